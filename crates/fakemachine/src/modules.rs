//! Kernel module discovery and resolution.
//!
//! The backends name the modules the guest's init script must probe; this
//! module resolves those names against the host's module tree with
//! modinfo(8), walks the dependency closure, and writes every module into
//! the initramfs, decompressing in transit when the distribution ships
//! compressed modules. A matching modules.dep is synthesised so modprobe
//! inside the guest can find what was copied.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::process::Command;

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::debug;

use crate::command_run::CommandRun;
use crate::cpio::{ArchiveWriter, Transformer};
use crate::decompress::{
    gzip_decompressor, null_decompressor, xz_decompressor, zstd_decompressor,
};

/// modinfo reports this as the filename of modules compiled into the
/// kernel image; they need no copying.
const BUILTIN: &str = "(builtin)";

/// Index files copied verbatim from the host's module tree.
const MODULE_INDEXES: [&str; 3] = ["modules.builtin", "modules.alias", "modules.symbols"];

struct ModuleInfo {
    filename: String,
    depends: Vec<String>,
}

/// Query modinfo for a module's on-disk location and direct dependencies.
/// A module that does not exist is reported with an empty filename rather
/// than an error, since modinfo exits non-zero for unknown names.
fn modinfo(release: &str, module: &str) -> Result<ModuleInfo> {
    let output = Command::new("modinfo")
        .args(["-k", release, module])
        .run_get_string();

    match output {
        Ok(text) => Ok(parse_modinfo(&text)),
        Err(_) => Ok(ModuleInfo {
            filename: String::new(),
            depends: Vec::new(),
        }),
    }
}

fn parse_modinfo(text: &str) -> ModuleInfo {
    let mut filename = String::new();
    let mut depends = Vec::new();

    for line in text.lines() {
        if let Some(value) = line.strip_prefix("filename:") {
            if filename.is_empty() {
                filename = value.trim().to_string();
            }
        } else if let Some(value) = line.strip_prefix("depends:") {
            depends.extend(
                value
                    .trim()
                    .split(',')
                    .filter(|dep| !dep.is_empty())
                    .map(str::to_string),
            );
        }
    }

    ModuleInfo { filename, depends }
}

/// The streaming rewriter matching a module file's compression suffix,
/// plus the filename with that suffix removed.
fn transformer_for(filename: &str) -> (Transformer, &str) {
    if let Some(stripped) = filename.strip_suffix(".gz") {
        (gzip_decompressor, stripped)
    } else if let Some(stripped) = filename.strip_suffix(".xz") {
        (xz_decompressor, stripped)
    } else if let Some(stripped) = filename.strip_suffix(".zst") {
        (zstd_decompressor, stripped)
    } else {
        (null_decompressor, filename)
    }
}

struct ResolvedModule {
    name: String,
    relpath: String,
    depends: Vec<String>,
}

/// Walks module dependency closures into an initramfs archive.
pub(crate) struct ModuleResolver<'a> {
    release: &'a str,
    moddir: &'a Utf8Path,
    prefix: &'a str,
    visited: HashSet<String>,
    resolved: Vec<ResolvedModule>,
}

impl<'a> ModuleResolver<'a> {
    pub(crate) fn new(release: &'a str, moddir: &'a Utf8Path, prefix: &'a str) -> Self {
        ModuleResolver {
            release,
            moddir,
            prefix,
            visited: HashSet::new(),
            resolved: Vec::new(),
        }
    }

    /// Add a module and its transitive dependencies to the archive. Each
    /// module is copied at most once; built-in modules are skipped.
    pub(crate) fn include<W: Write>(
        &mut self,
        w: &mut ArchiveWriter<W>,
        module: &str,
    ) -> Result<()> {
        if !self.visited.insert(module.to_string()) {
            return Ok(());
        }

        let info = modinfo(self.release, module)?;
        if info.filename == BUILTIN {
            debug!("module {module} is built into the kernel, skipping");
            return Ok(());
        }
        if info.filename.is_empty() {
            return Err(eyre!(
                "kernel module {module} not found for kernel {}",
                self.release
            ));
        }

        let source = Utf8Path::new(&info.filename);
        if !source.exists() {
            return Err(eyre!("kernel module file {source} does not exist"));
        }

        let (transform, stripped) = transformer_for(&info.filename);
        let canonical = stripped.strip_prefix("/usr").unwrap_or(stripped);
        let destination = format!("{}{canonical}", self.prefix);

        debug!("adding module {module} from {source}");
        w.transform_file_to(source, &destination, transform)
            .with_context(|| format!("failed to archive kernel module {module}"))?;

        let relpath = canonical
            .strip_prefix(&format!("/lib/modules/{}/", self.release))
            .unwrap_or_else(|| canonical.trim_start_matches('/'))
            .to_string();
        self.resolved.push(ResolvedModule {
            name: module.to_string(),
            relpath,
            depends: info.depends.clone(),
        });

        for dep in &info.depends {
            self.include(w, dep)?;
        }
        Ok(())
    }

    /// Emit the synthesised modules.dep plus the verbatim index files.
    /// Does nothing when no module was resolved.
    pub(crate) fn finish<W: Write>(self, w: &mut ArchiveWriter<W>) -> Result<()> {
        if self.resolved.is_empty() {
            return Ok(());
        }

        let archive_moddir = format!("{}/lib/modules/{}", self.prefix, self.release);
        w.write_file(
            &format!("{archive_moddir}/modules.dep"),
            render_modules_dep(&self.resolved).as_bytes(),
            0o644,
        )?;

        for index in MODULE_INDEXES {
            w.copy_file_to(
                &self.moddir.join(index),
                &format!("{archive_moddir}/{index}"),
            )?;
        }
        Ok(())
    }
}

fn render_modules_dep(modules: &[ResolvedModule]) -> String {
    let paths: HashMap<&str, &str> = modules
        .iter()
        .map(|m| (m.name.as_str(), m.relpath.as_str()))
        .collect();

    let mut out = String::new();
    for module in modules {
        out.push_str(&module.relpath);
        out.push(':');
        for dep in &module.depends {
            // built-in dependencies have no file and are not listed
            if let Some(path) = paths.get(dep.as_str()) {
                out.push(' ');
                out.push_str(path);
            }
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_filename_and_depends() {
        let info = parse_modinfo(
            "filename:       /lib/modules/6.1.0-13-amd64/kernel/fs/9p/9p.ko.xz\n\
             license:        GPL\n\
             depends:        9pnet,fscache,netfs\n",
        );
        assert_eq!(
            info.filename,
            "/lib/modules/6.1.0-13-amd64/kernel/fs/9p/9p.ko.xz"
        );
        assert_eq!(info.depends, ["9pnet", "fscache", "netfs"]);
    }

    #[test]
    fn first_filename_wins() {
        let info = parse_modinfo("filename: /a.ko\nfilename: /b.ko\ndepends:\n");
        assert_eq!(info.filename, "/a.ko");
        assert!(info.depends.is_empty());
    }

    #[test]
    fn empty_depends_dropped() {
        let info = parse_modinfo("filename: (builtin)\ndepends:        \n");
        assert_eq!(info.filename, BUILTIN);
        assert!(info.depends.is_empty());
    }

    #[test]
    fn transformer_matches_suffix() {
        assert_eq!(transformer_for("/m/a.ko").1, "/m/a.ko");
        assert_eq!(transformer_for("/m/a.ko.gz").1, "/m/a.ko");
        assert_eq!(transformer_for("/m/a.ko.xz").1, "/m/a.ko");
        assert_eq!(transformer_for("/m/a.ko.zst").1, "/m/a.ko");
    }

    #[test]
    fn modules_dep_lists_resolved_dependencies() {
        let modules = vec![
            ResolvedModule {
                name: "9p".into(),
                relpath: "kernel/fs/9p/9p.ko".into(),
                depends: vec!["9pnet".into(), "builtin-dep".into()],
            },
            ResolvedModule {
                name: "9pnet".into(),
                relpath: "kernel/net/9p/9pnet.ko".into(),
                depends: vec![],
            },
        ];
        assert_eq!(
            render_modules_dep(&modules),
            "kernel/fs/9p/9p.ko: kernel/net/9p/9pnet.ko\n\
             kernel/net/9p/9pnet.ko:\n"
        );
    }
}
