//! Streaming writer for newc-format cpio archives.
//!
//! The kernel unpacks the initramfs from a "new ASCII" (newc) cpio stream,
//! so this is the container format for everything fakemachine puts in front
//! of the guest. The writer emits the format directly instead of shelling
//! out to cpio(1): most of the archive is synthesised on the fly (generated
//! configuration, kernel modules decompressed in transit) and never exists
//! as a staged directory tree on the host.
//!
//! Parent directories are created implicitly, exactly once, before any
//! entry below them.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;

use camino::Utf8Path;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use walkdir::WalkDir;

/// A streaming content rewriter applied while a host file is copied into
/// the archive. The emitted entry size is whatever the transformer wrote.
pub type Transformer = fn(&mut dyn Write, &mut dyn Read) -> Result<()>;

const MAGIC: &str = "070701";
const TRAILER: &str = "TRAILER!!!";

// File type bits from the mode field, per <linux/stat.h>.
const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;
const S_IFCHR: u32 = 0o020000;

pub struct ArchiveWriter<W: Write> {
    out: W,
    ino: u32,
    paths: HashSet<String>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(out: W) -> Self {
        ArchiveWriter {
            out,
            ino: 0,
            paths: HashSet::from(["/".to_string()]),
        }
    }

    /// Write a directory entry. Parents are created as needed with mode
    /// 0755; writing a path that already exists in the archive is a no-op.
    pub fn write_directory(&mut self, directory: &str, perm: u32) -> Result<()> {
        let clean = normalize(directory);
        if self.paths.contains(&clean) {
            return Ok(());
        }
        self.ensure_parents(&clean)?;
        self.write_header(&clean, S_IFDIR | (perm & 0o7777), 0, 0, 0)?;
        self.paths.insert(clean);
        Ok(())
    }

    /// Write a regular file from a byte slice.
    pub fn write_file(&mut self, file: &str, content: &[u8], perm: u32) -> Result<()> {
        let clean = normalize(file);
        self.ensure_parents(&clean)?;
        self.write_header(&clean, S_IFREG | (perm & 0o7777), content.len() as u64, 0, 0)?;
        self.write_data(content)?;
        self.paths.insert(clean);
        Ok(())
    }

    /// Copy a host file into the archive under the same path.
    pub fn copy_file(&mut self, path: &str) -> Result<()> {
        self.copy_file_to(Utf8Path::new(path), path)
    }

    /// Copy a host file into the archive, preserving its permission bits.
    pub fn copy_file_to(&mut self, src: &Utf8Path, dst: &str) -> Result<()> {
        let clean = normalize(dst);
        self.ensure_parents(&clean)?;

        let f = File::open(src).with_context(|| format!("open failed: {src}"))?;
        let info = f
            .metadata()
            .with_context(|| format!("failed to stat source file {src}"))?;

        let mode = info.permissions().mode() & 0o7777;
        self.write_header(&clean, S_IFREG | mode, info.len(), 0, 0)?;

        let mut reader = io::BufReader::new(f);
        let copied = io::copy(&mut reader, &mut self.out)
            .with_context(|| format!("failed to copy contents of {src}"))?;
        if copied != info.len() {
            return Err(eyre!("{src} changed size while being archived"));
        }
        self.pad(copied)?;
        self.paths.insert(clean);
        Ok(())
    }

    /// Copy a host file through a transformer. The archive entry carries
    /// the transformed bytes under the source file's permission bits.
    pub fn transform_file_to(
        &mut self,
        src: &Utf8Path,
        dst: &str,
        transform: Transformer,
    ) -> Result<()> {
        let f = File::open(src).with_context(|| format!("open failed: {src}"))?;
        let info = f
            .metadata()
            .with_context(|| format!("failed to stat source file {src}"))?;

        let mut content = Vec::new();
        let mut reader = io::BufReader::new(f);
        transform(&mut content, &mut reader)
            .with_context(|| format!("failed to transform {src}"))?;

        self.write_file(dst, &content, info.permissions().mode() & 0o7777)
    }

    /// Write a symbolic link. The target is stored verbatim.
    pub fn write_symlink(&mut self, target: &str, link: &str, perm: u32) -> Result<()> {
        let clean = normalize(link);
        self.ensure_parents(&clean)?;
        let content = target.as_bytes();
        self.write_header(&clean, S_IFLNK | (perm & 0o7777), content.len() as u64, 0, 0)?;
        self.write_data(content)?;
        self.paths.insert(clean);
        Ok(())
    }

    /// Write a character device node.
    pub fn write_char_device(
        &mut self,
        device: &str,
        major: u32,
        minor: u32,
        perm: u32,
    ) -> Result<()> {
        let clean = normalize(device);
        self.ensure_parents(&clean)?;
        self.write_header(&clean, S_IFCHR | (perm & 0o7777), 0, major, minor)?;
        self.paths.insert(clean);
        Ok(())
    }

    /// Recursively copy a host directory tree. Directories keep their
    /// permission bits and regular files are copied as-is; any other file
    /// type fails the whole walk.
    pub fn copy_tree(&mut self, path: &str) -> Result<()> {
        for entry in WalkDir::new(path) {
            let entry = entry.with_context(|| format!("failed to walk directory {path}"))?;
            let entry_path = entry
                .path()
                .to_str()
                .ok_or_else(|| eyre!("non-UTF-8 path under {path}"))?;

            let file_type = entry.file_type();
            if file_type.is_dir() {
                let mode = entry.metadata()?.permissions().mode() & 0o7777;
                self.write_directory(entry_path, mode)?;
            } else if file_type.is_file() {
                self.copy_file(entry_path)?;
            } else {
                return Err(eyre!("file type not handled for {entry_path}"));
            }
        }
        Ok(())
    }

    /// Write the trailer entry and return the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.write_header_raw(TRAILER, 0, 0, 1, 0, 0, 0)?;
        self.out.flush()?;
        Ok(self.out)
    }

    fn ensure_parents(&mut self, path: &str) -> Result<()> {
        let Some(parent) = Utf8Path::new(path).parent() else {
            return Ok(());
        };
        if self.paths.contains(parent.as_str()) {
            return Ok(());
        }
        let ancestors: Vec<&Utf8Path> = parent.ancestors().collect();
        for dir in ancestors.into_iter().rev() {
            if dir == "/" || dir.as_str().is_empty() {
                continue;
            }
            self.write_directory(dir.as_str(), 0o755)?;
        }
        Ok(())
    }

    fn write_header(&mut self, name: &str, mode: u32, size: u64, major: u32, minor: u32) -> Result<()> {
        self.ino += 1;
        let nlink = if mode & S_IFMT == S_IFDIR { 2 } else { 1 };
        self.write_header_raw(name.trim_start_matches('/'), self.ino, mode, nlink, size, major, minor)
    }

    fn write_header_raw(
        &mut self,
        name: &str,
        ino: u32,
        mode: u32,
        nlink: u32,
        size: u64,
        rdevmajor: u32,
        rdevminor: u32,
    ) -> Result<()> {
        let namesize = name.len() + 1;
        write!(
            self.out,
            "{MAGIC}{ino:08X}{mode:08X}{uid:08X}{gid:08X}{nlink:08X}{mtime:08X}\
             {size:08X}{devmajor:08X}{devminor:08X}{rdevmajor:08X}{rdevminor:08X}\
             {namesize:08X}{check:08X}",
            uid = 0,
            gid = 0,
            mtime = 0,
            devmajor = 0,
            devminor = 0,
            check = 0,
        )
        .with_context(|| format!("failed to write header for {name}"))?;
        self.out.write_all(name.as_bytes())?;
        self.out.write_all(&[0])?;
        // Header plus name is padded to a 4-byte boundary, as is file data.
        self.pad(110 + namesize as u64)?;
        Ok(())
    }

    fn write_data(&mut self, content: &[u8]) -> Result<()> {
        self.out.write_all(content)?;
        self.pad(content.len() as u64)?;
        Ok(())
    }

    fn pad(&mut self, written: u64) -> Result<()> {
        const ZEROS: [u8; 3] = [0; 3];
        let rem = (written % 4) as usize;
        if rem != 0 {
            self.out.write_all(&ZEROS[..4 - rem])?;
        }
        Ok(())
    }
}

fn normalize(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}
