//! The virtualisation backend abstraction.
//!
//! A backend knows how to launch one kind of hypervisor and advertises the
//! guest-visible parameters that differ between them: which kernel to boot,
//! where its modules live, how volumes are mounted, which modules the init
//! script must probe, which udev rules map images to stable device names,
//! and where the job's output terminal lives. The machine composer is
//! backend-agnostic and only talks through this trait.

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;

use crate::machine::{Image, Machine, MountPoint};
use crate::qemu::{KvmBackend, QemuBackend};
use crate::uml::UmlBackend;

pub(crate) trait Backend: std::fmt::Debug {
    /// The name of the backend.
    fn name(&self) -> &'static str;

    /// Whether the backend can run on this host; the error carries a
    /// user-facing reason when it cannot.
    fn supported(&self) -> Result<()>;

    /// Kernel release version the guest will boot.
    fn kernel_release(&self) -> Result<String>;

    /// Path of the kernel image.
    fn kernel_path(&self) -> Result<Utf8PathBuf>;

    /// Path of the module tree matching the kernel.
    fn module_path(&self) -> Result<Utf8PathBuf>;

    /// Udev rules giving each image a stable by-label device path.
    fn udev_rules(&self, images: &[Image]) -> Vec<String>;

    /// Match expression for the guest's networkd configuration.
    fn networkd_match(&self) -> &'static str;

    /// The tty used for the job output.
    fn job_output_tty(&self, show_boot: bool) -> &'static str;

    /// Filesystem type and options used to mount a volume in the guest.
    fn mount_parameters(&self, mount: &MountPoint) -> (&'static str, Vec<String>);

    /// Modules the init script probes before handing over to systemd.
    fn init_modules(&self) -> Vec<&'static str>;

    /// Additional static volumes the backend itself needs mounted by the
    /// init script.
    fn init_static_volumes(&self) -> Vec<MountPoint>;

    /// Launch the hypervisor and block until it exits. Returns whether the
    /// hypervisor itself terminated successfully.
    fn start(&self, machine: &Machine) -> Result<bool>;
}

/// The backends `auto` tries, in priority order. uml comes last and is
/// never picked implicitly; it is only available when named.
fn implemented_backends() -> Vec<Box<dyn Backend>> {
    vec![
        Box::new(KvmBackend::new()),
        Box::new(QemuBackend::new()),
        Box::new(UmlBackend),
    ]
}

/// Names accepted by [`new_backend`], for the command line.
pub fn backend_names() -> Vec<&'static str> {
    vec!["auto", "kvm", "qemu", "uml"]
}

pub(crate) fn new_backend(name: &str) -> Result<Box<dyn Backend>> {
    if name == "auto" {
        return select_backend(implemented_backends());
    }

    let backend = implemented_backends()
        .into_iter()
        .find(|b| b.name() == name)
        .ok_or_else(|| eyre!("{name} backend does not exist"))?;

    if let Err(err) = backend.supported() {
        return Err(eyre!("{name} backend not supported: {err}"));
    }
    Ok(backend)
}

fn select_backend(candidates: Vec<Box<dyn Backend>>) -> Result<Box<dyn Backend>> {
    let mut reasons = Vec::new();
    for backend in candidates {
        // uml is too flaky to pick implicitly
        if backend.name() == "uml" {
            continue;
        }
        match backend.supported() {
            Ok(()) => return Ok(backend),
            Err(err) => reasons.push(format!("{} backend not supported: {err}", backend.name())),
        }
    }
    Err(eyre!(reasons.join(", ")))
}

/// Udev rules creating /dev/disk/by-fakemachine-label/ symlinks for each
/// image, given the kernel's name prefix for the disks (vd for virtio-blk,
/// ubd for uml).
pub(crate) fn disk_udev_rules(kernel_prefix: &str, images: &[Image]) -> Vec<String> {
    let mut rules = Vec::new();
    for (i, img) in images.iter().enumerate() {
        let letter = (b'a' + i as u8) as char;
        rules.push(format!(
            r#"KERNEL=="{kernel_prefix}{letter}", SYMLINK+="disk/by-fakemachine-label/{label}""#,
            label = img.label
        ));
        rules.push(format!(
            r#"KERNEL=="{kernel_prefix}{letter}[0-9]", SYMLINK+="disk/by-fakemachine-label/{label}-part%n""#,
            label = img.label
        ));
    }
    rules
}

/// Whether this host uses the merged-usr layout, where /bin, /sbin and
/// /lib are symlinks into /usr.
pub(crate) fn merged_usr_system() -> bool {
    fs::symlink_metadata("/bin")
        .map(|meta| meta.file_type().is_symlink())
        .unwrap_or(false)
}

/// Kernel release the guest should boot. The running kernel is preferred
/// when its modules are installed; otherwise the newest tree under
/// /lib/modules is picked, which is what docker environments lacking the
/// host's release need. The fallback takes the last lexicographic entry
/// whose name starts with a digit (filtering out directories such as
/// extramodules-ARCH), so a mis-sorted tree can select an older kernel.
pub(crate) fn host_kernel_release() -> Result<String> {
    let uts = rustix::system::uname();
    let release = uts.release().to_string_lossy().into_owned();
    if Utf8Path::new("/lib/modules").join(&release).exists() {
        return Ok(release);
    }

    let mut entries: Vec<String> = fs::read_dir("/lib/modules")
        .context("no kernel modules installed")?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    entries.sort();

    entries
        .into_iter()
        .rev()
        .find(|name| name.starts_with(|c: char| c.is_ascii_digit()))
        .ok_or_else(|| eyre!("kernel not found"))
}

/// Module tree for the host kernel release.
pub(crate) fn host_module_path() -> Result<Utf8PathBuf> {
    let release = host_kernel_release()?;

    let base = if merged_usr_system() {
        "/usr/lib/modules"
    } else {
        "/lib/modules"
    };
    let moddir = Utf8PathBuf::from(base).join(release);
    if !moddir.exists() {
        return Err(eyre!("kernel modules not found at {moddir}"));
    }
    Ok(moddir)
}

/// Kernel image for the host kernel release. Distributions such as Arch
/// and Fedora install vmlinuz inside the module directory; /boot is the
/// fallback.
pub(crate) fn host_kernel_path() -> Result<Utf8PathBuf> {
    if let Ok(moddir) = host_module_path() {
        let kernel = moddir.join("vmlinuz");
        if kernel.exists() {
            return Ok(kernel);
        }
    }

    let release = host_kernel_release()?;
    let kernel = Utf8PathBuf::from(format!("/boot/vmlinuz-{release}"));
    if !kernel.exists() {
        return Err(eyre!("kernel image not found at {kernel}"));
    }
    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct StubBackend {
        name: &'static str,
        supported: bool,
    }

    impl Backend for StubBackend {
        fn name(&self) -> &'static str {
            self.name
        }
        fn supported(&self) -> Result<()> {
            if self.supported {
                Ok(())
            } else {
                Err(eyre!("{} is unavailable", self.name))
            }
        }
        fn kernel_release(&self) -> Result<String> {
            unreachable!()
        }
        fn kernel_path(&self) -> Result<Utf8PathBuf> {
            unreachable!()
        }
        fn module_path(&self) -> Result<Utf8PathBuf> {
            unreachable!()
        }
        fn udev_rules(&self, _images: &[Image]) -> Vec<String> {
            Vec::new()
        }
        fn networkd_match(&self) -> &'static str {
            "e*"
        }
        fn job_output_tty(&self, _show_boot: bool) -> &'static str {
            "/dev/hvc0"
        }
        fn mount_parameters(&self, _mount: &MountPoint) -> (&'static str, Vec<String>) {
            ("9p", Vec::new())
        }
        fn init_modules(&self) -> Vec<&'static str> {
            Vec::new()
        }
        fn init_static_volumes(&self) -> Vec<MountPoint> {
            Vec::new()
        }
        fn start(&self, _machine: &Machine) -> Result<bool> {
            unreachable!()
        }
    }

    fn stub(name: &'static str, supported: bool) -> Box<dyn Backend> {
        Box::new(StubBackend { name, supported })
    }

    #[test]
    fn auto_picks_first_supported() {
        let selected =
            select_backend(vec![stub("kvm", false), stub("qemu", true), stub("uml", true)])
                .unwrap();
        assert_eq!(selected.name(), "qemu");
    }

    #[test]
    fn auto_never_picks_uml() {
        let err = select_backend(vec![stub("kvm", false), stub("uml", true)]).unwrap_err();
        assert!(err.to_string().contains("kvm backend not supported"));
    }

    #[test]
    fn auto_error_aggregates_reasons() {
        let err =
            select_backend(vec![stub("kvm", false), stub("qemu", false), stub("uml", false)])
                .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("kvm backend not supported: kvm is unavailable"));
        assert!(message.contains(", qemu backend not supported: qemu is unavailable"));
        assert!(!message.contains("uml"));
    }

    #[test]
    fn unknown_backend_is_an_error() {
        let err = new_backend("vmware").unwrap_err();
        assert_eq!(err.to_string(), "vmware backend does not exist");
    }

    #[test]
    fn implemented_backends_priority_order() {
        let names: Vec<&str> = implemented_backends().iter().map(|b| b.name()).collect();
        assert_eq!(names, ["kvm", "qemu", "uml"]);
    }
}
