//! The user-mode-linux backend.
//!
//! UML runs the guest kernel as an ordinary host process, so it works
//! without /dev/kvm and without emulation. Volumes are shared through
//! hostfs rather than 9p, disks become ubd devices, and networking is
//! provided by libslirp-helper on the host: a connected datagram socket
//! pair links the helper to the guest's vector transport, each process
//! inheriting its end as file descriptor 3.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use rustix::net::{AddressFamily, SocketFlags, SocketType};
use tracing::debug;

use crate::backend::{disk_udev_rules, merged_usr_system, Backend};
use crate::machine::{Image, Machine, MountPoint};

const UML_MODULE_BASE: &str = "/usr/lib/uml/modules";

#[derive(Debug)]
pub(crate) struct UmlBackend;

impl UmlBackend {
    fn uml_binary() -> Result<Utf8PathBuf> {
        let path = which::which("linux.uml").map_err(|_| eyre!("user-mode-linux not installed"))?;
        Utf8PathBuf::from_path_buf(path).map_err(|path| eyre!("non-UTF-8 path {path:?}"))
    }

    fn slirp_helper_path() -> Result<Utf8PathBuf> {
        let path =
            which::which("libslirp-helper").map_err(|_| eyre!("libslirp-helper not installed"))?;
        Utf8PathBuf::from_path_buf(path).map_err(|path| eyre!("non-UTF-8 path {path:?}"))
    }

    /// The single release directory under the UML module base. The
    /// modules live there even on non-merged-usr systems.
    fn module_dir() -> Result<Utf8PathBuf> {
        let base = Utf8Path::new(UML_MODULE_BASE);
        if !base.is_dir() {
            return Err(eyre!("user-mode-linux modules not installed"));
        }

        let subdirs: Vec<String> = base
            .read_dir_utf8()
            .context("failed to read user-mode-linux module directory")?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string())
            .collect();

        match subdirs.as_slice() {
            [release] => Ok(base.join(release)),
            _ => Err(eyre!("could not determine which user-mode-linux modules to use")),
        }
    }

    fn uml_args(&self, m: &Machine) -> Result<Vec<String>> {
        let initrd_path = m
            .initrd_path
            .as_ref()
            .ok_or_else(|| eyre!("initramfs has not been assembled"))?;

        let mut args = vec![
            format!("mem={}M", m.memory),
            format!("initrd={initrd_path}"),
            "panic=-1".to_string(),
            "nosplash".to_string(),
            "systemd.unit=fakemachine.service".to_string(),
            "console=tty0".to_string(),
            // vector network device backed by the inherited socket
            "vec0:transport=fd,fd=3,vec=0".to_string(),
        ];

        if m.show_boot {
            args.extend([
                "con0=fd:0,fd:1".to_string(),
                "con=none".to_string(),
            ]);
        } else {
            args.extend([
                "quiet".to_string(),
                "con1=fd:0,fd:1".to_string(),
                "con0=null".to_string(),
                "con=none".to_string(),
            ]);
        }

        for (i, img) in m.images.iter().enumerate() {
            args.push(format!("ubd{i}={}", img.path));
        }
        Ok(args)
    }
}

/// Arrange for `socket` to appear as file descriptor 3 in the child.
/// dup2 clears close-on-exec on the duplicate; when the socket already is
/// fd 3 the flag is cleared directly.
fn attach_fd3(cmd: &mut Command, socket: &OwnedFd) {
    let raw = socket.as_raw_fd();
    unsafe {
        cmd.pre_exec(move || {
            let socket = BorrowedFd::borrow_raw(raw);
            if raw == 3 {
                rustix::io::fcntl_setfd(socket, rustix::io::FdFlags::empty())?;
            } else {
                let mut target = OwnedFd::from_raw_fd(3);
                let result = rustix::io::dup2(socket, &mut target);
                std::mem::forget(target);
                result?;
            }
            Ok(())
        });
    }
}

impl Backend for UmlBackend {
    fn name(&self) -> &'static str {
        "uml"
    }

    fn supported(&self) -> Result<()> {
        Self::uml_binary()?;
        Self::slirp_helper_path()?;
        Self::module_dir()?;
        Ok(())
    }

    fn kernel_release(&self) -> Result<String> {
        let moddir = Self::module_dir()?;
        moddir
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| eyre!("malformed user-mode-linux module path {moddir}"))
    }

    fn kernel_path(&self) -> Result<Utf8PathBuf> {
        Self::uml_binary()
    }

    fn module_path(&self) -> Result<Utf8PathBuf> {
        Self::module_dir()
    }

    fn udev_rules(&self, images: &[Image]) -> Vec<String> {
        disk_udev_rules("ubd", images)
    }

    fn networkd_match(&self) -> &'static str {
        "vec*"
    }

    fn job_output_tty(&self, show_boot: bool) -> &'static str {
        if show_boot {
            "/dev/tty0"
        } else {
            "/dev/tty1"
        }
    }

    fn mount_parameters(&self, mount: &MountPoint) -> (&'static str, Vec<String>) {
        ("hostfs", vec![mount.host_directory.to_string()])
    }

    fn init_modules(&self) -> Vec<&'static str> {
        Vec::new()
    }

    fn init_static_volumes(&self) -> Vec<MountPoint> {
        // The initramfs carries the base system's module tree; bind the
        // UML modules over the top of it.
        let Ok(moddir) = Self::module_dir() else {
            return Vec::new();
        };
        let Some(tree) = moddir.parent() else {
            return Vec::new();
        };

        let machine_dir = if merged_usr_system() {
            "/usr/lib/modules"
        } else {
            "/lib/modules"
        };

        vec![MountPoint {
            host_directory: tree.to_owned(),
            machine_directory: machine_dir.into(),
            label: "modules".to_string(),
            static_mount: true,
        }]
    }

    fn start(&self, machine: &Machine) -> Result<bool> {
        let kernel_path = match &machine.kernel_path {
            Some(path) => path.clone(),
            None => Self::uml_binary()?,
        };
        let slirp_helper_path = Self::slirp_helper_path()?;

        // A connected socket pair carries the network between the slirp
        // helper and the guest's vector device; which process gets which
        // end does not matter.
        let (slirp_socket, vector_socket) = rustix::net::socketpair(
            AddressFamily::UNIX,
            SocketType::DGRAM,
            SocketFlags::CLOEXEC,
            None,
        )
        .context("failed to create network socket pair")?;

        let mut helper_cmd = Command::new(slirp_helper_path.as_std_path());
        helper_cmd.args(["--exit-with-parent", "--fd=3"]);
        attach_fd3(&mut helper_cmd, &slirp_socket);
        let mut helper = helper_cmd.spawn().context("failed to start libslirp-helper")?;

        let args = self.uml_args(machine)?;
        debug!("{kernel_path} {}", args.join(" "));
        let mut uml_cmd = Command::new(kernel_path.as_std_path());
        uml_cmd.args(&args);
        attach_fd3(&mut uml_cmd, &vector_socket);

        let spawned = uml_cmd.spawn();

        // The children own their duplicates now; keeping our ends open
        // would hold the link up after they exit.
        drop(slirp_socket);
        drop(vector_socket);

        let status = match spawned {
            Ok(mut uml) => uml.wait(),
            Err(err) => {
                let _ = helper.kill();
                let _ = helper.wait();
                return Err(err).context("failed to start user-mode-linux");
            }
        };

        let _ = helper.kill();
        let _ = helper.wait();

        let status = status.context("failed waiting for user-mode-linux")?;
        Ok(status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;

    fn test_machine() -> Machine {
        let mut m = Machine::from_backend(Box::new(UmlBackend));
        m.initrd_path = Some("/tmp/initramfs.cpio".into());
        m
    }

    #[test]
    fn kernel_command_line_quiet_by_default() {
        let m = test_machine();
        let args = UmlBackend.uml_args(&m).unwrap();
        assert_eq!(args[0], "mem=2048M");
        assert!(args.contains(&"vec0:transport=fd,fd=3,vec=0".to_string()));
        assert!(args.contains(&"quiet".to_string()));
        assert!(args.contains(&"con1=fd:0,fd:1".to_string()));
        assert!(args.contains(&"con0=null".to_string()));
    }

    #[test]
    fn show_boot_routes_tty0_to_stdio() {
        let mut m = test_machine();
        m.show_boot = true;
        let args = UmlBackend.uml_args(&m).unwrap();
        assert!(args.contains(&"con0=fd:0,fd:1".to_string()));
        assert!(!args.contains(&"quiet".to_string()));
    }

    #[test]
    fn images_become_ubd_devices() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("disk.img");
        let img = img.to_str().unwrap();

        let mut m = test_machine();
        m.create_image(img, 1024).unwrap();
        let args = UmlBackend.uml_args(&m).unwrap();
        assert!(args.contains(&format!("ubd0={img}")));
    }

    #[test]
    fn hostfs_mount_parameters_carry_the_host_path() {
        let mount = MountPoint {
            host_directory: "/srv/data".into(),
            machine_directory: "/srv/data".into(),
            label: "virtfs-0".to_string(),
            static_mount: false,
        };
        let (fstype, options) = UmlBackend.mount_parameters(&mount);
        assert_eq!(fstype, "hostfs");
        assert_eq!(options, ["/srv/data"]);
    }
}
