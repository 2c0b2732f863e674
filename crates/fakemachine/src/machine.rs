//! The machine composer.
//!
//! A [`Machine`] collects volumes, images and tuning knobs, then `run`
//! assembles an initramfs from the host's own binaries, boots it under the
//! selected backend and reports the job's exit code back.
//!
//! # Execution flow
//!
//! 1. A host temp directory is created and shared into the guest at
//!    `/run/fakemachine`; this is the only channel the guest uses to talk
//!    back (it writes the job's exit status to a `result` file there).
//! 2. The initramfs is assembled in that temp directory: a fixed skeleton
//!    (busybox, the dynamic linker and libc, identity files, udev rules,
//!    networkd configuration), the backend's kernel modules, and the
//!    generated boot files (`/init`, `/wrapper`, `fakemachine.service`,
//!    `/etc/fstab`).
//! 3. The backend launches its hypervisor and blocks until poweroff.
//!    Inside the guest, `/init` mounts the static volumes and execs
//!    systemd, which brings up networking and runs the wrapper on the
//!    backend's job TTY; the wrapper runs the command and records its exit
//!    status.
//! 4. The result file is parsed and the temp state torn down, whatever the
//!    outcome.
//!
//! A machine is single-shot: startup mutates volume and image state, so a
//! new machine is needed for every run.

use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::debug;

use crate::arch::Arch;
use crate::backend::{merged_usr_system, new_backend, Backend};
use crate::command_run::CommandRun;
use crate::cpio::ArchiveWriter;
use crate::modules::ModuleResolver;

/// Label under which the scratch image is exposed; rejected for caller
/// supplied images.
const SCRATCH_LABEL: &str = "fake-scratch";

/// A host directory shared into the guest. Static mounts are created by
/// the machine itself and mounted by the init script before systemd runs;
/// the rest go through the guest's fstab.
#[derive(Debug, Clone)]
pub(crate) struct MountPoint {
    pub(crate) host_directory: Utf8PathBuf,
    pub(crate) machine_directory: Utf8PathBuf,
    pub(crate) label: String,
    pub(crate) static_mount: bool,
}

/// A disk image exposed to the guest as a block device.
#[derive(Debug, Clone)]
pub(crate) struct Image {
    pub(crate) path: Utf8PathBuf,
    pub(crate) label: String,
}

pub struct Machine {
    pub(crate) backend: Box<dyn Backend>,
    pub(crate) mounts: Vec<MountPoint>,
    count: usize,
    pub(crate) images: Vec<Image>,
    pub(crate) memory: u32,
    pub(crate) num_cpus: u32,
    pub(crate) show_boot: bool,
    pub(crate) environ: Vec<String>,
    pub(crate) sector_size: u32,
    pub(crate) kernel_path: Option<Utf8PathBuf>,

    scratch_size: u64,
    scratch_path: Utf8PathBuf,
    scratch_dev: Option<String>,
    pub(crate) initrd_path: Option<Utf8PathBuf>,
}

/// Removes a file when dropped, scoping scratch space to a single run.
struct RemoveOnDrop(Utf8PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

impl Machine {
    /// Create a machine using the first supported backend.
    pub fn new() -> Result<Machine> {
        Machine::with_backend("auto")
    }

    /// Create a machine using the named backend.
    pub fn with_backend(backend_name: &str) -> Result<Machine> {
        Ok(Machine::from_backend(new_backend(backend_name)?))
    }

    pub(crate) fn from_backend(backend: Box<dyn Backend>) -> Machine {
        let mut m = Machine {
            backend,
            mounts: Vec::new(),
            count: 0,
            images: Vec::new(),
            memory: 2048,
            num_cpus: default_num_cpus(),
            show_boot: false,
            environ: Vec::new(),
            sector_size: 512,
            kernel_path: None,
            scratch_size: 0,
            scratch_path: Utf8PathBuf::new(),
            scratch_dev: None,
            initrd_path: None,
        };

        // usr is mounted by label from the init script before systemd runs
        m.add_static_volume("/usr", "usr");
        if !merged_usr_system() {
            m.add_static_volume("/sbin", "sbin");
            m.add_static_volume("/bin", "bin");
            m.add_static_volume("/lib", "lib");
        }

        // Standard host shares, when present: ssl certificates, dbus
        // configuration, the alternatives symlink farm and the binfmt
        // registry.
        for dir in [
            "/etc/ca-certificates",
            "/etc/ssl",
            "/etc/dbus-1",
            "/etc/alternatives",
            "/var/lib/binfmts",
        ] {
            if Utf8Path::new(dir).exists() {
                m.add_volume(dir);
            }
        }

        m
    }

    /// The name of the backend this machine runs on.
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    fn add_static_volume(&mut self, directory: &str, label: &str) {
        self.mounts.push(MountPoint {
            host_directory: directory.into(),
            machine_directory: directory.into(),
            label: label.to_string(),
            static_mount: true,
        });
    }

    /// Mount `host_directory` at `machine_directory` inside the machine.
    /// Adding the same pair twice is a no-op.
    pub fn add_volume_at(
        &mut self,
        host_directory: impl Into<Utf8PathBuf>,
        machine_directory: impl Into<Utf8PathBuf>,
    ) {
        let host_directory = host_directory.into();
        let machine_directory = machine_directory.into();

        if self.mounts.iter().any(|mount| {
            mount.host_directory == host_directory && mount.machine_directory == machine_directory
        }) {
            return;
        }

        self.mounts.push(MountPoint {
            host_directory,
            machine_directory,
            label: format!("virtfs-{}", self.count),
            static_mount: false,
        });
        self.count += 1;
    }

    /// Mount a host directory at the same location inside the machine.
    pub fn add_volume(&mut self, directory: impl Into<Utf8PathBuf>) {
        let directory = directory.into();
        self.add_volume_at(directory.clone(), directory);
    }

    /// Create an image file of the given size and expose it in the machine
    /// with the label as its serial id. A negative size means the file
    /// already exists and is left untouched. Returns the device path the
    /// image will have inside the machine.
    ///
    /// Labels must be shorter than 20 characters due to limitations of
    /// qemu's serial ids.
    pub fn create_image_with_label(
        &mut self,
        path: impl Into<Utf8PathBuf>,
        size: i64,
        label: &str,
    ) -> Result<String> {
        if label == SCRATCH_LABEL {
            return Err(eyre!("label '{label}' is reserved"));
        }
        self.attach_image(path.into(), size, label)
    }

    /// Like [`Machine::create_image_with_label`] with a generated
    /// `fakedisk-<n>` label.
    pub fn create_image(&mut self, path: impl Into<Utf8PathBuf>, size: i64) -> Result<String> {
        let label = format!("fakedisk-{}", self.images.len());
        self.create_image_with_label(path, size, &label)
    }

    fn attach_image(&mut self, path: Utf8PathBuf, size: i64, label: &str) -> Result<String> {
        if label.len() >= 20 {
            return Err(eyre!(
                "label '{label}' too long; cannot be more than 20 characters"
            ));
        }
        if self.images.iter().any(|image| image.label == label) {
            return Err(eyre!("label '{label}' already exists"));
        }

        if size < 0 {
            fs::metadata(&path).with_context(|| format!("image {path} does not exist"))?;
        } else {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&path)
                .with_context(|| format!("failed to create image {path}"))?;
            file.set_len(size as u64)
                .with_context(|| format!("failed to resize image {path}"))?;
        }

        self.images.push(Image {
            path,
            label: label.to_string(),
        });
        Ok(format!("/dev/disk/by-fakemachine-label/{label}"))
    }

    /// Set the amount of memory in megabytes. Defaults to 2048 MB.
    pub fn set_memory(&mut self, megabytes: u32) {
        self.memory = megabytes;
    }

    /// Set the number of CPUs. Defaults to the number of host cores.
    pub fn set_num_cpus(&mut self, num_cpus: u32) {
        self.num_cpus = num_cpus;
    }

    /// Show boot and console messages from the machine on the terminal.
    pub fn set_show_boot(&mut self, show_boot: bool) {
        self.show_boot = show_boot;
    }

    /// Override the logical and physical sector size of exposed images.
    /// Defaults to 512 bytes.
    pub fn set_sector_size(&mut self, bytes: u32) {
        self.sector_size = bytes;
    }

    /// Environment variables set for the command, as `KEY=value` strings.
    pub fn set_environ(&mut self, environ: Vec<String>) {
        self.environ = environ;
    }

    /// Boot an explicit kernel image instead of the discovered one.
    pub fn set_kernel_path(&mut self, path: impl Into<Utf8PathBuf>) {
        self.kernel_path = Some(path.into());
    }

    /// Allocate on-disk scratch space of the given size (sparsely) for
    /// /scratch instead of backing it with memory. An empty path stores
    /// the scratch file in the current working directory.
    pub fn set_scratch(&mut self, size: u64, path: &str) {
        self.scratch_size = size;
        if path.is_empty() {
            self.scratch_path = env::current_dir()
                .ok()
                .and_then(|dir| Utf8PathBuf::from_path_buf(dir).ok())
                .unwrap_or_else(|| Utf8PathBuf::from("."));
        } else {
            self.scratch_path = path.into();
        }
    }

    /// Volume misconfiguration surfaces here, at machine start: mount
    /// labels and paths end up in hypervisor command lines and the guest's
    /// fstab, and host directories have to exist by now.
    fn check_mounts(&self) -> Result<()> {
        let mut labels = std::collections::HashSet::new();

        for mount in &self.mounts {
            let MountPoint {
                host_directory,
                machine_directory,
                label,
                ..
            } = mount;

            if label.len() >= 20 {
                return Err(eyre!(
                    "mount label '{label}' too long; cannot be more than 20 characters"
                ));
            }
            if !labels.insert(label.as_str()) {
                return Err(eyre!("mount label '{label}' already exists"));
            }
            if host_directory.as_str().chars().any(char::is_whitespace)
                || machine_directory.as_str().chars().any(char::is_whitespace)
            {
                return Err(eyre!(
                    "volume path '{host_directory}:{machine_directory}' must not contain whitespace"
                ));
            }

            let meta = fs::metadata(host_directory)
                .with_context(|| format!("volume host path {host_directory} does not exist"))?;
            use std::os::unix::fs::FileTypeExt;
            let file_type = meta.file_type();
            if file_type.is_block_device() || file_type.is_char_device() {
                return Err(eyre!("volume host path {host_directory} is a device node"));
            }
        }
        Ok(())
    }

    fn setup_scratch(&mut self) -> Result<Option<RemoveOnDrop>> {
        if self.scratch_size == 0 {
            return Ok(None);
        }

        let scratch = tempfile::Builder::new()
            .prefix("fake-scratch.img.")
            .tempfile_in(&self.scratch_path)
            .with_context(|| format!("failed to create scratch file in {}", self.scratch_path))?;
        let (_, path) = scratch.keep().context("failed to keep scratch file")?;
        let path = Utf8PathBuf::from_path_buf(path)
            .map_err(|path| eyre!("non-UTF-8 scratch path {path:?}"))?;
        let guard = RemoveOnDrop(path.clone());

        let device = self.attach_image(path.clone(), self.scratch_size as i64, SCRATCH_LABEL)?;
        std::process::Command::new("mkfs.ext4")
            .args(["-q", path.as_str()])
            .run()
            .context("failed to format scratch space")?;

        self.scratch_dev = Some(device);
        Ok(Some(guard))
    }

    /// All volumes the init script must mount before systemd takes over,
    /// including the backend's own extras.
    fn static_volumes(&self) -> Vec<MountPoint> {
        self.mounts
            .iter()
            .cloned()
            .chain(self.backend.init_static_volumes())
            .filter(|mount| mount.static_mount)
            .collect()
    }

    fn init_script(&self) -> String {
        let mut script = String::from(
            "#!/bin/busybox sh\n\n\
             busybox mount -t proc proc /proc\n\
             busybox mount -t sysfs none /sys\n\n",
        );

        for module in self.backend.init_modules() {
            script.push_str(&format!("busybox modprobe {module}\n"));
        }
        script.push('\n');

        for mount in self.static_volumes() {
            let (fstype, options) = self.backend.mount_parameters(&mount);
            script.push_str(&format!("busybox mkdir -p {}\n", mount.machine_directory));
            script.push_str(&format!("busybox mount -v -t {fstype}"));
            if !options.is_empty() {
                script.push_str(&format!(" -o {}", options.join(",")));
            }
            script.push_str(&format!(" {} {}\n", mount.label, mount.machine_directory));
        }

        script.push_str("\nexec /lib/systemd/systemd\n");
        script
    }

    fn networkd_unit(&self) -> String {
        format!(
            "\n[Match]\nName={}\n\n\
             [Network]\nDHCP=ipv4\n\
             # Disable link-local address to speedup boot\n\
             LinkLocalAddressing=no\nIPv6AcceptRA=no\n",
            self.backend.networkd_match()
        )
    }

    fn service_unit(&self) -> String {
        format!(
            r#"
[Unit]
Description=fakemachine runner
Conflicts=shutdown.target
Before=shutdown.target
Requires=basic.target
Wants=systemd-resolved.service binfmt-support.service systemd-networkd.service
After=basic.target systemd-resolved.service binfmt-support.service systemd-networkd.service
OnFailure=poweroff.target

[Service]
Environment=HOME=/root IN_FAKE_MACHINE=yes {environ}
WorkingDirectory=-/scratch
ExecStart=/wrapper
ExecStopPost=/bin/sync
ExecStopPost=/bin/systemctl poweroff -ff
Type=idle
TTYPath={tty}
StandardInput=tty-force
StandardOutput=inherit
StandardError=inherit
KillMode=process
IgnoreSIGPIPE=no
SendSIGHUP=yes
LimitNOFILE=4096
"#,
            environ = self.environ.join(" "),
            tty = self.backend.job_output_tty(self.show_boot),
        )
    }

    fn wrapper_script(&self, command: &str) -> String {
        format!(
            r#"#!/bin/sh
/lib/systemd/systemd-networkd-wait-online -q
if [ $? != 0 ]; then
  echo "WARNING: Network setup failed"
  echo "== Journal =="
  journalctl -a --no-pager
  echo "== networkd =="
  networkctl status
  networkctl list
  echo 1 > /run/fakemachine/result
  exit
fi

echo Running '{command}' using '{backend}' backend
{command}
echo $? > /run/fakemachine/result
"#,
            backend = self.backend.name(),
        )
    }

    fn fstab_contents(&self) -> String {
        let mut fstab = vec!["# Generated fstab file by fakemachine".to_string()];

        match &self.scratch_dev {
            None => fstab.push("none /scratch tmpfs size=95% 0 0".to_string()),
            Some(device) => fstab.push(format!("{device} /scratch ext4 defaults,relatime 0 0")),
        }

        // static volumes are already mounted by the init script
        for mount in self.mounts.iter().filter(|mount| !mount.static_mount) {
            let (fstype, options) = self.backend.mount_parameters(mount);
            fstab.push(format!(
                "{} {} {fstype} {} 0 0",
                mount.label,
                mount.machine_directory,
                options.join(",")
            ));
        }
        fstab.push(String::new());
        fstab.join("\n")
    }

    fn compose_initramfs<W: Write>(
        &self,
        w: &mut ArchiveWriter<W>,
        command: &str,
        extra_content: &[(Utf8PathBuf, String)],
    ) -> Result<()> {
        w.write_directory("/scratch", 0o1777)?;
        w.write_directory("/var/tmp", 0o1777)?;
        w.write_directory("/var/lib/dbus", 0o755)?;

        w.write_directory("/tmp", 0o1777)?;
        w.write_directory("/sys", 0o755)?;
        w.write_directory("/proc", 0o755)?;
        w.write_directory("/run", 0o755)?;
        w.write_directory("/usr", 0o755)?;
        w.write_directory("/usr/bin", 0o755)?;
        w.write_directory("/lib64", 0o755)?;

        w.write_symlink("/run", "/var/run", 0o755)?;

        let merged = merged_usr_system();
        if merged {
            w.write_symlink("/usr/sbin", "/sbin", 0o755)?;
            w.write_symlink("/usr/bin", "/bin", 0o755)?;
            w.write_symlink("/usr/lib", "/lib", 0o755)?;
        } else {
            w.write_directory("/sbin", 0o755)?;
            w.write_directory("/bin", 0o755)?;
            w.write_directory("/lib", 0o755)?;
        }
        let prefix = if merged { "/usr" } else { "" };

        // some distros place busybox in /sbin
        let busybox = which::which("busybox").map_err(|_| eyre!("busybox not found in PATH"))?;
        let busybox = Utf8PathBuf::from_path_buf(busybox)
            .map_err(|path| eyre!("non-UTF-8 path {path:?}"))?;
        w.copy_file_to(&busybox, &format!("{prefix}/bin/busybox"))?;

        if let Some(arch) = Arch::host() {
            // The dynamic linker, with libc and libresolv from wherever
            // the linker symlink really points.
            let linker = arch.dynamic_linker();
            w.copy_file(linker)?;

            let real = fs::canonicalize(linker)
                .with_context(|| format!("failed to resolve dynamic linker {linker}"))?;
            let real = Utf8PathBuf::from_path_buf(real)
                .map_err(|path| eyre!("non-UTF-8 path {path:?}"))?;
            let libdir = real
                .parent()
                .ok_or_else(|| eyre!("dynamic linker {real} has no parent directory"))?;
            for lib in ["libc.so.6", "libresolv.so.2"] {
                w.copy_file(libdir.join(lib).as_str())?;
            }
        }

        w.write_char_device("/dev/console", 5, 1, 0o700)?;

        // Linker configuration
        w.copy_file("/etc/ld.so.conf")?;
        w.copy_tree("/etc/ld.so.conf.d")?;

        // Core system configuration
        w.write_file("/etc/machine-id", b"", 0o444)?;
        w.write_file("/etc/hostname", b"fakemachine", 0o444)?;

        w.copy_file("/etc/passwd")?;
        w.copy_file("/etc/group")?;
        w.copy_file("/etc/nsswitch.conf")?;

        let udev_rules = self.backend.udev_rules(&self.images).join("\n") + "\n";
        w.write_file(
            "/etc/udev/rules.d/61-fakemachine.rules",
            udev_rules.as_bytes(),
            0o444,
        )?;

        w.write_file(
            "/etc/systemd/network/ethernet.network",
            self.networkd_unit().as_bytes(),
            0o444,
        )?;
        w.write_symlink("/lib/systemd/resolv.conf", "/etc/resolv.conf", 0o755)?;

        let release = self.backend.kernel_release()?;
        let moddir = self.backend.module_path()?;
        let mut resolver = ModuleResolver::new(&release, &moddir, prefix);
        for module in self.backend.init_modules() {
            resolver.include(w, module)?;
        }
        resolver.finish(w)?;

        w.write_file(
            "/etc/systemd/system/fakemachine.service",
            self.service_unit().as_bytes(),
            0o644,
        )?;
        w.write_symlink(
            "/dev/null",
            "/lib/systemd/system/serial-getty@ttyS0.service",
            0o755,
        )?;

        w.write_file("/wrapper", self.wrapper_script(command).as_bytes(), 0o755)?;
        w.write_file("/init", self.init_script().as_bytes(), 0o755)?;
        w.write_file("/etc/fstab", self.fstab_contents().as_bytes(), 0o755)?;

        for (source, destination) in extra_content {
            w.copy_file_to(source, destination)?;
        }
        Ok(())
    }

    fn startup(&mut self, command: &str, extra_content: &[(Utf8PathBuf, String)]) -> Result<i32> {
        // The tools this run shells out to (mkfs.ext4, modinfo) tend to
        // live in sbin directories not every user has on PATH.
        if let Ok(mut path) = env::var("PATH") {
            path.push_str(":/sbin:/usr/sbin");
            env::set_var("PATH", path);
        }

        let tmpdir = tempfile::Builder::new()
            .prefix("fakemachine-")
            .tempdir()
            .context("failed to create temporary directory")?;
        let tmp_path = Utf8Path::from_path(tmpdir.path())
            .ok_or_else(|| eyre!("non-UTF-8 temporary directory"))?
            .to_owned();

        // The guest reports the job's exit status through this share.
        self.add_volume_at(tmp_path.clone(), "/run/fakemachine");

        self.check_mounts()?;
        let _scratch = self.setup_scratch()?;

        let initrd_path = tmp_path.join("initramfs.cpio");
        let initrd = File::create(&initrd_path)
            .with_context(|| format!("failed to create {initrd_path}"))?;
        self.initrd_path = Some(initrd_path);

        let mut w = ArchiveWriter::new(BufWriter::new(initrd));
        self.compose_initramfs(&mut w, command, extra_content)?;
        w.finish()?
            .into_inner()
            .map_err(|err| eyre!("failed to flush initramfs: {err}"))?;

        debug!("starting {} backend", self.backend.name());
        let success = match self.backend.start(self) {
            Ok(success) => success,
            Err(err) => {
                return Err(eyre!("error starting {} backend: {err}", self.backend.name()))
            }
        };
        if !success {
            return Err(eyre!(
                "error starting {} backend: hypervisor exited with an error",
                self.backend.name()
            ));
        }

        let result = fs::read_to_string(tmp_path.join("result"))
            .context("no result available from the machine")?;
        let exit_code = result
            .trim()
            .parse::<i32>()
            .with_context(|| format!("unexpected result from the machine: '{}'", result.trim()))?;
        Ok(exit_code)
    }

    /// Run a command in the machine and return its exit code.
    pub fn run(&mut self, command: &str) -> Result<i32> {
        self.startup(command, &[])
    }

    /// Run the calling binary inside the machine with the given command
    /// line arguments. The binary detects re-entry through the
    /// `IN_FAKE_MACHINE` environment variable.
    pub fn run_in_machine_with_args(&mut self, args: &[&str]) -> Result<i32> {
        let executable = env::current_exe().context("failed to find executable")?;
        let executable = Utf8PathBuf::from_path_buf(executable)
            .map_err(|path| eyre!("non-UTF-8 executable path {path:?}"))?;
        let name = format!(
            "/{}",
            executable
                .file_name()
                .ok_or_else(|| eyre!("executable {executable} has no file name"))?
        );

        let mut command = vec![name.clone()];
        command.extend(args.iter().map(|arg| arg.to_string()));

        let extra_content = [(executable, name)];
        self.startup(&command.join(" "), &extra_content)
    }

    /// Run the calling binary inside the machine with the same command
    /// line arguments as the current process.
    pub fn run_in_machine(&mut self) -> Result<i32> {
        let args: Vec<String> = env::args().skip(1).collect();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_in_machine_with_args(&args)
    }
}

fn default_num_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TestBackend;

    impl Backend for TestBackend {
        fn name(&self) -> &'static str {
            "test"
        }
        fn supported(&self) -> Result<()> {
            Ok(())
        }
        fn kernel_release(&self) -> Result<String> {
            Ok("6.1.0-test".to_string())
        }
        fn kernel_path(&self) -> Result<Utf8PathBuf> {
            Ok("/boot/vmlinuz-test".into())
        }
        fn module_path(&self) -> Result<Utf8PathBuf> {
            Ok("/lib/modules/6.1.0-test".into())
        }
        fn udev_rules(&self, _images: &[Image]) -> Vec<String> {
            Vec::new()
        }
        fn networkd_match(&self) -> &'static str {
            "e*"
        }
        fn job_output_tty(&self, show_boot: bool) -> &'static str {
            if show_boot {
                "/dev/console"
            } else {
                "/dev/hvc0"
            }
        }
        fn mount_parameters(&self, _mount: &MountPoint) -> (&'static str, Vec<String>) {
            ("9p", vec!["trans=virtio".to_string()])
        }
        fn init_modules(&self) -> Vec<&'static str> {
            vec!["virtio_pci", "9p"]
        }
        fn init_static_volumes(&self) -> Vec<MountPoint> {
            Vec::new()
        }
        fn start(&self, _machine: &Machine) -> Result<bool> {
            Err(eyre!("test backend cannot start"))
        }
    }

    fn test_machine() -> Machine {
        Machine::from_backend(Box::new(TestBackend))
    }

    #[test]
    fn duplicate_volumes_are_ignored() {
        let mut m = test_machine();
        let before = m.mounts.len();
        m.add_volume_at("/srv/data", "/data");
        m.add_volume_at("/srv/data", "/data");
        assert_eq!(m.mounts.len(), before + 1);

        // a different guest path is a separate mount with a fresh label
        m.add_volume_at("/srv/data", "/data2");
        assert_eq!(m.mounts.len(), before + 2);
        let labels: Vec<&str> = m.mounts[before..].iter().map(|v| v.label.as_str()).collect();
        assert_ne!(labels[0], labels[1]);
    }

    #[test]
    fn image_labels_must_be_unique() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("a.img");
        let img = img.to_str().unwrap();

        let mut m = test_machine();
        m.create_image_with_label(img, 1024, "disk").unwrap();

        let other = dir.path().join("b.img");
        let err = m
            .create_image_with_label(other.to_str().unwrap(), 1024, "disk")
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn scratch_label_is_reserved() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("a.img");

        let mut m = test_machine();
        let err = m
            .create_image_with_label(img.to_str().unwrap(), 1024, SCRATCH_LABEL)
            .unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn long_labels_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("a.img");

        let mut m = test_machine();
        let err = m
            .create_image_with_label(img.to_str().unwrap(), 1024, "a-label-longer-than-20-chars")
            .unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn negative_size_requires_an_existing_image() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.img");

        let mut m = test_machine();
        let err = m.create_image(missing.to_str().unwrap(), -1).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
        assert!(m.images.is_empty());

        let existing = dir.path().join("existing.img");
        std::fs::write(&existing, b"data").unwrap();
        m.create_image(existing.to_str().unwrap(), -1).unwrap();
        assert_eq!(std::fs::metadata(&existing).unwrap().len(), 4);
    }

    #[test]
    fn create_image_returns_by_label_device() {
        let dir = tempfile::tempdir().unwrap();
        let img = dir.path().join("a.img");

        let mut m = test_machine();
        let device = m.create_image(img.to_str().unwrap(), 4096).unwrap();
        assert_eq!(device, "/dev/disk/by-fakemachine-label/fakedisk-0");
        assert_eq!(std::fs::metadata(&img).unwrap().len(), 4096);
    }

    #[test]
    fn fstab_defaults_to_memory_scratch() {
        let m = test_machine();
        let fstab = m.fstab_contents();
        assert!(fstab.starts_with("# Generated fstab file by fakemachine\n"));
        assert!(fstab.contains("none /scratch tmpfs size=95% 0 0"));
        assert!(fstab.ends_with('\n'));
        // static mounts are handled by the init script, not fstab
        assert!(!fstab.contains(" /usr "));
    }

    #[test]
    fn fstab_uses_scratch_device_when_set() {
        let mut m = test_machine();
        m.scratch_dev = Some("/dev/disk/by-fakemachine-label/fake-scratch".to_string());
        let fstab = m.fstab_contents();
        assert!(fstab.contains(
            "/dev/disk/by-fakemachine-label/fake-scratch /scratch ext4 defaults,relatime 0 0"
        ));
        assert!(!fstab.contains("tmpfs"));
    }

    #[test]
    fn fstab_lists_plain_volumes() {
        let mut m = test_machine();
        m.add_volume_at("/srv/data", "/data");
        let label = &m.mounts.last().unwrap().label;
        assert!(m
            .fstab_contents()
            .contains(&format!("{label} /data 9p trans=virtio 0 0")));
    }

    #[test]
    fn init_script_probes_modules_and_mounts_usr() {
        let m = test_machine();
        let script = m.init_script();
        assert!(script.starts_with("#!/bin/busybox sh\n"));
        assert!(script.contains("busybox modprobe virtio_pci\n"));
        assert!(script.contains("busybox modprobe 9p\n"));
        assert!(script.contains("busybox mkdir -p /usr\n"));
        assert!(script.contains("busybox mount -v -t 9p -o trans=virtio usr /usr\n"));
        assert!(script.ends_with("exec /lib/systemd/systemd\n"));
    }

    #[test]
    fn service_unit_carries_environment_and_tty() {
        let mut m = test_machine();
        m.set_environ(vec!["FOO=bar".to_string(), "BAZ=qux".to_string()]);
        let unit = m.service_unit();
        assert!(unit.contains("Environment=HOME=/root IN_FAKE_MACHINE=yes FOO=bar BAZ=qux"));
        assert!(unit.contains("TTYPath=/dev/hvc0"));
        assert!(unit.contains("OnFailure=poweroff.target"));

        m.set_show_boot(true);
        assert!(m.service_unit().contains("TTYPath=/dev/console"));
    }

    #[test]
    fn wrapper_runs_command_and_records_result() {
        let m = test_machine();
        let wrapper = m.wrapper_script("ls /");
        assert!(wrapper.contains("echo Running 'ls /' using 'test' backend\nls /\n"));
        assert!(wrapper.contains("echo $? > /run/fakemachine/result"));
    }

    #[test]
    fn networkd_unit_uses_backend_match() {
        let m = test_machine();
        let unit = m.networkd_unit();
        assert!(unit.contains("[Match]\nName=e*\n"));
        assert!(unit.contains("DHCP=ipv4"));
        assert!(unit.contains("IPv6AcceptRA=no"));
    }

    #[test]
    fn whitespace_in_guest_path_fails_validation() {
        let mut m = test_machine();
        m.add_volume_at("/dev", "/dev ices");
        let err = m.check_mounts().unwrap_err();
        assert!(err.to_string().contains("whitespace"));
    }

    #[test]
    fn missing_host_directory_fails_validation() {
        let mut m = test_machine();
        m.add_volume("/nonexistent-fakemachine-path");
        let err = m.check_mounts().unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
