//! The qemu and kvm backends.
//!
//! Both drive qemu-system-* with a directly booted kernel, 9p volume
//! shares and virtio-blk disks; kvm additionally enables hardware
//! virtualisation and therefore requires /dev/kvm. Job output is routed
//! through a virtio console so boot noise stays off the user's terminal
//! unless show-boot asks for it.

use std::fs::OpenOptions;
use std::process::Command;

use camino::Utf8PathBuf;
use color_eyre::eyre::{eyre, Context};
use color_eyre::Result;
use tracing::debug;

use crate::arch::Arch;
use crate::backend::{
    disk_udev_rules, host_kernel_path, host_kernel_release, host_module_path, Backend,
};
use crate::machine::{Image, Machine, MountPoint};

struct QemuMachine {
    binary: &'static str,
    console: &'static str,
    machine: &'static str,
    /// Cpu to pass explicitly when the architecture has no good default.
    cpu: Option<&'static str>,
}

impl QemuMachine {
    fn for_arch(arch: Arch) -> QemuMachine {
        match arch {
            Arch::Amd64 => QemuMachine {
                binary: "qemu-system-x86_64",
                console: "ttyS0",
                machine: "pc",
                cpu: None,
            },
            Arch::Arm64 => QemuMachine {
                binary: "qemu-system-aarch64",
                console: "ttyAMA0",
                machine: "virt",
                // The default cpu is a 32 bit one and "max" is far too
                // slow to emulate, so pick a small 64 bit cortex-a.
                cpu: Some("cortex-a53"),
            },
        }
    }
}

#[derive(Debug)]
pub(crate) struct QemuBackend {
    arch: Option<Arch>,
}

impl QemuBackend {
    pub(crate) fn new() -> Self {
        QemuBackend { arch: Arch::host() }
    }

    #[cfg(test)]
    fn for_arch(arch: Arch) -> Self {
        QemuBackend { arch: Some(arch) }
    }

    fn machine_type(&self) -> Result<QemuMachine> {
        let arch = self
            .arch
            .ok_or_else(|| eyre!("unsupported architecture for qemu"))?;
        Ok(QemuMachine::for_arch(arch))
    }

    fn qemu_path(&self) -> Result<Utf8PathBuf> {
        let machine = self.machine_type()?;
        let path = which::which(machine.binary)
            .map_err(|_| eyre!("{} not found in PATH", machine.binary))?;
        Utf8PathBuf::from_path_buf(path).map_err(|path| eyre!("non-UTF-8 path {path:?}"))
    }

    fn qemu_args(&self, m: &Machine, kvm: bool) -> Result<Vec<String>> {
        let machine = self.machine_type()?;
        let kernel_path = match &m.kernel_path {
            Some(path) => path.clone(),
            None => host_kernel_path()?,
        };
        let initrd_path = m
            .initrd_path
            .as_ref()
            .ok_or_else(|| eyre!("initramfs has not been assembled"))?;

        let mut args: Vec<String> = vec![
            "-smp".into(),
            m.num_cpus.to_string(),
            "-m".into(),
            m.memory.to_string(),
            "-kernel".into(),
            kernel_path.into_string(),
            "-initrd".into(),
            initrd_path.to_string(),
            "-display".into(),
            "none".into(),
            "-nic".into(),
            "user,model=virtio-net-pci".into(),
            "-no-reboot".into(),
        ];

        if kvm {
            args.extend(["-cpu".into(), "host".into(), "-enable-kvm".into()]);
        } else if let Some(cpu) = machine.cpu {
            args.extend(["-cpu".into(), cpu.into()]);
        }
        args.extend(["-machine".into(), machine.machine.into()]);

        let mut kernel_args = vec![
            format!("console={}", machine.console),
            "panic=-1".to_string(),
            "plymouth.enable=0".to_string(),
            "systemd.unit=fakemachine.service".to_string(),
        ];

        if m.show_boot {
            // Wire the emulated serial port, which is the console for the
            // BIOS, the kernel and systemd, straight to our stdio.
            args.extend([
                "-chardev".into(),
                "stdio,id=for-ttyS0,signal=off".into(),
                "-serial".into(),
                "chardev:for-ttyS0".into(),
            ]);
            kernel_args.push("loglevel=7".to_string());
        } else {
            args.extend([
                // The bus for virtio consoles
                "-device".into(),
                "virtio-serial".into(),
                // Keep /dev/ttyS0 as the VM console but discard whatever
                // it prints, so boot noise cannot corrupt our terminal
                "-chardev".into(),
                "null,id=for-ttyS0".into(),
                "-serial".into(),
                "chardev:for-ttyS0".into(),
                // Job output arrives on /dev/hvc0, connected to stdio
                "-chardev".into(),
                "stdio,id=for-hvc0,signal=off".into(),
                "-device".into(),
                "virtconsole,chardev=for-hvc0".into(),
            ]);
        }

        for mount in &m.mounts {
            args.extend([
                "-virtfs".into(),
                format!(
                    "local,mount_tag={},path={},security_model=none,multidevs=remap",
                    mount.label, mount.host_directory
                ),
            ]);
        }

        for (i, img) in m.images.iter().enumerate() {
            args.extend([
                "-drive".into(),
                format!(
                    "file={},if=none,format=raw,cache=unsafe,id=drive-virtio-disk{i}",
                    img.path
                ),
                "-device".into(),
                format!(
                    "virtio-blk-pci,drive=drive-virtio-disk{i},id=virtio-disk{i},\
                     serial={},logical_block_size={},physical_block_size={}",
                    img.label, m.sector_size, m.sector_size
                ),
            ]);
        }

        args.extend(["-append".into(), kernel_args.join(" ")]);
        Ok(args)
    }

    fn start_qemu(&self, m: &Machine, kvm: bool) -> Result<bool> {
        let binary = self.qemu_path()?;
        let args = self.qemu_args(m, kvm)?;
        debug!("{binary} {}", args.join(" "));

        let status = Command::new(binary.as_std_path())
            .args(&args)
            .status()
            .with_context(|| format!("failed to start {binary}"))?;
        Ok(status.success())
    }
}

impl Backend for QemuBackend {
    fn name(&self) -> &'static str {
        "qemu"
    }

    fn supported(&self) -> Result<()> {
        self.qemu_path().map(|_| ())
    }

    fn kernel_release(&self) -> Result<String> {
        host_kernel_release()
    }

    fn kernel_path(&self) -> Result<Utf8PathBuf> {
        host_kernel_path()
    }

    fn module_path(&self) -> Result<Utf8PathBuf> {
        host_module_path()
    }

    fn udev_rules(&self, images: &[Image]) -> Vec<String> {
        disk_udev_rules("vd", images)
    }

    fn networkd_match(&self) -> &'static str {
        "e*"
    }

    fn job_output_tty(&self, show_boot: bool) -> &'static str {
        // Job output normally goes to the second virtio console, keeping
        // /dev/ttyS0 for the boot messages we discard. When debugging the
        // boot, mix it into the normal console instead so both are
        // visible.
        if show_boot {
            "/dev/console"
        } else {
            "/dev/hvc0"
        }
    }

    fn mount_parameters(&self, _mount: &MountPoint) -> (&'static str, Vec<String>) {
        (
            "9p",
            vec![
                "trans=virtio".to_string(),
                "version=9p2000.L".to_string(),
                "cache=loose".to_string(),
                "msize=262144".to_string(),
            ],
        )
    }

    fn init_modules(&self) -> Vec<&'static str> {
        vec!["virtio_pci", "virtio_console", "9pnet_virtio", "9p"]
    }

    fn init_static_volumes(&self) -> Vec<MountPoint> {
        Vec::new()
    }

    fn start(&self, machine: &Machine) -> Result<bool> {
        self.start_qemu(machine, false)
    }
}

#[derive(Debug)]
pub(crate) struct KvmBackend(QemuBackend);

impl KvmBackend {
    pub(crate) fn new() -> Self {
        KvmBackend(QemuBackend::new())
    }
}

impl Backend for KvmBackend {
    fn name(&self) -> &'static str {
        "kvm"
    }

    fn supported(&self) -> Result<()> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/kvm")
            .context("/dev/kvm is not usable")?;
        self.0.supported()
    }

    fn kernel_release(&self) -> Result<String> {
        self.0.kernel_release()
    }

    fn kernel_path(&self) -> Result<Utf8PathBuf> {
        self.0.kernel_path()
    }

    fn module_path(&self) -> Result<Utf8PathBuf> {
        self.0.module_path()
    }

    fn udev_rules(&self, images: &[Image]) -> Vec<String> {
        self.0.udev_rules(images)
    }

    fn networkd_match(&self) -> &'static str {
        self.0.networkd_match()
    }

    fn job_output_tty(&self, show_boot: bool) -> &'static str {
        self.0.job_output_tty(show_boot)
    }

    fn mount_parameters(&self, mount: &MountPoint) -> (&'static str, Vec<String>) {
        self.0.mount_parameters(mount)
    }

    fn init_modules(&self) -> Vec<&'static str> {
        self.0.init_modules()
    }

    fn init_static_volumes(&self) -> Vec<MountPoint> {
        self.0.init_static_volumes()
    }

    fn start(&self, machine: &Machine) -> Result<bool> {
        self.0.start_qemu(machine, true)
    }
}
