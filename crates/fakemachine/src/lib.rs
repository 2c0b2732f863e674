//! fakemachine - run a command in a transient virtual machine.
//!
//! The machine shares the host's `/usr` (and friends) over a
//! paravirtualised transport, so the command sees an environment nearly
//! identical to the host while staying isolated from it: installing
//! packages, partitioning images or running privileged build steps leaves
//! the host untouched. The guest is assembled on the fly from the host's
//! own kernel, modules and binaries; no images are downloaded and nothing
//! persists beyond the run except what the caller mounted or exposed.
//!
//! Three backends are available behind one interface: kvm (hardware
//! accelerated), qemu (pure emulation) and uml (user-mode linux, no
//! hypervisor at all). `"auto"` picks the best supported one.
//!
//! ```no_run
//! use fakemachine::Machine;
//!
//! # fn main() -> color_eyre::Result<()> {
//! let mut m = Machine::new()?;
//! let exit_code = m.run("ls /")?;
//! # Ok(())
//! # }
//! ```

mod arch;
mod backend;
mod command_run;
mod cpio;
mod decompress;
mod machine;
mod modules;
mod qemu;
mod uml;

pub use backend::backend_names;
pub use cpio::{ArchiveWriter, Transformer};
pub use decompress::{
    gzip_decompressor, null_decompressor, xz_decompressor, zstd_decompressor,
};
pub use machine::Machine;

/// Whether this process is running inside a fakemachine guest.
pub fn in_machine() -> bool {
    std::env::var_os("IN_FAKE_MACHINE").is_some()
}

/// Whether any virtualisation backend is usable on this host.
pub fn supported() -> bool {
    backend::new_backend("auto").is_ok()
}
