//! Final boot artifacts: kernel command line, combined integrity volume and
//! the unified kernel image.

pub mod cmdline;
pub mod combine;
pub mod uki;

pub use cmdline::{write_command_line, BootCommandLine};
pub use combine::combine_volumes;
pub use uki::{build_boot_executable, render_os_release, write_os_release};
