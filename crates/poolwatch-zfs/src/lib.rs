//! Native volume-manager boundary backed by the host's `zfs` and `zpool`
//! binaries. `system` implements the backend trait, while `command` and
//! `parse` cover process handling and output parsing.

mod command;
mod parse;
mod system;

pub use parse::parse_size;
pub use system::{SystemZfsBackend, DEFAULT_ZFS_PATHS, DEFAULT_ZPOOL_PATHS};
