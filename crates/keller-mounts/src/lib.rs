//! # keller-mounts
//!
//! Readers for the two proc views of the kernel mount table:
//!
//! - [`flat`] parses the flat `/proc/self/mounts` listing, one record per
//!   mounted filesystem.
//! - [`tree`] parses `/proc/self/mountinfo` and links its records by parent
//!   id into a tree of uniquely-owned nodes, so callers can walk a mount
//!   point's descendants.
//!
//! Both readers take an explicit path as well, which lets tests feed
//! fixture files and lets callers inspect another process through
//! `/proc/<pid>/mountinfo`.

#![warn(missing_docs)]

pub mod flat;
pub mod tree;

pub use flat::MountEntry;
pub use tree::{MountNode, MountTree};
