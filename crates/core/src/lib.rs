//! `xbval-core` -- building blocks of the backup-restore validation pipeline.
//!
//! Everything that touches the host goes through [`process::CommandRunner`],
//! so each component can be driven by a scripted runner in tests.

pub mod cluster;
pub mod config;
pub mod datadir;
pub mod dump;
pub mod fs_guard;
pub mod process;
pub mod restore;
pub mod service;
