//! Shared building blocks for the Zenith crates: logging bootstrap, command-line
//! helpers and the hash collections used across the workspace.

pub mod cli;
pub mod collections;
pub mod log;
