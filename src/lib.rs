#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod bootsvc;
pub mod cli;
pub mod cloudinit;
pub mod config;
pub mod error;
pub mod logging;
pub mod paths;
pub mod ports;
pub mod qemu;
pub mod ssh;
pub mod sshkeys;
pub mod store;
pub mod supervisor;
pub mod wait;
