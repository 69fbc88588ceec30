//! # Boot subsystem for snap based systems
//!
//! This crate prepares systems booting from a seed of recovery systems:
//! it makes images and recovery systems bootable, installs a run system,
//! seals the disk keys against the measured boot chains, and maintains
//! the mode environment read by early boot.
//!
//! The `snapboot` binary (`crates/cli`) is a thin wrapper that delegates
//! to [`cli::run_from_iter`].
//!
//! # Module Index
//!
//! - [`boot`] - Entry operations: make bootable, make runnable
//! - [`seal`] - Sealing orchestration and the backend interfaces
//! - [`bootchain`] - Boot chains sealed against
//! - [`assets`] - Trusted boot asset hashing and caching
//! - [`cmdline`] - Kernel command line composition
//! - [`modeenv`] - The mode environment file
//! - [`installer`] - Installing snaps and kernel assets
//! - [`bootloader`] - Bootloader capabilities and detection
//! - [`config`] - Partition layout configuration

pub mod assets;
pub mod boot;
pub mod bootchain;
mod bootenv;
pub mod bootloader;
pub mod cli;
pub mod cmdline;
pub mod config;
pub mod installer;
mod kernel_cmdline;
pub mod modeenv;
pub mod model;
pub mod seal;
pub mod snap;
mod utils;

pub use bootenv::{mark_recovery_capable_system, RecoveryCapableError};
