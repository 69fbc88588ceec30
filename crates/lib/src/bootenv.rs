//! Writing the bootloader variables consulted at boot.
//!
//! The seed bootloader carries the recovery variables, the boot partition
//! bootloader the run kernel variables, and each recovery system its own
//! kernel and command line variables.

use std::collections::BTreeMap;

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;

use crate::bootloader::{Bootloader, BootloaderFinder, Options, Role};
use crate::config::Layout;
use crate::modeenv::Mode;
use crate::snap::SnapInfo;

pub(crate) const VAR_RECOVERY_SYSTEM: &str = "snapd_recovery_system";
pub(crate) const VAR_RECOVERY_MODE: &str = "snapd_recovery_mode";
pub(crate) const VAR_GOOD_RECOVERY_SYSTEMS: &str = "snapd_good_recovery_systems";
pub(crate) const VAR_BOOT_FLAGS: &str = "snapd_boot_flags";
pub(crate) const VAR_RECOVERY_KERNEL: &str = "snapd_recovery_kernel";
pub(crate) const VAR_KERNEL_STATUS: &str = "kernel_status";
pub(crate) const VAR_SNAP_KERNEL: &str = "snap_kernel";
pub(crate) const VAR_SNAP_TRY_KERNEL: &str = "snap_try_kernel";

/// Boot flags that may be passed on to the next boot.
const KNOWN_BOOT_FLAGS: &[&str] = &["factory"];

/// Errors recording a recovery capable system. The system is not usable
/// for recovery until this succeeds.
#[derive(thiserror::Error, Debug)]
#[error("cannot record {label:?} as a recovery capable system")]
pub struct RecoveryCapableError {
    /// The recovery system label.
    pub label: String,
    #[source]
    source: Box<dyn std::error::Error + Send + Sync + 'static>,
}

fn vars<const N: usize>(items: [(&str, &str); N]) -> BTreeMap<String, String> {
    items
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Reject boot flags this version does not understand.
pub(crate) fn check_boot_flags(flags: &[String]) -> Result<()> {
    let unknown: Vec<&str> = flags
        .iter()
        .map(String::as_str)
        .filter(|f| !KNOWN_BOOT_FLAGS.contains(f))
        .collect();
    if !unknown.is_empty() {
        anyhow::bail!("unknown boot flags {unknown:?} not allowed");
    }
    Ok(())
}

/// Select the recovery system and mode for the next boot from the seed.
#[context("Setting recovery variables")]
pub(crate) fn set_recovery_vars(
    bl: &dyn Bootloader,
    label: &str,
    mode: Mode,
    flags: &[String],
) -> Result<()> {
    check_boot_flags(flags)?;
    let mut v = vars([(VAR_RECOVERY_SYSTEM, label), (VAR_RECOVERY_MODE, mode.as_str())]);
    if !flags.is_empty() {
        v.insert(VAR_BOOT_FLAGS.to_string(), flags.join(","));
    }
    bl.set_boot_vars(&v)
}

/// Name the run kernel. `enabled` tells whether the bootloader already
/// points at it through its extracted kernel.
#[context("Setting run kernel variables")]
pub(crate) fn set_run_kernel_vars(bl: &dyn Bootloader, kernel: &SnapInfo, enabled: bool) -> Result<()> {
    let mut v = vars([(VAR_KERNEL_STATUS, "")]);
    if !enabled {
        v.insert(VAR_SNAP_KERNEL.to_string(), kernel.filename());
        v.insert(VAR_SNAP_TRY_KERNEL.to_string(), String::new());
    }
    bl.set_boot_vars(&v)
}

/// Set the variables of the recovery system in `system_dir`, relative to
/// the seed root.
#[context("Setting variables of recovery system {system_dir}")]
pub(crate) fn set_recovery_system_vars(
    bl: &dyn Bootloader,
    system_dir: &Utf8Path,
    kernel_path: &str,
    cmdline_vars: BTreeMap<String, String>,
) -> Result<()> {
    let Some(rbl) = bl.as_recovery_aware() else {
        anyhow::bail!(
            "cannot use {} bootloader: does not support recovery systems",
            bl.name()
        );
    };
    let mut v = cmdline_vars;
    v.insert(VAR_RECOVERY_KERNEL.to_string(), kernel_path.to_string());
    rbl.set_recovery_system_env(system_dir, &v)
}

fn find_seed_bootloader(finder: &BootloaderFinder, layout: &Layout) -> Result<Box<dyn Bootloader>> {
    let opts = Options {
        role: Role::Recovery,
        ..Default::default()
    };
    finder.find(&layout.ubuntu_seed(), &opts)
}

fn append_good_recovery_system(finder: &BootloaderFinder, layout: &Layout, label: &str) -> Result<()> {
    let bl = find_seed_bootloader(finder, layout)?;
    let current = bl.get_boot_vars(&[VAR_GOOD_RECOVERY_SYSTEMS])?;
    let mut good: Vec<&str> = current
        .get(VAR_GOOD_RECOVERY_SYSTEMS)
        .map(|v| v.split(',').filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    if good.contains(&label) {
        tracing::debug!("{label} already recovery capable");
        return Ok(());
    }
    good.push(label);
    let good = good.join(",");
    bl.set_boot_vars(&vars([(VAR_GOOD_RECOVERY_SYSTEMS, good.as_str())]))
}

/// Record `label` as a recovery capable system in the seed environment.
/// Recording an already recorded system is a no-op.
pub fn mark_recovery_capable_system(
    finder: &BootloaderFinder,
    layout: &Layout,
    label: &str,
) -> Result<(), RecoveryCapableError> {
    append_good_recovery_system(finder, layout, label).map_err(|e| RecoveryCapableError {
        label: label.to_string(),
        source: e.into(),
    })
}

/// Make the next boot go to run mode, from recovery system `label`.
#[context("Setting next boot to run mode")]
pub fn ensure_next_boot_to_run_mode(finder: &BootloaderFinder, layout: &Layout, label: &str) -> Result<()> {
    let bl = find_seed_bootloader(finder, layout)?;
    bl.set_boot_vars(&vars([
        (VAR_RECOVERY_MODE, Mode::Run.as_str()),
        (VAR_RECOVERY_SYSTEM, label),
    ]))
}
