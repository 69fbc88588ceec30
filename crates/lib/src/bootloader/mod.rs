//! # Bootloader driver interface
//!
//! Boot operations talk to bootloaders only through [`Bootloader`]. Every
//! bootloader can store variables, install its configuration from a gadget
//! and extract kernel assets. Extra capabilities are optional and obtained
//! through the `as_*` queries, which return `None` when a driver lacks
//! them.
//!
//! Drivers are registered with a [`BootloaderFinder`]. A finder may carry
//! a forced driver which then wins over detection; this replaces any
//! process-wide override.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Serialize;

use crate::snap::{SnapContainer, SnapInfo};

#[cfg(test)]
pub(crate) mod mock;

/// The boot path a bootloader serves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// A system without boot modes has a single bootloader.
    #[default]
    Sole,
    /// The bootloader on the seed partition.
    Recovery,
    /// The bootloader on the boot partition.
    RunMode,
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Sole => "sole",
            Role::Recovery => "recovery",
            Role::RunMode => "run-mode",
        };
        f.write_str(s)
    }
}

/// How a bootloader is looked up or instantiated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options {
    /// The operation runs while building an image, not on a device.
    pub prepare_image_time: bool,
    /// The role of the bootloader.
    pub role: Role,
    /// The boot partition is not mounted at `/boot`, its contents are
    /// directly under the root passed to the driver.
    pub no_slash_boot: bool,
}

/// An entry in a boot chain as reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootFile {
    /// The snap the file is read from, for files inside a snap.
    pub snap: Option<Utf8PathBuf>,
    /// Path of the file, relative to the bootloader root or snap.
    pub path: Utf8PathBuf,
    /// Role of the bootloader the file belongs to.
    pub role: Role,
}

impl BootFile {
    /// A bootloader asset.
    pub fn asset(path: impl Into<Utf8PathBuf>, role: Role) -> Self {
        Self {
            snap: None,
            path: path.into(),
            role,
        }
    }

    /// A file inside a snap.
    pub fn in_snap(snap: impl Into<Utf8PathBuf>, path: impl Into<Utf8PathBuf>, role: Role) -> Self {
        Self {
            snap: Some(snap.into()),
            path: path.into(),
            role,
        }
    }
}

/// Parameters for registering a firmware boot option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EfiLoadOption {
    /// Boot option description.
    pub description: String,
    /// The asset the firmware should load.
    pub asset_path: Utf8PathBuf,
    /// Opaque optional data for the load option.
    pub optional_data: Vec<u8>,
}

/// Errors detecting bootloaders.
#[derive(thiserror::Error, Debug)]
pub enum BootloaderError {
    /// No registered driver recognized the location.
    #[error("cannot determine bootloader")]
    NotFound,
}

/// The base bootloader capability.
pub trait Bootloader: Debug {
    /// Driver name, e.g. `grub`.
    fn name(&self) -> &str;
    /// Whether the bootloader is installed at its root.
    fn present(&self) -> Result<bool>;
    /// Install the bootloader configuration shipped by the gadget.
    fn install_boot_config(&self, gadget_dir: &Utf8Path, opts: &Options) -> Result<()>;
    /// Set environment variables; an empty value unsets a variable.
    fn set_boot_vars(&self, vars: &BTreeMap<String, String>) -> Result<()>;
    /// Get environment variables; unset variables are empty strings.
    fn get_boot_vars(&self, names: &[&str]) -> Result<BTreeMap<String, String>>;
    /// Extract the kernel's boot assets to where the bootloader expects them.
    fn extract_kernel_assets(&self, kernel: &SnapInfo, container: &dyn SnapContainer) -> Result<()>;

    /// Trusted assets capability.
    fn as_trusted_assets(&self) -> Option<&dyn TrustedAssetsBootloader> {
        None
    }
    /// Recovery systems capability.
    fn as_recovery_aware(&self) -> Option<&dyn RecoveryAwareBootloader> {
        None
    }
    /// Extracted run kernel capability.
    fn as_extracted_run_kernel(&self) -> Option<&dyn ExtractedRunKernelImageBootloader> {
        None
    }
    /// Extracted recovery kernel capability.
    fn as_extracted_recovery_kernel(&self) -> Option<&dyn ExtractedRecoveryKernelImageBootloader> {
        None
    }
    /// Firmware boot option capability.
    fn as_uefi(&self) -> Option<&dyn UefiBootloader> {
        None
    }
}

/// A bootloader whose binaries are measured and whose command line it
/// manages itself.
pub trait TrustedAssetsBootloader {
    /// Trusted asset paths relative to the bootloader root.
    fn trusted_assets(&self) -> Result<Vec<Utf8PathBuf>>;
    /// The built-in static command line snippet.
    fn default_command_line(&self, candidate: bool) -> Result<String>;
    /// Files loaded when booting into recovery, kernel last.
    fn recovery_boot_chain(&self, kernel_path: &Utf8Path) -> Result<Vec<BootFile>>;
    /// Files loaded when booting into run mode through `run_bl`, kernel
    /// last.
    fn boot_chain(&self, run_bl: &dyn Bootloader, kernel_path: &Utf8Path) -> Result<Vec<BootFile>>;
}

/// A bootloader with a separate environment per recovery system.
pub trait RecoveryAwareBootloader {
    /// Set variables for the recovery system in `recovery_system_dir`,
    /// relative to the bootloader root.
    fn set_recovery_system_env(
        &self,
        recovery_system_dir: &Utf8Path,
        vars: &BTreeMap<String, String>,
    ) -> Result<()>;
}

/// A bootloader loading the run mode kernel from extracted files.
pub trait ExtractedRunKernelImageBootloader {
    /// Point the stable kernel name at the given kernel.
    fn enable_kernel(&self, kernel: &SnapInfo) -> Result<()>;
}

/// A bootloader loading recovery kernels from files extracted into the
/// recovery system.
pub trait ExtractedRecoveryKernelImageBootloader {
    /// Extract kernel assets into `recovery_system_dir`.
    fn extract_recovery_kernel_assets(
        &self,
        recovery_system_dir: &Utf8Path,
        kernel: &SnapInfo,
        container: &dyn SnapContainer,
    ) -> Result<()>;
}

/// A bootloader started by UEFI firmware.
pub trait UefiBootloader {
    /// The load option to register with the firmware.
    fn efi_load_option_parameters(&self) -> Result<EfiLoadOption>;
}

/// A bootloader implementation that can be detected and instantiated.
pub trait BootloaderDriver: Debug {
    /// Driver name.
    fn name(&self) -> &str;
    /// Whether the gadget ships configuration for this bootloader.
    fn supports_gadget(&self, gadget_dir: &Utf8Path) -> bool;
    /// Instantiate the bootloader rooted at `rootdir`.
    fn instantiate(&self, rootdir: &Utf8Path, opts: &Options) -> Box<dyn Bootloader>;
}

/// Locates bootloaders among a set of drivers.
#[derive(Debug, Clone, Default)]
pub struct BootloaderFinder {
    drivers: Vec<Arc<dyn BootloaderDriver>>,
    forced: Option<Arc<dyn BootloaderDriver>>,
}

impl BootloaderFinder {
    /// A finder trying `drivers` in order.
    pub fn new(drivers: Vec<Arc<dyn BootloaderDriver>>) -> Self {
        Self {
            drivers,
            forced: None,
        }
    }

    /// Use `driver` for every lookup, bypassing detection.
    pub fn with_forced(mut self, driver: Arc<dyn BootloaderDriver>) -> Self {
        self.forced = Some(driver);
        self
    }

    /// Find the bootloader installed under `rootdir`.
    #[context("Finding bootloader in {rootdir}")]
    pub fn find(&self, rootdir: &Utf8Path, opts: &Options) -> Result<Box<dyn Bootloader>> {
        if let Some(forced) = self.forced.as_ref() {
            return Ok(forced.instantiate(rootdir, opts));
        }
        for driver in self.drivers.iter() {
            let bl = driver.instantiate(rootdir, opts);
            if bl.present()? {
                tracing::debug!("Found {} bootloader ({})", bl.name(), opts.role);
                return Ok(bl);
            }
        }
        Err(BootloaderError::NotFound.into())
    }

    /// Find the bootloader the gadget ships configuration for, to be
    /// installed under `rootdir`.
    pub fn for_gadget(
        &self,
        gadget_dir: &Utf8Path,
        rootdir: &Utf8Path,
        opts: &Options,
    ) -> Result<Box<dyn Bootloader>> {
        if let Some(forced) = self.forced.as_ref() {
            return Ok(forced.instantiate(rootdir, opts));
        }
        self.drivers
            .iter()
            .find(|d| d.supports_gadget(gadget_dir))
            .map(|d| d.instantiate(rootdir, opts))
            .ok_or_else(|| BootloaderError::NotFound.into())
    }

    /// Install the boot configuration of the gadget's bootloader under
    /// `rootdir`.
    #[context("Installing boot config")]
    pub fn install_boot_config(
        &self,
        gadget_dir: &Utf8Path,
        rootdir: &Utf8Path,
        opts: &Options,
    ) -> Result<()> {
        let bl = self.for_gadget(gadget_dir, rootdir, opts)?;
        bl.install_boot_config(gadget_dir, opts)
    }
}
