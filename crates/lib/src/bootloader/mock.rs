//! An in-tree bootloader driver for unit tests. It keeps its environment
//! in flat `key=value` files and can be configured to look like a UEFI
//! bootloader with trusted assets or like a simple embedded one.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use super::*;
use crate::installer;

pub(crate) const STATIC_CMDLINE: &str = "console=ttyS0 console=tty1 panic=-1";

#[derive(Debug, Clone)]
pub(crate) struct MockFeatures {
    pub(crate) name: &'static str,
    pub(crate) env_dir: &'static str,
    pub(crate) trusted: bool,
    pub(crate) extracted_run: bool,
    pub(crate) extracted_recovery: bool,
    pub(crate) uefi: bool,
}

impl MockFeatures {
    pub(crate) fn grub() -> Self {
        Self {
            name: "grub",
            env_dir: "EFI/ubuntu",
            trusted: true,
            extracted_run: true,
            extracted_recovery: false,
            uefi: true,
        }
    }

    /// Like `grub`, without trusted assets.
    pub(crate) fn grub_untrusted() -> Self {
        Self {
            trusted: false,
            uefi: false,
            ..Self::grub()
        }
    }

    pub(crate) fn piboot() -> Self {
        Self {
            name: "piboot",
            env_dir: "piboot/ubuntu",
            trusted: false,
            extracted_run: false,
            extracted_recovery: true,
            uefi: false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockDriver {
    features: MockFeatures,
}

impl MockDriver {
    pub(crate) fn new(features: MockFeatures) -> Self {
        Self { features }
    }
}

impl BootloaderDriver for MockDriver {
    fn name(&self) -> &str {
        self.features.name
    }

    fn supports_gadget(&self, gadget_dir: &Utf8Path) -> bool {
        gadget_dir.join(format!("{}.conf", self.features.name)).exists()
    }

    fn instantiate(&self, rootdir: &Utf8Path, opts: &Options) -> Box<dyn Bootloader> {
        Box::new(MockBootloader {
            features: self.features.clone(),
            root: rootdir.to_owned(),
            role: opts.role,
        })
    }
}

#[derive(Debug)]
pub(crate) struct MockBootloader {
    features: MockFeatures,
    root: Utf8PathBuf,
    role: Role,
}

pub(crate) fn read_env(path: &Utf8Path) -> Result<BTreeMap<String, String>> {
    let buf = std::fs::read_to_string(path).with_context(|| format!("open {path}"))?;
    Ok(buf
        .lines()
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect())
}

fn update_env(path: &Utf8Path, vars: &BTreeMap<String, String>) -> Result<()> {
    let mut env = if path.exists() {
        read_env(path)?
    } else {
        BTreeMap::new()
    };
    env.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
    let buf: String = env.iter().map(|(k, v)| format!("{k}={v}\n")).collect();
    std::fs::create_dir_all(path.parent().unwrap())?;
    std::fs::write(path, buf)?;
    Ok(())
}

impl MockBootloader {
    fn dir(&self) -> Utf8PathBuf {
        self.root.join(self.features.env_dir)
    }

    pub(crate) fn env_path(&self) -> Utf8PathBuf {
        self.dir().join("grubenv")
    }
}

impl Bootloader for MockBootloader {
    fn name(&self) -> &str {
        self.features.name
    }

    fn present(&self) -> Result<bool> {
        Ok(self.dir().join("boot.cfg").exists())
    }

    fn install_boot_config(&self, gadget_dir: &Utf8Path, _opts: &Options) -> Result<()> {
        let conf = std::fs::read(gadget_dir.join(format!("{}.conf", self.features.name)))?;
        std::fs::create_dir_all(self.dir())?;
        std::fs::write(self.dir().join("boot.cfg"), conf)?;
        if !self.env_path().exists() {
            std::fs::write(self.env_path(), "")?;
        }
        Ok(())
    }

    fn set_boot_vars(&self, vars: &BTreeMap<String, String>) -> Result<()> {
        update_env(&self.env_path(), vars)
    }

    fn get_boot_vars(&self, names: &[&str]) -> Result<BTreeMap<String, String>> {
        let env = read_env(&self.env_path())?;
        Ok(names
            .iter()
            .map(|n| (n.to_string(), env.get(*n).cloned().unwrap_or_default()))
            .collect())
    }

    fn extract_kernel_assets(&self, kernel: &SnapInfo, container: &dyn SnapContainer) -> Result<()> {
        let dest = self.dir().join(kernel.filename());
        installer::extract_kernel_files(container, &["kernel.efi", "kernel.img"], &dest)
    }

    fn as_trusted_assets(&self) -> Option<&dyn TrustedAssetsBootloader> {
        self.features.trusted.then_some(self as &dyn TrustedAssetsBootloader)
    }

    fn as_recovery_aware(&self) -> Option<&dyn RecoveryAwareBootloader> {
        Some(self)
    }

    fn as_extracted_run_kernel(&self) -> Option<&dyn ExtractedRunKernelImageBootloader> {
        self.features
            .extracted_run
            .then_some(self as &dyn ExtractedRunKernelImageBootloader)
    }

    fn as_extracted_recovery_kernel(&self) -> Option<&dyn ExtractedRecoveryKernelImageBootloader> {
        self.features
            .extracted_recovery
            .then_some(self as &dyn ExtractedRecoveryKernelImageBootloader)
    }

    fn as_uefi(&self) -> Option<&dyn UefiBootloader> {
        self.features.uefi.then_some(self as &dyn UefiBootloader)
    }
}

impl TrustedAssetsBootloader for MockBootloader {
    fn trusted_assets(&self) -> Result<Vec<Utf8PathBuf>> {
        let r = match self.role {
            Role::RunMode => vec!["EFI/boot/grubx64.efi".into()],
            _ => vec!["EFI/boot/bootx64.efi".into(), "EFI/boot/grubx64.efi".into()],
        };
        Ok(r)
    }

    fn default_command_line(&self, _candidate: bool) -> Result<String> {
        Ok(STATIC_CMDLINE.to_string())
    }

    fn recovery_boot_chain(&self, kernel_path: &Utf8Path) -> Result<Vec<BootFile>> {
        Ok(vec![
            BootFile::asset("EFI/boot/bootx64.efi", Role::Recovery),
            BootFile::asset("EFI/boot/grubx64.efi", Role::Recovery),
            BootFile::in_snap(kernel_path, "kernel.efi", Role::Recovery),
        ])
    }

    fn boot_chain(&self, _run_bl: &dyn Bootloader, kernel_path: &Utf8Path) -> Result<Vec<BootFile>> {
        Ok(vec![
            BootFile::asset("EFI/boot/bootx64.efi", Role::Recovery),
            BootFile::asset("EFI/boot/grubx64.efi", Role::Recovery),
            BootFile::asset("EFI/boot/grubx64.efi", Role::RunMode),
            BootFile::in_snap(kernel_path, "kernel.efi", Role::RunMode),
        ])
    }
}

impl RecoveryAwareBootloader for MockBootloader {
    fn set_recovery_system_env(
        &self,
        recovery_system_dir: &Utf8Path,
        vars: &BTreeMap<String, String>,
    ) -> Result<()> {
        update_env(&self.root.join(recovery_system_dir).join("grubenv"), vars)
    }
}

impl ExtractedRunKernelImageBootloader for MockBootloader {
    fn enable_kernel(&self, kernel: &SnapInfo) -> Result<()> {
        installer::link_current_kernel(&self.dir(), kernel, "kernel.efi")
    }
}

impl ExtractedRecoveryKernelImageBootloader for MockBootloader {
    fn extract_recovery_kernel_assets(
        &self,
        recovery_system_dir: &Utf8Path,
        _kernel: &SnapInfo,
        container: &dyn SnapContainer,
    ) -> Result<()> {
        let dest = self.root.join(recovery_system_dir).join("kernel");
        installer::extract_kernel_files(container, &["kernel.img", "initrd.img", "dtbs/*"], &dest)
    }
}

impl UefiBootloader for MockBootloader {
    fn efi_load_option_parameters(&self) -> Result<EfiLoadOption> {
        Ok(EfiLoadOption {
            description: "ubuntu".into(),
            asset_path: self.root.join("EFI/boot/bootx64.efi"),
            optional_data: Vec::new(),
        })
    }
}
