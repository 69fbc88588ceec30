//! # Boot chains
//!
//! A boot chain is the ordered list of trusted assets measured when
//! booting a given path, followed by the kernel. The order comes from the
//! bootloader driver and is kept as is, the sealing policy depends on it.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Serialize;

use crate::bootloader::{BootFile, Bootloader, Role, TrustedAssetsBootloader};
use crate::modeenv::ModeEnv;
use crate::model::Model;
use crate::snap::SnapInfo;

/// A trusted asset with every digest it may currently have.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BootAsset {
    /// Role of the bootloader the asset belongs to.
    pub role: Role,
    /// Asset file name.
    pub name: String,
    /// Digests, oldest first.
    pub hashes: Vec<String>,
}

/// The kernel at the end of a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelBootFile {
    /// The kernel snap.
    pub snap: Utf8PathBuf,
    /// The file inside the snap that is booted.
    pub path: Utf8PathBuf,
}

/// One boot path to seal against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BootChain {
    /// Recovery or run mode.
    pub role: Role,
    /// Model brand.
    pub brand_id: String,
    /// Model name.
    pub model: String,
    /// Model grade.
    pub grade: String,
    /// Classic model.
    pub classic: bool,
    /// Model signing key.
    pub model_sign_key_id: String,
    /// Measured assets in boot order.
    pub asset_chain: Vec<BootAsset>,
    /// Kernel snap name.
    pub kernel: String,
    /// Kernel snap revision.
    pub kernel_revision: String,
    /// Command lines the kernel may be booted with.
    pub kernel_cmdlines: Vec<String>,
    /// The booted kernel file.
    pub kernel_boot_file: KernelBootFile,
}

/// Resolve the driver's boot files into assets with digests taken from the
/// modeenv. The last file is the kernel.
pub fn build_boot_assets(
    files: &[BootFile],
    modeenv: &ModeEnv,
) -> Result<(Vec<BootAsset>, KernelBootFile)> {
    let Some((kernel, assets)) = files.split_last() else {
        anyhow::bail!("internal error: cannot build boot assets without boot files");
    };
    let Some(snap) = kernel.snap.clone() else {
        anyhow::bail!("internal error: last boot file {} is not a kernel", kernel.path);
    };
    let mut r = Vec::with_capacity(assets.len());
    for f in assets {
        let Some(name) = f.path.file_name() else {
            anyhow::bail!("internal error: invalid boot file {}", f.path);
        };
        let known = match f.role {
            Role::RunMode => &modeenv.current_trusted_boot_assets,
            _ => &modeenv.current_trusted_recovery_boot_assets,
        };
        let Some(hashes) = known.get(name) else {
            anyhow::bail!("cannot find expected boot asset {name} in modeenv");
        };
        r.push(BootAsset {
            role: f.role,
            name: name.to_string(),
            hashes: hashes.to_vec(),
        });
    }
    let kernel = KernelBootFile {
        snap,
        path: kernel.path.clone(),
    };
    Ok((r, kernel))
}

fn to_chain(
    role: Role,
    model: &Model,
    (asset_chain, kernel_boot_file): (Vec<BootAsset>, KernelBootFile),
    kernel: &SnapInfo,
    cmdlines: &[String],
) -> BootChain {
    BootChain {
        role,
        brand_id: model.brand_id.clone(),
        model: model.model.clone(),
        grade: model.grade.to_string(),
        classic: model.classic,
        model_sign_key_id: model.sign_key_id.clone(),
        asset_chain,
        kernel: kernel.name.clone(),
        kernel_revision: kernel.revision.to_string(),
        kernel_cmdlines: cmdlines.to_vec(),
        kernel_boot_file,
    }
}

/// The chain booting the run mode kernel `kernel` through the recovery
/// bootloader `rbl` and the run mode bootloader `bl`.
#[context("Building run mode boot chain")]
pub fn run_mode_boot_chain(
    rbl: &dyn TrustedAssetsBootloader,
    bl: &dyn Bootloader,
    modeenv: &ModeEnv,
    model: &Model,
    kernel: &SnapInfo,
    kernel_path: &Utf8Path,
    cmdlines: &[String],
) -> Result<BootChain> {
    let files = rbl.boot_chain(bl, kernel_path)?;
    let assets = build_boot_assets(&files, modeenv)?;
    tracing::trace!("Run mode chain has {} assets", assets.0.len());
    Ok(to_chain(Role::RunMode, model, assets, kernel, cmdlines))
}

/// The chain booting the recovery kernel `kernel` through `rbl`.
#[context("Building recovery boot chain")]
pub fn recovery_boot_chain(
    rbl: &dyn TrustedAssetsBootloader,
    modeenv: &ModeEnv,
    model: &Model,
    kernel: &SnapInfo,
    kernel_path: &Utf8Path,
    cmdlines: &[String],
) -> Result<BootChain> {
    let files = rbl.recovery_boot_chain(kernel_path)?;
    let assets = build_boot_assets(&files, modeenv)?;
    tracing::trace!("Recovery chain has {} assets", assets.0.len());
    Ok(to_chain(Role::Recovery, model, assets, kernel, cmdlines))
}
