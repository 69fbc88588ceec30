//! # Sealing the disk unlock keys
//!
//! Once the boot chains of a freshly installed system are known, the keys
//! protecting the data and save partitions are sealed against them by an
//! external backend. Sealing happens exactly once per installation run,
//! after everything it measures has been written, and before the system
//! is switched to run mode.
//!
//! An installation run moves through [`Stage`]s in order; an error at any
//! point ends the run, leaving the boot mode untouched.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::Serialize;

use crate::assets::BootAssetsMap;
use crate::bootchain::{recovery_boot_chain, run_mode_boot_chain, BootChain};
use crate::bootloader::{Bootloader, Options, Role};
use crate::cmdline::{compose_factory_reset_command_line, compose_recovery_command_line};
use crate::config::Layout;
use crate::kernel_cmdline::Cmdline;
use crate::modeenv::ModeEnv;
use crate::model::Model;
use crate::snap::SnapInfo;

/// Host kernel argument forcing the use of key tokens on Ubuntu Core.
const FORCE_TOKENS_ARG: &str = "ubuntu-core.force-experimental-tokens";

/// How keys are protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SealingMethod {
    /// Sealed by the TPM against the measured boot chains.
    Tpm,
    /// Protected by the kernel's fde-setup hook.
    FdeSetupHook,
}

/// A freshly formatted encrypted container whose key is yet to be sealed.
pub trait BootstrappedContainer: Debug {
    /// Name of the container, e.g. `ubuntu-data`.
    fn name(&self) -> &str;
}

/// How a user authenticates to unlock volumes, besides the sealed key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    /// A passphrase.
    Passphrase,
    /// A numeric PIN.
    Pin,
}

/// Authentication required in addition to the boot chain.
#[derive(Clone, PartialEq, Eq)]
pub struct VolumesAuthOptions {
    /// Kind of secret.
    pub mode: AuthMode,
    /// The secret.
    pub secret: String,
}

impl Debug for VolumesAuthOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumesAuthOptions")
            .field("mode", &self.mode)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// The keys an installation seals.
#[derive(Debug, Clone)]
pub struct EncryptionKeys {
    /// The data partition container.
    pub data_key: Arc<dyn BootstrappedContainer>,
    /// The save partition container.
    pub save_key: Arc<dyn BootstrappedContainer>,
    /// The primary key shared by all protected keys.
    pub primary_key: Vec<u8>,
    /// Optional user authentication.
    pub volumes_auth: Option<VolumesAuthOptions>,
}

/// Everything the backend needs to seal keys against the boot chains.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SealKeyForBootChainsParams {
    /// Run mode chains, normally one.
    pub run_mode_boot_chains: Vec<BootChain>,
    /// Recovery chains, normally one.
    pub recovery_boot_chains: Vec<BootChain>,
    /// Recovery chains that may unlock with the run key; only during a
    /// factory reset whose recovery assets changed.
    pub recovery_boot_chains_for_run_key: Vec<BootChain>,
    /// Bootloader names by role.
    pub role_to_bootloader_name: BTreeMap<Role, String>,
    /// Sealing happens during a factory reset.
    pub factory_reset: bool,
    /// The writable root of the installed system.
    pub install_host_writable_dir: Utf8PathBuf,
    /// Keys are stored in LUKS2 tokens.
    pub use_tokens: bool,
}

/// The external key sealing backend.
pub trait SealingBackend: Debug {
    /// Whether `kernel` carries an fde-setup hook.
    fn has_fde_setup_hook(&self, kernel: &SnapInfo) -> Result<bool>;
    /// Whether the host cryptsetup can replace tokens.
    fn cryptsetup_supports_token_replace(&self) -> bool;
    /// Seal `keys`. Called at most once per installation run.
    fn seal_key_for_boot_chains(
        &self,
        method: SealingMethod,
        keys: &EncryptionKeys,
        params: &SealKeyForBootChainsParams,
    ) -> Result<()>;
}

/// Registration of boot entries with the firmware.
pub trait FirmwareVariables: Debug {
    /// Create or update the boot entry loading `asset_path`.
    fn set_boot_variables(
        &self,
        description: &str,
        asset_path: &Utf8Path,
        optional_data: &[u8],
    ) -> Result<()>;
}

/// Essential snaps of a recovery system in the seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedSystem {
    /// The recovery kernel.
    pub kernel: SnapInfo,
    /// Where the kernel snap is.
    pub kernel_path: Utf8PathBuf,
    /// The recovery system's gadget, unpacked.
    pub gadget_dir: Utf8PathBuf,
}

/// Access to recovery systems in the seed.
pub trait SeedReader: Debug {
    /// Read the essential snaps of the recovery system `label`.
    fn read_system_essential(&self, seed_dir: &Utf8Path, label: &str) -> Result<SeedSystem>;
}

/// Progress of an installation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    /// Installing snaps and boot configuration.
    Assembling,
    /// Computing the command lines.
    ComposingCommandLines,
    /// Building boot chains.
    BuildingChains,
    /// Calling the sealing backend.
    Sealing,
    /// The new system is the active one.
    Committed,
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Assembling => "assembling",
            Stage::ComposingCommandLines => "composing-command-lines",
            Stage::BuildingChains => "building-chains",
            Stage::Sealing => "sealing",
            Stage::Committed => "committed",
        };
        f.write_str(s)
    }
}

/// Tracks the stage of an installation run; stages only move forward.
#[derive(Debug)]
pub(crate) struct Orchestration {
    stage: Stage,
}

impl Orchestration {
    pub(crate) fn new() -> Self {
        tracing::debug!("Entering stage {}", Stage::Assembling);
        Self {
            stage: Stage::Assembling,
        }
    }

    pub(crate) fn stage(&self) -> Stage {
        self.stage
    }

    pub(crate) fn advance(&mut self, next: Stage) -> Result<()> {
        if next <= self.stage {
            anyhow::bail!("internal error: cannot move from {} to {next}", self.stage);
        }
        tracing::debug!("Entering stage {next}");
        self.stage = next;
        Ok(())
    }
}

/// The sealing method for a system booting `kernel`.
pub(crate) fn sealing_method(backend: &dyn SealingBackend, kernel: &SnapInfo) -> Result<SealingMethod> {
    if backend.has_fde_setup_hook(kernel)? {
        Ok(SealingMethod::FdeSetupHook)
    } else {
        Ok(SealingMethod::Tpm)
    }
}

/// Whether keys go into LUKS2 tokens. Classic systems use them when
/// cryptsetup supports it; Ubuntu Core only when forced on the host's
/// kernel command line.
#[context("Checking for key token support")]
pub(crate) fn use_tokens(backend: &dyn SealingBackend, layout: &Layout, model: &Model) -> Result<bool> {
    if model.classic {
        return Ok(backend.cryptsetup_supports_token_replace());
    }
    let cmdline = Cmdline::from_file(&layout.proc_cmdline)?;
    let forced = cmdline
        .find_str(FORCE_TOKENS_ARG)
        .and_then(|p| p.value)
        .is_some_and(|v| v == "1");
    Ok(forced)
}

/// What is sealed, and against what.
#[derive(Debug)]
pub(crate) struct SealRequest<'a> {
    pub(crate) model: &'a Model,
    pub(crate) modeenv: &'a ModeEnv,
    pub(crate) kernel: &'a SnapInfo,
    pub(crate) kernel_path: &'a Utf8Path,
    pub(crate) run_bootloader: &'a dyn Bootloader,
    pub(crate) keys: &'a EncryptionKeys,
    pub(crate) seed_dir: &'a Utf8Path,
    pub(crate) install_host_writable_dir: &'a Utf8Path,
    pub(crate) factory_reset: bool,
    pub(crate) pre_reset_recovery_assets: Option<&'a BootAssetsMap>,
}

/// Collaborators sealing depends on.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Sealer<'a> {
    pub(crate) bootloaders: &'a crate::bootloader::BootloaderFinder,
    pub(crate) layout: &'a Layout,
    pub(crate) backend: &'a dyn SealingBackend,
    pub(crate) seed: &'a dyn SeedReader,
}

impl Sealer<'_> {
    /// Compose the recovery command lines, build the chains and seal.
    /// Expects `run` to be composing command lines; leaves it at sealing.
    /// Backend errors are returned as is.
    pub(crate) fn seal(&self, run: &mut Orchestration, req: &SealRequest<'_>) -> Result<()> {
        if run.stage() != Stage::ComposingCommandLines {
            anyhow::bail!("internal error: cannot seal from stage {}", run.stage());
        }
        let label = req.modeenv.recovery_system.as_str();
        let system = self
            .seed
            .read_system_essential(req.seed_dir, label)
            .with_context(|| format!("Reading recovery system {label}"))?;
        let recovery_cmdlines = vec![
            compose_recovery_command_line(
                self.bootloaders,
                self.layout,
                req.model,
                label,
                &system.gadget_dir,
            )?,
            compose_factory_reset_command_line(
                self.bootloaders,
                self.layout,
                req.model,
                label,
                &system.gadget_dir,
            )?,
        ];

        run.advance(Stage::BuildingChains)?;
        let opts = Options {
            role: Role::Recovery,
            no_slash_boot: true,
            ..Default::default()
        };
        let rbl = self.bootloaders.find(&self.layout.ubuntu_seed(), &opts)?;
        let Some(tbl) = rbl.as_trusted_assets() else {
            anyhow::bail!("internal error: sealing without trusted assets in {}", rbl.name());
        };
        let run_chain = run_mode_boot_chain(
            tbl,
            req.run_bootloader,
            req.modeenv,
            req.model,
            req.kernel,
            req.kernel_path,
            &req.modeenv.current_kernel_command_lines,
        )?;
        let recovery_chain = recovery_boot_chain(
            tbl,
            req.modeenv,
            req.model,
            &system.kernel,
            &system.kernel_path,
            &recovery_cmdlines,
        )?;
        let mut for_run_key = Vec::new();
        if req.factory_reset {
            match req.pre_reset_recovery_assets {
                Some(pre) if pre != &req.modeenv.current_trusted_recovery_boot_assets => {
                    tracing::debug!("Recovery assets changed across factory reset");
                    let mut old = req.modeenv.clone();
                    old.current_trusted_recovery_boot_assets = pre.clone();
                    for_run_key.push(recovery_boot_chain(
                        tbl,
                        &old,
                        req.model,
                        &system.kernel,
                        &system.kernel_path,
                        &recovery_cmdlines,
                    )?);
                }
                _ => {}
            }
        }

        run.advance(Stage::Sealing)?;
        let params = SealKeyForBootChainsParams {
            run_mode_boot_chains: vec![run_chain],
            recovery_boot_chains: vec![recovery_chain],
            recovery_boot_chains_for_run_key: for_run_key,
            role_to_bootloader_name: BTreeMap::from([
                (Role::Recovery, rbl.name().to_string()),
                (Role::RunMode, req.run_bootloader.name().to_string()),
            ]),
            factory_reset: req.factory_reset,
            install_host_writable_dir: req.install_host_writable_dir.to_owned(),
            use_tokens: use_tokens(self.backend, self.layout, req.model)?,
        };
        let method = sealing_method(self.backend, req.kernel)?;
        tracing::info!("Sealing keys using {method:?}");
        self.backend
            .seal_key_for_boot_chains(method, req.keys, &params)
    }
}


#[cfg(test)]
mod tests {
    use super::mock::MockBackend;
    use super::*;
    use crate::model::Grade;

    #[test]
    fn test_orchestration_order() -> Result<()> {
        let mut run = Orchestration::new();
        assert_eq!(run.stage(), Stage::Assembling);
        run.advance(Stage::ComposingCommandLines)?;
        run.advance(Stage::Sealing)?;
        assert!(run.advance(Stage::BuildingChains).is_err());
        assert!(run.advance(Stage::Sealing).is_err());
        run.advance(Stage::Committed)?;
        assert_eq!(run.stage().to_string(), "committed");
        Ok(())
    }

    #[test]
    fn test_use_tokens() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        let mut layout = Layout::new(root);
        layout.proc_cmdline = root.join("cmdline");
        let core = Model::new("my-brand", "my-model-uc20", Grade::Dangerous);
        let classic = core.clone().classic(true);
        let backend = MockBackend {
            token_replace: true,
            ..Default::default()
        };

        assert!(use_tokens(&backend, &layout, &classic)?);
        assert!(!use_tokens(&MockBackend::default(), &layout, &classic)?);
        // No command line file yet
        assert!(use_tokens(&backend, &layout, &core).is_err());

        for (cmdline, expected) in [
            ("some args", false),
            ("some ubuntu-core.force-experimental-tokens=1 args", true),
            ("some ubuntu_core.force-experimental-tokens=1 args", true),
            ("some ubuntu-core.force-experimental-tokens=0 args", false),
            ("ubuntu-core.force-experimental-tokens", false),
        ] {
            std::fs::write(&layout.proc_cmdline, cmdline)?;
            assert_eq!(use_tokens(&backend, &layout, &core)?, expected, "{cmdline}");
        }
        Ok(())
    }

    #[test]
    fn test_sealing_method() -> Result<()> {
        let kernel = SnapInfo::new("pc-kernel", 5, crate::snap::SnapType::Kernel);
        assert_eq!(
            sealing_method(&MockBackend::default(), &kernel)?,
            SealingMethod::Tpm
        );
        let hook = MockBackend {
            fde_hook: true,
            ..Default::default()
        };
        assert_eq!(sealing_method(&hook, &kernel)?, SealingMethod::FdeSetupHook);
        Ok(())
    }

    #[test]
    fn test_auth_redacted() {
        let a = VolumesAuthOptions {
            mode: AuthMode::Pin,
            secret: "1234".into(),
        };
        assert!(!format!("{a:?}").contains("1234"));
    }
}
