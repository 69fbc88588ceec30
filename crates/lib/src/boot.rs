//! # Making systems bootable and runnable
//!
//! These are the entry points used when building images, creating recovery
//! systems, and installing a system from a recovery system. They put the
//! snaps, kernel assets and boot configuration in place, write the mode
//! environment and bootloader variables, seal the disk keys, and finally
//! switch the seed to run mode.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::assets::TrustedAssetsInstallObserver;
use crate::bootenv;
use crate::bootloader::{Bootloader, BootloaderFinder, Options, Role};
use crate::cmdline::{boot_vars_for_command_line, compose_candidate_command_line};
use crate::config::{Layout, BOOT_ASSETS_DIR, SNAP_BLOB_DIR};
use crate::installer;
use crate::modeenv::{Mode, ModeEnv};
use crate::model::Model;
use crate::seal::{FirmwareVariables, Orchestration, SealRequest, Sealer, SealingBackend, SeedReader, Stage};
use crate::snap::{KernelModulesComponent, SnapContainer, SnapInfo};

/// The snaps making up a bootable system.
#[derive(Debug)]
pub struct BootableSet {
    /// The base; absent on classic systems.
    pub base: Option<SnapInfo>,
    /// Where the base snap is.
    pub base_path: Option<Utf8PathBuf>,
    /// The kernel.
    pub kernel: SnapInfo,
    /// Where the kernel snap is.
    pub kernel_path: Utf8PathBuf,
    /// Access to the kernel's files.
    pub kernel_container: Box<dyn SnapContainer>,
    /// Kernel modules components to install alongside the kernel.
    pub kernel_mods: Vec<KernelModulesComponent>,
    /// The gadget; absent on some classic systems.
    pub gadget: Option<SnapInfo>,
    /// Where the gadget snap is.
    pub gadget_path: Option<Utf8PathBuf>,
    /// The gadget, unpacked.
    pub unpacked_gadget_dir: Utf8PathBuf,
    /// Label of the recovery system the set comes from.
    pub recovery_system_label: String,
    /// Directory of the recovery system relative to the seed root. Only
    /// set when building images.
    pub recovery_system_dir: Option<Utf8PathBuf>,
}

/// The snaps needed to boot a recovery system.
#[derive(Debug)]
pub struct RecoverySystemBootableSet<'a> {
    /// The recovery kernel.
    pub kernel: &'a SnapInfo,
    /// Where the kernel snap is, below the seed root.
    pub kernel_path: &'a Utf8Path,
    /// Access to the kernel's files.
    pub kernel_container: &'a dyn SnapContainer,
    /// The gadget, unpacked.
    pub gadget_dir: &'a Utf8Path,
    /// Whether this happens while building an image.
    pub prepare_image_time: bool,
}

/// Services and locations used by the entry operations.
#[derive(Debug)]
pub struct BootContext<'a> {
    /// Partition locations.
    pub layout: Layout,
    /// Bootloader detection.
    pub bootloaders: BootloaderFinder,
    /// Key sealing.
    pub backend: &'a dyn SealingBackend,
    /// Firmware boot entries.
    pub firmware: &'a dyn FirmwareVariables,
    /// Recovery systems in the seed.
    pub seed: &'a dyn SeedReader,
}

#[derive(Debug, Clone, Copy)]
struct RunnableOptions {
    factory_reset: bool,
    from_initrd: bool,
}

fn static_command_line(bl: &dyn Bootloader) -> Result<Option<String>> {
    bl.as_trusted_assets()
        .map(|t| t.default_command_line(false))
        .transpose()
}

fn count_recovery_systems(rootdir: &Utf8Path) -> Result<usize> {
    let systems = rootdir.join("systems");
    if !systems.try_exists()? {
        return Ok(0);
    }
    let mut n = 0;
    for entry in systems.read_dir_utf8()? {
        if entry?.file_type()?.is_dir() {
            n += 1;
        }
    }
    Ok(n)
}

/// Make the image being built in `rootdir` boot into install mode from its
/// only recovery system.
#[context("Making image bootable")]
pub fn make_bootable_image(
    ctx: &BootContext<'_>,
    model: &Model,
    rootdir: &Utf8Path,
    set: &BootableSet,
    flags: &[String],
) -> Result<()> {
    if !model.has_modes() {
        anyhow::bail!("internal error: cannot make an image bootable for a model without modes");
    }
    if count_recovery_systems(rootdir)? > 1 {
        anyhow::bail!("cannot make multiple recovery systems bootable yet");
    }
    if set.recovery_system_label.is_empty() {
        anyhow::bail!("internal error: recovery system label unset");
    }
    let Some(system_dir) = set.recovery_system_dir.as_deref() else {
        anyhow::bail!("internal error: recovery system directory unset");
    };
    let opts = Options {
        prepare_image_time: true,
        role: Role::Recovery,
        ..Default::default()
    };
    ctx.bootloaders
        .install_boot_config(&set.unpacked_gadget_dir, rootdir, &opts)?;
    let bl = ctx.bootloaders.find(rootdir, &opts)?;
    bootenv::set_recovery_vars(
        bl.as_ref(),
        &set.recovery_system_label,
        Mode::Install,
        flags,
    )?;
    let recovery = RecoverySystemBootableSet {
        kernel: &set.kernel,
        kernel_path: &set.kernel_path,
        kernel_container: set.kernel_container.as_ref(),
        gadget_dir: &set.unpacked_gadget_dir,
        prepare_image_time: true,
    };
    make_recovery_system_bootable(ctx, model, rootdir, system_dir, &recovery)
}

/// Set up the recovery system in `system_dir`, relative to the seed
/// root `rootdir`, so that its kernel can be booted.
#[context("Making recovery system {system_dir} bootable")]
pub fn make_recovery_system_bootable(
    ctx: &BootContext<'_>,
    model: &Model,
    rootdir: &Utf8Path,
    system_dir: &Utf8Path,
    set: &RecoverySystemBootableSet<'_>,
) -> Result<()> {
    let opts = Options {
        prepare_image_time: set.prepare_image_time,
        role: Role::Recovery,
        ..Default::default()
    };
    let bl = ctx.bootloaders.find(rootdir, &opts)?;
    let system_dir = system_dir.strip_prefix("/").unwrap_or(system_dir);
    let kernel_rel = set.kernel_path.strip_prefix(rootdir).with_context(|| {
        format!(
            "internal error: kernel {} is not below {rootdir}",
            set.kernel_path
        )
    })?;
    let kernel_path = format!("/{kernel_rel}");

    if let Some(ebl) = bl.as_extracted_recovery_kernel() {
        ebl.extract_recovery_kernel_assets(system_dir, set.kernel, set.kernel_container)?;
    }
    let static_cmdline = static_command_line(bl.as_ref())?;
    let cmdline_vars = boot_vars_for_command_line(model, set.gadget_dir, static_cmdline.as_deref())
        .context("Obtaining recovery system command line")?;
    bootenv::set_recovery_system_vars(bl.as_ref(), system_dir, &kernel_path, cmdline_vars)
}

/// Install the gadget's boot configuration into the partition mounted at
/// `part_dir` and select the recovery system of `set` with `mode`.
#[context("Making partition bootable")]
pub fn make_bootable_partition(
    ctx: &BootContext<'_>,
    part_dir: &Utf8Path,
    opts: &Options,
    set: &BootableSet,
    mode: Mode,
    flags: &[String],
) -> Result<()> {
    if set.recovery_system_dir.is_some() {
        anyhow::bail!("internal error: recovery system directory unexpectedly set for a partition");
    }
    ctx.bootloaders
        .install_boot_config(&set.unpacked_gadget_dir, part_dir, opts)?;
    let bl = ctx.bootloaders.find(part_dir, opts)?;
    bootenv::set_recovery_vars(bl.as_ref(), &set.recovery_system_label, mode, flags)
}

/// Install the run system from `set` and switch the seed to run mode.
pub fn make_runnable_system(
    ctx: &BootContext<'_>,
    model: &Model,
    set: &BootableSet,
    observer: Option<&TrustedAssetsInstallObserver>,
) -> Result<()> {
    let opts = RunnableOptions {
        factory_reset: false,
        from_initrd: false,
    };
    make_runnable(ctx, model, set, observer, opts)
}

/// Like [`make_runnable_system`], for installs driven outside of the
/// regular install flow. From the initramfs the seed is read from the
/// mounted seed partition.
pub fn make_runnable_standalone_system(
    ctx: &BootContext<'_>,
    model: &Model,
    set: &BootableSet,
    observer: Option<&TrustedAssetsInstallObserver>,
    from_initrd: bool,
) -> Result<()> {
    let opts = RunnableOptions {
        factory_reset: false,
        from_initrd,
    };
    make_runnable(ctx, model, set, observer, opts)
}

/// Reinstall the run system during a factory reset.
pub fn make_runnable_system_after_data_reset(
    ctx: &BootContext<'_>,
    model: &Model,
    set: &BootableSet,
    observer: Option<&TrustedAssetsInstallObserver>,
) -> Result<()> {
    let opts = RunnableOptions {
        factory_reset: true,
        from_initrd: false,
    };
    make_runnable(ctx, model, set, observer, opts)
}

/// Make the next boot go to run mode, from recovery system `label`.
pub fn ensure_next_boot_to_run_mode(ctx: &BootContext<'_>, label: &str) -> Result<()> {
    bootenv::ensure_next_boot_to_run_mode(&ctx.bootloaders, &ctx.layout, label)
}

fn install_modeenv(model: &Model, set: &BootableSet) -> ModeEnv {
    let mut m = ModeEnv::for_model(model);
    m.mode = Mode::Run;
    let label = &set.recovery_system_label;
    m.recovery_system = label.clone();
    if !label.is_empty() {
        m.current_recovery_systems = vec![label.clone()];
        m.good_recovery_systems = vec![label.clone()];
    }
    if !model.classic {
        m.base = set.base.as_ref().map(|b| b.filename()).unwrap_or_default();
    }
    m.gadget = set.gadget.as_ref().map(|g| g.filename()).unwrap_or_default();
    m.current_kernels = vec![set.kernel.filename()];
    m
}

fn make_runnable(
    ctx: &BootContext<'_>,
    model: &Model,
    set: &BootableSet,
    observer: Option<&TrustedAssetsInstallObserver>,
    opts: RunnableOptions,
) -> Result<()> {
    if !model.has_modes() {
        anyhow::bail!("internal error: cannot make pre-UC20 system runnable");
    }
    if set.recovery_system_dir.is_some() {
        anyhow::bail!("internal error: recovery system directory unexpectedly set for a runnable system");
    }
    let layout = &ctx.layout;
    let mut run = Orchestration::new();
    tracing::info!(
        "Installing run system for {} from recovery system {:?}",
        model.identifier(),
        set.recovery_system_label
    );

    let writable = layout.install_host_writable_dir(model);
    installer::install_snaps(set, &writable.join(SNAP_BLOB_DIR))?;
    if let Some(obs) = observer.filter(|o| o.uses_encryption()) {
        let cache = obs.cache().dir();
        if cache.try_exists()? {
            installer::copy_tree(cache, &writable.join(BOOT_ASSETS_DIR))?;
        }
    }

    let gadget = set.unpacked_gadget_dir.as_path();
    let bl_opts = Options {
        role: Role::RunMode,
        no_slash_boot: true,
        ..Default::default()
    };
    let bl = ctx
        .bootloaders
        .for_gadget(gadget, &layout.ubuntu_boot(), &bl_opts)
        .map_err(|e| anyhow::anyhow!("internal error: cannot identify run system bootloader: {e:#}"))?;
    bl.install_boot_config(gadget, &bl_opts)?;
    let enabled = installer::install_run_kernel(bl.as_ref(), &set.kernel, set.kernel_container.as_ref())?;
    bootenv::set_run_kernel_vars(bl.as_ref(), &set.kernel, enabled)?;

    let mut modeenv = install_modeenv(model, set);
    if let Some(obs) = observer {
        modeenv.current_trusted_boot_assets = obs.current_trusted_boot_assets().clone();
        modeenv.current_trusted_recovery_boot_assets =
            obs.current_trusted_recovery_boot_assets().clone();
    }

    run.advance(Stage::ComposingCommandLines)?;
    let cmdline = compose_candidate_command_line(&ctx.bootloaders, layout, model, gadget)
        .context("cannot compose the candidate command line")?;
    if !cmdline.is_empty() {
        modeenv.current_kernel_command_lines = vec![cmdline];
    }
    let static_cmdline = static_command_line(bl.as_ref())?;
    let cmdline_vars: BTreeMap<String, String> =
        boot_vars_for_command_line(model, gadget, static_cmdline.as_deref())?;
    bl.set_boot_vars(&cmdline_vars)?;
    modeenv.write_to(&writable)?;

    if let Some(obs) = observer.filter(|o| o.uses_encryption()) {
        let Some(keys) = obs.encryption_keys() else {
            anyhow::bail!("internal error: encryption requested but no encryption keys set");
        };
        let seed_dir = if opts.from_initrd {
            layout.ubuntu_seed()
        } else {
            layout.seed()
        };
        let sealer = Sealer {
            bootloaders: &ctx.bootloaders,
            layout,
            backend: ctx.backend,
            seed: ctx.seed,
        };
        let req = SealRequest {
            model,
            modeenv: &modeenv,
            kernel: &set.kernel,
            kernel_path: &set.kernel_path,
            run_bootloader: bl.as_ref(),
            keys,
            seed_dir: &seed_dir,
            install_host_writable_dir: &writable,
            factory_reset: opts.factory_reset,
            pre_reset_recovery_assets: obs.pre_reset_recovery_assets(),
        };
        sealer.seal(&mut run, &req)?;
    }

    run.advance(Stage::Committed)?;
    commit(ctx, &set.recovery_system_label)
}

/// Make the installed system the one booted next.
fn commit(ctx: &BootContext<'_>, label: &str) -> Result<()> {
    if label.is_empty() {
        tracing::debug!("No recovery system to record");
    } else {
        bootenv::mark_recovery_capable_system(&ctx.bootloaders, &ctx.layout, label)?;
    }
    set_firmware_boot_entry(ctx)?;
    bootenv::ensure_next_boot_to_run_mode(&ctx.bootloaders, &ctx.layout, label)
}

#[context("Setting firmware boot entry")]
fn set_firmware_boot_entry(ctx: &BootContext<'_>) -> Result<()> {
    let opts = Options {
        role: Role::Recovery,
        ..Default::default()
    };
    let bl = ctx.bootloaders.find(&ctx.layout.ubuntu_seed(), &opts)?;
    let Some(ubl) = bl.as_uefi() else {
        tracing::debug!("{} has no firmware boot entry", bl.name());
        return Ok(());
    };
    let o = ubl.efi_load_option_parameters()?;
    ctx.firmware
        .set_boot_variables(&o.description, &o.asset_path, &o.optional_data)
}
