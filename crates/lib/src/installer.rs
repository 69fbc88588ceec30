//! # Installing boot-critical payloads
//!
//! Snap blobs (kernel, base, gadget and kernel-modules components) are
//! copied into the snap blob directory of the target writable root. The
//! copy always contains the bytes of the source file, even when the
//! source is a symlink into a seed that will go away.
//!
//! Kernel assets are extracted by the bootloader driver; the helpers here
//! are shared by driver implementations.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::boot::BootableSet;
use crate::bootloader::Bootloader;
use crate::snap::{SnapContainer, SnapInfo};
use crate::utils::{copy_file_durably, fsync_dir, open_dir_all, write_file_durably};

fn pattern_matches(pattern: &str, path: &str) -> bool {
    match pattern.strip_suffix("/*") {
        Some(prefix) => path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/')),
        None => pattern == path,
    }
}

/// Extract the files of `container` matching any of `patterns` into
/// `dest`, keeping their relative paths. A pattern is either an exact path
/// or `dir/*` for everything below `dir`.
#[context("Extracting kernel assets to {dest}")]
pub fn extract_kernel_files(
    container: &dyn SnapContainer,
    patterns: &[&str],
    dest: &Utf8Path,
) -> Result<()> {
    let mut n = 0;
    for f in container.list_files()? {
        if !patterns.iter().any(|p| pattern_matches(p, &f)) {
            continue;
        }
        let target = dest.join(&f);
        let (dir, name) = match (target.parent(), target.file_name()) {
            (Some(d), Some(n)) => (d, n),
            _ => anyhow::bail!("Invalid kernel asset path {f}"),
        };
        write_file_durably(dir, name, container.read_file(&f)?)?;
        tracing::trace!("Extracted {f}");
        n += 1;
    }
    anyhow::ensure!(n > 0, "No kernel assets matching {patterns:?}");
    Ok(())
}

/// Make `dir/<file>` a relative symlink to `<kernel>/<file>`, replacing the
/// previous link atomically.
#[context("Enabling kernel {}", kernel.filename())]
pub fn link_current_kernel(dir: &Utf8Path, kernel: &SnapInfo, file: &str) -> Result<()> {
    let target = format!("{}/{file}", kernel.filename());
    let d = open_dir_all(dir)?;
    let tmp = format!(".{file}.new");
    // A stale temporary link from an interrupted run is fine to drop
    let _ = d.remove_file(&tmp);
    d.symlink(&target, &tmp)
        .with_context(|| format!("Creating link to {target}"))?;
    d.rename(&tmp, &d, file)
        .with_context(|| format!("Renaming {tmp}"))?;
    fsync_dir(&d)
}

/// Copy the snaps of `set` into `blob_dir`.
#[context("Installing snaps to {blob_dir}")]
pub(crate) fn install_snaps(set: &BootableSet, blob_dir: &Utf8Path) -> Result<()> {
    let dir = open_dir_all(blob_dir)?;
    let snaps = [
        (set.base_path.as_deref(), set.base.as_ref().map(|s| s.filename())),
        (Some(set.kernel_path.as_path()), Some(set.kernel.filename())),
        (set.gadget_path.as_deref(), set.gadget.as_ref().map(|s| s.filename())),
    ];
    for (src, name) in snaps {
        // The base is absent on classic systems
        let (Some(src), Some(name)) = (src, name) else {
            continue;
        };
        tracing::debug!("Installing {name}");
        copy_file_durably(src, &dir, &name)?;
    }
    for comp in set.kernel_mods.iter() {
        let name = comp.filename();
        tracing::debug!("Installing {name}");
        copy_file_durably(&comp.path, &dir, &name)?;
    }
    fsync_dir(&dir)
}

/// Extract the run kernel and point the bootloader at it. Returns whether
/// the driver tracks the kernel itself; otherwise the kernel has to be named
/// in the bootloader environment.
#[context("Installing run mode kernel")]
pub(crate) fn install_run_kernel(
    bl: &dyn Bootloader,
    kernel: &SnapInfo,
    container: &dyn SnapContainer,
) -> Result<bool> {
    bl.extract_kernel_assets(kernel, container)?;
    match bl.as_extracted_run_kernel() {
        Some(ebl) => {
            ebl.enable_kernel(kernel)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Copy a directory tree, following symlinks.
#[context("Copying {src} to {dest}")]
pub(crate) fn copy_tree(src: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    let d = open_dir_all(dest)?;
    for entry in src.read_dir_utf8()? {
        let entry = entry?;
        let path = entry.path();
        if std::fs::metadata(path)?.is_dir() {
            copy_tree(path, &dest.join(entry.file_name()))?;
        } else {
            copy_file_durably(path, &d, entry.file_name())?;
        }
    }
    fsync_dir(&d)
}
