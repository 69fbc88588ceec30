//! # Partition layout configuration
//!
//! Boot operations touch three storage locations: the seed (recovery)
//! partition, the boot partition and the data partition. Where these are
//! mounted is described by a [`Layout`], which may be adjusted by TOML
//! drop-ins in `snapboot/layout.d`.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::model::Model;

/// Drop-in directory for layout fragments, relative to each base.
pub(crate) const LAYOUT_CONFIG_DIR: &str = "snapboot/layout.d";
/// Where we look for drop-in fragments.
const SYSTEMD_CONVENTIONAL_BASES: &[&str] = &["/usr/lib", "/usr/local/lib", "/etc", "/run"];

/// Snap blobs, relative to a writable root.
pub const SNAP_BLOB_DIR: &str = "var/lib/snapd/snaps";
/// The mode environment, relative to a writable root.
pub const MODEENV_PATH: &str = "var/lib/snapd/modeenv";
/// The trusted boot asset cache, relative to a writable root.
pub const BOOT_ASSETS_DIR: &str = "var/lib/snapd/boot-assets";
/// The data partition subdirectory holding the writable root on core systems.
const SYSTEM_DATA_DIR: &str = "system-data";

/// Locations used by boot operations. All relative paths are resolved
/// against the root directory passed to [`Layout::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Layout {
    #[serde(skip)]
    rootdir: Utf8PathBuf,
    /// The seed used by image and install time operations.
    pub seed_dir: Utf8PathBuf,
    /// Mount point of the seed partition.
    pub ubuntu_seed_dir: Utf8PathBuf,
    /// Mount point of the boot partition.
    pub ubuntu_boot_dir: Utf8PathBuf,
    /// Mount point of the data partition.
    pub ubuntu_data_dir: Utf8PathBuf,
    /// The trusted boot asset cache of the running system.
    pub boot_assets_dir: Utf8PathBuf,
    /// The running kernel's command line. Not relative to the root.
    pub proc_cmdline: Utf8PathBuf,
}

/// A layout fragment as found in a drop-in file.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct LayoutConfig {
    seed_dir: Option<Utf8PathBuf>,
    ubuntu_seed_dir: Option<Utf8PathBuf>,
    ubuntu_boot_dir: Option<Utf8PathBuf>,
    ubuntu_data_dir: Option<Utf8PathBuf>,
    boot_assets_dir: Option<Utf8PathBuf>,
    proc_cmdline: Option<Utf8PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LayoutConfigRoot {
    layout: Option<LayoutConfig>,
}

fn under(root: &Utf8Path, p: &Utf8Path) -> Utf8PathBuf {
    root.join(p.strip_prefix("/").unwrap_or(p))
}

impl Layout {
    /// The default layout under `rootdir`.
    pub fn new(rootdir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            rootdir: rootdir.into(),
            seed_dir: "var/lib/snapd/seed".into(),
            ubuntu_seed_dir: "run/mnt/ubuntu-seed".into(),
            ubuntu_boot_dir: "run/mnt/ubuntu-boot".into(),
            ubuntu_data_dir: "run/mnt/ubuntu-data".into(),
            boot_assets_dir: BOOT_ASSETS_DIR.into(),
            proc_cmdline: "/proc/cmdline".into(),
        }
    }

    /// The image/install time seed.
    pub fn seed(&self) -> Utf8PathBuf {
        under(&self.rootdir, &self.seed_dir)
    }

    /// The mounted seed partition.
    pub fn ubuntu_seed(&self) -> Utf8PathBuf {
        under(&self.rootdir, &self.ubuntu_seed_dir)
    }

    /// The mounted boot partition.
    pub fn ubuntu_boot(&self) -> Utf8PathBuf {
        under(&self.rootdir, &self.ubuntu_boot_dir)
    }

    /// The mounted data partition.
    pub fn ubuntu_data(&self) -> Utf8PathBuf {
        under(&self.rootdir, &self.ubuntu_data_dir)
    }

    /// The trusted boot asset cache of the running system.
    pub fn boot_assets_cache(&self) -> Utf8PathBuf {
        under(&self.rootdir, &self.boot_assets_dir)
    }

    /// The writable root of the system being installed. Classic systems
    /// use the data partition directly.
    pub fn install_host_writable_dir(&self, model: &Model) -> Utf8PathBuf {
        let data = self.ubuntu_data();
        if model.classic {
            data
        } else {
            data.join(SYSTEM_DATA_DIR)
        }
    }

    fn apply(&mut self, c: LayoutConfig) {
        let LayoutConfig {
            seed_dir,
            ubuntu_seed_dir,
            ubuntu_boot_dir,
            ubuntu_data_dir,
            boot_assets_dir,
            proc_cmdline,
        } = c;
        for (dest, v) in [
            (&mut self.seed_dir, seed_dir),
            (&mut self.ubuntu_seed_dir, ubuntu_seed_dir),
            (&mut self.ubuntu_boot_dir, ubuntu_boot_dir),
            (&mut self.ubuntu_data_dir, ubuntu_data_dir),
            (&mut self.boot_assets_dir, boot_assets_dir),
            (&mut self.proc_cmdline, proc_cmdline),
        ] {
            if let Some(v) = v {
                *dest = v;
            }
        }
    }

    /// Merge a TOML fragment into this layout.
    #[context("Parsing layout configuration")]
    pub fn merge_toml(&mut self, buf: &str) -> Result<()> {
        let c: LayoutConfigRoot = toml::from_str(buf)?;
        if let Some(c) = c.layout {
            self.apply(c);
        }
        Ok(())
    }

    /// Load the layout for `rootdir`, applying drop-in fragments found on
    /// the host in lexicographic order.
    #[context("Loading layout configuration")]
    pub fn load(rootdir: impl Into<Utf8PathBuf>) -> Result<Self> {
        let mut layout = Self::new(rootdir);
        let fragments = liboverdrop::scan(SYSTEMD_CONVENTIONAL_BASES, LAYOUT_CONFIG_DIR, &["toml"], true);
        for (_name, path) in fragments {
            let buf = std::fs::read_to_string(&path)
                .with_context(|| format!("Reading {}", path.display()))?;
            layout
                .merge_toml(&buf)
                .with_context(|| format!("Loading {}", path.display()))?;
            tracing::debug!("Applied layout fragment {}", path.display());
        }
        Ok(layout)
    }
}
