//! # Trusted boot assets
//!
//! Trusted assets are the bootloader binaries measured during boot. Each
//! is identified by its file name and the SHA3-384 digest of its content.
//! Every observed version is kept in a cache so that a chain sealed
//! against an older version can still be reconstructed.

use std::collections::BTreeMap;
use std::fs::File;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use openssl::hash::{Hasher, MessageDigest};
use serde::{Deserialize, Serialize};

use crate::bootloader::{BootloaderFinder, Options, Role};
use crate::config::Layout;
use crate::model::Model;
use crate::seal::EncryptionKeys;
use crate::utils::{copy_file_durably, open_dir_all};

/// Asset name to the digests observed for it, oldest first.
///
/// The list for a name only ever grows; a digest already present is not
/// added again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BootAssetsMap(BTreeMap<String, Vec<String>>);

impl BootAssetsMap {
    /// Record `hash` for `name`.
    pub fn append(&mut self, name: &str, hash: &str) {
        let hashes = self.0.entry(name.to_string()).or_default();
        if !hashes.iter().any(|h| h == hash) {
            hashes.push(hash.to_string());
        }
    }

    /// The digests recorded for `name`.
    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0.get(name).map(Vec::as_slice)
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over assets and their digests.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

/// Compute the lowercase hex SHA3-384 digest of the file at `path`.
#[context("Hashing {path}")]
pub fn hash_file(path: &Utf8Path) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("Opening {path}"))?;
    let mut h = Hasher::new(MessageDigest::sha3_384())?;
    std::io::copy(&mut f, &mut h)?;
    Ok(hex::encode(h.finish()?))
}

/// An asset stored in the [`TrustedAssetsCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedAsset {
    /// Bootloader the asset belongs to.
    pub bootloader: String,
    /// Asset file name.
    pub name: String,
    /// Content digest.
    pub hash: String,
}

/// A directory keeping every observed version of the trusted assets, as
/// `<bootloader>/<name>-<hash>`.
#[derive(Debug, Clone)]
pub struct TrustedAssetsCache {
    dir: Utf8PathBuf,
}

impl TrustedAssetsCache {
    /// A cache rooted at `dir`.
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The cache root.
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Where a given asset version is stored.
    pub fn path_for(&self, bootloader: &str, name: &str, hash: &str) -> Utf8PathBuf {
        self.dir.join(bootloader).join(format!("{name}-{hash}"))
    }

    /// Hash `source` and store it in the cache unless already present.
    #[context("Caching {name} of {bootloader}")]
    pub fn add(&self, source: &Utf8Path, bootloader: &str, name: &str) -> Result<TrackedAsset> {
        let hash = hash_file(source)?;
        let dest = self.path_for(bootloader, name, &hash);
        if dest.try_exists()? {
            tracing::trace!("{dest} already cached");
        } else {
            let d = open_dir_all(&self.dir.join(bootloader))?;
            copy_file_durably(source, &d, &format!("{name}-{hash}"))?;
            tracing::debug!("Cached {name} with hash {hash}");
        }
        Ok(TrackedAsset {
            bootloader: bootloader.to_string(),
            name: name.to_string(),
            hash,
        })
    }
}

fn asset_name(path: &Utf8Path) -> Result<&str> {
    path.file_name()
        .ok_or_else(|| anyhow::anyhow!("Invalid asset path {path}"))
}

/// Tracks the trusted assets written while installing a system.
///
/// Only created for models with boot modes whose gadget uses a bootloader
/// with trusted assets.
#[derive(Debug)]
pub struct TrustedAssetsInstallObserver {
    cache: TrustedAssetsCache,
    bootloader: String,
    trusted_assets: Vec<Utf8PathBuf>,
    use_encryption: bool,
    run_assets: BootAssetsMap,
    recovery_assets: BootAssetsMap,
    pre_reset_recovery_assets: Option<BootAssetsMap>,
    keys: Option<EncryptionKeys>,
}

impl TrustedAssetsInstallObserver {
    /// Set up an observer for installing `model` from the gadget unpacked
    /// at `gadget_dir`. Returns `None` when there is nothing to observe.
    #[context("Setting up trusted assets observer")]
    pub fn new(
        finder: &BootloaderFinder,
        layout: &Layout,
        model: &Model,
        gadget_dir: &Utf8Path,
        use_encryption: bool,
    ) -> Result<Option<Self>> {
        if !model.has_modes() {
            return Ok(None);
        }
        let opts = Options {
            role: Role::RunMode,
            no_slash_boot: true,
            ..Default::default()
        };
        let bl = finder.for_gadget(gadget_dir, &layout.ubuntu_boot(), &opts)?;
        let Some(tbl) = bl.as_trusted_assets() else {
            tracing::debug!("{} has no trusted assets", bl.name());
            return Ok(None);
        };
        Ok(Some(Self {
            cache: TrustedAssetsCache::new(layout.boot_assets_cache()),
            bootloader: bl.name().to_string(),
            trusted_assets: tbl.trusted_assets()?,
            use_encryption,
            run_assets: BootAssetsMap::default(),
            recovery_assets: BootAssetsMap::default(),
            pre_reset_recovery_assets: None,
            keys: None,
        }))
    }

    /// The cache trusted assets are copied into.
    pub fn cache(&self) -> &TrustedAssetsCache {
        &self.cache
    }

    /// Whether the installed system uses disk encryption.
    pub fn uses_encryption(&self) -> bool {
        self.use_encryption
    }

    /// Note that `content` was written to `target`, relative to the boot
    /// partition. Files that are not trusted assets are ignored.
    pub fn observe_write(&mut self, target: &Utf8Path, content: &Utf8Path) -> Result<()> {
        if !self.trusted_assets.iter().any(|a| a == target) {
            return Ok(());
        }
        if !self.use_encryption {
            // Assets only matter for sealing
            return Ok(());
        }
        let ta = self.cache.add(content, &self.bootloader, asset_name(target)?)?;
        self.run_assets.append(&ta.name, &ta.hash);
        Ok(())
    }

    /// Hash the trusted assets already present on the seed at `seed_root`.
    #[context("Observing recovery assets in {seed_root}")]
    pub fn observe_existing_recovery_assets(
        &mut self,
        finder: &BootloaderFinder,
        seed_root: &Utf8Path,
    ) -> Result<()> {
        if !self.use_encryption {
            return Ok(());
        }
        let opts = Options {
            role: Role::Recovery,
            ..Default::default()
        };
        let bl = finder.find(seed_root, &opts)?;
        let Some(tbl) = bl.as_trusted_assets() else {
            return Ok(());
        };
        for asset in tbl.trusted_assets()? {
            let path = seed_root.join(&asset);
            if !path.try_exists()? {
                tracing::debug!("Recovery asset {asset} not present");
                continue;
            }
            let ta = self.cache.add(&path, bl.name(), asset_name(&asset)?)?;
            self.recovery_assets.append(&ta.name, &ta.hash);
        }
        Ok(())
    }

    /// Trusted assets written to the boot partition.
    pub fn current_trusted_boot_assets(&self) -> &BootAssetsMap {
        &self.run_assets
    }

    /// Trusted assets found on the seed.
    pub fn current_trusted_recovery_boot_assets(&self) -> &BootAssetsMap {
        &self.recovery_assets
    }

    /// Record the recovery assets the system had before a factory reset.
    pub fn set_pre_reset_recovery_assets(&mut self, assets: BootAssetsMap) {
        self.pre_reset_recovery_assets = Some(assets);
    }

    /// Recovery assets of the system before a factory reset, if known.
    pub fn pre_reset_recovery_assets(&self) -> Option<&BootAssetsMap> {
        self.pre_reset_recovery_assets.as_ref()
    }

    /// Provide the keys to seal.
    pub fn set_encryption_keys(&mut self, keys: EncryptionKeys) {
        self.keys = Some(keys);
    }

    /// The keys to seal, when encryption is used.
    pub fn encryption_keys(&self) -> Option<&EncryptionKeys> {
        self.keys.as_ref().filter(|_| self.use_encryption)
    }
}
