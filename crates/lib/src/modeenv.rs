//! # The mode environment
//!
//! The modeenv is a `key=value` file on the data partition recording the
//! boot mode, the recovery systems, the installed snaps and the trusted
//! boot assets. It is read at every boot by the early boot stage.
//!
//! Keys are written in a fixed order so that rewrites produce minimal
//! diffs. Keys this version does not know are kept and written back after
//! the known ones.

use std::fmt::Display;

use anyhow::{Context, Result};
use camino::Utf8Path;
use canon_json::CanonJsonSerialize as _;
use fn_error_context::context;
use serde::Serialize;

use crate::assets::BootAssetsMap;
use crate::config::MODEENV_PATH;
use crate::model::{Grade, Model};
use crate::utils::write_file_durably;

/// The boot mode of a system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Normal operation.
    #[default]
    Run,
    /// Booted into a recovery system.
    Recover,
    /// Reinstalling while keeping the seed.
    FactoryReset,
    /// Installing from a recovery system.
    Install,
}

impl Mode {
    /// The string used on the kernel command line and in the modeenv.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Run => "run",
            Mode::Recover => "recover",
            Mode::FactoryReset => "factory-reset",
            Mode::Install => "install",
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Mode {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        let r = match value {
            "run" => Mode::Run,
            "recover" => Mode::Recover,
            "factory-reset" => Mode::FactoryReset,
            "install" => Mode::Install,
            o => anyhow::bail!("Unknown boot mode {o:?}"),
        };
        Ok(r)
    }
}

/// Errors reading or writing a modeenv.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ModeenvError {
    /// A line is not of the form `key=value`.
    #[error("malformed modeenv line {line}: {content:?}")]
    MalformedLine {
        /// One-based line number.
        line: usize,
        /// The offending line.
        content: String,
    },
    /// A key has a value that cannot be parsed.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// The key.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
    /// The mandatory `mode` key is absent.
    #[error("internal error: mode is unset")]
    MissingMode,
    /// A value would not read back as written.
    #[error("cannot write {key}: {reason}")]
    Unwritable {
        /// The key.
        key: String,
        /// What is wrong with the value.
        reason: String,
    },
}

/// The persisted boot state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModeEnv {
    /// Current boot mode.
    pub mode: Mode,
    /// Label of the active recovery system.
    pub recovery_system: String,
    /// Recovery systems that are installed.
    pub current_recovery_systems: Vec<String>,
    /// Recovery systems known to be recovery capable.
    pub good_recovery_systems: Vec<String>,
    /// Flags for the next boot.
    pub boot_flags: Vec<String>,
    /// Base snap file name; unset on classic.
    pub base: String,
    /// Base snap being tried.
    pub try_base: String,
    /// Status of a base update.
    pub base_status: String,
    /// Gadget snap file name.
    pub gadget: String,
    /// Installed kernel snap file names.
    pub current_kernels: Vec<String>,
    /// Brand of the model.
    pub brand_id: String,
    /// Model name.
    pub model: String,
    /// The system is a classic system with boot modes.
    pub classic: bool,
    /// Model grade.
    pub grade: Grade,
    /// Key the model assertion is signed with.
    pub model_sign_key_id: String,
    /// Brand of a model being tried during remodel.
    pub try_brand_id: String,
    /// Model being tried during remodel.
    pub try_model: String,
    /// Grade of the model being tried.
    pub try_grade: Grade,
    /// Signing key of the model being tried.
    pub try_model_sign_key_id: String,
    /// Trusted assets of the run mode bootloader.
    pub current_trusted_boot_assets: BootAssetsMap,
    /// Trusted assets of the recovery bootloader.
    pub current_trusted_recovery_boot_assets: BootAssetsMap,
    /// Kernel command lines the run mode may boot with.
    pub current_kernel_command_lines: Vec<String>,
    #[serde(skip)]
    extra: Vec<(String, String)>,
}

fn compact_json<T: Serialize>(v: &T) -> Result<String> {
    let mut buf = Vec::new();
    v.to_canon_json_writer(&mut buf)?;
    Ok(String::from_utf8(buf)?)
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn split_model(key: &str, v: &str) -> Result<(String, String), ModeenvError> {
    match v.split_once('/') {
        Some((brand, model)) if !brand.is_empty() && !model.is_empty() => {
            Ok((brand.to_string(), model.to_string()))
        }
        _ => Err(ModeenvError::InvalidValue {
            key: key.to_string(),
            reason: format!("expected brand/model, found {v:?}"),
        }),
    }
}

fn parse_json<T: serde::de::DeserializeOwned>(key: &str, v: &str) -> Result<T, ModeenvError> {
    serde_json::from_str(v).map_err(|e| ModeenvError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn unwritable(key: &str, reason: &str) -> ModeenvError {
    ModeenvError::Unwritable {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn join_list(key: &str, items: &[String]) -> Result<String, ModeenvError> {
    if items.iter().any(|i| i.contains(',')) {
        return Err(unwritable(key, "list item contains a comma"));
    }
    if items.iter().any(|i| i.trim().is_empty()) {
        return Err(unwritable(key, "empty list item"));
    }
    Ok(items.join(","))
}

fn join_model(key: &str, brand_id: &str, model: &str) -> Result<Option<String>, ModeenvError> {
    match (brand_id.is_empty(), model.is_empty()) {
        (true, true) => Ok(None),
        (true, false) => Err(unwritable(key, "model without a brand")),
        (false, true) => Err(unwritable(key, "brand without a model")),
        _ if brand_id.contains('/') => Err(unwritable(key, "brand contains a slash")),
        _ => Ok(Some(format!("{brand_id}/{model}"))),
    }
}

fn invalid(key: &str, e: impl Display) -> ModeenvError {
    ModeenvError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    }
}

impl ModeEnv {
    /// A run mode environment for the given model.
    pub fn for_model(model: &Model) -> Self {
        Self {
            brand_id: model.brand_id.clone(),
            model: model.model.clone(),
            classic: model.classic,
            grade: model.grade,
            model_sign_key_id: model.sign_key_id.clone(),
            ..Default::default()
        }
    }

    /// Keys not known to this version, in the order they were read.
    pub fn unknown_keys(&self) -> impl Iterator<Item = (&str, &str)> {
        self.extra.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render the environment in the on-disk format.
    pub fn serialize(&self) -> Result<String> {
        let mut entries: Vec<(&str, String)> = vec![
            ("mode", self.mode.to_string()),
            ("recovery_system", self.recovery_system.clone()),
            (
                "current_recovery_systems",
                join_list("current_recovery_systems", &self.current_recovery_systems)?,
            ),
            (
                "good_recovery_systems",
                join_list("good_recovery_systems", &self.good_recovery_systems)?,
            ),
            ("boot_flags", join_list("boot_flags", &self.boot_flags)?),
            ("base", self.base.clone()),
            ("try_base", self.try_base.clone()),
            ("base_status", self.base_status.clone()),
            ("gadget", self.gadget.clone()),
            ("current_kernels", join_list("current_kernels", &self.current_kernels)?),
        ];
        if let Some(v) = join_model("model", &self.brand_id, &self.model)? {
            entries.push(("model", v));
        }
        if self.classic {
            entries.push(("classic", "true".into()));
        }
        entries.push(("grade", self.grade.to_string()));
        entries.push(("model_sign_key_id", self.model_sign_key_id.clone()));
        if let Some(v) = join_model("try_model", &self.try_brand_id, &self.try_model)? {
            entries.push(("try_model", v));
        }
        entries.push(("try_grade", self.try_grade.to_string()));
        entries.push(("try_model_sign_key_id", self.try_model_sign_key_id.clone()));
        for (k, m) in [
            ("current_trusted_boot_assets", &self.current_trusted_boot_assets),
            (
                "current_trusted_recovery_boot_assets",
                &self.current_trusted_recovery_boot_assets,
            ),
        ] {
            if !m.is_empty() {
                entries.push((k, compact_json(m)?));
            }
        }
        if !self.current_kernel_command_lines.is_empty() {
            entries.push((
                "current_kernel_command_lines",
                compact_json(&self.current_kernel_command_lines)?,
            ));
        }

        let mut out = String::new();
        let extra = self.extra.iter().map(|(k, v)| (k.as_str(), v.clone()));
        for (k, v) in entries.into_iter().chain(extra) {
            if v.is_empty() {
                continue;
            }
            if v.contains(['\n', '\r']) {
                return Err(unwritable(k, "value contains a line break").into());
            }
            out.push_str(k);
            out.push('=');
            out.push_str(&v);
            out.push('\n');
        }
        Ok(out)
    }

    /// Parse the on-disk format.
    pub fn parse(buf: &str) -> Result<Self, ModeenvError> {
        let mut r = ModeEnv::default();
        let mut have_mode = false;
        for (i, line) in buf.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((k, v)) = line.split_once('=') else {
                return Err(ModeenvError::MalformedLine {
                    line: i + 1,
                    content: line.to_string(),
                });
            };
            let (k, v) = (k.trim(), v.trim());
            match k {
                "mode" => {
                    r.mode = Mode::try_from(v).map_err(|e| invalid(k, e))?;
                    have_mode = true;
                }
                "recovery_system" => r.recovery_system = v.to_string(),
                "current_recovery_systems" => r.current_recovery_systems = split_list(v),
                "good_recovery_systems" => r.good_recovery_systems = split_list(v),
                "boot_flags" => r.boot_flags = split_list(v),
                "base" => r.base = v.to_string(),
                "try_base" => r.try_base = v.to_string(),
                "base_status" => r.base_status = v.to_string(),
                "gadget" => r.gadget = v.to_string(),
                "current_kernels" => r.current_kernels = split_list(v),
                "model" => (r.brand_id, r.model) = split_model(k, v)?,
                "classic" => r.classic = v.parse().map_err(|e| invalid(k, e))?,
                "grade" => r.grade = Grade::try_from(v).map_err(|e| invalid(k, e))?,
                "model_sign_key_id" => r.model_sign_key_id = v.to_string(),
                "try_model" => (r.try_brand_id, r.try_model) = split_model(k, v)?,
                "try_grade" => r.try_grade = Grade::try_from(v).map_err(|e| invalid(k, e))?,
                "try_model_sign_key_id" => r.try_model_sign_key_id = v.to_string(),
                "current_trusted_boot_assets" => {
                    r.current_trusted_boot_assets = parse_json(k, v)?
                }
                "current_trusted_recovery_boot_assets" => {
                    r.current_trusted_recovery_boot_assets = parse_json(k, v)?
                }
                "current_kernel_command_lines" => {
                    r.current_kernel_command_lines = parse_json(k, v)?
                }
                _ => {
                    tracing::trace!("Keeping unknown modeenv key {k}");
                    r.extra.push((k.to_string(), v.to_string()));
                }
            }
        }
        if !have_mode {
            return Err(ModeenvError::MissingMode);
        }
        Ok(r)
    }

    /// Read the modeenv of the writable root `rootdir`.
    #[context("Reading modeenv")]
    pub fn read_from(rootdir: &Utf8Path) -> Result<Self> {
        let path = rootdir.join(MODEENV_PATH);
        let buf = std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
        Ok(Self::parse(&buf)?)
    }

    /// Atomically write the modeenv into the writable root `rootdir`.
    #[context("Writing modeenv")]
    pub fn write_to(&self, rootdir: &Utf8Path) -> Result<()> {
        let path = rootdir.join(MODEENV_PATH);
        let (dir, name) = match (path.parent(), path.file_name()) {
            (Some(d), Some(n)) => (d, n),
            _ => anyhow::bail!("Invalid modeenv path {path}"),
        };
        let buf = self.serialize()?;
        write_file_durably(dir, name, buf)?;
        tracing::debug!("Wrote {path}");
        Ok(())
    }
}
