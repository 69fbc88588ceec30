//! The subset of a device model assertion consumed by boot operations.

use std::fmt::Display;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// The grade of a model.
///
/// Models that predate boot modes carry no grade at all, which is
/// represented as [`Grade::Unset`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum Grade {
    /// No grade; the model has no boot modes.
    #[default]
    Unset,
    /// Development devices; all overrides are honored.
    Dangerous,
    /// Signed production devices.
    Signed,
    /// Secured production devices.
    Secured,
}

impl Grade {
    /// The textual form used in the mode environment.
    pub fn as_str(&self) -> &'static str {
        match self {
            Grade::Unset => "",
            Grade::Dangerous => "dangerous",
            Grade::Signed => "signed",
            Grade::Secured => "secured",
        }
    }
}

impl Display for Grade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for Grade {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "" => Ok(Grade::Unset),
            "dangerous" => Ok(Grade::Dangerous),
            "signed" => Ok(Grade::Signed),
            "secured" => Ok(Grade::Secured),
            unrecognized => Err(anyhow::anyhow!("Unrecognized model grade: {unrecognized:?}")),
        }
    }
}

/// Identity of the device model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    /// The brand account owning the model.
    pub brand_id: String,
    /// The model name.
    pub model: String,
    /// Model grade.
    pub grade: Grade,
    /// Whether this is a classic (deb based) system.
    pub classic: bool,
    /// The identifier of the key the model assertion is signed with.
    pub sign_key_id: String,
}

impl Model {
    /// Create a model with the given identity and grade.
    pub fn new(brand_id: impl Into<String>, model: impl Into<String>, grade: Grade) -> Self {
        Self {
            brand_id: brand_id.into(),
            model: model.into(),
            grade,
            classic: false,
            sign_key_id: String::new(),
        }
    }

    /// Mark the model as classic.
    pub fn classic(mut self, classic: bool) -> Self {
        self.classic = classic;
        self
    }

    /// Set the signing key identifier.
    pub fn signed_with(mut self, sign_key_id: impl Into<String>) -> Self {
        self.sign_key_id = sign_key_id.into();
        self
    }

    /// Whether the model supports boot modes (run, recover, install...).
    pub fn has_modes(&self) -> bool {
        self.grade != Grade::Unset
    }

    /// `<brand>/<model>`, as recorded in the mode environment.
    pub fn identifier(&self) -> String {
        format!("{}/{}", self.brand_id, self.model)
    }
}
