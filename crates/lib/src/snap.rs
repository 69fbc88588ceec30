//! Snap and component naming, plus read access to snap contents.

use std::fmt::Display;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

/// The type of a boot-relevant snap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapType {
    /// The base runtime.
    Base,
    /// The gadget.
    Gadget,
    /// The kernel.
    Kernel,
}

/// A snap revision. Negative values are local (unasserted) revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Revision(pub i32);

impl Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            0 => f.write_str("unset"),
            n if n < 0 => write!(f, "x{}", -n),
            n => write!(f, "{n}"),
        }
    }
}

/// Identity of an installed snap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapInfo {
    /// Snap name.
    pub name: String,
    /// Snap revision.
    pub revision: Revision,
    /// Snap type.
    pub snap_type: SnapType,
}

impl SnapInfo {
    /// Create a new snap identity.
    pub fn new(name: impl Into<String>, revision: i32, snap_type: SnapType) -> Self {
        Self {
            name: name.into(),
            revision: Revision(revision),
            snap_type,
        }
    }

    /// The blob file name, e.g. `pc-kernel_5.snap`.
    pub fn filename(&self) -> String {
        format!("{}_{}.snap", self.name, self.revision)
    }
}

/// A kernel-modules component shipped alongside a kernel snap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelModulesComponent {
    /// The snap providing the component.
    pub snap_name: String,
    /// The component name.
    pub component_name: String,
    /// Component revision.
    pub revision: Revision,
    /// Where the component blob currently lives.
    pub path: Utf8PathBuf,
}

impl KernelModulesComponent {
    /// The blob file name, e.g. `pc-kernel+kcomp1_33.comp`.
    pub fn filename(&self) -> String {
        format!(
            "{}+{}_{}.comp",
            self.snap_name, self.component_name, self.revision
        )
    }
}

/// Read access to the files inside a snap.
pub trait SnapContainer: std::fmt::Debug {
    /// Read a file, path relative to the snap root.
    fn read_file(&self, path: &str) -> Result<Vec<u8>>;
    /// All regular files in the snap, as sorted relative paths.
    fn list_files(&self) -> Result<Vec<String>>;
}

/// A snap unpacked into a directory.
#[derive(Debug, Clone)]
pub struct UnpackedSnap {
    dir: Utf8PathBuf,
}

impl UnpackedSnap {
    /// Access a snap unpacked at `dir`.
    pub fn new(dir: impl Into<Utf8PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

fn walk(root: &Utf8Path, dir: &Utf8Path, out: &mut Vec<String>) -> Result<()> {
    for entry in dir.read_dir_utf8().with_context(|| format!("Reading {dir}"))? {
        let entry = entry?;
        let ft = entry.file_type()?;
        if ft.is_dir() {
            walk(root, entry.path(), out)?;
        } else if ft.is_file() {
            let rel = entry.path().strip_prefix(root)?;
            out.push(rel.to_string());
        }
    }
    Ok(())
}

impl SnapContainer for UnpackedSnap {
    fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let p = self.dir.join(path);
        std::fs::read(&p).with_context(|| format!("Reading {p}"))
    }

    #[context("Listing snap files")]
    fn list_files(&self) -> Result<Vec<String>> {
        let mut r = Vec::new();
        walk(&self.dir, &self.dir, &mut r)?;
        r.sort();
        Ok(r)
    }
}
