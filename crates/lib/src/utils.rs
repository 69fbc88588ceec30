//! Durable file writes through capability based directory handles.

use std::io::Write as _;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt as _;

/// Create `path` (and its parents) if needed and open it.
pub(crate) fn open_dir_all(path: &Utf8Path) -> Result<Dir> {
    std::fs::create_dir_all(path).with_context(|| format!("Creating {path}"))?;
    Dir::open_ambient_dir(path, cap_std::ambient_authority())
        .with_context(|| format!("Opening {path}"))
}

/// Flush directory entries to disk.
pub(crate) fn fsync_dir(dir: &Dir) -> Result<()> {
    // Can't call fsync on O_PATH fds, so re-open it as a non O_PATH fd
    let fd = dir.reopen_as_ownedfd().context("Reopening as owned fd")?;
    rustix::fs::fsync(fd).context("fsync")?;
    Ok(())
}

/// Replace `dir/name` with `contents` and sync the directory.
pub(crate) fn write_file_durably(
    dir_path: &Utf8Path,
    name: &str,
    contents: impl AsRef<[u8]>,
) -> Result<()> {
    let dir = open_dir_all(dir_path)?;
    dir.atomic_write(name, contents)
        .with_context(|| format!("Writing {dir_path}/{name}"))?;
    fsync_dir(&dir)
}

/// Copy the contents of `src` to `dir/name`, following a symlink at `src`.
///
/// The destination is always a new regular file renamed into place, so a
/// symlink at the destination is replaced rather than written through.
pub(crate) fn copy_file_durably(src: &Utf8Path, dir: &Dir, name: &str) -> Result<()> {
    let mut f = std::fs::File::open(src).with_context(|| format!("Opening {src}"))?;
    dir.atomic_replace_with(name, |w| -> Result<()> {
        std::io::copy(&mut f, w)?;
        w.flush()?;
        Ok(())
    })
    .with_context(|| format!("Copying {src} to {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_dereferences() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        std::fs::write(root.join("real"), "payload")?;
        std::os::unix::fs::symlink(root.join("real"), root.join("link"))?;
        let dest = open_dir_all(&root.join("dest"))?;
        // Pre-existing symlink at the destination must be replaced
        std::os::unix::fs::symlink(root.join("real"), root.join("dest/out"))?;
        copy_file_durably(&root.join("link"), &dest, "out")?;
        let meta = std::fs::symlink_metadata(root.join("dest/out"))?;
        assert!(meta.file_type().is_file());
        assert_eq!(std::fs::read_to_string(root.join("dest/out"))?, "payload");
        assert_eq!(std::fs::read_to_string(root.join("real"))?, "payload");
        Ok(())
    }

    #[test]
    fn test_write_file_durably() -> Result<()> {
        let td = tempfile::tempdir()?;
        let root = Utf8Path::from_path(td.path()).unwrap();
        write_file_durably(&root.join("a/b"), "env", "x=1\n")?;
        write_file_durably(&root.join("a/b"), "env", "x=2\n")?;
        assert_eq!(std::fs::read_to_string(root.join("a/b/env"))?, "x=2\n");
        Ok(())
    }
}
