use std::fmt::Display;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Helper to format a path for log and error messages.
#[derive(Debug)]
pub struct PathQuotedDisplay<'a> {
    path: &'a Path,
}

fn is_plain(s: &str) -> bool {
    s.chars()
        .all(|c| matches!(c, '/' | '.' | '-' | '_' | '+') || c.is_alphanumeric())
}

impl Display for PathQuotedDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(s) = self.path.to_str().filter(|s| is_plain(s)) {
            return f.write_str(s);
        }
        let quoted =
            shlex::bytes::try_quote(self.path.as_os_str().as_bytes()).map_err(|_| std::fmt::Error)?;
        f.write_str(&String::from_utf8_lossy(&quoted))
    }
}

impl<'a> PathQuotedDisplay<'a> {
    /// Given a path, quote it in a way that it would be parsed by a default
    /// POSIX shell. Snap file names such as `pc-kernel+kcomp1_33.comp`
    /// are left as-is.
    pub fn new<P: AsRef<Path> + ?Sized>(path: &'a P) -> PathQuotedDisplay<'a> {
        PathQuotedDisplay {
            path: path.as_ref(),
        }
    }
}
