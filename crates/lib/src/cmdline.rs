//! # Kernel command line composition
//!
//! A boot mode's kernel command line is made of the mode argument, the
//! recovery system argument (recover and factory-reset modes only), a base
//! portion and the optional append options from gadget defaults. The base
//! portion is the bootloader's built-in static snippet, optionally extended
//! by the gadget's `cmdline.extra`, or replaced outright by the gadget's
//! `cmdline.full`.
//!
//! Gadget supplied arguments must not use the reserved `snapd_` prefix or
//! the bare `snapd=` key; those are owned by the boot subsystem.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde::Deserialize;

use crate::bootloader::{BootloaderFinder, Options, Role};
use crate::config::Layout;
use crate::kernel_cmdline::Cmdline;
use crate::model::{Grade, Model};
use crate::modeenv::Mode;

/// Gadget file extending the bootloader's static command line.
pub const CMDLINE_EXTRA: &str = "cmdline.extra";
/// Gadget file replacing the bootloader's static command line.
pub const CMDLINE_FULL: &str = "cmdline.full";
/// Gadget metadata carrying configuration defaults.
const GADGET_YAML: &str = "meta/gadget.yaml";
/// Snap id under which system configuration defaults live.
const SYSTEM_DEFAULTS: &str = "system";
/// Arguments appended on all grades.
pub const OPT_CMDLINE_APPEND: &str = "system.kernel.cmdline-append";
/// Arguments appended on the dangerous grade only.
pub const OPT_DANGEROUS_CMDLINE_APPEND: &str = "system.kernel.dangerous-cmdline-append";

/// Bootloader variable holding arguments appended to the static command line.
pub const VAR_EXTRA_CMDLINE_ARGS: &str = "snapd_extra_cmdline_args";
/// Bootloader variable holding a command line that replaces the static one.
pub const VAR_FULL_CMDLINE_ARGS: &str = "snapd_full_cmdline_args";

/// Errors in gadget supplied kernel arguments.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CmdlineError {
    /// A reserved argument was found.
    #[error("invalid kernel command line in {source_name}: disallowed kernel argument {arg:?}")]
    Disallowed {
        /// Where the argument came from.
        source_name: String,
        /// The offending argument.
        arg: String,
    },
    /// The gadget ships both override files.
    #[error("cannot support both extra and full kernel command lines")]
    ExtraAndFull,
}

/// Which edition of the bootloader's static command line to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edition {
    /// What the installed boot configuration uses.
    Current,
    /// What the boot configuration shipped by this build would use.
    Candidate,
}

/// Kernel command line supplied by the gadget.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum GadgetCmdline {
    /// The gadget does not override the command line.
    #[default]
    None,
    /// Contents of `cmdline.extra`.
    Extra(String),
    /// Contents of `cmdline.full`.
    Full(String),
}

/// The kernel drops the quotes around a parameter before splitting off
/// its key, so `"snapd_x=1"` sets `snapd_x`.
fn is_reserved(key: &str, parameter: &str) -> bool {
    let key = key.strip_prefix('"').unwrap_or(key);
    let parameter = parameter.strip_prefix('"').unwrap_or(parameter);
    key.starts_with("snapd_") || parameter.starts_with("snapd=")
}

/// Reject arguments owned by the boot subsystem.
pub fn validate_args(source_name: &str, args: &str) -> Result<(), CmdlineError> {
    let cmdline = Cmdline::from(args);
    let reserved = cmdline
        .iter()
        .filter_map(|p| p.to_str())
        .find(|p| is_reserved(p.key, p.parameter));
    match reserved {
        Some(p) => Err(CmdlineError::Disallowed {
            source_name: source_name.to_string(),
            arg: p.parameter.to_string(),
        }),
        None => Ok(()),
    }
}

/// Join the non-empty items with a single space.
pub(crate) fn join_non_empty<'a>(items: impl IntoIterator<Item = &'a str>) -> String {
    items
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Read a gadget command line file: `#` comments are dropped and the
/// remaining lines are joined into one.
fn read_cmdline_file(gadget_dir: &Utf8Path, name: &str) -> Result<Option<String>> {
    let path = gadget_dir.join(name);
    let buf = match std::fs::read_to_string(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
    };
    let lines = buf.lines().map(|l| match l.split_once('#') {
        Some((before, _)) => before.trim(),
        None => l.trim(),
    });
    let content = join_non_empty(lines);
    validate_args(name, &content)?;
    Ok(Some(content))
}

/// Load the kernel command line override shipped by the gadget.
#[context("Using kernel command line from gadget")]
pub fn gadget_cmdline(gadget_dir: &Utf8Path) -> Result<GadgetCmdline> {
    let extra = read_cmdline_file(gadget_dir, CMDLINE_EXTRA)?;
    let full = read_cmdline_file(gadget_dir, CMDLINE_FULL)?;
    let r = match (extra, full) {
        (Some(_), Some(_)) => return Err(CmdlineError::ExtraAndFull.into()),
        (Some(extra), None) => GadgetCmdline::Extra(extra),
        (None, Some(full)) => GadgetCmdline::Full(full),
        (None, None) => GadgetCmdline::None,
    };
    tracing::trace!("Gadget command line: {r:?}");
    Ok(r)
}

#[derive(Debug, Default, Deserialize)]
struct GadgetYaml {
    #[serde(default)]
    defaults: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
}

fn default_option(defaults: &BTreeMap<String, serde_yaml::Value>, name: &str) -> Result<String> {
    let Some(v) = defaults.get(name) else {
        return Ok(String::new());
    };
    let v = match v {
        serde_yaml::Value::String(s) => s.trim().to_string(),
        serde_yaml::Value::Null => String::new(),
        o => anyhow::bail!("Invalid value for {name}: {o:?}"),
    };
    validate_args(name, &v)?;
    Ok(v)
}

/// Arguments to append from the gadget's system configuration defaults.
/// Dangerous-only arguments are dropped silently on other grades.
#[context("Reading kernel command line defaults from gadget")]
pub fn optional_kernel_command_line(model: &Model, gadget_dir: &Utf8Path) -> Result<String> {
    let path = gadget_dir.join(GADGET_YAML);
    let buf = match std::fs::read_to_string(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
    };
    let gadget: GadgetYaml =
        serde_yaml::from_str(&buf).with_context(|| format!("Parsing {path}"))?;
    let Some(system) = gadget.defaults.get(SYSTEM_DEFAULTS) else {
        return Ok(String::new());
    };
    let append = default_option(system, OPT_CMDLINE_APPEND)?;
    if model.grade != Grade::Dangerous {
        if system.contains_key(OPT_DANGEROUS_CMDLINE_APPEND) {
            tracing::debug!("Ignoring {OPT_DANGEROUS_CMDLINE_APPEND} for grade {}", model.grade);
        }
        return Ok(append);
    }
    let dangerous = default_option(system, OPT_DANGEROUS_CMDLINE_APPEND)?;
    Ok(join_non_empty([append.as_str(), dangerous.as_str()]))
}

/// Compose the command line for `mode` given the bootloader's static
/// snippet.
pub fn compose_command_line(
    mode: Mode,
    system: &str,
    gadget_dir: &Utf8Path,
    model: &Model,
    static_cmdline: &str,
) -> Result<String> {
    let mode_arg = format!("snapd_recovery_mode={mode}");
    let system_arg = match mode {
        Mode::Run => String::new(),
        Mode::Recover | Mode::FactoryReset => format!("snapd_recovery_system={system}"),
        Mode::Install => anyhow::bail!("internal error: unsupported command line mode {mode:?}"),
    };
    let gadget = gadget_cmdline(gadget_dir)?;
    let append = optional_kernel_command_line(model, gadget_dir)?;
    let (base, extra) = match &gadget {
        GadgetCmdline::None => (static_cmdline, ""),
        GadgetCmdline::Extra(e) => (static_cmdline, e.as_str()),
        GadgetCmdline::Full(f) => (f.as_str(), ""),
    };
    Ok(join_non_empty([
        mode_arg.as_str(),
        system_arg.as_str(),
        base,
        extra,
        append.as_str(),
    ]))
}

/// Compose the command line for `mode` using the static snippet of the
/// bootloader responsible for that mode. Bootloaders that do not manage
/// their command line yield an empty string.
pub fn compose_command_line_for_mode(
    finder: &BootloaderFinder,
    layout: &Layout,
    edition: Edition,
    mode: Mode,
    system: &str,
    gadget_dir: &Utf8Path,
    model: &Model,
) -> Result<String> {
    if !model.has_modes() {
        return Ok(String::new());
    }
    let (root, role) = match mode {
        Mode::Run => (layout.ubuntu_boot(), Role::RunMode),
        _ => (layout.ubuntu_seed(), Role::Recovery),
    };
    let opts = Options {
        role,
        no_slash_boot: true,
        ..Default::default()
    };
    let bl = finder.find(&root, &opts)?;
    let Some(tbl) = bl.as_trusted_assets() else {
        return Ok(String::new());
    };
    let static_cmdline = tbl.default_command_line(edition == Edition::Candidate)?;
    compose_command_line(mode, system, gadget_dir, model, &static_cmdline)
}

/// The run mode command line of the boot configuration about to be
/// installed.
pub fn compose_candidate_command_line(
    finder: &BootloaderFinder,
    layout: &Layout,
    model: &Model,
    gadget_dir: &Utf8Path,
) -> Result<String> {
    compose_command_line_for_mode(
        finder,
        layout,
        Edition::Candidate,
        Mode::Run,
        "",
        gadget_dir,
        model,
    )
}

/// The recover mode command line for a recovery system.
pub fn compose_recovery_command_line(
    finder: &BootloaderFinder,
    layout: &Layout,
    model: &Model,
    system: &str,
    gadget_dir: &Utf8Path,
) -> Result<String> {
    compose_command_line_for_mode(
        finder,
        layout,
        Edition::Current,
        Mode::Recover,
        system,
        gadget_dir,
        model,
    )
}

/// The factory-reset mode command line for a recovery system.
pub fn compose_factory_reset_command_line(
    finder: &BootloaderFinder,
    layout: &Layout,
    model: &Model,
    system: &str,
    gadget_dir: &Utf8Path,
) -> Result<String> {
    compose_command_line_for_mode(
        finder,
        layout,
        Edition::Current,
        Mode::FactoryReset,
        system,
        gadget_dir,
        model,
    )
}

/// Bootloader variables carrying the gadget's command line contribution.
///
/// When the bootloader manages its command line (`static_cmdline` is set)
/// the complete base portion goes to `snapd_full_cmdline_args`. Otherwise
/// gadget arguments are handed to the bootloader's own configuration as-is.
pub fn boot_vars_for_command_line(
    model: &Model,
    gadget_dir: &Utf8Path,
    static_cmdline: Option<&str>,
) -> Result<BTreeMap<String, String>> {
    let gadget = gadget_cmdline(gadget_dir)?;
    let append = optional_kernel_command_line(model, gadget_dir)?;
    let append = append.as_str();
    let (extra, full) = match (static_cmdline, &gadget) {
        (Some(_), GadgetCmdline::Full(f)) => (String::new(), join_non_empty([f.as_str(), append])),
        (Some(d), GadgetCmdline::Extra(e)) => (String::new(), join_non_empty([d, e.as_str(), append])),
        (Some(d), GadgetCmdline::None) => (String::new(), join_non_empty([d, append])),
        (None, GadgetCmdline::Full(f)) => (String::new(), join_non_empty([f.as_str(), append])),
        (None, GadgetCmdline::Extra(e)) => (join_non_empty([e.as_str(), append]), String::new()),
        (None, GadgetCmdline::None) => (append.to_string(), String::new()),
    };
    Ok(BTreeMap::from([
        (VAR_EXTRA_CMDLINE_ARGS.to_string(), extra),
        (VAR_FULL_CMDLINE_ARGS.to_string(), full),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATIC: &str = "console=ttyS0 console=tty1 panic=-1";

    fn gadget(files: &[(&str, &str)]) -> Result<(tempfile::TempDir, camino::Utf8PathBuf)> {
        let td = tempfile::tempdir()?;
        let dir = camino::Utf8PathBuf::try_from(td.path().to_path_buf())?;
        for (name, content) in files {
            let p = dir.join(name);
            std::fs::create_dir_all(p.parent().unwrap())?;
            std::fs::write(p, content)?;
        }
        Ok((td, dir))
    }

    fn dangerous() -> Model {
        Model::new("my-brand", "my-model-uc20", Grade::Dangerous)
    }

    #[test]
    fn test_validate() {
        assert!(validate_args("x", "foo bar=baz snapd.debug=1 snapdfoo").is_ok());
        assert_eq!(
            validate_args(CMDLINE_EXTRA, "foo snapd_foo=bar"),
            Err(CmdlineError::Disallowed {
                source_name: CMDLINE_EXTRA.into(),
                arg: "snapd_foo=bar".into()
            })
        );
        let e = validate_args(CMDLINE_FULL, "snapd=unhappy").unwrap_err();
        assert_eq!(
            e.to_string(),
            r#"invalid kernel command line in cmdline.full: disallowed kernel argument "snapd=unhappy""#
        );
        assert!(validate_args("x", "snapd_recovery_mode").is_err());

        for quoted in [
            r#""snapd_recovery_mode=recover""#,
            r#""snapd=unhappy""#,
            r#""snapd_foo""#,
            r#""snapd_foo=a b""#,
        ] {
            assert_eq!(
                validate_args(CMDLINE_EXTRA, &format!("foo {quoted}")),
                Err(CmdlineError::Disallowed {
                    source_name: CMDLINE_EXTRA.into(),
                    arg: quoted.into()
                }),
                "{quoted}"
            );
        }
        assert!(validate_args("x", r#"foo="snapd_foo=1" "snapd.debug=1""#).is_ok());
    }

    #[test]
    fn test_compose_default() -> Result<()> {
        let (_td, dir) = gadget(&[])?;
        let r = compose_command_line(Mode::Run, "", &dir, &dangerous(), STATIC)?;
        assert_eq!(r, "snapd_recovery_mode=run console=ttyS0 console=tty1 panic=-1");
        let r = compose_command_line(Mode::Recover, "20191216", &dir, &dangerous(), STATIC)?;
        assert_eq!(
            r,
            "snapd_recovery_mode=recover snapd_recovery_system=20191216 console=ttyS0 console=tty1 panic=-1"
        );
        let r = compose_command_line(Mode::FactoryReset, "1234", &dir, &dangerous(), STATIC)?;
        assert_eq!(
            r,
            "snapd_recovery_mode=factory-reset snapd_recovery_system=1234 console=ttyS0 console=tty1 panic=-1"
        );
        assert!(compose_command_line(Mode::Install, "", &dir, &dangerous(), STATIC).is_err());
        Ok(())
    }

    #[test]
    fn test_compose_extra_and_full() -> Result<()> {
        let (_td, dir) = gadget(&[(CMDLINE_EXTRA, "foo bar baz\n")])?;
        let r = compose_command_line(Mode::Run, "", &dir, &dangerous(), STATIC)?;
        assert_eq!(
            r,
            "snapd_recovery_mode=run console=ttyS0 console=tty1 panic=-1 foo bar baz"
        );

        let (_td, dir) = gadget(&[(CMDLINE_FULL, "# a comment\nfoo bar baz\n  x=1 # trailing\n")])?;
        let r = compose_command_line(Mode::Run, "", &dir, &dangerous(), STATIC)?;
        assert_eq!(r, "snapd_recovery_mode=run foo bar baz x=1");

        let (_td, dir) = gadget(&[(CMDLINE_FULL, "a"), (CMDLINE_EXTRA, "b")])?;
        let e = compose_command_line(Mode::Run, "", &dir, &dangerous(), STATIC).unwrap_err();
        assert!(e
            .chain()
            .any(|c| c.downcast_ref::<CmdlineError>() == Some(&CmdlineError::ExtraAndFull)));
        Ok(())
    }

    #[test]
    fn test_compose_rejects_reserved() -> Result<()> {
        for (file, arg) in [(CMDLINE_EXTRA, "snapd_foo=bar"), (CMDLINE_FULL, "snapd=unhappy")] {
            let (_td, dir) = gadget(&[(file, &format!("foo {arg}"))])?;
            let e = compose_command_line(Mode::Run, "", &dir, &dangerous(), STATIC).unwrap_err();
            let msg = format!("{e:#}");
            assert!(msg.contains(&format!("invalid kernel command line in {file}")), "{msg}");
            assert!(msg.contains(&format!("disallowed kernel argument \"{arg}\"")), "{msg}");
            assert!(boot_vars_for_command_line(&dangerous(), &dir, Some(STATIC)).is_err());
        }
        Ok(())
    }

    #[test]
    fn test_gadget_defaults() -> Result<()> {
        let yaml = indoc::indoc! {"
            volumes: {}
            defaults:
              system:
                system.kernel.cmdline-append: param1=val param2
                system.kernel.dangerous-cmdline-append: dparam1=val dparam2
        "};
        let (_td, dir) = gadget(&[(GADGET_YAML, yaml)])?;
        assert_eq!(
            optional_kernel_command_line(&dangerous(), &dir)?,
            "param1=val param2 dparam1=val dparam2"
        );
        let signed = Model::new("my-brand", "my-model-uc20", Grade::Signed);
        assert_eq!(optional_kernel_command_line(&signed, &dir)?, "param1=val param2");
        let r = compose_command_line(Mode::Run, "", &dir, &signed, STATIC)?;
        assert_eq!(
            r,
            "snapd_recovery_mode=run console=ttyS0 console=tty1 panic=-1 param1=val param2"
        );

        let yaml = indoc::indoc! {"
            defaults:
              system:
                system.kernel.dangerous-cmdline-append: snapd_x=1
        "};
        let (_td, dir) = gadget(&[(GADGET_YAML, yaml)])?;
        assert_eq!(optional_kernel_command_line(&signed, &dir)?, "");
        assert!(optional_kernel_command_line(&dangerous(), &dir).is_err());
        Ok(())
    }

    #[test]
    fn test_boot_vars() -> Result<()> {
        let m = dangerous();
        let (_td, dir) = gadget(&[(CMDLINE_EXTRA, "foo bar baz")])?;
        let v = boot_vars_for_command_line(&m, &dir, Some(STATIC))?;
        assert_eq!(v[VAR_EXTRA_CMDLINE_ARGS], "");
        assert_eq!(
            v[VAR_FULL_CMDLINE_ARGS],
            "console=ttyS0 console=tty1 panic=-1 foo bar baz"
        );
        let v = boot_vars_for_command_line(&m, &dir, None)?;
        assert_eq!(v[VAR_EXTRA_CMDLINE_ARGS], "foo bar baz");
        assert_eq!(v[VAR_FULL_CMDLINE_ARGS], "");

        let (_td, dir) = gadget(&[(CMDLINE_FULL, "foo bar baz")])?;
        for d in [Some(STATIC), None] {
            let v = boot_vars_for_command_line(&m, &dir, d)?;
            assert_eq!(v[VAR_EXTRA_CMDLINE_ARGS], "");
            assert_eq!(v[VAR_FULL_CMDLINE_ARGS], "foo bar baz");
        }
        Ok(())
    }
}
