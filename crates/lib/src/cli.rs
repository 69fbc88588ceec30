//! # snapboot command line
//!
//! Inspection helpers for boot state: the mode environment, gadget
//! supplied kernel command lines, trusted asset digests and the partition
//! layout configuration.

use std::ffi::OsString;
use std::io::Write;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use serde::Serialize;
use snapboot_utils::PathQuotedDisplay;

use crate::assets::hash_file;
use crate::cmdline::compose_command_line;
use crate::config::Layout;
use crate::modeenv::{Mode, ModeEnv};
use crate::model::{Grade, Model};

/// Options for `modeenv show`.
#[derive(Debug, clap::Args, PartialEq, Eq)]
pub(crate) struct ModeenvShowOpts {
    /// Writable root the modeenv is read from.
    #[clap(long, default_value = "/")]
    pub(crate) root: Utf8PathBuf,

    /// Output JSON instead of the on-disk format.
    #[clap(long)]
    pub(crate) json: bool,
}

/// Operations on the mode environment.
#[derive(Debug, clap::Subcommand, PartialEq, Eq)]
pub(crate) enum ModeenvOpts {
    /// Display the mode environment.
    Show(ModeenvShowOpts),
    /// Parse a modeenv file and report problems.
    Check {
        /// Path to the file.
        file: Utf8PathBuf,
    },
}

fn parse_mode(s: &str) -> Result<Mode> {
    Mode::try_from(s)
}

/// Options for `cmdline gadget`.
#[derive(Debug, clap::Args, PartialEq, Eq)]
pub(crate) struct CmdlineGadgetOpts {
    /// The unpacked gadget.
    pub(crate) gadget_dir: Utf8PathBuf,

    /// Grade of the model.
    #[clap(long, value_enum, default_value_t = Grade::Signed)]
    pub(crate) grade: Grade,

    /// Boot mode: run, recover or factory-reset.
    #[clap(long, value_parser = parse_mode, default_value = "run")]
    pub(crate) mode: Mode,

    /// Recovery system label, for recover and factory-reset.
    #[clap(long, default_value = "")]
    pub(crate) system: String,

    /// The bootloader's built-in command line snippet.
    #[clap(long = "default", default_value = "")]
    pub(crate) default_cmdline: String,
}

/// Kernel command line operations.
#[derive(Debug, clap::Subcommand, PartialEq, Eq)]
pub(crate) enum CmdlineOpts {
    /// Compose the command line from a gadget.
    Gadget(CmdlineGadgetOpts),
}

/// Layout configuration operations.
#[derive(Debug, clap::Subcommand, PartialEq, Eq)]
pub(crate) enum ConfigOpts {
    /// Print the effective layout after applying drop-ins.
    Show {
        /// Root the layout is relative to.
        #[clap(long, default_value = "/")]
        root: Utf8PathBuf,
    },
}

/// Inspect and diagnose the boot state of snap based systems.
#[derive(Debug, Parser, PartialEq, Eq)]
#[clap(name = "snapboot", version)]
pub(crate) enum Opt {
    /// Mode environment operations.
    #[clap(subcommand)]
    Modeenv(ModeenvOpts),
    /// Kernel command line operations.
    #[clap(subcommand)]
    Cmdline(CmdlineOpts),
    /// Print the SHA3-384 digest of trusted asset files.
    Hash {
        /// Files to hash.
        #[clap(required = true)]
        files: Vec<Utf8PathBuf>,
    },
    /// Layout configuration.
    #[clap(subcommand)]
    Config(ConfigOpts),
}

fn modeenv_show(opts: &ModeenvShowOpts, out: &mut impl Write) -> Result<()> {
    let m = ModeEnv::read_from(&opts.root)?;
    if opts.json {
        serde_json::to_writer_pretty(&mut *out, &m)?;
        writeln!(out)?;
    } else {
        out.write_all(m.serialize()?.as_bytes())?;
    }
    Ok(())
}

fn modeenv_check(file: &Utf8Path) -> Result<()> {
    let buf = std::fs::read_to_string(file).with_context(|| format!("Reading {file}"))?;
    let m = ModeEnv::parse(&buf).with_context(|| format!("Parsing {file}"))?;
    for (k, _) in m.unknown_keys() {
        tracing::warn!("Unknown key {k} in {file}");
    }
    tracing::info!("{file}: mode {}", m.mode);
    Ok(())
}

fn cmdline_gadget(opts: &CmdlineGadgetOpts) -> Result<String> {
    let model = Model::new("", "", opts.grade);
    compose_command_line(
        opts.mode,
        &opts.system,
        &opts.gadget_dir,
        &model,
        &opts.default_cmdline,
    )
}

fn hash_files(files: &[Utf8PathBuf], out: &mut impl Write) -> Result<()> {
    for f in files {
        let h = hash_file(f)?;
        writeln!(out, "{h}  {}", PathQuotedDisplay::new(f))?;
    }
    Ok(())
}

#[derive(Serialize)]
struct LayoutRoot<'a> {
    layout: &'a Layout,
}

fn config_show(root: &Utf8Path, out: &mut impl Write) -> Result<()> {
    let layout = Layout::load(root)?;
    let buf = toml::to_string(&LayoutRoot { layout: &layout })?;
    out.write_all(buf.as_bytes())?;
    Ok(())
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args))
}

fn run_from_opt(opt: Opt) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    match opt {
        Opt::Modeenv(ModeenvOpts::Show(opts)) => modeenv_show(&opts, &mut stdout),
        Opt::Modeenv(ModeenvOpts::Check { file }) => modeenv_check(&file),
        Opt::Cmdline(CmdlineOpts::Gadget(opts)) => {
            let cmdline = cmdline_gadget(&opts)?;
            writeln!(stdout, "{cmdline}")?;
            Ok(())
        }
        Opt::Hash { files } => hash_files(&files, &mut stdout),
        Opt::Config(ConfigOpts::Show { root }) => config_show(&root, &mut stdout),
    }
}
