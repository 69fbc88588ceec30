//! Kernel command line parsing utilities.
//!
//! Splits a command line into parameters, honoring double quotes so that
//! `foo="a b"` is a single parameter. Keys treat dashes and underscores as
//! equivalent, like the kernel does.

use std::borrow::Cow;

use anyhow::{Context, Result};
use camino::Utf8Path;

/// A parsed kernel command line.
///
/// Wraps the raw command line bytes; borrowed input is not copied.
#[derive(Debug)]
pub(crate) struct Cmdline<'a>(Cow<'a, [u8]>);

impl<'a, T: AsRef<[u8]> + ?Sized> From<&'a T> for Cmdline<'a> {
    fn from(input: &'a T) -> Self {
        Self(Cow::Borrowed(input.as_ref()))
    }
}

impl<'a> Cmdline<'a> {
    /// Reads a kernel command line from a file such as `/proc/cmdline`.
    pub(crate) fn from_file(path: &Utf8Path) -> Result<Self> {
        let buf = std::fs::read(path).with_context(|| format!("Reading {path}"))?;
        Ok(Self(Cow::Owned(buf)))
    }

    /// Returns an iterator over all parameters in the command line.
    ///
    /// Splits on unquoted whitespace; runs of whitespace do not produce
    /// empty parameters.
    pub(crate) fn iter(&'a self) -> impl Iterator<Item = Parameter<'a>> + 'a {
        let mut in_quotes = false;

        self.0
            .split(move |c| {
                if *c == b'"' {
                    in_quotes = !in_quotes;
                }
                !in_quotes && c.is_ascii_whitespace()
            })
            .filter(|p| !p.is_empty())
            .map(Parameter::from)
    }

    /// Locate a kernel argument with the given key name that must be UTF-8.
    ///
    /// Returns the first match. Key comparison treats dashes and
    /// underscores as equivalent.
    pub(crate) fn find_str(&'a self, key: &str) -> Option<ParameterStr<'a>> {
        let key = ParameterKey(key.as_bytes());
        self.iter()
            .find(|p| p.key == key)
            .and_then(|p| p.to_str())
    }
}

/// A single kernel command line parameter key.
#[derive(Debug, Eq)]
pub(crate) struct ParameterKey<'a>(&'a [u8]);

impl PartialEq for ParameterKey<'_> {
    /// Keys are compared with dashes and underscores treated as equivalent.
    /// This comparison is case-sensitive.
    fn eq(&self, other: &Self) -> bool {
        let dedashed = |&c: &u8| if c == b'-' { b'_' } else { c };

        // Not zip(): "foo" would otherwise equal "foobar".
        let our_iter = self.0.iter().map(dedashed);
        let other_iter = other.0.iter().map(dedashed);
        our_iter.eq(other_iter)
    }
}

/// A single kernel command line parameter.
#[derive(Debug, Eq)]
pub(crate) struct Parameter<'a> {
    /// The full original parameter
    pub parameter: &'a [u8],
    /// The parameter key as raw bytes
    pub key: ParameterKey<'a>,
    /// The parameter value as raw bytes, if present
    pub value: Option<&'a [u8]>,
}

/// A single kernel command line parameter known to be UTF-8.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct ParameterStr<'a> {
    /// The original parameter
    pub parameter: &'a str,
    /// The parameter key
    pub key: &'a str,
    /// The parameter value, if present
    pub value: Option<&'a str>,
}

impl PartialEq for Parameter<'_> {
    fn eq(&self, other: &Self) -> bool {
        // The raw parameter is not compared so keys stay dash-insensitive
        self.key == other.key && self.value == other.value
    }
}

fn strip_outer_quotes(value: &[u8]) -> &[u8] {
    let value = value.strip_prefix(b"\"").unwrap_or(value);
    value.strip_suffix(b"\"").unwrap_or(value)
}

impl<'a> Parameter<'a> {
    pub(crate) fn to_str(&self) -> Option<ParameterStr<'a>> {
        let parameter = std::str::from_utf8(self.parameter).ok()?;
        let key = std::str::from_utf8(self.key.0).ok()?;
        let value = match self.value {
            Some(v) => Some(std::str::from_utf8(v).ok()?),
            None => None,
        };
        Some(ParameterStr {
            parameter,
            key,
            value,
        })
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> From<&'a T> for Parameter<'a> {
    /// Splits on the first `=`; only the outermost pair of double quotes
    /// is stripped from the value.
    fn from(input: &'a T) -> Self {
        let input = input.as_ref();
        match input.iter().position(|b| *b == b'=') {
            None => Self {
                parameter: input,
                key: ParameterKey(input),
                value: None,
            },
            Some(i) => Self {
                parameter: input,
                key: ParameterKey(&input[..i]),
                value: Some(strip_outer_quotes(&input[i + 1..])),
            },
        }
    }
}
