// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::error::CliError;
use std::{
    ffi::OsString,
    fs,
    io::{self, Read, Write},
    path::Path,
};
use tpm2_protocol::{
    constant::TPM_MAX_COMMAND_SIZE, data::TpmtPublic, TpmError, TpmMarshal, TpmUnmarshal,
    TpmWriter,
};

/// Long flags that take no value, per subcommand. `help` and `version` are
/// accepted everywhere.
const SWITCHES: &[(&str, &[&str])] = &[
    ("caps", &["algorithms", "handles", "commands", "properties", "all"]),
    ("createprimary", &["endorsement", "platform"]),
    ("readpublic", &["pubout", "text"]),
];

fn is_switch(command: Option<&str>, flag: &str) -> bool {
    matches!(flag, "help" | "version")
        || SWITCHES
            .iter()
            .any(|(name, flags)| command == Some(*name) && flags.contains(&flag))
}

/// Returns the flag body of a single-dash long flag (`-handle` or
/// `-tpm=x`), or `None` for short flags, `-` and negative numbers.
fn single_dash_long(arg: &str) -> Option<&str> {
    let rest = arg.strip_prefix('-')?;
    if rest.starts_with('-') {
        return None;
    }
    let name = rest.split('=').next().unwrap_or(rest);
    if name.chars().count() < 2 || !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return None;
    }
    Some(rest)
}

/// Marshals a TPM structure into a freshly allocated buffer.
///
/// # Errors
///
/// Returns a `TpmError` if the structure does not fit a TPM command buffer
/// or its tagged unions do not match their selectors.
pub fn build_to_vec<T: TpmMarshal>(obj: &T) -> Result<Vec<u8>, TpmError> {
    let mut buf = [0u8; TPM_MAX_COMMAND_SIZE];
    let len = {
        let mut writer = TpmWriter::new(&mut buf);
        obj.marshal(&mut writer)?;
        writer.len()
    };
    Ok(buf[..len].to_vec())
}

/// Parses a handle in decimal, `0x` hexadecimal, `0o` or leading-zero octal,
/// or `0b` binary notation.
///
/// # Errors
///
/// Returns `CliError::Configuration` if the string is not a number or does
/// not fit in 32 bits.
pub fn parse_handle(s: &str) -> Result<u32, CliError> {
    let invalid = || CliError::Configuration(format!("invalid handle '{s}'"));
    let lower = s.to_ascii_lowercase();
    let (digits, radix) = if let Some(rest) = lower.strip_prefix("0x") {
        (rest, 16)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (rest, 2)
    } else if let Some(rest) = lower.strip_prefix("0o") {
        (rest, 8)
    } else if lower.len() > 1 && lower.starts_with('0') {
        (&lower[1..], 8)
    } else {
        (lower.as_str(), 10)
    };
    if digits.is_empty() || digits.starts_with(['+', '-']) {
        return Err(invalid());
    }
    let value = u64::from_str_radix(&digits.replace('_', ""), radix).map_err(|_| invalid())?;
    u32::try_from(value).map_err(|_| {
        CliError::Configuration(format!("handle '{s}' is larger than 0xffffffff"))
    })
}

/// Rewrites single-dash long flags (`-handle`) to the double-dash form that
/// clap expects. Single-character flags, `-`, the value following a flag that
/// takes one, and everything after `--` are left alone.
#[must_use]
pub fn normalize_args<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = OsString>,
{
    let mut args = args.into_iter();
    let mut out: Vec<OsString> = args.next().into_iter().collect();
    let mut command: Option<String> = None;
    let mut verbatim = false;
    let mut value_next = false;
    for arg in args {
        if verbatim || std::mem::take(&mut value_next) {
            out.push(arg);
            continue;
        }
        let Some(s) = arg.to_str() else {
            out.push(arg);
            continue;
        };
        if s == "--" {
            verbatim = true;
            out.push(arg);
            continue;
        }
        let long = s.strip_prefix("--").or_else(|| single_dash_long(s));
        let Some(body) = long else {
            if command.is_none() && !s.starts_with('-') {
                command = Some(s.to_string());
            }
            out.push(arg);
            continue;
        };
        value_next = match body.split_once('=') {
            Some(_) => false,
            None => !is_switch(command.as_deref(), body),
        };
        out.push(OsString::from(format!("--{body}")));
    }
    out
}

/// Reads a whole file, or standard input when `path` is `None`.
///
/// # Errors
///
/// Returns `CliError::File` or `CliError::Io` on read failure.
pub fn read_input(path: Option<&Path>) -> Result<Vec<u8>, CliError> {
    match path {
        Some(path) => fs::read(path).map_err(|e| CliError::file(path, e)),
        None => {
            let mut data = Vec::new();
            io::stdin().read_to_end(&mut data)?;
            Ok(data)
        }
    }
}

/// Decodes a raw `TPMT_PUBLIC` file.
///
/// # Errors
///
/// Returns `CliError::File` if the file cannot be read and
/// `CliError::MalformedPublicArea` if it does not decode.
pub fn read_public_area(path: &Path) -> Result<TpmtPublic, CliError> {
    let data = fs::read(path).map_err(|e| CliError::file(path, e))?;
    let (public, tail) =
        TpmtPublic::unmarshal(&data).map_err(|e| CliError::MalformedPublicArea(e.to_string()))?;
    if !tail.is_empty() {
        return Err(CliError::MalformedPublicArea(format!(
            "{} trailing bytes",
            tail.len()
        )));
    }
    Ok(public)
}

/// Writes `data` to a file, or to `writer` when `path` is `None`.
///
/// # Errors
///
/// Returns `CliError::File` or `CliError::Io` on write failure.
pub fn write_output<W: Write>(
    path: Option<&Path>,
    writer: &mut W,
    data: &[u8],
) -> Result<(), CliError> {
    match path {
        Some(path) => fs::write(path, data).map_err(|e| CliError::file(path, e)),
        None => {
            writer.write_all(data)?;
            writer.flush()?;
            Ok(())
        }
    }
}
