// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

#![deny(clippy::all)]
#![deny(clippy::pedantic)]

pub mod cli;
pub mod command;
pub mod crypto;
pub mod device;
pub mod error;
pub mod mocktpm;
pub mod name;
pub mod print;
pub mod template;
pub mod transport;
pub mod util;

use crate::{cli::Cli, device::TpmDevice, error::CliError, util::normalize_args};
use clap::Parser;
use std::{
    ffi::OsString,
    io::{self, Write},
    sync::{Arc, Mutex, PoisonError},
};

/// A trait for executing subcommands.
pub trait Command {
    /// Returns `true` if the command does not require TPM device access.
    fn is_local(&self) -> bool {
        false
    }

    /// Runs a command.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the execution fails
    fn run<W: Write>(
        &self,
        device: Option<Arc<Mutex<TpmDevice>>>,
        writer: &mut W,
    ) -> Result<(), CliError>;
}

/// Parses command-line arguments and executes the corresponding command.
/// The TPM channel is closed on every exit path once the command returns.
///
/// # Errors
///
/// Returns a `CliError` if opening the device, executing the command or
/// closing the device fails. A command error takes precedence over a close
/// error.
pub fn execute_cli<I>(args: I) -> Result<(), CliError>
where
    I: IntoIterator<Item = OsString>,
{
    let cli = Cli::parse_from(normalize_args(args));
    let command = &cli.command;
    let mut stdout = io::stdout().lock();

    if command.is_local() {
        return command.run(None, &mut stdout);
    }

    let device = Arc::new(Mutex::new(TpmDevice::open(command.device())?));
    let result = command.run(Some(Arc::clone(&device)), &mut stdout);

    let closed = match Arc::try_unwrap(device) {
        Ok(mutex) => mutex
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .close(),
        Err(_) => Err(CliError::Execution(
            "TPM device still referenced after the command".to_string(),
        )),
    };
    result?;
    closed
}
