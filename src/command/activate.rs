// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use crate::{
    cli::Activate,
    device::{self, TpmDevice},
    error::CliError,
    util::read_input,
    Command,
};
use std::{
    io::Write,
    sync::{Arc, Mutex},
};

impl Command for Activate {
    /// Runs `activate`.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the execution fails
    fn run<W: Write>(
        &self,
        device: Option<Arc<Mutex<TpmDevice>>>,
        writer: &mut W,
    ) -> Result<(), CliError> {
        let blob = read_input(Some(&self.credin))?;
        let secret = read_input(Some(&self.secretin))?;

        let device = device::required(device)?;
        let credential = device::lock(&device)?.activate_credential(
            self.handle,
            self.protector,
            self.pass.as_bytes(),
            self.protectorpass.as_bytes(),
            &blob,
            &secret,
        )?;

        writer.write_all(&credential)?;
        writer.flush()?;
        Ok(())
    }
}
