// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{
    cli::MakeCred,
    device::{self, TpmDevice},
    error::CliError,
    name::{derive_name, strip_size_prefix},
    util::{read_input, read_public_area},
    Command,
};
use std::{
    fs,
    io::Write,
    sync::{Arc, Mutex},
};
use tracing::debug;

impl Command for MakeCred {
    /// Runs `makecred`.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the execution fails
    fn run<W: Write>(
        &self,
        device: Option<Arc<Mutex<TpmDevice>>>,
        _writer: &mut W,
    ) -> Result<(), CliError> {
        let public = read_public_area(&self.publicarea)?;
        let name = derive_name(&public)?;
        let encoded = name.encode()?;
        let name_bytes = strip_size_prefix(&encoded)?;
        debug!(name = %name, "binding credential");

        let credential = read_input(self.input.as_deref())?;

        let device = device::required(device)?;
        let (blob, secret) =
            device::lock(&device)?.make_credential(self.handle, &credential, name_bytes)?;

        fs::write(&self.credout, &blob).map_err(|e| CliError::file(&self.credout, e))?;
        fs::write(&self.secretout, &secret).map_err(|e| CliError::file(&self.secretout, e))?;
        Ok(())
    }
}
