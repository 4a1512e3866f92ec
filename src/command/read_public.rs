// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{
    cli::ReadPublic,
    device::{self, TpmDevice},
    error::CliError,
    name::derive_name,
    print::{print_public, public_key_pem},
    util::{build_to_vec, read_public_area, write_output},
    Command,
};
use std::{
    io::Write,
    sync::{Arc, Mutex},
};

impl Command for ReadPublic {
    fn is_local(&self) -> bool {
        self.input.is_some()
    }

    /// Runs `readpublic`.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the execution fails
    fn run<W: Write>(
        &self,
        device: Option<Arc<Mutex<TpmDevice>>>,
        writer: &mut W,
    ) -> Result<(), CliError> {
        let (public, name, qualified_name) = if let Some(path) = &self.input {
            let public = read_public_area(path)?;
            let name = derive_name(&public)?;
            (public, name, None)
        } else {
            let handle = self
                .handle
                .ok_or_else(|| CliError::Configuration("no handle specified".to_string()))?;
            let device = device::required(device)?;
            let area = device::lock(&device)?.read_public(handle)?;
            (area.public, area.name, Some(area.qualified_name))
        };

        if self.out.is_some() || (!self.text && !self.pubout) {
            let data = build_to_vec(&public).map_err(|e| CliError::MalformedPublicArea(e.to_string()))?;
            write_output(self.out.as_deref(), writer, &data)?;
        }

        if self.text {
            print_public(writer, &public, &name, qualified_name.as_ref())?;
        }

        if self.pubout {
            writer.write_all(public_key_pem(&public)?.as_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }
}
