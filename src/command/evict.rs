// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use crate::{
    cli::Evict,
    device::{self, TpmDevice},
    error::CliError,
    Command,
};
use std::{
    io::Write,
    sync::{Arc, Mutex},
};
use tpm2_protocol::data::{TpmHt, TpmRh};

impl Command for Evict {
    /// Runs `evict`.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the execution fails
    fn run<W: Write>(
        &self,
        device: Option<Arc<Mutex<TpmDevice>>>,
        _writer: &mut W,
    ) -> Result<(), CliError> {
        if self.handle >> 24 != u32::from(TpmHt::Persistent.value()) {
            return Err(CliError::Configuration(format!(
                "'{:#010x}' is not a persistent handle",
                self.handle
            )));
        }
        let device = device::required(device)?;
        device::lock(&device)?.evict_control(
            TpmRh::Owner.value(),
            self.ownerpass.as_bytes(),
            self.handle,
            self.handle,
        )?;
        Ok(())
    }
}
