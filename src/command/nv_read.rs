// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{
    cli::NvRead,
    device::{self, TpmDevice},
    error::CliError,
    util::write_output,
    Command,
};
use std::{
    io::Write,
    sync::{Arc, Mutex},
};

impl Command for NvRead {
    /// Runs `nvread`.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the execution fails
    fn run<W: Write>(
        &self,
        device: Option<Arc<Mutex<TpmDevice>>>,
        writer: &mut W,
    ) -> Result<(), CliError> {
        let device = device::required(device)?;
        let data = device::lock(&device)?.nv_read(self.handle, self.pass.as_bytes())?;
        write_output(self.out.as_deref(), writer, &data)
    }
}
