// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use crate::{
    cli::Flush,
    device::{self, TpmDevice},
    error::CliError,
    Command,
};
use std::{
    io::Write,
    sync::{Arc, Mutex},
};

impl Command for Flush {
    fn run<W: Write>(
        &self,
        device: Option<Arc<Mutex<TpmDevice>>>,
        _writer: &mut W,
    ) -> Result<(), CliError> {
        let device = device::required(device)?;
        device::lock(&device)?.flush_context(self.handle)?;
        Ok(())
    }
}
