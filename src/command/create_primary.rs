// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{
    cli::CreatePrimary,
    device::{self, ScopedHandle, TpmDevice},
    error::CliError,
    print::label,
    template::Template,
    Command,
};
use log::info;
use std::{
    io::Write,
    sync::{Arc, Mutex},
};
use tpm2_protocol::data::{Tpm2bAuth, TpmRh, TpmsSensitiveCreate};

impl CreatePrimary {
    fn hierarchy(&self) -> u32 {
        let hierarchy = if self.endorsement {
            TpmRh::Endorsement
        } else if self.platform {
            TpmRh::Platform
        } else {
            TpmRh::Owner
        };
        hierarchy.value()
    }
}

impl Command for CreatePrimary {
    /// Runs `createprimary`.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the execution fails
    fn run<W: Write>(
        &self,
        device: Option<Arc<Mutex<TpmDevice>>>,
        _writer: &mut W,
    ) -> Result<(), CliError> {
        let template = Template::from_file(&self.template)?.to_public()?;
        let sensitive = TpmsSensitiveCreate {
            user_auth: Tpm2bAuth::try_from(self.pass.as_bytes())?,
            data: Default::default(),
        };
        let owner_password = self.ownerpass.as_bytes();

        let device = device::required(device)?;
        let created = device::lock(&device)?.create_primary(
            self.hierarchy(),
            owner_password,
            &sensitive,
            &template,
        )?;
        let primary = ScopedHandle::new(created.handle, Arc::clone(&device));

        device::lock(&device)?.evict_control(
            TpmRh::Owner.value(),
            owner_password,
            primary.handle(),
            self.persistent,
        )?;
        primary.flush()?;
        info!(
            "{:#010x}: {} ({})",
            self.persistent,
            label(created.public.object_type),
            created.name
        );
        Ok(())
    }
}
