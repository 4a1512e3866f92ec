// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{
    cli::Create,
    device::{self, ScopedHandle, TpmDevice},
    error::CliError,
    print::label,
    template::Template,
    util::build_to_vec,
    Command,
};
use log::info;
use std::{
    fs,
    io::Write,
    sync::{Arc, Mutex},
};
use tpm2_protocol::data::{Tpm2bAuth, TpmRh, TpmsSensitiveCreate};

impl Command for Create {
    /// Runs `create`.
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
        let parent_password = self.parentpass.as_bytes();

        let device = device::required(device)?;
        let created =
            device::lock(&device)?.create(self.parent, parent_password, &sensitive, &template)?;

        if let Some(persistent) = self.persistent {
            let (handle, name) = device::lock(&device)?.load(
                self.parent,
                parent_password,
                &created.private,
                &created.public,
            )?;
            let object = ScopedHandle::new(handle, Arc::clone(&device));
            device::lock(&device)?.evict_control(
                TpmRh::Owner.value(),
                self.ownerpass.as_bytes(),
                object.handle(),
                persistent,
            )?;
            object.flush()?;
            info!(
                "{persistent:#010x}: {} ({name})",
                label(created.public.object_type)
            );
        }

        if let Some(path) = &self.pubout {
            let data = build_to_vec(&created.public)?;
            fs::write(path, data).map_err(|e| CliError::file(path, e))?;
        }
        if let Some(path) = &self.privout {
            fs::write(path, &created.private).map_err(|e| CliError::file(path, e))?;
        }
        Ok(())
    }
}
