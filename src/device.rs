// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::{
    error::CliError,
    name::TpmName,
    transport::{FileTransport, SimulatorTransport, Transport},
};
use log::warn;
use std::{
    fs::OpenOptions,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};
use tpm2_protocol::{
    basic::{TpmHandle, TpmUint16, TpmUint32},
    constant::TPM_MAX_COMMAND_SIZE,
    data::{
        Tpm2bAuth, Tpm2bData, Tpm2bDigest, Tpm2bEncryptedSecret, Tpm2bIdObject, Tpm2bName,
        Tpm2bPrivate, Tpm2bPublic, Tpm2bSensitiveCreate, TpmCap, TpmCc, TpmPt, TpmRc, TpmRcBase,
        TpmRh, TpmSt, TpmSu, TpmaSession, TpmlPcrSelection, TpmsAuthCommand, TpmsCapabilityData,
        TpmsNvPublic, TpmsSensitiveCreate, TpmtPublic, TpmuCapabilities,
    },
    frame::{
        tpm_marshal_command, TpmActivateCredentialCommand, TpmActivateCredentialResponse,
        TpmCreateCommand, TpmCreatePrimaryCommand, TpmCreatePrimaryResponse, TpmCreateResponse,
        TpmEvictControlCommand, TpmEvictControlResponse, TpmFlushContextCommand,
        TpmFlushContextResponse, TpmFrame, TpmGetCapabilityCommand, TpmGetCapabilityResponse,
        TpmLoadCommand, TpmLoadResponse, TpmMakeCredentialCommand, TpmMakeCredentialResponse,
        TpmNvReadCommand, TpmNvReadPublicCommand, TpmNvReadPublicResponse, TpmNvReadResponse,
        TpmReadPublicCommand, TpmReadPublicResponse, TpmResponse, TpmStartupCommand,
        TpmStartupResponse, TpmUnmarshalBody,
    },
    TpmWriter,
};
use tracing::{debug, trace};

pub const TPM_CAP_PROPERTY_MAX: u32 = 16;
pub const TPM_NV_BUFFER_DEFAULT: u16 = 512;

/// Output of `TPM2_CreatePrimary`.
#[derive(Debug, Clone)]
pub struct CreatedPrimary {
    pub handle: u32,
    pub public: TpmtPublic,
    pub name: TpmName,
}

/// Output of `TPM2_Create`.
#[derive(Debug, Clone)]
pub struct CreatedObject {
    pub private: Vec<u8>,
    pub public: TpmtPublic,
}

/// Output of `TPM2_ReadPublic`.
#[derive(Debug, Clone)]
pub struct PublicArea {
    pub public: TpmtPublic,
    pub name: TpmName,
    pub qualified_name: TpmName,
}

/// An open channel to a TPM.
#[derive(Debug)]
pub struct TpmDevice {
    transport: Box<dyn Transport>,
    closed: bool,
}

/// Splits `host:port` into its parts. Both must be non-empty and the port
/// must be numeric.
fn parse_simulator_address(spec: &str) -> Option<(&str, u16)> {
    let mut parts = spec.split(':');
    let (Some(host), Some(port), None) = (parts.next(), parts.next(), parts.next()) else {
        return None;
    };
    if host.is_empty() || port.is_empty() {
        return None;
    }
    port.parse().ok().map(|port| (host, port))
}

fn unexpected(cc: TpmCc, err: impl std::fmt::Display) -> CliError {
    CliError::UnexpectedResponse(format!("{cc}: {err}"))
}

/// Builds a password authorization session for `password`.
fn password_session(password: &[u8]) -> Result<TpmsAuthCommand, CliError> {
    Ok(TpmsAuthCommand {
        session_handle: TpmHandle::new(TpmRh::Pw.value()),
        nonce: Default::default(),
        session_attributes: TpmaSession::CONTINUE_SESSION,
        hmac: Tpm2bAuth::try_from(password)?,
    })
}

impl TpmDevice {
    /// Wraps an already connected transport.
    #[must_use]
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self {
            transport: Box::new(transport),
            closed: false,
        }
    }

    /// Opens a channel to the TPM named by `spec`. An existing path is opened
    /// as a character device, otherwise `host:port` selects a TPM simulator.
    ///
    /// # Errors
    ///
    /// Returns `CliError::DeviceNotFound` if `spec` is neither an existing path
    /// nor a simulator address, `CliError::File` if the device cannot be
    /// opened, and `CliError::Transport` if the simulator is unreachable.
    pub fn open(spec: &str) -> Result<Self, CliError> {
        let path = Path::new(spec);
        if path.exists() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(|e| CliError::file(spec, e))?;
            debug!(device_path = %spec, "opening");
            return Ok(Self::new(FileTransport(file)));
        }

        let (host, port) = parse_simulator_address(spec)
            .ok_or_else(|| CliError::DeviceNotFound(spec.to_string()))?;
        let transport = SimulatorTransport::connect(host, port)?;
        debug!(simulator = %spec, "opening");
        let mut device = Self::new(transport);
        device.startup()?;
        Ok(device)
    }

    /// Closes the channel.
    ///
    /// # Errors
    ///
    /// Returns `CliError::Transport` if the peer could not be notified.
    pub fn close(mut self) -> Result<(), CliError> {
        self.closed = true;
        self.transport.close()?;
        Ok(())
    }

    /// Sends a command to the TPM and waits for the response.
    ///
    /// # Errors
    ///
    /// Returns `CliError::Transport` on I/O failure, `CliError::Protocol` if
    /// the response cannot be framed or carries bytes past its last
    /// parameter, and `CliError::TpmRc` if the TPM returns a non-zero
    /// response code.
    pub fn execute<C, R>(
        &mut self,
        command: &C,
        sessions: &[TpmsAuthCommand],
    ) -> Result<R, CliError>
    where
        C: TpmFrame,
        R: TpmUnmarshalBody,
    {
        let mut command_buf = [0u8; TPM_MAX_COMMAND_SIZE];
        let len = {
            let mut writer = TpmWriter::new(&mut command_buf);
            let tag = if sessions.is_empty() {
                TpmSt::NoSessions
            } else {
                TpmSt::Sessions
            };
            tpm_marshal_command(command, tag, sessions, &mut writer)?;
            writer.len()
        };
        let command_bytes = &command_buf[..len];

        trace!(command = %hex::encode(command_bytes), "Command");
        self.transport.send(command_bytes)?;

        let resp_buf = self.transport.receive()?;
        trace!(response = %hex::encode(&resp_buf), "Response");

        let response = TpmResponse::cast(&resp_buf)?;
        let rc = response.rc()?;
        if let TpmRc::Warn(_) = rc {
            warn!(target: "cli::device", "{}: {rc}", command.cc());
        }
        if rc != TpmRc::Fmt0(TpmRcBase::Success) {
            return Err(CliError::TpmRc(rc));
        }
        Ok(response.unmarshal::<R>()?)
    }

    /// Issues `TPM2_Startup(TPM_SU_CLEAR)`. An already started TPM is fine.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the command fails for any other reason.
    pub fn startup(&mut self) -> Result<(), CliError> {
        let cmd = TpmStartupCommand {
            handles: [],
            startup_type: TpmSu::Clear,
        };
        match self.execute::<_, TpmStartupResponse>(&cmd, &[]) {
            Ok(_) => Ok(()),
            Err(CliError::TpmRc(rc)) if rc.base() == TpmRcBase::Initialize => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Reads the public area and Names of a loaded or persistent object.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the command fails or the response is malformed.
    pub fn read_public(&mut self, handle: u32) -> Result<PublicArea, CliError> {
        let cmd = TpmReadPublicCommand {
            handles: [TpmHandle::new(handle)],
        };
        let resp: TpmReadPublicResponse = self.execute(&cmd, &[]).map_err(|e| match e {
            CliError::Protocol(e) => CliError::MalformedPublicArea(e.to_string()),
            e => e,
        })?;
        Ok(PublicArea {
            public: resp.out_public.inner,
            name: TpmName::from_bytes(&resp.name)?,
            qualified_name: TpmName::from_bytes(&resp.qualified_name)?,
        })
    }

    /// Wraps `credential` to the key at `protector`, bound to the object
    /// identified by `name`. Returns the credential blob and the encrypted
    /// seed, both without their size fields.
    ///
    /// # Errors
    ///
    /// Returns `CliError::InvalidName` if `name` is not an algorithm-prefixed
    /// digest, `CliError::Protocol` if the credential is larger than any
    /// digest, or any `CliError` from the command itself.
    pub fn make_credential(
        &mut self,
        protector: u32,
        credential: &[u8],
        name: &[u8],
    ) -> Result<(Vec<u8>, Vec<u8>), CliError> {
        let name = TpmName::from_bytes(name)?;
        let cmd = TpmMakeCredentialCommand {
            handles: [TpmHandle::new(protector)],
            credential: Tpm2bDigest::try_from(credential)?,
            object_name: Tpm2bName::try_from(name.as_bytes())?,
        };
        let resp: TpmMakeCredentialResponse = self.execute(&cmd, &[])?;
        Ok((resp.credential_blob.to_vec(), resp.secret.to_vec()))
    }

    /// Recovers a credential wrapped by [`TpmDevice::make_credential`].
    ///
    /// # Errors
    ///
    /// Returns `CliError::TpmRc` if either authorization fails or the blob
    /// was not bound to the Name of `activate`.
    pub fn activate_credential(
        &mut self,
        activate: u32,
        key: u32,
        activate_password: &[u8],
        key_password: &[u8],
        blob: &[u8],
        secret: &[u8],
    ) -> Result<Vec<u8>, CliError> {
        let cmd = TpmActivateCredentialCommand {
            handles: [TpmHandle::new(activate), TpmHandle::new(key)],
            credential_blob: Tpm2bIdObject::try_from(blob)?,
            secret: Tpm2bEncryptedSecret::try_from(secret)?,
        };
        let sessions = [
            password_session(activate_password)?,
            password_session(key_password)?,
        ];
        let resp: TpmActivateCredentialResponse = self.execute(&cmd, &sessions)?;
        Ok(resp.cert_info.to_vec())
    }

    /// Creates a primary object under `hierarchy`.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the command fails or the response is malformed.
    pub fn create_primary(
        &mut self,
        hierarchy: u32,
        hierarchy_password: &[u8],
        sensitive: &TpmsSensitiveCreate,
        template: &TpmtPublic,
    ) -> Result<CreatedPrimary, CliError> {
        let cmd = TpmCreatePrimaryCommand {
            handles: [TpmHandle::new(hierarchy)],
            in_sensitive: Tpm2bSensitiveCreate::from(sensitive.clone()),
            in_public: Tpm2bPublic::from(template.clone()),
            outside_info: Tpm2bData::default(),
            creation_pcr: TpmlPcrSelection::default(),
        };
        let resp: TpmCreatePrimaryResponse =
            self.execute(&cmd, &[password_session(hierarchy_password)?])?;
        Ok(CreatedPrimary {
            handle: resp.handles[0].value(),
            public: resp.out_public.inner,
            name: TpmName::from_bytes(&resp.name)?,
        })
    }

    /// Creates an ordinary object under `parent`.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the command fails or the response is malformed.
    pub fn create(
        &mut self,
        parent: u32,
        parent_password: &[u8],
        sensitive: &TpmsSensitiveCreate,
        template: &TpmtPublic,
    ) -> Result<CreatedObject, CliError> {
        let cmd = TpmCreateCommand {
            handles: [TpmHandle::new(parent)],
            in_sensitive: Tpm2bSensitiveCreate::from(sensitive.clone()),
            in_public: Tpm2bPublic::from(template.clone()),
            outside_info: Tpm2bData::default(),
            creation_pcr: TpmlPcrSelection::default(),
        };
        let resp: TpmCreateResponse = self.execute(&cmd, &[password_session(parent_password)?])?;
        Ok(CreatedObject {
            private: resp.out_private.to_vec(),
            public: resp.out_public.inner,
        })
    }

    /// Loads an object created by [`TpmDevice::create`].
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the command fails or the response is malformed.
    pub fn load(
        &mut self,
        parent: u32,
        parent_password: &[u8],
        private: &[u8],
        public: &TpmtPublic,
    ) -> Result<(u32, TpmName), CliError> {
        let cmd = TpmLoadCommand {
            handles: [TpmHandle::new(parent)],
            in_private: Tpm2bPrivate::try_from(private)?,
            in_public: Tpm2bPublic::from(public.clone()),
        };
        let resp: TpmLoadResponse = self.execute(&cmd, &[password_session(parent_password)?])?;
        Ok((resp.handles[0].value(), TpmName::from_bytes(&resp.name)?))
    }

    /// Makes `object` persistent at `persistent`, or evicts it when both
    /// handles name the same persistent object.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the command fails.
    pub fn evict_control(
        &mut self,
        auth: u32,
        auth_password: &[u8],
        object: u32,
        persistent: u32,
    ) -> Result<(), CliError> {
        let cmd = TpmEvictControlCommand {
            handles: [TpmHandle::new(auth), TpmHandle::new(object)],
            persistent_handle: TpmHandle::new(persistent),
        };
        self.execute::<_, TpmEvictControlResponse>(&cmd, &[password_session(auth_password)?])?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns a `CliError` if the command fails.
    pub fn flush_context(&mut self, handle: u32) -> Result<(), CliError> {
        let cmd = TpmFlushContextCommand {
            handles: [],
            flush_handle: TpmHandle::new(handle),
        };
        self.execute::<_, TpmFlushContextResponse>(&cmd, &[])?;
        Ok(())
    }

    fn capability_page(
        &mut self,
        cap: TpmCap,
        property: u32,
        count: u32,
    ) -> Result<TpmGetCapabilityResponse, CliError> {
        let cmd = TpmGetCapabilityCommand {
            handles: [],
            cap,
            property: TpmUint32::new(property),
            property_count: TpmUint32::new(count),
        };
        self.execute(&cmd, &[])
    }

    /// Fetches all capabilities of a certain type starting from `property`,
    /// following `moreData` until the TPM has nothing left to report.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the command fails or the TPM returns data for
    /// a different capability.
    pub fn get_capability(
        &mut self,
        cap: TpmCap,
        mut property: u32,
        count: u32,
    ) -> Result<Vec<TpmsCapabilityData>, CliError> {
        let mut all_caps = Vec::new();
        loop {
            let resp = self.capability_page(cap, property, count)?;
            let capability_data = resp.capability_data;
            if capability_data.capability != cap {
                return Err(unexpected(
                    TpmCc::GetCapability,
                    format!("requested {cap}, got {}", capability_data.capability),
                ));
            }

            let next_prop = if bool::from(resp.more_data) {
                match &capability_data.data {
                    TpmuCapabilities::Algs(algs) => {
                        algs.last().map(|p| u32::from(p.alg.value()) + 1)
                    }
                    TpmuCapabilities::Handles(handles) => handles.last().map(|h| h.value() + 1),
                    TpmuCapabilities::Commands(cmds) => {
                        cmds.last().map(|a| u32::from(a.command_index()) + 1)
                    }
                    TpmuCapabilities::TpmProperties(props) => {
                        props.last().map(|p| p.property.value() + 1)
                    }
                    _ => None,
                }
            } else {
                None
            };

            all_caps.push(capability_data);

            if let Some(p) = next_prop {
                property = p;
            } else {
                break;
            }
        }
        Ok(all_caps)
    }

    /// Returns the value of a single TPM property, if reported.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the command fails or the response carries
    /// trailing bytes.
    pub fn get_property(&mut self, property: TpmPt) -> Result<Option<u32>, CliError> {
        let resp = self.capability_page(TpmCap::TpmProperties, property.value(), 1)?;
        Ok(match resp.capability_data.data {
            TpmuCapabilities::TpmProperties(props) => props
                .iter()
                .find(|p| p.property == property)
                .map(|p| p.value.value()),
            _ => None,
        })
    }

    /// Reads the public area and Name of an NV index.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the command fails or the response is malformed.
    pub fn nv_read_public(&mut self, index: u32) -> Result<(TpmsNvPublic, Vec<u8>), CliError> {
        let cmd = TpmNvReadPublicCommand {
            handles: [TpmHandle::new(index)],
        };
        let resp: TpmNvReadPublicResponse = self.execute(&cmd, &[])?;
        Ok((resp.nv_public.inner, resp.nv_name.to_vec()))
    }

    /// Reads the full contents of an NV index with owner authorization. The
    /// chunk size is `TPM_PT_NV_BUFFER_MAX` when the TPM reports it.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if any command fails or the response is malformed.
    pub fn nv_read(&mut self, index: u32, owner_password: &[u8]) -> Result<Vec<u8>, CliError> {
        let (nv_public, _) = self.nv_read_public(index)?;
        let chunk = match self.get_property(TpmPt::NvBufferMax)? {
            Some(v) if v > 0 => u16::try_from(v).unwrap_or(u16::MAX),
            _ => TPM_NV_BUFFER_DEFAULT,
        };

        let total = nv_public.data_size.value();
        let mut data = Vec::with_capacity(usize::from(total));
        let mut offset: u16 = 0;
        while offset < total {
            let size = chunk.min(total - offset);
            let cmd = TpmNvReadCommand {
                handles: [TpmHandle::new(TpmRh::Owner.value()), TpmHandle::new(index)],
                size: TpmUint16::new(size),
                offset: TpmUint16::new(offset),
            };
            let resp: TpmNvReadResponse =
                self.execute(&cmd, &[password_session(owner_password)?])?;
            if resp.data.len() != usize::from(size) {
                return Err(unexpected(
                    TpmCc::NvRead,
                    format!("asked for {size} bytes, got {}", resp.data.len()),
                ));
            }
            data.extend_from_slice(&resp.data);
            offset += size;
        }
        Ok(data)
    }
}

impl Drop for TpmDevice {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.transport.close() {
                warn!(target: "cli::device", "failed to close TPM channel: {e}");
            }
        }
    }
}

/// Unwraps the device handed to a command that needs one.
///
/// # Errors
///
/// Returns `CliError::Execution` if no device was opened.
pub fn required(
    device: Option<Arc<Mutex<TpmDevice>>>,
) -> Result<Arc<Mutex<TpmDevice>>, CliError> {
    device.ok_or_else(|| CliError::Execution("TPM device not provided".to_string()))
}

/// Locks a shared device for the duration of one or more commands.
///
/// # Errors
///
/// Returns `CliError::Execution` if a previous holder panicked.
pub fn lock(device: &Mutex<TpmDevice>) -> Result<MutexGuard<'_, TpmDevice>, CliError> {
    device
        .lock()
        .map_err(|_| CliError::Execution("TPM device lock poisoned".to_string()))
}

/// A transient handle that is flushed when it goes out of scope.
///
/// Call [`ScopedHandle::flush`] on the success path so that a failing flush
/// is reported. `Drop` only covers early exits and merely logs failures.
#[derive(Debug)]
pub struct ScopedHandle {
    handle: Option<u32>,
    device: Arc<Mutex<TpmDevice>>,
}

impl ScopedHandle {
    #[must_use]
    pub fn new(handle: u32, device: Arc<Mutex<TpmDevice>>) -> Self {
        Self {
            handle: Some(handle),
            device,
        }
    }

    /// Returns the wrapped handle.
    #[must_use]
    pub fn handle(&self) -> u32 {
        self.handle.unwrap_or_default()
    }

    /// Flushes the handle now and reports the outcome.
    ///
    /// # Errors
    ///
    /// Returns a `CliError` if the device is unavailable or the TPM rejects
    /// `TPM2_FlushContext`.
    pub fn flush(mut self) -> Result<(), CliError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        lock(&self.device)?.flush_context(handle)?;
        Ok(())
    }
}

impl Drop for ScopedHandle {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match self.device.lock() {
            Ok(mut device) => {
                if let Err(e) = device.flush_context(handle) {
                    warn!(
                        target: "cli::device",
                        "Failed to flush transient handle {handle:#010x}: {e}"
                    );
                }
            }
            Err(_) => warn!(
                target: "cli::device",
                "Failed to flush transient handle {handle:#010x}: lock poisoned"
            ),
        }
    }
}
