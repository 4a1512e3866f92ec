// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! An in-memory TPM executing the command subset used by this tool.

use crate::{
    crypto::{
        crypto_cfb_decrypt, crypto_cfb_encrypt, crypto_digest, crypto_hmac, crypto_hmac_verify,
        crypto_kdfa, digest_size, protect_seed_with_rsa, rsa_exponent, rsa_public_key,
        unprotect_seed_with_rsa, KDF_LABEL_INTEGRITY, KDF_LABEL_STORAGE, OAEP_LABEL_IDENTITY,
    },
    name::derive_name,
    transport::{PipeTransport, TPM_HEADER_SIZE},
    util::build_to_vec,
};
use log::error;
use pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rand::RngCore;
use rsa::{traits::PublicKeyParts, BigUint, RsaPrivateKey};
use std::{
    collections::BTreeMap,
    io::{Read, Write},
};
use tpm2_protocol::{
    basic::{TpmBuffer, TpmHandle, TpmList, TpmUint16, TpmUint32},
    constant::TPM_MAX_COMMAND_SIZE,
    data::{
        Tpm2b, Tpm2bAuth, Tpm2bCreationData, Tpm2bDigest, Tpm2bEncryptedSecret, Tpm2bIdObject,
        Tpm2bMaxNvBuffer, Tpm2bName, Tpm2bNvPublic, Tpm2bPrivate, Tpm2bPublic, Tpm2bSymKey,
        TpmAlgId, TpmCap, TpmCc, TpmHt, TpmPt, TpmRc, TpmRcBase, TpmRcFmt1, TpmRcIndex, TpmRh,
        TpmSt, TpmaAlgorithm, TpmaCc, TpmaNv, TpmaObject, TpmaSession,
        TpmiYesNo, TpmsAlgProperty, TpmsAuthCommand, TpmsAuthResponse, TpmsCapabilityData,
        TpmsNvPublic, TpmsSensitiveCreate, TpmsTaggedProperty, TpmtPublic, TpmtTkCreation,
        TpmuCapabilities, TpmuPublicId, TpmuPublicParms, TpmuSymKeyBits, TPM_RC_FMT1,
        TPM_RC_WARN,
    },
    frame::{
        tpm_marshal_response, TpmActivateCredentialCommand, TpmActivateCredentialResponse,
        TpmCommand, TpmCreateCommand, TpmCreatePrimaryCommand, TpmCreatePrimaryResponse,
        TpmCreateResponse, TpmEvictControlCommand, TpmEvictControlResponse,
        TpmFlushContextCommand, TpmFlushContextResponse, TpmFrame, TpmGetCapabilityCommand,
        TpmGetCapabilityResponse, TpmLoadCommand, TpmLoadResponse, TpmMakeCredentialCommand,
        TpmMakeCredentialResponse, TpmNvReadCommand, TpmNvReadPublicCommand,
        TpmNvReadPublicResponse, TpmNvReadResponse, TpmReadPublicCommand, TpmReadPublicResponse,
        TpmStartupCommand, TpmStartupResponse, TpmUnmarshalBody,
    },
    TpmError, TpmUnmarshal, TpmWriter,
};

/// `TPMA_NV` of indices defined through [`MockTpm::define_nv`]: owner and
/// auth read/write, written.
const MOCKTPM_NV_ATTRIBUTES: u32 = 0x2006_0006;
const MOCKTPM_NV_BUFFER_MAX: u32 = 1024;
const MOCKTPM_CAP_MAX: u32 = 64;
const MOCKTPM_TRANSIENT_FIRST: u32 = 0x8000_0000;
const MOCKTPM_PERSISTENT_FIRST: u32 = 0x8100_0000;

type MockTpmResult = Result<Vec<u8>, TpmRc>;

trait TpmErrorExt {
    fn to_tpm_rc(self) -> TpmRc;
}

impl TpmErrorExt for TpmError {
    fn to_tpm_rc(self) -> TpmRc {
        match self {
            TpmError::InvalidCc { .. } => mocktpm_rc(TpmRcBase::CommandCode),
            TpmError::InvalidTag { .. } => mocktpm_rc(TpmRcBase::BadTag),
            TpmError::BufferOverflow { .. }
            | TpmError::TooManyBytes { .. }
            | TpmError::TooManyItems { .. }
            | TpmError::TrailingData { .. }
            | TpmError::UnexpectedEnd { .. } => mocktpm_rc(TpmRcBase::Size),
            _ => mocktpm_rc(TpmRcBase::Value),
        }
    }
}

/// Wraps a base code in the response code format its value selects.
fn mocktpm_rc(base: TpmRcBase) -> TpmRc {
    let value = base as u32;
    if value & TPM_RC_FMT1 != 0 {
        TpmRc::Fmt1(TpmRcFmt1 { base, index: None })
    } else if value & TPM_RC_WARN == TPM_RC_WARN {
        TpmRc::Warn(base)
    } else {
        TpmRc::Fmt0(base)
    }
}

fn mocktpm_rc_at(base: TpmRcBase, index: TpmRcIndex) -> TpmRc {
    TpmRc::Fmt1(TpmRcFmt1 {
        base,
        index: Some(index),
    })
}

fn mocktpm_rc_handle(base: TpmRcBase, n: u8) -> TpmRc {
    mocktpm_rc_at(base, TpmRcIndex::Handle(n))
}

fn mocktpm_rc_parameter(base: TpmRcBase, n: u8) -> TpmRc {
    mocktpm_rc_at(base, TpmRcIndex::Parameter(n))
}

fn mocktpm_rc_session(base: TpmRcBase, n: u8) -> TpmRc {
    mocktpm_rc_at(base, TpmRcIndex::Session(n))
}

/// A command frame together with its decoded authorization sessions.
struct MockTpmRequest<'a> {
    cc: TpmCc,
    frame: &'a TpmCommand,
    sessions: Vec<TpmsAuthCommand>,
}

impl<'a> MockTpmRequest<'a> {
    fn parse(frame: &'a TpmCommand) -> Result<Self, TpmRc> {
        let cc = frame.cc().map_err(TpmErrorExt::to_tpm_rc)?;
        let mut area = frame.auth_area().map_err(TpmErrorExt::to_tpm_rc)?;
        let mut sessions = Vec::new();
        while !area.is_empty() {
            let (session, rest) = TpmsAuthCommand::unmarshal(area)
                .map_err(|_| mocktpm_rc(TpmRcBase::AuthSize))?;
            sessions.push(session);
            area = rest;
        }
        Ok(Self {
            cc,
            frame,
            sessions,
        })
    }

    fn unmarshal<C: TpmUnmarshalBody>(&self) -> Result<C, TpmRc> {
        self.frame.unmarshal::<C>().map_err(TpmErrorExt::to_tpm_rc)
    }

    /// Marshals a successful response, acknowledging every command session.
    fn reply<R: TpmFrame>(&self, response: &R) -> MockTpmResult {
        let sessions: Vec<TpmsAuthResponse> = self
            .sessions
            .iter()
            .map(|_| TpmsAuthResponse {
                session_attributes: TpmaSession::CONTINUE_SESSION,
                ..TpmsAuthResponse::default()
            })
            .collect();
        let mut buf = [0u8; TPM_MAX_COMMAND_SIZE];
        let len = {
            let mut writer = TpmWriter::new(&mut buf);
            tpm_marshal_response(
                response,
                TpmRc::Fmt0(TpmRcBase::Success),
                &sessions,
                &mut writer,
            )
            .map_err(|e| {
                error!("failed to build response: {e}");
                mocktpm_rc(TpmRcBase::Failure)
            })?;
            writer.len()
        };
        Ok(buf[..len].to_vec())
    }
}

#[derive(Debug, Clone)]
struct MockTpmObject {
    public: TpmtPublic,
    name: Vec<u8>,
    qualified_name: Vec<u8>,
    auth: Vec<u8>,
    private: Option<RsaPrivateKey>,
    sensitive: Vec<u8>,
}

#[derive(Debug, Clone)]
struct MockNvIndex {
    public: TpmsNvPublic,
    data: Vec<u8>,
}

/// State of the mock TPM.
#[derive(Debug, Default)]
pub struct MockTpm {
    objects: BTreeMap<u32, MockTpmObject>,
    nv: BTreeMap<u32, MockNvIndex>,
    next_transient_handle: u32,
    started: bool,
}

macro_rules! mocktpm_command {
    ($state:ident, $req:ident, $($variant:ident => $handler:path),* $(,)?) => {
        match $req.cc {
            $(
                TpmCc::$variant => $handler($state, $req),
            )*
            _ => Err(mocktpm_rc(TpmRcBase::CommandCode)),
        }
    };
}

/// Returns the type of a handle, if its top byte is a known one.
fn mocktpm_handle_type(handle: u32) -> Option<TpmHt> {
    u8::try_from(handle >> 24)
        .ok()
        .and_then(|raw| TpmHt::try_from(raw).ok())
}

impl MockTpm {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_transient_handle: MOCKTPM_TRANSIENT_FIRST,
            ..Self::default()
        }
    }

    /// Defines an NV index holding `data`, readable with an empty owner
    /// password.
    ///
    /// # Errors
    ///
    /// Returns `TPM_RC_NV_RANGE` if `index` is not an NV index handle and
    /// `TPM_RC_NV_SPACE` if `data` does not fit an index.
    pub fn define_nv(&mut self, index: u32, data: &[u8]) -> Result<(), TpmRc> {
        if mocktpm_handle_type(index) != Some(TpmHt::NvIndex) {
            return Err(mocktpm_rc(TpmRcBase::NvRange));
        }
        let data_size =
            u16::try_from(data.len()).map_err(|_| mocktpm_rc(TpmRcBase::NvSpace))?;
        self.nv.insert(
            index,
            MockNvIndex {
                public: TpmsNvPublic {
                    nv_index: TpmHandle::new(index),
                    name_alg: TpmAlgId::Sha256,
                    attributes: TpmaNv::from_bits_truncate(MOCKTPM_NV_ATTRIBUTES),
                    auth_policy: Tpm2bDigest::default(),
                    data_size: TpmUint16::new(data_size),
                },
                data: data.to_vec(),
            },
        );
        Ok(())
    }

    /// Executes one command buffer and returns the response buffer.
    #[must_use]
    pub fn execute(&mut self, request_buf: &[u8]) -> Vec<u8> {
        let response = TpmCommand::cast(request_buf)
            .map_err(TpmErrorExt::to_tpm_rc)
            .and_then(MockTpmRequest::parse)
            .and_then(|req| self.dispatch(&req));
        match response {
            Ok(bytes) => bytes,
            Err(rc) => mocktpm_error_bytes(rc),
        }
    }

    fn dispatch(&mut self, req: &MockTpmRequest) -> MockTpmResult {
        let state = self;
        mocktpm_command! {
            state, req,
            ActivateCredential => mocktpm_activate_credential,
            Create => mocktpm_create,
            CreatePrimary => mocktpm_create_primary,
            EvictControl => mocktpm_evict_control,
            FlushContext => mocktpm_flush_context,
            GetCapability => mocktpm_get_capability,
            Load => mocktpm_load,
            MakeCredential => mocktpm_make_credential,
            NvRead => mocktpm_nv_read,
            NvReadPublic => mocktpm_nv_read_public,
            ReadPublic => mocktpm_read_public,
            Startup => mocktpm_startup,
        }
    }

    fn object(&self, handle: u32, n: u8) -> Result<&MockTpmObject, TpmRc> {
        self.objects
            .get(&handle)
            .ok_or(mocktpm_rc_handle(TpmRcBase::Handle, n))
    }

    /// Authorizes `handle` with the password session number `n`.
    fn authorize(&self, handle: u32, req: &MockTpmRequest, n: u8) -> Result<(), TpmRc> {
        let session = usize::from(n)
            .checked_sub(1)
            .and_then(|i| req.sessions.get(i))
            .ok_or(mocktpm_rc(TpmRcBase::AuthMissing))?;
        if session.session_handle.value() != TpmRh::Pw.value() {
            return Err(mocktpm_rc_session(TpmRcBase::Value, n));
        }
        let hierarchies = [
            TpmRh::Owner,
            TpmRh::Endorsement,
            TpmRh::Platform,
            TpmRh::Lockout,
            TpmRh::Null,
        ];
        let expected: &[u8] = match handle {
            h if hierarchies.iter().any(|rh| rh.value() == h) => &[],
            h if self.nv.contains_key(&h) => &[],
            h => &self.object(h, n)?.auth,
        };
        if &session.hmac[..] != expected {
            return Err(mocktpm_rc_session(TpmRcBase::AuthFail, n));
        }
        Ok(())
    }

    fn insert_transient(&mut self, object: MockTpmObject) -> Result<u32, TpmRc> {
        let handle = self.next_transient_handle;
        if handle >= MOCKTPM_PERSISTENT_FIRST {
            return Err(mocktpm_rc(TpmRcBase::ObjectMemory));
        }
        self.next_transient_handle += 1;
        self.objects.insert(handle, object);
        Ok(handle)
    }
}

fn mocktpm_error_bytes(rc: TpmRc) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(TPM_HEADER_SIZE);
    bytes.extend_from_slice(&TpmSt::NoSessions.value().to_be_bytes());
    bytes.extend_from_slice(&(TPM_HEADER_SIZE as u32).to_be_bytes());
    bytes.extend_from_slice(&rc.value().to_be_bytes());
    bytes
}

fn mocktpm_hash(alg: TpmAlgId, parts: &[&[u8]]) -> Result<Vec<u8>, TpmRc> {
    crypto_digest(alg, &parts.concat()).map_err(|_| mocktpm_rc(TpmRcBase::Hash))
}

fn mocktpm_random(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Copies `data` into a sized buffer, failing with `TPM_RC_SIZE`.
fn mocktpm_buffer<const N: usize>(data: &[u8]) -> Result<TpmBuffer<N>, TpmRc> {
    TpmBuffer::try_from(data).map_err(TpmErrorExt::to_tpm_rc)
}

fn mocktpm_list<T: Copy, const N: usize>(items: &[T]) -> Result<TpmList<T, N>, TpmRc> {
    let mut list = TpmList::default();
    list.try_extend_from_slice(items)
        .map_err(TpmErrorExt::to_tpm_rc)?;
    Ok(list)
}

/// Creates the sensitive part of a new object and fills in `unique`.
fn mocktpm_new_object(
    mut public: TpmtPublic,
    sensitive: &TpmsSensitiveCreate,
    parent_qualified_name: &[u8],
) -> Result<MockTpmObject, TpmRc> {
    let mut private = None;
    let mut secret = sensitive.data.to_vec();

    match (public.object_type, &public.parameters) {
        (TpmAlgId::Rsa, TpmuPublicParms::Rsa(params)) => {
            if !secret.is_empty() {
                return Err(mocktpm_rc_parameter(TpmRcBase::Value, 1));
            }
            let exponent = BigUint::from(rsa_exponent(params));
            let Ok(rsa_key) = RsaPrivateKey::new_with_exp(
                &mut rand::thread_rng(),
                usize::from(params.key_bits.value()),
                &exponent,
            ) else {
                return Err(mocktpm_rc_parameter(TpmRcBase::Value, 2));
            };
            let modulus = rsa_key.n().to_bytes_be();
            public.unique = TpmuPublicId::Rsa(mocktpm_buffer(&modulus)?);
            private = Some(rsa_key);
        }
        (TpmAlgId::Ecc, _) => return Err(mocktpm_rc_parameter(TpmRcBase::Asymmetric, 2)),
        (TpmAlgId::KeyedHash, TpmuPublicParms::KeyedHash(_)) => {
            if secret.is_empty() {
                let size = digest_size(public.name_alg)
                    .ok_or(mocktpm_rc_parameter(TpmRcBase::Hash, 2))?;
                secret = mocktpm_random(size);
            }
            let unique = mocktpm_hash(public.name_alg, &[&secret])?;
            public.unique = TpmuPublicId::KeyedHash(Tpm2bDigest::try_from(unique.as_slice())
                .map_err(TpmErrorExt::to_tpm_rc)?);
        }
        (TpmAlgId::SymCipher, TpmuPublicParms::SymCipher(parms)) => {
            let TpmuSymKeyBits::Aes(bits) = parms.sym.key_bits else {
                return Err(mocktpm_rc_parameter(TpmRcBase::Symmetric, 2));
            };
            secret = mocktpm_random(usize::from(bits.value() / 8));
            let unique = mocktpm_hash(public.name_alg, &[&secret])?;
            public.unique = TpmuPublicId::SymCipher(
                Tpm2bSymKey::try_from(unique.as_slice()).map_err(TpmErrorExt::to_tpm_rc)?,
            );
        }
        _ => return Err(mocktpm_rc_parameter(TpmRcBase::Type, 2)),
    }

    let name = derive_name(&public)
        .map_err(|_| mocktpm_rc_parameter(TpmRcBase::Hash, 2))?
        .as_bytes()
        .to_vec();
    let qualified_name = mocktpm_qualified_name(public.name_alg, parent_qualified_name, &name)?;
    Ok(MockTpmObject {
        public,
        name,
        qualified_name,
        auth: sensitive.user_auth.to_vec(),
        private,
        sensitive: secret,
    })
}

fn mocktpm_qualified_name(
    alg: TpmAlgId,
    parent_qualified_name: &[u8],
    name: &[u8],
) -> Result<Vec<u8>, TpmRc> {
    let mut qualified_name = alg.value().to_be_bytes().to_vec();
    qualified_name.extend(mocktpm_hash(alg, &[parent_qualified_name, name])?);
    Ok(qualified_name)
}

fn mocktpm_creation_ticket(hierarchy: u32) -> Result<TpmtTkCreation, TpmRc> {
    Ok(TpmtTkCreation {
        tag: TpmSt::Creation,
        hierarchy: TpmRh::try_from(hierarchy).map_err(TpmErrorExt::to_tpm_rc)?,
        digest: Tpm2bDigest::default(),
    })
}

/// Encodes the private area returned by `TPM2_Create`: the auth value and
/// the secret, each as a sized buffer.
fn mocktpm_seal_private(object: &MockTpmObject) -> Result<Tpm2bPrivate, TpmRc> {
    let secret = match &object.private {
        Some(key) => key
            .to_pkcs8_der()
            .map_err(|_| mocktpm_rc(TpmRcBase::Failure))?
            .as_bytes()
            .to_vec(),
        None => object.sensitive.clone(),
    };
    let auth: Tpm2bAuth = mocktpm_buffer(&object.auth)?;
    let secret: Tpm2b = mocktpm_buffer(&secret)?;
    let mut sealed = build_to_vec(&auth).map_err(TpmErrorExt::to_tpm_rc)?;
    sealed.extend(build_to_vec(&secret).map_err(TpmErrorExt::to_tpm_rc)?);
    Tpm2bPrivate::try_from(sealed.as_slice()).map_err(TpmErrorExt::to_tpm_rc)
}

/// Decodes a private area produced by [`mocktpm_seal_private`].
fn mocktpm_unseal_private(private: &[u8]) -> Result<(Vec<u8>, Vec<u8>), TpmRc> {
    let integrity = |_| mocktpm_rc_parameter(TpmRcBase::Integrity, 1);
    let (auth, rest) = Tpm2bAuth::unmarshal(private).map_err(integrity)?;
    let (secret, tail) = Tpm2b::unmarshal(rest).map_err(integrity)?;
    if !tail.is_empty() {
        return Err(mocktpm_rc_parameter(TpmRcBase::Integrity, 1));
    }
    Ok((auth.to_vec(), secret.to_vec()))
}

fn mocktpm_startup(tpm: &mut MockTpm, req: &MockTpmRequest) -> MockTpmResult {
    let _cmd: TpmStartupCommand = req.unmarshal()?;
    if tpm.started {
        return Err(mocktpm_rc(TpmRcBase::Initialize));
    }
    tpm.started = true;
    req.reply(&TpmStartupResponse { handles: [] })
}

fn mocktpm_create_primary(tpm: &mut MockTpm, req: &MockTpmRequest) -> MockTpmResult {
    let cmd: TpmCreatePrimaryCommand = req.unmarshal()?;
    let hierarchy = cmd.handles[0].value();
    let allowed = [TpmRh::Owner, TpmRh::Endorsement, TpmRh::Platform, TpmRh::Null];
    if !allowed.iter().any(|rh| rh.value() == hierarchy) {
        return Err(mocktpm_rc_handle(TpmRcBase::Hierarchy, 1));
    }
    tpm.authorize(hierarchy, req, 1)?;

    let object = mocktpm_new_object(
        cmd.in_public.inner,
        &cmd.in_sensitive.inner,
        &hierarchy.to_be_bytes(),
    )?;
    let response = TpmCreatePrimaryResponse {
        handles: [TpmHandle::new(0)],
        out_public: Tpm2bPublic::from(object.public.clone()),
        creation_data: Tpm2bCreationData::default(),
        creation_hash: Tpm2bDigest::default(),
        creation_ticket: mocktpm_creation_ticket(hierarchy)?,
        name: Tpm2bName::try_from(object.name.as_slice()).map_err(TpmErrorExt::to_tpm_rc)?,
    };
    let handle = tpm.insert_transient(object)?;
    req.reply(&TpmCreatePrimaryResponse {
        handles: [TpmHandle::new(handle)],
        ..response
    })
}

fn mocktpm_create(tpm: &mut MockTpm, req: &MockTpmRequest) -> MockTpmResult {
    let cmd: TpmCreateCommand = req.unmarshal()?;
    let parent_handle = cmd.handles[0].value();
    let parent = tpm.object(parent_handle, 1)?;
    if !parent
        .public
        .object_attributes
        .contains(TpmaObject::RESTRICTED | TpmaObject::DECRYPT)
    {
        return Err(mocktpm_rc_handle(TpmRcBase::Type, 1));
    }
    let parent_qualified_name = parent.qualified_name.clone();
    tpm.authorize(parent_handle, req, 1)?;

    let object = mocktpm_new_object(
        cmd.in_public.inner,
        &cmd.in_sensitive.inner,
        &parent_qualified_name,
    )?;
    req.reply(&TpmCreateResponse {
        handles: [],
        out_private: mocktpm_seal_private(&object)?,
        out_public: Tpm2bPublic::from(object.public),
        creation_data: Tpm2bCreationData::default(),
        creation_hash: Tpm2bDigest::default(),
        creation_ticket: mocktpm_creation_ticket(TpmRh::Owner.value())?,
    })
}

fn mocktpm_load(tpm: &mut MockTpm, req: &MockTpmRequest) -> MockTpmResult {
    let cmd: TpmLoadCommand = req.unmarshal()?;
    let parent_handle = cmd.handles[0].value();
    let parent_qualified_name = tpm.object(parent_handle, 1)?.qualified_name.clone();
    tpm.authorize(parent_handle, req, 1)?;

    let public = cmd.in_public.inner;
    let (auth, secret) = mocktpm_unseal_private(&cmd.in_private)?;

    let private_key = if public.object_type == TpmAlgId::Rsa {
        let key = RsaPrivateKey::from_pkcs8_der(&secret)
            .map_err(|_| mocktpm_rc_parameter(TpmRcBase::Integrity, 1))?;
        let TpmuPublicId::Rsa(modulus) = &public.unique else {
            return Err(mocktpm_rc(TpmRcBase::Binding));
        };
        if modulus[..] != key.n().to_bytes_be()[..] {
            return Err(mocktpm_rc(TpmRcBase::Binding));
        }
        Some(key)
    } else {
        None
    };

    let sensitive = if private_key.is_some() {
        Vec::new()
    } else {
        secret
    };

    let name = derive_name(&public)
        .map_err(|_| mocktpm_rc_parameter(TpmRcBase::Hash, 2))?
        .as_bytes()
        .to_vec();
    let qualified_name = mocktpm_qualified_name(public.name_alg, &parent_qualified_name, &name)?;
    let response_name =
        Tpm2bName::try_from(name.as_slice()).map_err(TpmErrorExt::to_tpm_rc)?;
    let handle = tpm.insert_transient(MockTpmObject {
        public,
        name,
        qualified_name,
        auth,
        private: private_key,
        sensitive,
    })?;
    req.reply(&TpmLoadResponse {
        handles: [TpmHandle::new(handle)],
        name: response_name,
    })
}

fn mocktpm_read_public(tpm: &mut MockTpm, req: &MockTpmRequest) -> MockTpmResult {
    let cmd: TpmReadPublicCommand = req.unmarshal()?;
    let object = tpm.object(cmd.handles[0].value(), 1)?;
    req.reply(&TpmReadPublicResponse {
        handles: [],
        out_public: Tpm2bPublic::from(object.public.clone()),
        name: Tpm2bName::try_from(object.name.as_slice()).map_err(TpmErrorExt::to_tpm_rc)?,
        qualified_name: Tpm2bName::try_from(object.qualified_name.as_slice())
            .map_err(TpmErrorExt::to_tpm_rc)?,
    })
}

/// Returns the AES key size of a storage key's symmetric definition.
fn mocktpm_storage_sym_bits(public: &TpmtPublic, n: u8) -> Result<u32, TpmRc> {
    let TpmuPublicParms::Rsa(parms) = &public.parameters else {
        return Err(mocktpm_rc_handle(TpmRcBase::Asymmetric, n));
    };
    match (parms.symmetric.algorithm, parms.symmetric.key_bits) {
        (TpmAlgId::Aes, TpmuSymKeyBits::Aes(bits)) => Ok(u32::from(bits.value())),
        _ => Err(mocktpm_rc_handle(TpmRcBase::Symmetric, n)),
    }
}

fn mocktpm_make_credential(tpm: &mut MockTpm, req: &MockTpmRequest) -> MockTpmResult {
    let cmd: TpmMakeCredentialCommand = req.unmarshal()?;
    let protector = tpm.object(cmd.handles[0].value(), 1)?;
    let public = &protector.public;
    if !public
        .object_attributes
        .contains(TpmaObject::RESTRICTED | TpmaObject::DECRYPT)
    {
        return Err(mocktpm_rc_handle(TpmRcBase::Type, 1));
    }
    let sym_bits = mocktpm_storage_sym_bits(public, 1)?;
    let name_alg = public.name_alg;
    let digest_len =
        digest_size(name_alg).ok_or(mocktpm_rc_handle(TpmRcBase::Hash, 1))?;

    if cmd.credential.len() > digest_len {
        return Err(mocktpm_rc_parameter(TpmRcBase::Size, 1));
    }
    let object_name = &cmd.object_name[..];

    let rsa_key = rsa_public_key(public).map_err(|_| mocktpm_rc_handle(TpmRcBase::Key, 1))?;
    let failure = |_| mocktpm_rc(TpmRcBase::Failure);
    let seed = mocktpm_random(digest_len);
    let secret = protect_seed_with_rsa(
        &rsa_key,
        name_alg,
        OAEP_LABEL_IDENTITY,
        &seed,
        &mut rand::thread_rng(),
    )
    .map_err(failure)?;

    let sym_key = crypto_kdfa(name_alg, &seed, KDF_LABEL_STORAGE, object_name, &[], sym_bits)
        .map_err(failure)?;
    let mut enc_identity = build_to_vec(&cmd.credential).map_err(TpmErrorExt::to_tpm_rc)?;
    crypto_cfb_encrypt(&sym_key, &mut enc_identity).map_err(failure)?;

    let hmac_bits = u32::try_from(digest_len * 8).map_err(|_| mocktpm_rc(TpmRcBase::Failure))?;
    let hmac_key = crypto_kdfa(name_alg, &seed, KDF_LABEL_INTEGRITY, &[], &[], hmac_bits)
        .map_err(failure)?;
    let outer_hmac =
        crypto_hmac(name_alg, &hmac_key, &[&enc_identity, object_name]).map_err(failure)?;

    let mut blob = build_to_vec(
        &Tpm2bDigest::try_from(outer_hmac.as_slice()).map_err(TpmErrorExt::to_tpm_rc)?,
    )
    .map_err(TpmErrorExt::to_tpm_rc)?;
    blob.extend_from_slice(&enc_identity);

    req.reply(&TpmMakeCredentialResponse {
        handles: [],
        credential_blob: Tpm2bIdObject::try_from(blob.as_slice())
            .map_err(TpmErrorExt::to_tpm_rc)?,
        secret: Tpm2bEncryptedSecret::try_from(secret.as_slice())
            .map_err(TpmErrorExt::to_tpm_rc)?,
    })
}

fn mocktpm_activate_credential(tpm: &mut MockTpm, req: &MockTpmRequest) -> MockTpmResult {
    let cmd: TpmActivateCredentialCommand = req.unmarshal()?;
    let (activate_handle, key_handle) = (cmd.handles[0].value(), cmd.handles[1].value());
    let activate = tpm.object(activate_handle, 1)?;
    let key = tpm.object(key_handle, 2)?;
    tpm.authorize(activate_handle, req, 1)?;
    tpm.authorize(key_handle, req, 2)?;

    let Some(private) = &key.private else {
        return Err(mocktpm_rc_handle(TpmRcBase::Type, 2));
    };
    let sym_bits = mocktpm_storage_sym_bits(&key.public, 2)?;
    let name_alg = key.public.name_alg;
    let digest_len =
        digest_size(name_alg).ok_or(mocktpm_rc_handle(TpmRcBase::Hash, 2))?;

    let seed = unprotect_seed_with_rsa(private, name_alg, OAEP_LABEL_IDENTITY, &cmd.secret)
        .map_err(|_| mocktpm_rc_parameter(TpmRcBase::Value, 2))?;

    let malformed = |_| mocktpm_rc_parameter(TpmRcBase::Size, 1);
    let (outer_hmac, rest) = Tpm2bDigest::unmarshal(&cmd.credential_blob).map_err(malformed)?;
    let mut enc_identity = rest.to_vec();

    let failure = |_| mocktpm_rc(TpmRcBase::Failure);
    let hmac_bits = u32::try_from(digest_len * 8).map_err(|_| mocktpm_rc(TpmRcBase::Failure))?;
    let hmac_key = crypto_kdfa(name_alg, &seed, KDF_LABEL_INTEGRITY, &[], &[], hmac_bits)
        .map_err(failure)?;
    let verified = crypto_hmac_verify(
        name_alg,
        &hmac_key,
        &[&enc_identity, &activate.name],
        &outer_hmac,
    )
    .map_err(failure)?;
    if !verified {
        return Err(mocktpm_rc_parameter(TpmRcBase::Integrity, 1));
    }

    let sym_key = crypto_kdfa(name_alg, &seed, KDF_LABEL_STORAGE, &activate.name, &[], sym_bits)
        .map_err(failure)?;
    crypto_cfb_decrypt(&sym_key, &mut enc_identity).map_err(failure)?;
    let (credential, tail) = Tpm2bDigest::unmarshal(&enc_identity).map_err(malformed)?;
    if !tail.is_empty() {
        return Err(mocktpm_rc_parameter(TpmRcBase::Size, 1));
    }

    req.reply(&TpmActivateCredentialResponse {
        handles: [],
        cert_info: credential,
    })
}

fn mocktpm_evict_control(tpm: &mut MockTpm, req: &MockTpmRequest) -> MockTpmResult {
    let cmd: TpmEvictControlCommand = req.unmarshal()?;
    let auth = cmd.handles[0].value();
    if auth != TpmRh::Owner.value() && auth != TpmRh::Platform.value() {
        return Err(mocktpm_rc_handle(TpmRcBase::Hierarchy, 1));
    }
    tpm.authorize(auth, req, 1)?;
    let object_handle = cmd.handles[1].value();
    let persistent = cmd.persistent_handle.value();
    if mocktpm_handle_type(persistent) != Some(TpmHt::Persistent) {
        return Err(mocktpm_rc_parameter(TpmRcBase::Value, 1));
    }

    match mocktpm_handle_type(object_handle) {
        Some(TpmHt::Transient) => {
            if tpm.objects.contains_key(&persistent) {
                return Err(mocktpm_rc(TpmRcBase::NvDefined));
            }
            let object = tpm.object(object_handle, 2)?.clone();
            tpm.objects.insert(persistent, object);
        }
        Some(TpmHt::Persistent) => {
            if object_handle != persistent {
                return Err(mocktpm_rc_parameter(TpmRcBase::Handle, 1));
            }
            tpm.object(object_handle, 2)?;
            tpm.objects.remove(&persistent);
        }
        _ => return Err(mocktpm_rc_handle(TpmRcBase::Handle, 2)),
    }
    req.reply(&TpmEvictControlResponse { handles: [] })
}

fn mocktpm_flush_context(tpm: &mut MockTpm, req: &MockTpmRequest) -> MockTpmResult {
    let cmd: TpmFlushContextCommand = req.unmarshal()?;
    let handle = cmd.flush_handle.value();
    if mocktpm_handle_type(handle) != Some(TpmHt::Transient)
        || tpm.objects.remove(&handle).is_none()
    {
        return Err(mocktpm_rc_parameter(TpmRcBase::Handle, 1));
    }
    req.reply(&TpmFlushContextResponse { handles: [] })
}

fn mocktpm_supported_commands() -> Vec<TpmaCc> {
    // (command, cHandles, rHandle)
    [
        (TpmCc::EvictControl, 2, false),
        (TpmCc::CreatePrimary, 1, true),
        (TpmCc::Startup, 0, false),
        (TpmCc::ActivateCredential, 2, false),
        (TpmCc::NvRead, 2, false),
        (TpmCc::Create, 1, false),
        (TpmCc::Load, 1, true),
        (TpmCc::FlushContext, 0, false),
        (TpmCc::MakeCredential, 1, false),
        (TpmCc::NvReadPublic, 1, false),
        (TpmCc::ReadPublic, 1, false),
        (TpmCc::GetCapability, 0, false),
    ]
    .iter()
    .map(|&(cc, c_handles, r_handle)| {
        let attributes = TpmaCc::from_bits_truncate((cc.value() & 0xffff) | (c_handles << 25));
        if r_handle {
            attributes | TpmaCc::R_HANDLE
        } else {
            attributes
        }
    })
    .collect()
}

fn mocktpm_supported_algs() -> Vec<TpmsAlgProperty> {
    let asymmetric_object = TpmaAlgorithm::ASYMMETRIC | TpmaAlgorithm::OBJECT;
    [
        (TpmAlgId::Rsa, asymmetric_object),
        (TpmAlgId::Sha1, TpmaAlgorithm::HASH),
        (TpmAlgId::Hmac, TpmaAlgorithm::HASH | TpmaAlgorithm::SIGNING),
        (TpmAlgId::Aes, TpmaAlgorithm::SYMMETRIC),
        (TpmAlgId::KeyedHash, TpmaAlgorithm::HASH | TpmaAlgorithm::OBJECT),
        (TpmAlgId::Sha256, TpmaAlgorithm::HASH),
        (TpmAlgId::Sha384, TpmaAlgorithm::HASH),
        (TpmAlgId::Sha512, TpmaAlgorithm::HASH),
        (TpmAlgId::Null, TpmaAlgorithm::empty()),
        (TpmAlgId::Rsaes, TpmaAlgorithm::ASYMMETRIC | TpmaAlgorithm::ENCRYPTING),
        (TpmAlgId::Oaep, TpmaAlgorithm::ASYMMETRIC | TpmaAlgorithm::ENCRYPTING),
        (TpmAlgId::SymCipher, TpmaAlgorithm::OBJECT),
        (TpmAlgId::Cfb, TpmaAlgorithm::SYMMETRIC | TpmaAlgorithm::ENCRYPTING),
    ]
    .iter()
    .map(|&(alg, alg_properties)| TpmsAlgProperty {
        alg,
        alg_properties,
    })
    .collect()
}

fn mocktpm_ascii(s: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*s)
}

fn mocktpm_properties() -> Vec<TpmsTaggedProperty> {
    [
        (TpmPt::FamilyIndicator, mocktpm_ascii(b"2.0\0")),
        (TpmPt::Level, 0),
        (TpmPt::Revision, 159),
        (TpmPt::Year, 2025),
        (TpmPt::Manufacturer, mocktpm_ascii(b"MOCK")),
        (TpmPt::VendorString1, mocktpm_ascii(b"tpmt")),
        (TpmPt::VendorString2, mocktpm_ascii(b"ool\0")),
        (TpmPt::InputBuffer, MOCKTPM_NV_BUFFER_MAX),
        (TpmPt::MaxCommandSize, TPM_MAX_COMMAND_SIZE as u32),
        (TpmPt::MaxResponseSize, TPM_MAX_COMMAND_SIZE as u32),
        (TpmPt::MaxDigest, 64),
        (TpmPt::NvBufferMax, MOCKTPM_NV_BUFFER_MAX),
    ]
    .iter()
    .map(|&(property, value)| TpmsTaggedProperty {
        property,
        value: TpmUint32::new(value),
    })
    .collect()
}

/// Returns at most `count` items at or after `property` and whether more
/// remain.
fn mocktpm_page<T: Copy>(
    items: &[T],
    key: impl Fn(&T) -> u32,
    property: u32,
    count: u32,
) -> (Vec<T>, bool) {
    let count = count.min(MOCKTPM_CAP_MAX) as usize;
    let mut matching = items.iter().filter(|item| key(*item) >= property);
    let page: Vec<T> = matching.by_ref().take(count).copied().collect();
    (page, matching.next().is_some())
}

fn mocktpm_get_capability(tpm: &mut MockTpm, req: &MockTpmRequest) -> MockTpmResult {
    let cmd: TpmGetCapabilityCommand = req.unmarshal()?;
    let property = cmd.property.value();
    let count = cmd.property_count.value();

    let (data, more_data) = match cmd.cap {
        TpmCap::Algs => {
            let (algs, more) = mocktpm_page(
                &mocktpm_supported_algs(),
                |a| u32::from(a.alg.value()),
                property,
                count,
            );
            (TpmuCapabilities::Algs(mocktpm_list(&algs)?), more)
        }
        TpmCap::Handles => {
            let Some(ht) = mocktpm_handle_type(property) else {
                return Err(mocktpm_rc_parameter(TpmRcBase::Value, 2));
            };
            let permanent = [
                TpmRh::Owner,
                TpmRh::Null,
                TpmRh::Pw,
                TpmRh::Lockout,
                TpmRh::Endorsement,
                TpmRh::Platform,
            ]
            .map(TpmRh::value);
            let mut handles: Vec<u32> = tpm
                .objects
                .keys()
                .chain(tpm.nv.keys())
                .chain(permanent.iter())
                .copied()
                .filter(|&h| mocktpm_handle_type(h) == Some(ht))
                .collect();
            handles.sort_unstable();
            let (handles, more) = mocktpm_page(&handles, |&h| h, property, count);
            let handles: Vec<TpmHandle> = handles.into_iter().map(TpmHandle::new).collect();
            (TpmuCapabilities::Handles(mocktpm_list(&handles)?), more)
        }
        TpmCap::Commands => {
            let (cmds, more) = mocktpm_page(
                &mocktpm_supported_commands(),
                |a| u32::from(a.command_index()),
                property,
                count,
            );
            (TpmuCapabilities::Commands(mocktpm_list(&cmds)?), more)
        }
        TpmCap::TpmProperties => {
            let (props, more) =
                mocktpm_page(&mocktpm_properties(), |p| p.property.value(), property, count);
            (TpmuCapabilities::TpmProperties(mocktpm_list(&props)?), more)
        }
        _ => return Err(mocktpm_rc_parameter(TpmRcBase::Value, 1)),
    };

    req.reply(&TpmGetCapabilityResponse {
        handles: [],
        more_data: TpmiYesNo::from(more_data),
        capability_data: TpmsCapabilityData {
            capability: cmd.cap,
            data,
        },
    })
}

/// Returns the Name of an NV index: the name algorithm followed by the digest
/// of the marshaled public area.
fn mocktpm_nv_name(public: &TpmsNvPublic) -> Result<Vec<u8>, TpmRc> {
    let public_bytes = build_to_vec(public).map_err(TpmErrorExt::to_tpm_rc)?;
    let mut name = public.name_alg.value().to_be_bytes().to_vec();
    name.extend(mocktpm_hash(public.name_alg, &[&public_bytes])?);
    Ok(name)
}

fn mocktpm_nv_read_public(tpm: &mut MockTpm, req: &MockTpmRequest) -> MockTpmResult {
    let cmd: TpmNvReadPublicCommand = req.unmarshal()?;
    let index = tpm
        .nv
        .get(&cmd.handles[0].value())
        .ok_or(mocktpm_rc_handle(TpmRcBase::Handle, 1))?;
    let name = mocktpm_nv_name(&index.public)?;
    req.reply(&TpmNvReadPublicResponse {
        handles: [],
        nv_public: Tpm2bNvPublic::from(index.public.clone()),
        nv_name: Tpm2bName::try_from(name.as_slice()).map_err(TpmErrorExt::to_tpm_rc)?,
    })
}

fn mocktpm_nv_read(tpm: &mut MockTpm, req: &MockTpmRequest) -> MockTpmResult {
    let cmd: TpmNvReadCommand = req.unmarshal()?;
    let (auth, index_handle) = (cmd.handles[0].value(), cmd.handles[1].value());
    if auth != TpmRh::Owner.value() && auth != index_handle {
        return Err(mocktpm_rc_handle(TpmRcBase::Hierarchy, 1));
    }
    if !tpm.nv.contains_key(&index_handle) {
        return Err(mocktpm_rc_handle(TpmRcBase::Handle, 2));
    }
    tpm.authorize(auth, req, 1)?;

    let size = usize::from(cmd.size.value());
    let offset = usize::from(cmd.offset.value());
    if size > MOCKTPM_NV_BUFFER_MAX as usize {
        return Err(mocktpm_rc_parameter(TpmRcBase::Value, 1));
    }

    let index = tpm
        .nv
        .get(&index_handle)
        .ok_or(mocktpm_rc_handle(TpmRcBase::Handle, 2))?;
    let chunk = index
        .data
        .get(offset..offset + size)
        .ok_or(mocktpm_rc(TpmRcBase::NvRange))?;
    req.reply(&TpmNvReadResponse {
        handles: [],
        data: Tpm2bMaxNvBuffer::try_from(chunk).map_err(TpmErrorExt::to_tpm_rc)?,
    })
}

/// Serves TPM commands framed by their own headers until the peer hangs up.
pub fn mocktpm_run(mut stream: impl Read + Write, state: &mut MockTpm) {
    loop {
        let mut header = [0u8; TPM_HEADER_SIZE];
        if stream.read_exact(&mut header).is_err() {
            break;
        }

        let size = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
        if !(TPM_HEADER_SIZE..=TPM_MAX_COMMAND_SIZE).contains(&size) {
            error!("Invalid command size: {size}");
            break;
        }

        let mut command_buf = header.to_vec();
        command_buf.resize(size, 0);
        if let Err(e) = stream.read_exact(&mut command_buf[TPM_HEADER_SIZE..]) {
            error!("{e}");
            break;
        }

        let response = state.execute(&command_buf);
        if stream.write_all(&response).is_err() || stream.flush().is_err() {
            error!("no response");
            break;
        }
    }
}

/// Starts a mock TPM on a background thread and returns the client end of the
/// pipe. NV indices in `nv` are defined before the first command.
///
/// # Errors
///
/// Returns a `TpmRc` if an NV index cannot be defined.
pub fn start(
    nv: &[(u32, Vec<u8>)],
) -> Result<(std::thread::JoinHandle<()>, PipeTransport), TpmRc> {
    let mut state = MockTpm::new();
    for (index, data) in nv {
        state.define_nv(*index, data)?;
    }
    let (client, server) = PipeTransport::pair();
    let handle = std::thread::spawn(move || {
        mocktpm_run(server, &mut state);
    });
    Ok((handle, client))
}
