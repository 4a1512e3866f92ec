// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! TPM object Names.
//!
//! A Name is the 2-byte big-endian identifier of the name algorithm followed
//! by the digest of the marshaled `TPMT_PUBLIC`. When a Name travels inside a
//! `TPM2B_NAME` it carries an additional 2-byte size field, which must be
//! removed before the bytes are used as KDFa context.

use crate::{
    crypto::{crypto_digest, digest_size},
    error::CliError,
    util::build_to_vec,
};
use std::fmt;
use tpm2_protocol::data::{Tpm2bName, TpmAlgId, TpmtPublic};

/// Name of a TPM object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmName {
    alg: TpmAlgId,
    bytes: Vec<u8>,
}

impl TpmName {
    /// Wraps algorithm-prefixed Name bytes, e.g. as returned by `ReadPublic`.
    ///
    /// # Errors
    ///
    /// Returns `CliError::InvalidName` if the bytes are empty, the prefix is
    /// not a supported hash algorithm, or the digest has the wrong length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CliError> {
        if bytes.len() < 2 {
            return Err(CliError::InvalidName(format!(
                "{} bytes is too short for a name",
                bytes.len()
            )));
        }
        let raw_alg = u16::from_be_bytes([bytes[0], bytes[1]]);
        let alg = TpmAlgId::try_from(raw_alg)
            .map_err(|_| CliError::InvalidName(format!("unknown name algorithm {raw_alg:#06x}")))?;
        let size = digest_size(alg)
            .ok_or_else(|| CliError::InvalidName(format!("{alg} is not a hash algorithm")))?;
        if bytes.len() - 2 != size {
            return Err(CliError::InvalidName(format!(
                "{alg} digest is {} bytes, expected {size}",
                bytes.len() - 2
            )));
        }
        Ok(Self {
            alg,
            bytes: bytes.to_vec(),
        })
    }

    #[must_use]
    pub fn alg(&self) -> TpmAlgId {
        self.alg
    }

    /// Returns the digest without the algorithm identifier.
    #[must_use]
    pub fn digest(&self) -> &[u8] {
        &self.bytes[2..]
    }

    /// Returns the algorithm-prefixed Name bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Encodes the Name as a `TPM2B_NAME`, size field included.
    ///
    /// # Errors
    ///
    /// Returns `CliError::Protocol` if the Name cannot be sized.
    pub fn encode(&self) -> Result<Vec<u8>, CliError> {
        Ok(build_to_vec(&Tpm2bName::try_from(self.bytes.as_slice())?)?)
    }
}

impl fmt::Display for TpmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.bytes))
    }
}

/// Computes the Name of an object from its public area.
///
/// # Errors
///
/// Returns `CliError::UnsupportedAlgorithm` if the name algorithm is not a
/// supported hash, or `CliError::MalformedPublicArea` if the public area
/// cannot be re-encoded.
pub fn derive_name(public: &TpmtPublic) -> Result<TpmName, CliError> {
    let alg = public.name_alg;
    if digest_size(alg).is_none() {
        return Err(CliError::UnsupportedAlgorithm(alg.to_string()));
    }
    let encoded =
        build_to_vec(public).map_err(|e| CliError::MalformedPublicArea(e.to_string()))?;
    let hash = crypto_digest(alg, &encoded)?;
    let mut bytes = Vec::with_capacity(2 + hash.len());
    bytes.extend_from_slice(&alg.value().to_be_bytes());
    bytes.extend_from_slice(&hash);
    Ok(TpmName { alg, bytes })
}

/// Removes the leading 2-byte size field of an encoded sized buffer.
///
/// # Errors
///
/// Returns `CliError::TruncatedName` if the input is shorter than 2 bytes.
pub fn strip_size_prefix(encoded: &[u8]) -> Result<&[u8], CliError> {
    encoded
        .get(2..)
        .ok_or(CliError::TruncatedName(encoded.len()))
}
