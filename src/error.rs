// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use crate::transport::TransportError;
use std::io::Error as IoError;
use thiserror::Error;
use tpm2_protocol::{data::TpmRc, TpmError};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Configuration(String),

    #[error("failed to locate TPM device '{0}'")]
    DeviceNotFound(String),

    #[error("Execution: {0}")]
    Execution(String),

    #[error("'{0}': {1}")]
    File(String, #[source] IoError),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("I/O: {0}")]
    Io(#[from] IoError),

    #[error("malformed public area: {0}")]
    MalformedPublicArea(String),

    #[error("TPM protocol: {0}")]
    Protocol(#[from] TpmError),

    #[error("{0}")]
    TpmRc(TpmRc),

    #[error("Transport: {0}")]
    Transport(#[from] TransportError),

    #[error("size of name bytes is {0}, expected at least 2")]
    TruncatedName(usize),

    #[error("TPM unexpected: {0}")]
    UnexpectedResponse(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

impl From<TpmRc> for CliError {
    fn from(rc: TpmRc) -> Self {
        CliError::TpmRc(rc)
    }
}

impl CliError {
    /// Returns a `CliError::File` for an I/O failure on `path`.
    pub fn file(path: impl AsRef<std::path::Path>, err: IoError) -> Self {
        CliError::File(path.as_ref().display().to_string(), err)
    }
}
