// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

use crate::error::CliError;
use aes::{Aes128, Aes192, Aes256};
use cfb_mode::{Decryptor, Encryptor};
use cipher::{AsyncStreamCipher, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::{CryptoRng, RngCore};
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tpm2_protocol::data::{TpmAlgId, TpmsRsaParms, TpmtPublic, TpmuPublicId, TpmuPublicParms};

pub const KDF_LABEL_INTEGRITY: &str = "INTEGRITY";
pub const KDF_LABEL_STORAGE: &str = "STORAGE";
pub const OAEP_LABEL_IDENTITY: &str = "IDENTITY\0";
pub const RSA_DEFAULT_EXPONENT: u32 = 65537;

/// Returns the public exponent of an RSA key. Zero selects the default.
#[must_use]
pub fn rsa_exponent(parms: &TpmsRsaParms) -> u32 {
    match parms.exponent.value() {
        0 => RSA_DEFAULT_EXPONENT,
        e => e,
    }
}

/// Returns the digest size of a hash algorithm, or `None` if the algorithm is
/// not a supported hash.
#[must_use]
pub fn digest_size(alg: TpmAlgId) -> Option<usize> {
    match alg {
        TpmAlgId::Sha1 => Some(20),
        TpmAlgId::Sha256 => Some(32),
        TpmAlgId::Sha384 => Some(48),
        TpmAlgId::Sha512 => Some(64),
        _ => None,
    }
}

/// Computes a digest.
///
/// # Errors
///
/// Returns `CliError::UnsupportedAlgorithm` for algorithms other than SHA1
/// and the SHA2 family.
pub fn crypto_digest(alg: TpmAlgId, data: &[u8]) -> Result<Vec<u8>, CliError> {
    match alg {
        TpmAlgId::Sha1 => Ok(Sha1::digest(data).to_vec()),
        TpmAlgId::Sha256 => Ok(Sha256::digest(data).to_vec()),
        TpmAlgId::Sha384 => Ok(Sha384::digest(data).to_vec()),
        TpmAlgId::Sha512 => Ok(Sha512::digest(data).to_vec()),
        _ => Err(CliError::UnsupportedAlgorithm(alg.to_string())),
    }
}

/// Computes an HMAC over the concatenation of `parts`.
///
/// # Errors
///
/// Returns `CliError::UnsupportedAlgorithm` for an unsupported hash.
pub fn crypto_hmac(alg: TpmAlgId, key: &[u8], parts: &[&[u8]]) -> Result<Vec<u8>, CliError> {
    macro_rules! do_hmac {
        ($digest:ty) => {{
            let mut mac = <Hmac<$digest> as Mac>::new_from_slice(key)
                .map_err(|e| CliError::Execution(format!("HMAC init error: {e}")))?;
            for part in parts {
                mac.update(part);
            }
            Ok(mac.finalize().into_bytes().to_vec())
        }};
    }

    match alg {
        TpmAlgId::Sha1 => do_hmac!(Sha1),
        TpmAlgId::Sha256 => do_hmac!(Sha256),
        TpmAlgId::Sha384 => do_hmac!(Sha384),
        TpmAlgId::Sha512 => do_hmac!(Sha512),
        _ => Err(CliError::UnsupportedAlgorithm(alg.to_string())),
    }
}

/// Verifies an HMAC in constant time.
///
/// # Errors
///
/// Returns `CliError::UnsupportedAlgorithm` for an unsupported hash.
pub fn crypto_hmac_verify(
    alg: TpmAlgId,
    key: &[u8],
    parts: &[&[u8]],
    expected: &[u8],
) -> Result<bool, CliError> {
    macro_rules! do_verify {
        ($digest:ty) => {{
            let mut mac = <Hmac<$digest> as Mac>::new_from_slice(key)
                .map_err(|e| CliError::Execution(format!("HMAC init error: {e}")))?;
            for part in parts {
                mac.update(part);
            }
            Ok(mac.verify_slice(expected).is_ok())
        }};
    }

    match alg {
        TpmAlgId::Sha1 => do_verify!(Sha1),
        TpmAlgId::Sha256 => do_verify!(Sha256),
        TpmAlgId::Sha384 => do_verify!(Sha384),
        TpmAlgId::Sha512 => do_verify!(Sha512),
        _ => Err(CliError::UnsupportedAlgorithm(alg.to_string())),
    }
}

/// KDFa from TPM 2.0 Part 1, section 11.4.10.2: SP 800-108 in counter mode
/// with HMAC as the PRF. `context_u` and `context_v` are used without their
/// size fields.
///
/// # Errors
///
/// Returns `CliError::UnsupportedAlgorithm` for an unsupported hash.
pub fn crypto_kdfa(
    alg: TpmAlgId,
    key: &[u8],
    label: &str,
    context_u: &[u8],
    context_v: &[u8],
    bits: u32,
) -> Result<Vec<u8>, CliError> {
    let len = bits.div_ceil(8) as usize;
    let mut label_bytes = label.as_bytes().to_vec();
    if label_bytes.last() != Some(&0) {
        label_bytes.push(0);
    }
    let bits_be = bits.to_be_bytes();
    let mut out = Vec::with_capacity(len);
    let mut counter: u32 = 1;
    while out.len() < len {
        let counter_be = counter.to_be_bytes();
        let block = crypto_hmac(
            alg,
            key,
            &[&counter_be, &label_bytes, context_u, context_v, &bits_be],
        )?;
        out.extend_from_slice(&block);
        counter += 1;
    }
    out.truncate(len);
    Ok(out)
}

fn cfb_apply(key: &[u8], data: &mut [u8], encrypt: bool) -> Result<(), CliError> {
    macro_rules! do_cfb {
        ($cipher:ty) => {{
            let iv = [0u8; 16];
            if encrypt {
                Encryptor::<$cipher>::new_from_slices(key, &iv)
                    .map_err(|e| CliError::Execution(format!("AES init error: {e}")))?
                    .encrypt(data);
            } else {
                Decryptor::<$cipher>::new_from_slices(key, &iv)
                    .map_err(|e| CliError::Execution(format!("AES init error: {e}")))?
                    .decrypt(data);
            }
            Ok(())
        }};
    }

    match key.len() {
        16 => do_cfb!(Aes128),
        24 => do_cfb!(Aes192),
        32 => do_cfb!(Aes256),
        n => Err(CliError::UnsupportedAlgorithm(format!("AES-{}", n * 8))),
    }
}

/// Encrypts in place with AES-CFB and a zero IV.
///
/// # Errors
///
/// Returns `CliError::UnsupportedAlgorithm` if the key is not an AES key size.
pub fn crypto_cfb_encrypt(key: &[u8], data: &mut [u8]) -> Result<(), CliError> {
    cfb_apply(key, data, true)
}

/// Decrypts in place with AES-CFB and a zero IV.
///
/// # Errors
///
/// Returns `CliError::UnsupportedAlgorithm` if the key is not an AES key size.
pub fn crypto_cfb_decrypt(key: &[u8], data: &mut [u8]) -> Result<(), CliError> {
    cfb_apply(key, data, false)
}

/// Extracts the RSA public key from a public area.
///
/// # Errors
///
/// Returns `CliError::UnsupportedAlgorithm` if the object is not an RSA key,
/// or `CliError::MalformedPublicArea` if the modulus is unusable.
pub fn rsa_public_key(public: &TpmtPublic) -> Result<RsaPublicKey, CliError> {
    let (TpmuPublicParms::Rsa(parms), TpmuPublicId::Rsa(modulus)) =
        (&public.parameters, &public.unique)
    else {
        return Err(CliError::UnsupportedAlgorithm(format!(
            "{} public key",
            public.object_type
        )));
    };
    RsaPublicKey::new(
        BigUint::from_bytes_be(modulus),
        BigUint::from(rsa_exponent(parms)),
    )
    .map_err(|e| CliError::MalformedPublicArea(e.to_string()))
}

fn oaep(alg: TpmAlgId, label: &str) -> Result<Oaep, CliError> {
    match alg {
        TpmAlgId::Sha1 => Ok(Oaep::new_with_label::<Sha1, _>(label)),
        TpmAlgId::Sha256 => Ok(Oaep::new_with_label::<Sha256, _>(label)),
        TpmAlgId::Sha384 => Ok(Oaep::new_with_label::<Sha384, _>(label)),
        TpmAlgId::Sha512 => Ok(Oaep::new_with_label::<Sha512, _>(label)),
        _ => Err(CliError::UnsupportedAlgorithm(alg.to_string())),
    }
}

/// Encrypts a seed to an RSA key with OAEP, using `name_alg` as the hash.
///
/// # Errors
///
/// Returns `CliError::Execution` if the encryption fails.
pub fn protect_seed_with_rsa<R: CryptoRng + RngCore>(
    key: &RsaPublicKey,
    name_alg: TpmAlgId,
    label: &str,
    seed: &[u8],
    rng: &mut R,
) -> Result<Vec<u8>, CliError> {
    key.encrypt(rng, oaep(name_alg, label)?, seed)
        .map_err(|e| CliError::Execution(format!("OAEP encryption failed: {e}")))
}

/// Decrypts a seed protected with [`protect_seed_with_rsa`].
///
/// # Errors
///
/// Returns `CliError::Execution` if the ciphertext does not decrypt.
pub fn unprotect_seed_with_rsa(
    key: &RsaPrivateKey,
    name_alg: TpmAlgId,
    label: &str,
    encrypted: &[u8],
) -> Result<Vec<u8>, CliError> {
    key.decrypt(oaep(name_alg, label)?, encrypted)
        .map_err(|e| CliError::Execution(format!("OAEP decryption failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(TpmAlgId::Sha256, 128)]
    #[case(TpmAlgId::Sha256, 256)]
    #[case(TpmAlgId::Sha1, 512)]
    fn test_kdfa_length(#[case] alg: TpmAlgId, #[case] bits: u32) {
        let out = crypto_kdfa(alg, b"seed", KDF_LABEL_STORAGE, b"u", b"", bits).unwrap();
        assert_eq!(out.len(), (bits / 8) as usize);
    }

    #[rstest]
    fn test_kdfa_first_block() {
        // One block is HMAC(key, 1 || "STORAGE\0" || u || v || bits).
        let out = crypto_kdfa(TpmAlgId::Sha256, b"key", "STORAGE", b"ctx", b"", 256).unwrap();
        let mut mac = Hmac::<Sha256>::new_from_slice(b"key").unwrap();
        mac.update(&1u32.to_be_bytes());
        mac.update(b"STORAGE\0");
        mac.update(b"ctx");
        mac.update(&256u32.to_be_bytes());
        assert_eq!(out, mac.finalize().into_bytes().to_vec());
    }

    #[rstest]
    fn test_kdfa_label_terminator_is_not_doubled() {
        let a = crypto_kdfa(TpmAlgId::Sha256, b"k", "INTEGRITY", b"", b"", 256).unwrap();
        let b = crypto_kdfa(TpmAlgId::Sha256, b"k", "INTEGRITY\0", b"", b"", 256).unwrap();
        assert_eq!(a, b);
    }

    #[rstest]
    fn test_hmac_verify() {
        let tag = crypto_hmac(TpmAlgId::Sha256, b"k", &[b"ab", b"cd"]).unwrap();
        assert!(crypto_hmac_verify(TpmAlgId::Sha256, b"k", &[b"abcd"], &tag).unwrap());
        assert!(!crypto_hmac_verify(TpmAlgId::Sha256, b"k", &[b"abce"], &tag).unwrap());
    }

    #[rstest]
    #[case(16)]
    #[case(32)]
    fn test_cfb_inverse(#[case] key_len: usize) {
        let key = vec![0x42; key_len];
        let mut data = b"activation credential".to_vec();
        crypto_cfb_encrypt(&key, &mut data).unwrap();
        assert_ne!(data, b"activation credential");
        crypto_cfb_decrypt(&key, &mut data).unwrap();
        assert_eq!(data, b"activation credential");
    }

    #[rstest]
    fn test_digest_rejects_non_hash() {
        assert!(matches!(
            crypto_digest(TpmAlgId::Aes, b""),
            Err(CliError::UnsupportedAlgorithm(_))
        ));
    }
}
