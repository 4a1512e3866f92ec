// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! JSON object templates for `createprimary` and `create`.
//!
//! ```json
//! {
//!   "type": "rsa",
//!   "name_alg": "sha256",
//!   "attributes": ["fixedtpm", "fixedparent", "sensitivedataorigin",
//!                  "userwithauth", "restricted", "decrypt"],
//!   "rsa": {
//!     "symmetric": { "alg": "aes", "key_bits": 128, "mode": "cfb" },
//!     "key_bits": 2048
//!   }
//! }
//! ```

use crate::{error::CliError, print::label, print::OBJECT_ATTRIBUTES};
use serde::Deserialize;
use std::{fmt::Display, fs, path::Path};
use tpm2_protocol::{
    basic::{TpmUint16, TpmUint32},
    data::{
        Tpm2bDigest, TpmAlgId, TpmEccCurve, TpmaObject, TpmsEccParms, TpmsKeyedhashParms, TpmsRsaParms,
        TpmsSchemeHash, TpmsSchemeXor, TpmsSymcipherParms, TpmtEccScheme, TpmtKdfScheme,
        TpmtKeyedhashScheme, TpmtPublic, TpmtRsaScheme, TpmtSymDefObject, TpmuAsymScheme,
        TpmuKdfScheme, TpmuKeyedhashScheme, TpmuPublicId, TpmuPublicParms, TpmuSymKeyBits,
        TpmuSymMode,
    },
};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SymmetricTemplate {
    alg: String,
    #[serde(default)]
    key_bits: u16,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchemeTemplate {
    scheme: String,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    kdf: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RsaTemplate {
    #[serde(default)]
    symmetric: Option<SymmetricTemplate>,
    #[serde(default)]
    scheme: Option<SchemeTemplate>,
    key_bits: u16,
    #[serde(default)]
    exponent: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct EccTemplate {
    #[serde(default)]
    symmetric: Option<SymmetricTemplate>,
    #[serde(default)]
    scheme: Option<SchemeTemplate>,
    curve: String,
    #[serde(default)]
    kdf: Option<SchemeTemplate>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct KeyedHashTemplate {
    #[serde(default)]
    scheme: Option<SchemeTemplate>,
}

/// An object template as read from JSON.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Template {
    #[serde(rename = "type")]
    object_type: String,
    name_alg: String,
    #[serde(default)]
    attributes: Vec<String>,
    #[serde(default)]
    auth_policy: String,
    #[serde(default)]
    rsa: Option<RsaTemplate>,
    #[serde(default)]
    ecc: Option<EccTemplate>,
    #[serde(default)]
    keyedhash: Option<KeyedHashTemplate>,
    #[serde(default)]
    symcipher: Option<SymmetricTemplate>,
}

/// Finds the constant whose `TPM_<kind>_` name matches `s`. Case is ignored
/// and a `TPM2_<kind>_` or `TPM_<kind>_` prefix is optional.
fn lookup<T: Display>(
    kind: &str,
    s: &str,
    values: impl IntoIterator<Item = T>,
) -> Result<T, CliError> {
    let prefix = format!("TPM_{kind}_");
    let upper = s.to_ascii_uppercase();
    let short = upper
        .strip_prefix(&format!("TPM2_{kind}_"))
        .or_else(|| upper.strip_prefix(&prefix))
        .unwrap_or(&upper);
    values
        .into_iter()
        .find(|v| v.to_string().strip_prefix(&prefix) == Some(short))
        .ok_or_else(|| {
            CliError::Configuration(format!("unknown {}: '{s}'", kind.to_ascii_lowercase()))
        })
}

fn alg(s: &str) -> Result<TpmAlgId, CliError> {
    lookup(
        "ALG",
        s,
        (0..=0x00ff_u16).filter_map(|v| TpmAlgId::try_from(v).ok()),
    )
}

fn opt_alg(s: Option<&String>) -> Result<TpmAlgId, CliError> {
    s.map_or(Ok(TpmAlgId::Null), |s| alg(s))
}

fn curve(s: &str) -> Result<TpmEccCurve, CliError> {
    lookup(
        "ECC",
        s,
        (0..=0x00ff_u16).filter_map(|v| TpmEccCurve::try_from(v).ok()),
    )
}

fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| *c != '_')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Parses an object attribute such as `fixedtpm`, `FIXED_TPM` or
/// `TPMA_OBJECT_FIXEDTPM`.
fn object_attribute(s: &str) -> Option<TpmaObject> {
    let wanted = squash(s);
    let wanted = wanted.strip_prefix("TPMAOBJECT").unwrap_or(&wanted);
    OBJECT_ATTRIBUTES
        .iter()
        .find(|(_, name)| squash(name) == wanted)
        .map(|(flag, _)| *flag)
}

/// Builds a `TPMT_SYM_DEF_OBJECT` for a block cipher. `TPM_ALG_NULL`
/// yields the empty definition.
///
/// # Errors
///
/// Returns `CliError::Configuration` if `algorithm` is not a block cipher.
pub fn sym_def(
    algorithm: TpmAlgId,
    key_bits: u16,
    mode: TpmAlgId,
) -> Result<TpmtSymDefObject, CliError> {
    let bits = TpmUint16::new(key_bits);
    let (key_bits, mode) = match algorithm {
        TpmAlgId::Null => return Ok(TpmtSymDefObject::default()),
        TpmAlgId::Aes => (TpmuSymKeyBits::Aes(bits), TpmuSymMode::Aes(mode)),
        TpmAlgId::Sm4 => (TpmuSymKeyBits::Sm4(bits), TpmuSymMode::Sm4(mode)),
        TpmAlgId::Camellia => (TpmuSymKeyBits::Camellia(bits), TpmuSymMode::Camellia(mode)),
        other => {
            return Err(CliError::Configuration(format!(
                "{} is not a block cipher",
                label(other)
            )))
        }
    };
    Ok(TpmtSymDefObject {
        algorithm,
        key_bits,
        mode,
    })
}

impl SymmetricTemplate {
    fn to_tpm(&self) -> Result<TpmtSymDefObject, CliError> {
        sym_def(alg(&self.alg)?, self.key_bits, opt_alg(self.mode.as_ref())?)
    }
}

fn symmetric(t: Option<&SymmetricTemplate>) -> Result<TpmtSymDefObject, CliError> {
    t.map_or(Ok(TpmtSymDefObject::default()), SymmetricTemplate::to_tpm)
}

/// Returns the scheme algorithm and its hash, `TPM_ALG_NULL` for both when
/// the template has no scheme.
fn scheme_algs(t: Option<&SchemeTemplate>) -> Result<(TpmAlgId, TpmAlgId), CliError> {
    match t {
        Some(t) => Ok((alg(&t.scheme)?, opt_alg(t.hash.as_ref())?)),
        None => Ok((TpmAlgId::Null, TpmAlgId::Null)),
    }
}

fn asym_details(scheme: TpmAlgId, hash_alg: TpmAlgId) -> TpmuAsymScheme {
    if scheme == TpmAlgId::Null {
        TpmuAsymScheme::Null
    } else {
        TpmuAsymScheme::Hash(TpmsSchemeHash { hash_alg })
    }
}

fn kdf_scheme(scheme: TpmAlgId, hash_alg: TpmAlgId) -> Result<TpmtKdfScheme, CliError> {
    let hash = TpmsSchemeHash { hash_alg };
    let details = match scheme {
        TpmAlgId::Null => TpmuKdfScheme::Null,
        TpmAlgId::Mgf1 => TpmuKdfScheme::Mgf1(hash),
        TpmAlgId::Kdf1Sp800_56A => TpmuKdfScheme::Kdf1Sp800_56a(hash),
        TpmAlgId::Kdf2 => TpmuKdfScheme::Kdf2(hash),
        TpmAlgId::Kdf1Sp800_108 => TpmuKdfScheme::Kdf1Sp800_108(hash),
        other => {
            return Err(CliError::Configuration(format!(
                "{} is not a KDF",
                label(other)
            )))
        }
    };
    Ok(TpmtKdfScheme { scheme, details })
}

fn keyedhash_scheme(t: Option<&SchemeTemplate>) -> Result<TpmtKeyedhashScheme, CliError> {
    let (scheme, hash_alg) = scheme_algs(t)?;
    let details = match scheme {
        TpmAlgId::Null => TpmuKeyedhashScheme::Null,
        TpmAlgId::Hmac => TpmuKeyedhashScheme::Hmac(TpmsSchemeHash { hash_alg }),
        TpmAlgId::Xor => {
            let kdf = opt_alg(t.and_then(|t| t.kdf.as_ref()))?;
            TpmuKeyedhashScheme::Xor(TpmsSchemeXor {
                hash_alg,
                kdf: kdf_scheme(kdf, hash_alg)?,
            })
        }
        other => {
            return Err(CliError::Configuration(format!(
                "{} is not a keyed hash scheme",
                label(other)
            )))
        }
    };
    Ok(TpmtKeyedhashScheme { scheme, details })
}

impl Template {
    /// Parses a template from JSON text.
    ///
    /// # Errors
    ///
    /// Returns `CliError::Configuration` if the text is not a valid template.
    pub fn from_json(text: &str) -> Result<Self, CliError> {
        serde_json::from_str(text).map_err(|e| CliError::Configuration(format!("template: {e}")))
    }

    /// Reads a template file.
    ///
    /// # Errors
    ///
    /// Returns `CliError::File` if the file cannot be read and
    /// `CliError::Configuration` if it is not a valid template.
    pub fn from_file(path: &Path) -> Result<Self, CliError> {
        let text = fs::read_to_string(path).map_err(|e| CliError::file(path, e))?;
        Self::from_json(&text)
    }

    /// Builds the public area described by the template, with an empty
    /// `unique` field.
    ///
    /// # Errors
    ///
    /// Returns `CliError::Configuration` for unknown names or a parameter
    /// block that does not match the object type.
    pub fn to_public(&self) -> Result<TpmtPublic, CliError> {
        let object_type = alg(&self.object_type)?;
        let name_alg = alg(&self.name_alg)?;

        let mut object_attributes = TpmaObject::empty();
        for attribute in &self.attributes {
            object_attributes |= object_attribute(attribute).ok_or_else(|| {
                CliError::Configuration(format!("unknown object attribute '{attribute}'"))
            })?;
        }

        let auth_policy = hex::decode(&self.auth_policy)
            .map_err(|e| CliError::Configuration(format!("auth_policy: {e}")))?;
        let auth_policy = Tpm2bDigest::try_from(auth_policy.as_slice())
            .map_err(|e| CliError::Configuration(format!("auth_policy: {e}")))?;

        let missing = || {
            CliError::Configuration(format!(
                "template for {} has no '{}' parameters",
                label(object_type),
                self.object_type.to_ascii_lowercase()
            ))
        };

        let (parameters, unique) = match object_type {
            TpmAlgId::Rsa => {
                let rsa = self.rsa.as_ref().ok_or_else(missing)?;
                let (scheme, hash_alg) = scheme_algs(rsa.scheme.as_ref())?;
                (
                    TpmuPublicParms::Rsa(TpmsRsaParms {
                        symmetric: symmetric(rsa.symmetric.as_ref())?,
                        scheme: TpmtRsaScheme {
                            scheme,
                            details: asym_details(scheme, hash_alg),
                        },
                        key_bits: TpmUint16::new(rsa.key_bits),
                        exponent: TpmUint32::new(rsa.exponent),
                    }),
                    TpmuPublicId::Rsa(Default::default()),
                )
            }
            TpmAlgId::Ecc => {
                let ecc = self.ecc.as_ref().ok_or_else(missing)?;
                let (scheme, hash_alg) = scheme_algs(ecc.scheme.as_ref())?;
                let (kdf, kdf_hash) = scheme_algs(ecc.kdf.as_ref())?;
                (
                    TpmuPublicParms::Ecc(TpmsEccParms {
                        symmetric: symmetric(ecc.symmetric.as_ref())?,
                        scheme: TpmtEccScheme {
                            scheme,
                            details: asym_details(scheme, hash_alg),
                        },
                        curve_id: curve(&ecc.curve)?,
                        kdf: kdf_scheme(kdf, kdf_hash)?,
                    }),
                    TpmuPublicId::Ecc(Default::default()),
                )
            }
            TpmAlgId::KeyedHash => {
                let scheme = self.keyedhash.as_ref().and_then(|k| k.scheme.as_ref());
                (
                    TpmuPublicParms::KeyedHash(TpmsKeyedhashParms {
                        scheme: keyedhash_scheme(scheme)?,
                    }),
                    TpmuPublicId::KeyedHash(Default::default()),
                )
            }
            TpmAlgId::SymCipher => {
                let sym = self.symcipher.as_ref().ok_or_else(missing)?;
                (
                    TpmuPublicParms::SymCipher(TpmsSymcipherParms { sym: sym.to_tpm()? }),
                    TpmuPublicId::SymCipher(Default::default()),
                )
            }
            other => {
                return Err(CliError::Configuration(format!(
                    "{} is not an object type",
                    label(other)
                )))
            }
        };

        Ok(TpmtPublic {
            object_type,
            name_alg,
            object_attributes,
            auth_policy,
            parameters,
            unique,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const RSA_STORAGE: &str = r#"{
        "type": "rsa",
        "name_alg": "sha256",
        "attributes": ["fixedtpm", "fixedparent", "sensitivedataorigin",
                       "userwithauth", "restricted", "decrypt"],
        "auth_policy": "",
        "rsa": {
            "symmetric": { "alg": "aes", "key_bits": 128, "mode": "cfb" },
            "scheme": null,
            "key_bits": 2048,
            "exponent": 0
        }
    }"#;

    #[rstest]
    fn test_rsa_storage_template() {
        let public = Template::from_json(RSA_STORAGE).unwrap().to_public().unwrap();
        assert_eq!(public.object_type, TpmAlgId::Rsa);
        assert_eq!(public.name_alg, TpmAlgId::Sha256);
        assert!(public
            .object_attributes
            .contains(TpmaObject::RESTRICTED | TpmaObject::DECRYPT | TpmaObject::FIXED_TPM));
        let TpmuPublicParms::Rsa(parms) = public.parameters else {
            panic!("not an RSA template");
        };
        assert_eq!(
            parms.symmetric,
            sym_def(TpmAlgId::Aes, 128, TpmAlgId::Cfb).unwrap()
        );
        assert_eq!(parms.key_bits.value(), 2048);
        assert_eq!(parms.scheme, TpmtRsaScheme::default());
    }

    #[rstest]
    fn test_signing_key_template() {
        let json = r#"{
            "type": "TPM2_ALG_RSA", "name_alg": "SHA256",
            "attributes": ["TPMA_OBJECT_SIGN_ENCRYPT", "userwithauth"],
            "rsa": { "scheme": { "scheme": "rsassa", "hash": "sha256" }, "key_bits": 2048 }
        }"#;
        let public = Template::from_json(json).unwrap().to_public().unwrap();
        let TpmuPublicParms::Rsa(parms) = public.parameters else {
            panic!("not an RSA template");
        };
        assert_eq!(parms.scheme.scheme, TpmAlgId::Rsassa);
        assert_eq!(
            parms.scheme.details,
            TpmuAsymScheme::Hash(TpmsSchemeHash {
                hash_alg: TpmAlgId::Sha256
            })
        );
        assert_eq!(parms.symmetric, TpmtSymDefObject::default());
    }

    #[rstest]
    fn test_sealed_object_template() {
        let json = r#"{
            "type": "keyedhash", "name_alg": "sha256",
            "attributes": ["fixedtpm", "fixedparent", "userwithauth"],
            "auth_policy": "00ff"
        }"#;
        let public = Template::from_json(json).unwrap().to_public().unwrap();
        assert_eq!(&*public.auth_policy, &[0x00, 0xff]);
        assert_eq!(
            public.parameters,
            TpmuPublicParms::KeyedHash(TpmsKeyedhashParms::default())
        );
    }

    #[rstest]
    fn test_ecc_template() {
        let json = r#"{
            "type": "ecc", "name_alg": "sha256",
            "ecc": { "curve": "nist_p256", "scheme": { "scheme": "ecdsa", "hash": "sha256" } }
        }"#;
        let public = Template::from_json(json).unwrap().to_public().unwrap();
        let TpmuPublicParms::Ecc(parms) = public.parameters else {
            panic!("not an ECC template");
        };
        assert_eq!(parms.curve_id, TpmEccCurve::NistP256);
        assert_eq!(parms.kdf, TpmtKdfScheme::default());
    }

    #[rstest]
    fn test_xor_sealing_template() {
        let json = r#"{
            "type": "keyedhash", "name_alg": "sha256",
            "keyedhash": { "scheme": { "scheme": "xor", "hash": "sha256", "kdf": "kdf1_sp800_108" } }
        }"#;
        let public = Template::from_json(json).unwrap().to_public().unwrap();
        let TpmuPublicParms::KeyedHash(parms) = public.parameters else {
            panic!("not a keyed hash template");
        };
        let TpmuKeyedhashScheme::Xor(xor) = parms.scheme.details else {
            panic!("not an XOR scheme");
        };
        assert_eq!(xor.kdf.scheme, TpmAlgId::Kdf1Sp800_108);
    }

    #[rstest]
    #[case("aes", Ok(TpmAlgId::Aes))]
    #[case("TPM2_ALG_SHA256", Ok(TpmAlgId::Sha256))]
    #[case("tpm_alg_keyedhash", Ok(TpmAlgId::KeyedHash))]
    #[case("TPM2_ECC_NIST_P256", Err(()))]
    #[case("sha257", Err(()))]
    fn test_alg_names(#[case] name: &str, #[case] expected: Result<TpmAlgId, ()>) {
        assert_eq!(alg(name).map_err(|_| ()), expected);
    }

    #[rstest]
    #[case("fixedtpm", TpmaObject::FIXED_TPM)]
    #[case("SIGN_ENCRYPT", TpmaObject::SIGN_ENCRYPT)]
    #[case("TPMA_OBJECT_NODA", TpmaObject::NO_DA)]
    fn test_object_attribute_names(#[case] name: &str, #[case] flag: TpmaObject) {
        assert_eq!(object_attribute(name), Some(flag));
    }

    #[rstest]
    #[case(r#"{ "type": "rsa" }"#)]
    #[case(r#"{ "type": "rsa", "name_alg": "sha256" }"#)]
    #[case(r#"{ "type": "rsa", "name_alg": "sha256", "attributes": ["bogus"], "rsa": { "key_bits": 2048 } }"#)]
    #[case(r#"{ "type": "sha256", "name_alg": "sha256" }"#)]
    #[case(r#"{ "type": "rsa", "name_alg": "sha256", "colour": "blue" }"#)]
    #[case(r#"{ "type": "symcipher", "name_alg": "sha256", "symcipher": { "alg": "sha256" } }"#)]
    #[case("not json")]
    fn test_invalid_template(#[case] json: &str) {
        let result = Template::from_json(json).and_then(|t| t.to_public());
        assert!(matches!(result, Err(CliError::Configuration(_))));
    }

    #[rstest]
    fn test_template_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("srk.json");
        fs::write(&path, RSA_STORAGE).unwrap();
        assert!(Template::from_file(&path).unwrap().to_public().is_ok());
    }
}
