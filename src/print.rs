// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy
// Copyright (c) 2024-2025 Jarkko Sakkinen

//! Text rendering of capabilities and public areas.

use crate::{
    crypto::{rsa_exponent, rsa_public_key},
    error::CliError,
    name::TpmName,
};
use pem::{EncodeConfig, LineEnding, Pem};
use rsa::pkcs8::EncodePublicKey;
use std::{fmt::Display, io::Write};
use tpm2_protocol::data::{
    TpmAlgId, TpmCc, TpmHt, TpmPt, TpmaAlgorithm, TpmaCc, TpmaObject, TpmsAlgProperty,
    TpmsTaggedProperty, TpmtPublic, TpmtSymDefObject, TpmuAsymScheme, TpmuKdfScheme,
    TpmuKeyedhashScheme, TpmuPublicId, TpmuPublicParms, TpmuSymKeyBits, TpmuSymMode,
};

/// Field width of `readpublic -text` labels.
const LABEL_WIDTH: usize = 20;
const MODULUS_BYTES_PER_LINE: usize = 16;

/// `TPMA_OBJECT` bits in bit order.
pub const OBJECT_ATTRIBUTES: [(TpmaObject, &str); 11] = [
    (TpmaObject::FIXED_TPM, "FIXED_TPM"),
    (TpmaObject::ST_CLEAR, "ST_CLEAR"),
    (TpmaObject::FIXED_PARENT, "FIXED_PARENT"),
    (TpmaObject::SENSITIVE_DATA_ORIGIN, "SENSITIVE_DATA_ORIGIN"),
    (TpmaObject::USER_WITH_AUTH, "USER_WITH_AUTH"),
    (TpmaObject::ADMIN_WITH_POLICY, "ADMIN_WITH_POLICY"),
    (TpmaObject::NO_DA, "NO_DA"),
    (TpmaObject::ENCRYPTED_DUPLICATION, "ENCRYPTED_DUPLICATION"),
    (TpmaObject::RESTRICTED, "RESTRICTED"),
    (TpmaObject::DECRYPT, "DECRYPT"),
    (TpmaObject::SIGN_ENCRYPT, "SIGN_ENCRYPT"),
];

const ALGORITHM_ATTRIBUTES: [(TpmaAlgorithm, &str); 7] = [
    (TpmaAlgorithm::ASYMMETRIC, "ASYMMETRIC"),
    (TpmaAlgorithm::SYMMETRIC, "SYMMETRIC"),
    (TpmaAlgorithm::HASH, "HASH"),
    (TpmaAlgorithm::OBJECT, "OBJECT"),
    (TpmaAlgorithm::SIGNING, "SIGNING"),
    (TpmaAlgorithm::ENCRYPTING, "ENCRYPTING"),
    (TpmaAlgorithm::METHOD, "METHOD"),
];

/// Renders a TPM constant with the `TPM2_` prefix used by the command-line
/// tools, e.g. `TPM2_ALG_RSA` for `TPM_ALG_RSA`.
pub fn label(value: impl Display) -> String {
    let text = value.to_string();
    match text.strip_prefix("TPM_") {
        Some(rest) => format!("TPM2_{rest}"),
        None => text,
    }
}

/// Returns the `TPMA_OBJECT_*` names of the set attributes in bit order.
#[must_use]
pub fn object_attribute_labels(attributes: TpmaObject) -> Vec<String> {
    OBJECT_ATTRIBUTES
        .iter()
        .filter(|(flag, _)| attributes.contains(*flag))
        .map(|(_, name)| format!("TPMA_OBJECT_{}", name.replace('_', "")))
        .collect()
}

/// Renders `TPM2_CAP_ALGS` entries.
///
/// # Errors
///
/// Returns `CliError::Io` if the writer fails.
pub fn print_algorithms<W: Write + ?Sized>(
    writer: &mut W,
    algs: &[TpmsAlgProperty],
) -> Result<(), CliError> {
    for prop in algs {
        let attributes: Vec<&str> = ALGORITHM_ATTRIBUTES
            .iter()
            .filter(|(flag, _)| prop.alg_properties.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        writeln!(
            writer,
            "  {:<24} {}",
            label(prop.alg),
            attributes.join(" | ")
        )?;
    }
    Ok(())
}

/// Renders `TPM2_CAP_HANDLES` entries of a single handle type.
///
/// # Errors
///
/// Returns `CliError::Io` if the writer fails.
pub fn print_handles<W: Write + ?Sized>(writer: &mut W, handles: &[u32]) -> Result<(), CliError> {
    for &handle in handles {
        let kind = u8::try_from(handle >> 24)
            .ok()
            .and_then(|ht| TpmHt::try_from(ht).ok())
            .map_or_else(|| "TPM2_HT_UNKNOWN".to_string(), label);
        writeln!(writer, "  0x{handle:08X}  {kind}")?;
    }
    Ok(())
}

/// Renders `TPM2_CAP_COMMANDS` entries.
///
/// # Errors
///
/// Returns `CliError::Io` if the writer fails.
pub fn print_commands<W: Write + ?Sized>(
    writer: &mut W,
    commands: &[TpmaCc],
) -> Result<(), CliError> {
    for attributes in commands {
        let index = attributes.command_index();
        let name = TpmCc::try_from(u32::from(index))
            .map_or_else(|_| "TPM2_CC_UNKNOWN".to_string(), label);
        writeln!(writer, "  {name:<24} 0x{index:04x}")?;
    }
    Ok(())
}

fn property_ascii(value: u32) -> String {
    value
        .to_be_bytes()
        .iter()
        .filter(|b| b.is_ascii_graphic() || **b == b' ')
        .map(|&b| char::from(b))
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// Renders `TPM2_CAP_TPM_PROPERTIES` entries.
///
/// # Errors
///
/// Returns `CliError::Io` if the writer fails.
pub fn print_properties<W: Write + ?Sized>(
    writer: &mut W,
    properties: &[TpmsTaggedProperty],
) -> Result<(), CliError> {
    for prop in properties {
        let raw = prop.value.value();
        let value = match prop.property {
            TpmPt::Manufacturer
            | TpmPt::VendorString1
            | TpmPt::VendorString2
            | TpmPt::VendorString3
            | TpmPt::VendorString4 => format!("\"{}\"", property_ascii(raw)),
            TpmPt::FamilyIndicator => property_ascii(raw),
            _ => format!("{raw} ({raw:#x})"),
        };
        writeln!(writer, "  {:<28} {value}", label(prop.property))?;
    }
    Ok(())
}

fn field<W: Write + ?Sized>(writer: &mut W, label: &str, value: impl Display) -> Result<(), CliError> {
    writeln!(writer, "{label:<LABEL_WIDTH$}: {value}")?;
    Ok(())
}

fn print_symmetric<W: Write + ?Sized>(
    writer: &mut W,
    sym: &TpmtSymDefObject,
) -> Result<(), CliError> {
    if sym.algorithm == TpmAlgId::Null {
        return Ok(());
    }
    field(writer, "Symmetric algorithm", label(sym.algorithm))?;
    if let TpmuSymKeyBits::Aes(bits) | TpmuSymKeyBits::Sm4(bits) | TpmuSymKeyBits::Camellia(bits) =
        sym.key_bits
    {
        field(writer, "Symmetric key bits", bits.value())?;
    }
    if let TpmuSymMode::Aes(mode)
    | TpmuSymMode::Sm4(mode)
    | TpmuSymMode::Camellia(mode)
    | TpmuSymMode::Xor(mode) = sym.mode
    {
        field(writer, "Symmetric mode", label(mode))?;
    }
    Ok(())
}

fn print_scheme<W: Write + ?Sized>(
    writer: &mut W,
    scheme: TpmAlgId,
    details: &TpmuAsymScheme,
) -> Result<(), CliError> {
    if scheme == TpmAlgId::Null {
        return Ok(());
    }
    field(writer, "Signature algorithm", label(scheme))?;
    if let TpmuAsymScheme::Hash(hash) = details {
        field(writer, "Signature hash", label(hash.hash_alg))?;
    }
    Ok(())
}

fn print_name<W: Write + ?Sized>(
    writer: &mut W,
    title: &str,
    name: &TpmName,
) -> Result<(), CliError> {
    field(
        writer,
        title,
        format_args!("{} ({})", hex::encode(name.digest()), label(name.alg())),
    )
}

/// Renders a public area in the `readpublic -text` format. The qualified
/// name is only known when the area was read from a TPM.
///
/// # Errors
///
/// Returns `CliError::Io` if the writer fails.
pub fn print_public<W: Write + ?Sized>(
    writer: &mut W,
    public: &TpmtPublic,
    name: &TpmName,
    qualified_name: Option<&TpmName>,
) -> Result<(), CliError> {
    field(writer, "Type", label(public.object_type))?;
    field(writer, "Name algorithm", label(public.name_alg))?;
    print_name(writer, "Name", name)?;
    if let Some(qualified_name) = qualified_name {
        print_name(writer, "Qualified name", qualified_name)?;
    }

    for (i, attribute) in object_attribute_labels(public.object_attributes)
        .iter()
        .enumerate()
    {
        field(writer, if i == 0 { "Attributes" } else { "" }, attribute)?;
    }

    if !public.auth_policy.is_empty() {
        field(writer, "Auth policy", hex::encode(&*public.auth_policy))?;
    }

    match &public.parameters {
        TpmuPublicParms::Rsa(parms) => {
            print_symmetric(writer, &parms.symmetric)?;
            print_scheme(writer, parms.scheme.scheme, &parms.scheme.details)?;
            field(writer, "Key bits", parms.key_bits.value())?;
            let e = rsa_exponent(parms);
            field(writer, "Exponent", format_args!("{e} (0x{e:x})"))?;
        }
        TpmuPublicParms::Ecc(parms) => {
            print_symmetric(writer, &parms.symmetric)?;
            print_scheme(writer, parms.scheme.scheme, &parms.scheme.details)?;
            field(writer, "Curve", label(parms.curve_id))?;
            if let TpmuKdfScheme::Mgf1(hash)
            | TpmuKdfScheme::Kdf1Sp800_56a(hash)
            | TpmuKdfScheme::Kdf2(hash)
            | TpmuKdfScheme::Kdf1Sp800_108(hash) = &parms.kdf.details
            {
                field(writer, "KDF", label(parms.kdf.scheme))?;
                field(writer, "KDF hash", label(hash.hash_alg))?;
            }
        }
        TpmuPublicParms::KeyedHash(parms) => {
            let hash_alg = match &parms.scheme.details {
                TpmuKeyedhashScheme::Hmac(hash) => Some(hash.hash_alg),
                TpmuKeyedhashScheme::Xor(xor) => Some(xor.hash_alg),
                TpmuKeyedhashScheme::Null => None,
            };
            if let Some(hash_alg) = hash_alg {
                field(writer, "Keyed hash scheme", label(parms.scheme.scheme))?;
                field(writer, "Keyed hash hash", label(hash_alg))?;
            }
        }
        TpmuPublicParms::SymCipher(parms) => print_symmetric(writer, &parms.sym)?,
        TpmuPublicParms::Null => {}
    }

    if let TpmuPublicId::Rsa(modulus) = &public.unique {
        let modulus: &[u8] = modulus;
        let start = modulus.iter().position(|&b| b != 0).unwrap_or(modulus.len());
        for (i, line) in modulus[start..].chunks(MODULUS_BYTES_PER_LINE).enumerate() {
            field(writer, if i == 0 { "Modulus" } else { "" }, hex::encode(line))?;
        }
    }
    Ok(())
}

/// Encodes the public key of an RSA object as a PEM `PUBLIC KEY` block.
///
/// # Errors
///
/// Returns `CliError::UnsupportedAlgorithm` for non-RSA objects and
/// `CliError::MalformedPublicArea` if the key cannot be DER-encoded.
pub fn public_key_pem(public: &TpmtPublic) -> Result<String, CliError> {
    let key = rsa_public_key(public)?;
    let der = key
        .to_public_key_der()
        .map_err(|e| CliError::MalformedPublicArea(e.to_string()))?;
    let block = Pem::new("PUBLIC KEY", der.as_bytes());
    Ok(pem::encode_config(
        &block,
        EncodeConfig::new().set_line_ending(LineEnding::LF),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{name::derive_name, template::sym_def};
    use rstest::{fixture, rstest};
    use tpm2_protocol::{
        basic::{TpmUint16, TpmUint32},
        data::{
            Tpm2bPublicKeyRsa, TpmsKeyedhashParms, TpmsRsaParms, TpmtKeyedhashScheme,
            TpmtRsaScheme,
        },
    };

    #[fixture]
    fn storage_key() -> TpmtPublic {
        TpmtPublic {
            object_type: TpmAlgId::Rsa,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::FIXED_TPM
                | TpmaObject::FIXED_PARENT
                | TpmaObject::RESTRICTED
                | TpmaObject::DECRYPT,
            auth_policy: Default::default(),
            parameters: TpmuPublicParms::Rsa(TpmsRsaParms {
                symmetric: sym_def(TpmAlgId::Aes, 128, TpmAlgId::Cfb).unwrap(),
                scheme: TpmtRsaScheme::default(),
                key_bits: TpmUint16::new(2048),
                exponent: TpmUint32::new(0),
            }),
            unique: TpmuPublicId::Rsa(Tpm2bPublicKeyRsa::try_from(&[0xc3; 256][..]).unwrap()),
        }
    }

    fn render(f: impl FnOnce(&mut Vec<u8>) -> Result<(), CliError>) -> String {
        let mut out = Vec::new();
        f(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[rstest]
    fn test_label() {
        assert_eq!(label(TpmAlgId::Rsa), "TPM2_ALG_RSA");
        assert_eq!(label(TpmHt::Persistent), "TPM2_HT_PERSISTENT");
        assert_eq!(label("0x0131"), "0x0131");
    }

    #[rstest]
    fn test_print_algorithms() {
        let algs = [TpmsAlgProperty {
            alg: TpmAlgId::Rsa,
            alg_properties: TpmaAlgorithm::ASYMMETRIC | TpmaAlgorithm::OBJECT,
        }];
        let text = render(|w| print_algorithms(w, &algs));
        assert_eq!(text, format!("  {:<24} ASYMMETRIC | OBJECT\n", "TPM2_ALG_RSA"));
    }

    #[rstest]
    #[case(0x8100_0001, "TPM2_HT_PERSISTENT")]
    #[case(0x7f00_0000, "TPM2_HT_UNKNOWN")]
    fn test_print_handles(#[case] handle: u32, #[case] kind: &str) {
        let text = render(|w| print_handles(w, &[handle]));
        assert_eq!(text, format!("  0x{handle:08X}  {kind}\n"));
    }

    #[rstest]
    fn test_print_commands() {
        let commands = [TpmaCc::from_bits_truncate(0x0200_0131)];
        let text = render(|w| print_commands(w, &commands));
        assert_eq!(text, format!("  {:<24} 0x0131\n", "TPM2_CC_CreatePrimary"));
    }

    #[rstest]
    fn test_print_properties() {
        let props = [
            TpmsTaggedProperty {
                property: TpmPt::Manufacturer,
                value: TpmUint32::new(u32::from_be_bytes(*b"MOCK")),
            },
            TpmsTaggedProperty {
                property: TpmPt::NvBufferMax,
                value: TpmUint32::new(1024),
            },
        ];
        let text = render(|w| print_properties(w, &props));
        let expected = format!(
            "  {:<28} \"MOCK\"\n  {:<28} 1024 (0x400)\n",
            "TPM2_PT_MANUFACTURER", "TPM2_PT_NV_BUFFER_MAX"
        );
        assert_eq!(text, expected);
    }

    #[rstest]
    fn test_print_public(storage_key: TpmtPublic) {
        let name = derive_name(&storage_key).unwrap();
        let text = render(|w| print_public(w, &storage_key, &name, None));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Type                : TPM2_ALG_RSA");
        assert_eq!(lines[1], "Name algorithm      : TPM2_ALG_SHA256");
        assert_eq!(
            lines[2],
            format!(
                "Name                : {} (TPM2_ALG_SHA256)",
                hex::encode(name.digest())
            )
        );
        assert_eq!(lines[3], "Attributes          : TPMA_OBJECT_FIXEDTPM");
        assert_eq!(lines[4], "                    : TPMA_OBJECT_FIXEDPARENT");
        assert!(text.contains("Exponent            : 65537 (0x10001)\n"));
        assert!(text.contains("Symmetric mode      : TPM2_ALG_CFB\n"));
        assert_eq!(text.lines().filter(|l| l.len() == 22 + 32).count(), 16);
        assert!(!text.contains("Qualified name"));
    }

    #[rstest]
    fn test_public_key_pem(storage_key: TpmtPublic) {
        let pem = public_key_pem(&storage_key).unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----\n"));
        assert!(pem.trim_end().ends_with("-----END PUBLIC KEY-----"));
    }

    #[rstest]
    fn test_public_key_pem_rejects_keyedhash() {
        let public = TpmtPublic {
            object_type: TpmAlgId::KeyedHash,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::empty(),
            auth_policy: Default::default(),
            parameters: TpmuPublicParms::KeyedHash(TpmsKeyedhashParms {
                scheme: TpmtKeyedhashScheme::default(),
            }),
            unique: TpmuPublicId::KeyedHash(Default::default()),
        };
        assert!(matches!(
            public_key_pem(&public),
            Err(CliError::UnsupportedAlgorithm(_))
        ));
    }
}
