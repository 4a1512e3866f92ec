// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2025 Opinsys Oy

use cli::{
    device::{CreatedPrimary, TpmDevice},
    error::CliError,
    mocktpm,
    name::{derive_name, strip_size_prefix, TpmName},
    template::sym_def,
};
use rstest::{fixture, rstest};
use tpm2_protocol::{
    basic::{TpmUint16, TpmUint32},
    data::{
        Tpm2bAuth, TpmAlgId, TpmRc, TpmRcBase, TpmRcFmt1, TpmRcIndex, TpmRh, TpmaObject,
        TpmsRsaParms, TpmsSchemeHash, TpmsSensitiveCreate, TpmtPublic, TpmtRsaScheme,
        TpmtSymDefObject, TpmuAsymScheme, TpmuPublicId, TpmuPublicParms,
    },
};

const EK_PASSWORD: &[u8] = b"ekpass";
const AK_PASSWORD: &[u8] = b"akpass";

fn storage_template() -> TpmtPublic {
    TpmtPublic {
        object_type: TpmAlgId::Rsa,
        name_alg: TpmAlgId::Sha256,
        object_attributes: TpmaObject::FIXED_TPM
            | TpmaObject::FIXED_PARENT
            | TpmaObject::SENSITIVE_DATA_ORIGIN
            | TpmaObject::USER_WITH_AUTH
            | TpmaObject::RESTRICTED
            | TpmaObject::DECRYPT,
        auth_policy: Default::default(),
        parameters: TpmuPublicParms::Rsa(TpmsRsaParms {
            symmetric: sym_def(TpmAlgId::Aes, 128, TpmAlgId::Cfb).unwrap(),
            scheme: TpmtRsaScheme::default(),
            key_bits: TpmUint16::new(2048),
            exponent: TpmUint32::new(0),
        }),
        unique: TpmuPublicId::Rsa(Default::default()),
    }
}

fn signing_template() -> TpmtPublic {
    TpmtPublic {
        object_attributes: TpmaObject::FIXED_TPM
            | TpmaObject::FIXED_PARENT
            | TpmaObject::SENSITIVE_DATA_ORIGIN
            | TpmaObject::USER_WITH_AUTH
            | TpmaObject::SIGN_ENCRYPT,
        parameters: TpmuPublicParms::Rsa(TpmsRsaParms {
            symmetric: TpmtSymDefObject::default(),
            scheme: TpmtRsaScheme {
                scheme: TpmAlgId::Rsassa,
                details: TpmuAsymScheme::Hash(TpmsSchemeHash {
                    hash_alg: TpmAlgId::Sha256,
                }),
            },
            key_bits: TpmUint16::new(2048),
            exponent: TpmUint32::new(0),
        }),
        ..storage_template()
    }
}

fn sensitive(password: &[u8]) -> TpmsSensitiveCreate {
    TpmsSensitiveCreate {
        user_auth: Tpm2bAuth::try_from(password).unwrap(),
        data: Default::default(),
    }
}

fn fmt1(base: TpmRcBase, index: TpmRcIndex) -> TpmRc {
    TpmRc::Fmt1(TpmRcFmt1 {
        base,
        index: Some(index),
    })
}

/// A mock TPM holding a protector key and a loaded activating key.
struct Enrolled {
    device: TpmDevice,
    ek: CreatedPrimary,
    ak: u32,
    ak_public: TpmtPublic,
}

impl Enrolled {
    /// Returns the KDF form of a Name: the `TPM2B_NAME` with its size removed.
    fn kdf_name(public: &TpmtPublic) -> Vec<u8> {
        let encoded = derive_name(public).unwrap().encode().unwrap();
        strip_size_prefix(&encoded).unwrap().to_vec()
    }

    fn activate(
        &mut self,
        ak_password: &[u8],
        ek_password: &[u8],
        blob: &[u8],
        secret: &[u8],
    ) -> Result<Vec<u8>, CliError> {
        self.device.activate_credential(
            self.ak,
            self.ek.handle,
            ak_password,
            ek_password,
            blob,
            secret,
        )
    }
}

fn mock_device(nv: &[(u32, Vec<u8>)]) -> TpmDevice {
    let (_thread, transport) = mocktpm::start(nv).unwrap();
    let mut device = TpmDevice::new(transport);
    device.startup().unwrap();
    device
}

#[fixture]
fn enrolled() -> Enrolled {
    let mut device = mock_device(&[]);
    let ek = device
        .create_primary(
            TpmRh::Endorsement.value(),
            b"",
            &sensitive(EK_PASSWORD),
            &storage_template(),
        )
        .unwrap();
    let created = device
        .create(ek.handle, EK_PASSWORD, &sensitive(AK_PASSWORD), &signing_template())
        .unwrap();
    let (ak, ak_name) = device
        .load(ek.handle, EK_PASSWORD, &created.private, &created.public)
        .unwrap();
    assert_eq!(derive_name(&created.public).unwrap(), ak_name);
    Enrolled {
        device,
        ek,
        ak,
        ak_public: created.public,
    }
}

#[rstest]
#[case(b"")]
#[case(b"secret")]
#[case(&[0x5a; 32])]
fn test_credential_round_trip(mut enrolled: Enrolled, #[case] credential: &[u8]) {
    let name = Enrolled::kdf_name(&enrolled.ak_public);
    let (blob, secret) = enrolled
        .device
        .make_credential(enrolled.ek.handle, credential, &name)
        .unwrap();
    assert_eq!(secret.len(), 256);

    let recovered = enrolled
        .activate(AK_PASSWORD, EK_PASSWORD, &blob, &secret)
        .unwrap();
    assert_eq!(recovered, credential);
}

#[rstest]
fn test_credential_too_long(mut enrolled: Enrolled) {
    let name = Enrolled::kdf_name(&enrolled.ak_public);
    let err = enrolled
        .device
        .make_credential(enrolled.ek.handle, &[0u8; 33], &name)
        .unwrap_err();
    let expected = fmt1(TpmRcBase::Size, TpmRcIndex::Parameter(1));
    assert!(matches!(err, CliError::TpmRc(rc) if rc == expected));
}

#[rstest]
fn test_credential_bound_to_other_name(mut enrolled: Enrolled) {
    // Bound to the protector itself rather than the activating key.
    let name = enrolled.ek.name.as_bytes().to_vec();
    let (blob, secret) = enrolled
        .device
        .make_credential(enrolled.ek.handle, b"secret", &name)
        .unwrap();
    let err = enrolled
        .activate(AK_PASSWORD, EK_PASSWORD, &blob, &secret)
        .unwrap_err();
    let expected = fmt1(TpmRcBase::Integrity, TpmRcIndex::Parameter(1));
    assert!(matches!(err, CliError::TpmRc(rc) if rc == expected));
}

#[rstest]
fn test_credential_from_other_protector(mut enrolled: Enrolled) {
    let other = enrolled
        .device
        .create_primary(TpmRh::Owner.value(), b"", &sensitive(b""), &storage_template())
        .unwrap();
    let name = Enrolled::kdf_name(&enrolled.ak_public);
    let (blob, secret) = enrolled
        .device
        .make_credential(other.handle, b"secret", &name)
        .unwrap();
    let err = enrolled
        .activate(AK_PASSWORD, EK_PASSWORD, &blob, &secret)
        .unwrap_err();
    let CliError::TpmRc(rc) = err else {
        panic!("expected a TPM error, got {err}");
    };
    assert!(matches!(rc.base(), TpmRcBase::Value | TpmRcBase::Integrity));
}

#[rstest]
#[case(b"wrong", EK_PASSWORD, 1)]
#[case(AK_PASSWORD, b"wrong", 2)]
fn test_activate_wrong_password(
    mut enrolled: Enrolled,
    #[case] ak_password: &[u8],
    #[case] ek_password: &[u8],
    #[case] session: u8,
) {
    let name = Enrolled::kdf_name(&enrolled.ak_public);
    let (blob, secret) = enrolled
        .device
        .make_credential(enrolled.ek.handle, b"secret", &name)
        .unwrap();
    let err = enrolled
        .activate(ak_password, ek_password, &blob, &secret)
        .unwrap_err();
    let expected = fmt1(TpmRcBase::AuthFail, TpmRcIndex::Session(session));
    assert!(matches!(err, CliError::TpmRc(rc) if rc == expected));
}

#[rstest]
fn test_make_credential_rejects_bad_name(mut enrolled: Enrolled) {
    for name in [&[][..], &[0x00, 0x0b, 0x01][..]] {
        let err = enrolled
            .device
            .make_credential(enrolled.ek.handle, b"secret", name)
            .unwrap_err();
        assert!(matches!(err, CliError::InvalidName(_)));
    }
}

#[rstest]
fn test_read_public_name_matches_derived(mut enrolled: Enrolled) {
    let area = enrolled.device.read_public(enrolled.ak).unwrap();
    assert_eq!(area.public, enrolled.ak_public);
    let derived: TpmName = derive_name(&area.public).unwrap();
    assert_eq!(area.name, derived);
    assert_eq!(derived.as_bytes().len(), 34);
    assert_eq!(&derived.as_bytes()[..2], &[0x00, 0x0b]);
    assert_eq!(derive_name(&area.public).unwrap(), derived);
}

#[rstest]
fn test_persist_and_evict(mut enrolled: Enrolled) {
    let persistent = 0x8101_0001;
    enrolled
        .device
        .evict_control(TpmRh::Owner.value(), b"", enrolled.ak, persistent)
        .unwrap();
    enrolled.device.flush_context(enrolled.ak).unwrap();

    let area = enrolled.device.read_public(persistent).unwrap();
    assert_eq!(area.public, enrolled.ak_public);

    enrolled
        .device
        .evict_control(TpmRh::Owner.value(), b"", persistent, persistent)
        .unwrap();
    assert!(matches!(
        enrolled.device.read_public(persistent),
        Err(CliError::TpmRc(_))
    ));
}

#[rstest]
fn test_nv_read_in_chunks() {
    let index = 0x01c0_0002;
    let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let mut device = mock_device(&[(index, data.clone())]);
    assert_eq!(device.nv_read(index, b"").unwrap(), data);
}

#[rstest]
fn test_open_missing_device() {
    let err = TpmDevice::open("nosuch/path").unwrap_err();
    assert!(matches!(err, CliError::DeviceNotFound(_)));
}

#[rstest]
fn test_close_device() {
    let device = mock_device(&[]);
    device.close().unwrap();
}
