//! Debug signing identity: a fresh RSA keypair and a self-signed
//! X.509 v3 certificate.

use crate::sign::{SignError, SignResult};
use der::asn1::{BitString, OctetString, SetOfVec, UtcTime};
use der::{Any, Decode, Encode, Tag};
use rand::Rng;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::EncodePublicKey;
use rsa::signature::{SignatureEncoding, Signer};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::certificate::{Certificate, TbsCertificate, Version};
use x509_cert::ext::pkix::{BasicConstraints, KeyUsage, KeyUsages};
use x509_cert::ext::Extension;
use x509_cert::name::{Name, RdnSequence, RelativeDistinguishedName};
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::{AlgorithmIdentifierOwned, ObjectIdentifier, SubjectPublicKeyInfoOwned};
use x509_cert::time::{Time, Validity};

const RSA_KEY_BITS: usize = 2048;
const VALIDITY_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const OID_ORGANIZATION: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
const OID_BASIC_CONSTRAINTS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.19");
const OID_KEY_USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.15");

pub(crate) const OID_SHA256_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
pub(crate) const OID_SHA256: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
pub(crate) const OID_RSA_ENCRYPTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");

const SUBJECT_COMMON_NAME: &str = "APK Debug Key";
const SUBJECT_ORGANIZATION: &str = "Debug";

/// Keypair plus self-signed certificate used for the re-sign.
pub struct SigningIdentity {
    pub private_key: RsaPrivateKey,
    pub public_key: RsaPublicKey,
    pub certificate: Certificate,
}

impl SigningIdentity {
    /// Generate a fresh 2048-bit identity. Key generation dominates the
    /// cost of the whole signing pass.
    pub fn generate() -> SignResult<Self> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|err| SignError::KeyGeneration(err.to_string()))?;
        let public_key = private_key.to_public_key();

        let mut serial = [0u8; 8];
        rng.fill(&mut serial);
        serial[0] &= 0x7F; // keep the serial positive

        let certificate = build_certificate(&private_key, &public_key, &serial)?;
        Ok(SigningIdentity {
            private_key,
            public_key,
            certificate,
        })
    }
}

/// `CN=APK Debug Key, O=Debug`, used for both issuer and subject.
pub(crate) fn debug_key_name() -> SignResult<Name> {
    Ok(RdnSequence(vec![
        dn_component(OID_COMMON_NAME, SUBJECT_COMMON_NAME)?,
        dn_component(OID_ORGANIZATION, SUBJECT_ORGANIZATION)?,
    ]))
}

fn dn_component(oid: ObjectIdentifier, text: &str) -> SignResult<RelativeDistinguishedName> {
    let value = Any::new(Tag::Utf8String, text.as_bytes().to_vec())?;
    let set = SetOfVec::try_from(vec![AttributeTypeAndValue { oid, value }])?;
    Ok(RelativeDistinguishedName(set))
}

pub(crate) fn sha256_with_rsa() -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid: OID_SHA256_WITH_RSA,
        parameters: Some(Any::null()),
    }
}

fn build_certificate(
    private_key: &RsaPrivateKey,
    public_key: &RsaPublicKey,
    serial: &[u8],
) -> SignResult<Certificate> {
    let name = debug_key_name()?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| SignError::Certificate(err.to_string()))?;
    let validity = Validity {
        not_before: Time::UtcTime(UtcTime::from_unix_duration(now)?),
        not_after: Time::UtcTime(UtcTime::from_unix_duration(
            now + Duration::from_secs(VALIDITY_SECONDS),
        )?),
    };

    let spki_der = public_key
        .to_public_key_der()
        .map_err(|err| SignError::Certificate(err.to_string()))?;
    let subject_public_key_info = SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes())?;

    let basic_constraints = BasicConstraints {
        ca: false,
        path_len_constraint: None,
    };
    let key_usage = KeyUsage(KeyUsages::DigitalSignature.into());
    let extensions = vec![
        Extension {
            extn_id: OID_BASIC_CONSTRAINTS,
            critical: true,
            extn_value: OctetString::new(basic_constraints.to_der()?)?,
        },
        Extension {
            extn_id: OID_KEY_USAGE,
            critical: true,
            extn_value: OctetString::new(key_usage.to_der()?)?,
        },
    ];

    let tbs_certificate = TbsCertificate {
        version: Version::V3,
        serial_number: SerialNumber::new(serial)?,
        signature: sha256_with_rsa(),
        issuer: name.clone(),
        validity,
        subject: name,
        subject_public_key_info,
        issuer_unique_id: None,
        subject_unique_id: None,
        extensions: Some(extensions),
    };

    let tbs_der = tbs_certificate.to_der()?;
    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let signature = signing_key
        .try_sign(&tbs_der)
        .map_err(|err| SignError::Signature(err.to_string()))?;

    Ok(Certificate {
        tbs_certificate,
        signature_algorithm: sha256_with_rsa(),
        signature: BitString::from_bytes(&signature.to_vec())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1v15::{Signature, VerifyingKey};
    use rsa::signature::Verifier;
    use rsa::traits::PublicKeyParts;

    #[test]
    fn generates_self_signed_debug_certificate() {
        let identity = SigningIdentity::generate().expect("generate identity");
        assert_eq!(identity.public_key.size() * 8, RSA_KEY_BITS);

        let tbs = &identity.certificate.tbs_certificate;
        assert_eq!(tbs.version, Version::V3);
        assert_eq!(tbs.issuer, tbs.subject);
        assert_eq!(tbs.signature.oid, OID_SHA256_WITH_RSA);
        assert!(tbs.serial_number.as_bytes().len() <= 8);

        let extensions = tbs.extensions.as_ref().expect("extensions");
        assert_eq!(extensions.len(), 2);
        assert_eq!(extensions[0].extn_id, OID_BASIC_CONSTRAINTS);
        assert!(extensions[0].critical);
        assert_eq!(extensions[1].extn_id, OID_KEY_USAGE);
        assert!(extensions[1].critical);

        // Self-signature verifies under the embedded public key.
        let tbs_der = tbs.to_der().unwrap();
        let signature_bytes = identity
            .certificate
            .signature
            .as_bytes()
            .expect("signature bits");
        let verifying_key = VerifyingKey::<Sha256>::new(identity.public_key.clone());
        let signature = Signature::try_from(signature_bytes).expect("signature shape");
        verifying_key
            .verify(&tbs_der, &signature)
            .expect("self-signature verifies");
    }
}
