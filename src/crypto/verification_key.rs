//
// Copyright 2021 The Sigstore Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use base64::{engine::general_purpose::STANDARD as BASE64_STD_ENGINE, Engine as _};
use pkcs8::DecodePublicKey;
use rsa::pkcs1v15;
use sha2::{Digest, Sha256, Sha384};
use signature::{DigestVerifier, Verifier};
use x509_cert::der::{Decode, Encode};

use super::Signature;
use crate::errors::*;

/// A key that can be used to verify signatures.
///
/// The verification algorithm is derived from the type of the public key:
///
///   * `EC public key with P-256 curve`: ECDSA, ASN.1 DER-encoded signatures, SHA-256
///   * `EC public key with P-384 curve`: ECDSA, ASN.1 DER-encoded signatures, SHA-384
///   * `Ed25519 public key`: Ed25519
///   * `RSA public key`: PKCS1 v1.5 padding, SHA-256
#[allow(non_camel_case_types)]
#[derive(Debug, Clone)]
pub enum CosignVerificationKey {
    RSA_PKCS1_SHA256(pkcs1v15::VerifyingKey<sha2::Sha256>),
    ECDSA_P256_SHA256_ASN1(ecdsa::VerifyingKey<p256::NistP256>),
    ECDSA_P384_SHA384_ASN1(ecdsa::VerifyingKey<p384::NistP384>),
    ED25519(ed25519_dalek::VerifyingKey),
}

impl CosignVerificationKey {
    /// Builds a [`CosignVerificationKey`] from DER-encoded public key data.
    pub fn try_from_der(der_data: &[u8]) -> Result<Self> {
        if let Ok(p256vk) = ecdsa::VerifyingKey::<p256::NistP256>::from_public_key_der(der_data) {
            Ok(Self::ECDSA_P256_SHA256_ASN1(p256vk))
        } else if let Ok(p384vk) =
            ecdsa::VerifyingKey::<p384::NistP384>::from_public_key_der(der_data)
        {
            Ok(Self::ECDSA_P384_SHA384_ASN1(p384vk))
        } else if let Ok(ed25519bytes) =
            ed25519::pkcs8::PublicKeyBytes::from_public_key_der(der_data)
        {
            Ok(Self::ED25519(
                ed25519_dalek::VerifyingKey::from_bytes(ed25519bytes.as_ref()).map_err(|e| {
                    ImageGuardError::InvalidKeyFormat {
                        error: format!("invalid Ed25519 public key: {e}"),
                    }
                })?,
            ))
        } else if let Ok(rsapk) = rsa::RsaPublicKey::from_public_key_der(der_data) {
            Ok(Self::RSA_PKCS1_SHA256(pkcs1v15::VerifyingKey::new(rsapk)))
        } else {
            Err(ImageGuardError::InvalidKeyFormat {
                error: "Failed to parse the public key.".to_string(),
            })
        }
    }

    /// Builds a [`CosignVerificationKey`] from a single PEM-encoded public key.
    pub fn try_from_pem(pem_data: &[u8]) -> Result<Self> {
        let key_pem = pem::parse(pem_data)?;
        if key_pem.tag() != "PUBLIC KEY" {
            return Err(ImageGuardError::InvalidKeyFormat {
                error: format!("expected a PUBLIC KEY PEM block, found {}", key_pem.tag()),
            });
        }
        Self::try_from_der(key_pem.contents())
    }

    /// Builds a [`CosignVerificationKey`] from the subject public key of a
    /// PEM-encoded x509 certificate.
    ///
    /// Only the leaf certificate is looked at, the chain is not validated.
    pub fn try_from_certificate_pem(cert_pem: &[u8]) -> Result<Self> {
        let pem = pem::parse(cert_pem)?;
        if pem.tag() != "CERTIFICATE" {
            return Err(ImageGuardError::InvalidKeyFormat {
                error: format!("expected a CERTIFICATE PEM block, found {}", pem.tag()),
            });
        }
        let cert = x509_cert::Certificate::from_der(pem.contents())?;
        let spki_der = cert.tbs_certificate.subject_public_key_info.to_der()?;
        Self::try_from_der(&spki_der)
    }

    /// Verify the signature provided has been actually generated by the given key
    /// when signing the provided message.
    pub fn verify_signature(&self, signature: Signature, msg: &[u8]) -> Result<()> {
        let sig = match signature {
            Signature::Raw(data) => data.to_owned(),
            Signature::Base64Encoded(data) => BASE64_STD_ENGINE.decode(data)?,
        };

        match self {
            CosignVerificationKey::RSA_PKCS1_SHA256(inner) => {
                let sig = pkcs1v15::Signature::try_from(sig.as_slice())?;
                inner
                    .verify(msg, &sig)
                    .map_err(|_| ImageGuardError::PublicKeyVerificationError)
            }
            // ECDSA signatures are encoded in der.
            CosignVerificationKey::ECDSA_P256_SHA256_ASN1(inner) => {
                let mut hasher = Sha256::new();
                Digest::update(&mut hasher, msg);
                let sig = ecdsa::Signature::<p256::NistP256>::from_der(&sig)?;
                inner
                    .verify_digest(hasher, &sig)
                    .map_err(|_| ImageGuardError::PublicKeyVerificationError)
            }
            CosignVerificationKey::ECDSA_P384_SHA384_ASN1(inner) => {
                let mut hasher = Sha384::new();
                Digest::update(&mut hasher, msg);
                let sig = ecdsa::Signature::<p384::NistP384>::from_der(&sig)?;
                inner
                    .verify_digest(hasher, &sig)
                    .map_err(|_| ImageGuardError::PublicKeyVerificationError)
            }
            CosignVerificationKey::ED25519(inner) => {
                let sig = ed25519::Signature::from_slice(sig.as_slice())
                    .map_err(|_| ImageGuardError::PublicKeyVerificationError)?;
                inner
                    .verify(msg, &sig)
                    .map_err(|_| ImageGuardError::PublicKeyVerificationError)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::{generate_p256_key, sign_p256};

    const EC_P256_PUBLIC_KEY: &str = r#"-----BEGIN PUBLIC KEY-----
MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAE8nXRh950IZbRj8Ra/N9sbqOPZrfM
5/KAQN0/KjHcorm/J5yctVd7iEcnessRQjU917hmKO6JWVGHpDguIyakZA==
-----END PUBLIC KEY-----"#;

    #[test]
    fn parse_p256_public_key() {
        let key = CosignVerificationKey::try_from_pem(EC_P256_PUBLIC_KEY.as_bytes())
            .expect("cannot parse key");
        assert!(matches!(
            key,
            CosignVerificationKey::ECDSA_P256_SHA256_ASN1(_)
        ));
    }

    #[test]
    fn reject_non_public_key_pem() {
        let not_a_key = "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----";
        let err = CosignVerificationKey::try_from_pem(not_a_key.as_bytes())
            .expect_err("should not accept a certificate");
        assert!(matches!(err, ImageGuardError::InvalidKeyFormat { .. }));
    }

    #[test]
    fn verify_p256_signature() {
        let (signing_key, pem) = generate_p256_key();
        let key = CosignVerificationKey::try_from_pem(pem.as_bytes()).unwrap();
        let msg = b"hello world";
        let sig = sign_p256(&signing_key, msg);

        key.verify_signature(Signature::Base64Encoded(sig.as_bytes()), msg)
            .expect("signature should verify");

        let err = key
            .verify_signature(Signature::Base64Encoded(sig.as_bytes()), b"tampered")
            .expect_err("tampered message should not verify");
        assert!(matches!(err, ImageGuardError::PublicKeyVerificationError));
    }

    #[test]
    fn signature_from_other_key_does_not_verify() {
        let (signing_key, _) = generate_p256_key();
        let (_, other_pem) = generate_p256_key();
        let other = CosignVerificationKey::try_from_pem(other_pem.as_bytes()).unwrap();
        let sig = sign_p256(&signing_key, b"payload");

        assert!(other
            .verify_signature(Signature::Base64Encoded(sig.as_bytes()), b"payload")
            .is_err());
    }
}
