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

use sha2::{Digest, Sha256};
use std::fmt;
use tracing::debug;

use super::payload::{Envelope, SimpleSigning};
use crate::crypto::{CosignVerificationKey, Signature};
use crate::errors::{ImageGuardError, Result};

/// A layer of a cosign signature or attestation object.
///
/// The information needed to build a SignatureLayer are spread over
/// two places:
///   * the descriptor inside of the manifest of the cosign object, holding
///     the signature annotation
///   * the layer data, holding the signed payload
///
/// Nothing stored here is trusted until it has been checked against a key.
#[derive(Clone, Debug)]
pub struct SignatureLayer {
    /// sha256 digest of the payload
    pub oci_digest: String,
    payload: Vec<u8>,
    signature: Option<String>,
}

impl fmt::Display for SignatureLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SignatureLayer(digest: {}, signature: {:?})",
            self.oci_digest, self.signature
        )
    }
}

impl SignatureLayer {
    /// Build a layer from its raw data and the base64 signature found in the
    /// descriptor annotations, if any.
    pub fn new(payload: Vec<u8>, signature: Option<String>) -> Self {
        let oci_digest = format!("sha256:{}", hex::encode(Sha256::digest(&payload)));
        SignatureLayer {
            oci_digest,
            payload,
            signature,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the layer as a simple-signing payload.
    pub fn simple_signing(&self) -> Result<SimpleSigning> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Decode the layer as a DSSE envelope.
    pub fn envelope(&self) -> Result<Envelope> {
        Envelope::from_slice(&self.payload)
    }

    /// Given a public key, check whether the signature annotation of the
    /// layer has been produced by it over the layer payload.
    pub fn is_signed_by_key(&self, verification_key: &CosignVerificationKey) -> bool {
        let Some(signature) = self.signature.as_deref() else {
            debug!(
                digest = self.oci_digest.as_str(),
                error = %ImageGuardError::SignatureAnnotationNotFoundError,
                "Layer cannot be verified"
            );
            return false;
        };

        match verification_key
            .verify_signature(Signature::Base64Encoded(signature.as_bytes()), &self.payload)
        {
            Ok(_) => true,
            Err(e) => {
                debug!(signature, reason = ?e, "Cannot verify signature with the given key");
                false
            }
        }
    }

    /// A simple-signing layer counts only when it is signed by the key and
    /// signs `manifest_digest`.
    pub fn signs_manifest_digest(
        &self,
        verification_key: &CosignVerificationKey,
        manifest_digest: &str,
    ) -> bool {
        if !self.is_signed_by_key(verification_key) {
            return false;
        }
        match self.simple_signing() {
            Ok(ss) if ss.satisfies_manifest_digest(manifest_digest) => true,
            Ok(ss) => {
                debug!(
                    expected = manifest_digest,
                    found = ss.critical.image.docker_manifest_digest.as_str(),
                    "Signed payload refers to another image"
                );
                false
            }
            Err(e) => {
                debug!(error = ?e, "Signed layer is not a simple signing payload");
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cosign::constants::IN_TOTO_PAYLOAD_TYPE;
    use crate::cosign::payload::{attestation::pae, EnvelopeSignature};
    use crate::crypto::tests::{generate_p256_key, sign_p256};
    use base64::{engine::general_purpose::STANDARD as BASE64_STD_ENGINE, Engine as _};
    use p256::ecdsa::SigningKey;

    const DIGEST: &str = "sha256:b31bfb4d0213f254d361e0079deaaebefa4f82ba7aa76ef82e90b4935ad5b105";

    /// A simple-signing layer over `digest`, signed by `signing_key`.
    pub(crate) fn signed_layer(signing_key: &SigningKey, repository: &str, digest: &str) -> SignatureLayer {
        let payload = serde_json::to_vec(&SimpleSigning::new(repository, digest)).unwrap();
        let signature = sign_p256(signing_key, &payload);
        SignatureLayer::new(payload, Some(signature))
    }

    /// An attestation layer carrying `statement`, signed by `signing_key`.
    pub(crate) fn attestation_layer(
        signing_key: &SigningKey,
        statement: &serde_json::Value,
    ) -> SignatureLayer {
        let body = statement.to_string();
        let envelope = Envelope {
            payload_type: IN_TOTO_PAYLOAD_TYPE.to_string(),
            payload: BASE64_STD_ENGINE.encode(body.as_bytes()),
            signatures: vec![EnvelopeSignature {
                keyid: String::new(),
                sig: sign_p256(signing_key, &pae(IN_TOTO_PAYLOAD_TYPE, body.as_bytes())),
            }],
        };
        SignatureLayer::new(serde_json::to_vec(&envelope).unwrap(), None)
    }

    #[test]
    fn verify_with_key() {
        let (signing_key, pem) = generate_p256_key();
        let key = CosignVerificationKey::try_from_pem(pem.as_bytes()).unwrap();
        let layer = signed_layer(&signing_key, "ghcr.io/foo/bar", DIGEST);

        assert!(layer.is_signed_by_key(&key));
        assert!(layer.signs_manifest_digest(&key, DIGEST));
        assert!(!layer.signs_manifest_digest(&key, "sha256:0000"));
    }

    #[test]
    fn is_signed_by_key_fails_when_signature_is_not_valid() {
        let (signing_key, _) = generate_p256_key();
        let (_, other_pem) = generate_p256_key();
        let other = CosignVerificationKey::try_from_pem(other_pem.as_bytes()).unwrap();
        let layer = signed_layer(&signing_key, "ghcr.io/foo/bar", DIGEST);

        assert!(!layer.is_signed_by_key(&other));
    }

    #[test]
    fn layer_without_signature_annotation() {
        let (_, pem) = generate_p256_key();
        let key = CosignVerificationKey::try_from_pem(pem.as_bytes()).unwrap();
        let layer = SignatureLayer::new(b"{}".to_vec(), None);

        assert!(!layer.is_signed_by_key(&key));
    }

    #[test]
    fn digest_of_payload() {
        let layer = SignatureLayer::new(b"hello".to_vec(), None);
        assert_eq!(
            layer.oci_digest,
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
