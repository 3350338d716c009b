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

//! Structures and helpers required to perform cryptographic operations.

use crate::errors::*;

pub mod verification_key;
pub use verification_key::CosignVerificationKey;

/// A signature produced by a private key
pub enum Signature<'a> {
    /// Raw signature. There's no need to process the contents
    Raw(&'a [u8]),
    /// A base64 encoded signature
    Base64Encoded(&'a [u8]),
}

/// Split a field holding one or more concatenated PEM blocks into one
/// PEM string per block, preserving their order.
///
/// Whitespace around and between the blocks is ignored. A blank field
/// yields an empty list.
pub fn split_pem_keys(data: &str) -> Result<Vec<String>> {
    if data.trim().is_empty() {
        return Ok(Vec::new());
    }

    let blocks = pem::parse_many(data.as_bytes())?;
    if blocks.is_empty() {
        return Err(ImageGuardError::InvalidKeyFormat {
            error: "no PEM block found".to_string(),
        });
    }

    Ok(blocks
        .iter()
        .map(|block| {
            pem::encode_config(
                block,
                pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
            )
        })
        .collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use base64::{engine::general_purpose::STANDARD as BASE64_STD_ENGINE, Engine as _};
    use p256::ecdsa::{signature::Signer, SigningKey};
    use p256::pkcs8::{EncodePublicKey, LineEnding};

    use super::*;

    /// Generate a fresh P-256 key, returning the signing half and the PEM
    /// encoded public key.
    pub(crate) fn generate_p256_key() -> (SigningKey, String) {
        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        let pem = signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("cannot encode public key");
        (signing_key, pem)
    }

    /// Sign `msg`, returning the base64 encoding of the DER signature, the
    /// format used by cosign.
    pub(crate) fn sign_p256(signing_key: &SigningKey, msg: &[u8]) -> String {
        let sig: p256::ecdsa::Signature = signing_key.sign(msg);
        BASE64_STD_ENGINE.encode(sig.to_der().as_bytes())
    }

    #[test]
    fn split_single_key() {
        let (_, pem) = generate_p256_key();
        let keys = split_pem_keys(&pem).unwrap();
        assert_eq!(keys.len(), 1);
        CosignVerificationKey::try_from_pem(keys[0].as_bytes()).expect("key should parse");
    }

    #[test]
    fn split_concatenated_keys_preserves_order() {
        let (_, first) = generate_p256_key();
        let (_, second) = generate_p256_key();
        let (_, third) = generate_p256_key();
        let bundle = format!("{first}{second}\n{third}");

        let keys = split_pem_keys(&bundle).unwrap();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys[0].trim(), first.trim());
        assert_eq!(keys[1].trim(), second.trim());
        assert_eq!(keys[2].trim(), third.trim());
    }

    #[test]
    fn split_blank_field() {
        assert!(split_pem_keys("").unwrap().is_empty());
        assert!(split_pem_keys("  \n ").unwrap().is_empty());
    }

    #[test]
    fn split_garbage() {
        assert!(split_pem_keys("this is not a key").is_err());
    }
}
