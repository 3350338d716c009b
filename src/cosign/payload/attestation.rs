//
// Copyright 2025 The Sigstore Authors.
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

//! Attestations written by `cosign attest`: an in-toto statement wrapped in
//! a DSSE envelope.
//!
//! See <https://github.com/secure-systems-lab/dsse/blob/master/envelope.md>
//! and <https://github.com/in-toto/attestation/blob/main/spec/v0.1.0/statement.md>

use base64::{engine::general_purpose::STANDARD as BASE64_STD_ENGINE, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::crypto::{CosignVerificationKey, Signature};
use crate::errors::{ImageGuardError, Result};

/// A DSSE envelope, as stored inside of an attestation layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub payload_type: String,
    /// base64 encoded statement
    pub payload: String,
    #[serde(default)]
    pub signatures: Vec<EnvelopeSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvelopeSignature {
    #[serde(default)]
    pub keyid: String,
    /// base64 encoded signature over the PAE of the envelope
    pub sig: String,
}

/// Pre-Authentication Encoding of a DSSE payload.
///
/// Format: `"DSSEv1 <type_len> <type> <payload_len> <payload>"`
pub fn pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut pae = format!("DSSEv1 {} {} ", payload_type.len(), payload_type).into_bytes();
    pae.extend_from_slice(format!("{} ", payload.len()).as_bytes());
    pae.extend_from_slice(payload);

    pae
}

impl Envelope {
    /// Parse the envelope stored in a layer.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| ImageGuardError::MalformedEnvelope(format!("invalid envelope: {e}")))
    }

    /// The raw statement carried by the envelope.
    pub fn decoded_payload(&self) -> Result<Vec<u8>> {
        BASE64_STD_ENGINE
            .decode(self.payload.as_bytes())
            .map_err(|e| ImageGuardError::MalformedEnvelope(format!("invalid payload: {e}")))
    }

    /// Decode the in-toto statement carried by the envelope.
    pub fn statement(&self) -> Result<Statement> {
        let payload = self.decoded_payload()?;
        serde_json::from_slice(&payload)
            .map_err(|e| ImageGuardError::MalformedEnvelope(format!("invalid statement: {e}")))
    }

    /// Checks whether one of the envelope signatures has been produced by
    /// the given key.
    pub fn is_signed_by_key(&self, verification_key: &CosignVerificationKey) -> bool {
        let payload = match self.decoded_payload() {
            Ok(payload) => payload,
            Err(e) => {
                debug!(error = ?e, "Cannot decode envelope payload");
                return false;
            }
        };
        let message = pae(&self.payload_type, &payload);

        self.signatures.iter().any(|signature| {
            match verification_key
                .verify_signature(Signature::Base64Encoded(signature.sig.as_bytes()), &message)
            {
                Ok(_) => true,
                Err(e) => {
                    debug!(keyid = signature.keyid.as_str(), reason = ?e, "Cannot verify envelope signature with the given key");
                    false
                }
            }
        })
    }
}

/// An in-toto statement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Statement {
    #[serde(rename = "_type")]
    pub statement_type: String,

    #[serde(rename = "predicateType")]
    pub predicate_type: String,

    #[serde(default)]
    pub subject: Vec<Subject>,

    #[serde(default)]
    pub predicate: serde_json::Value,
}

/// An artifact the statement is about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subject {
    pub name: String,

    /// algorithm -> hex-encoded digest
    pub digest: HashMap<String, String>,
}

impl Statement {
    /// Checks whether one of the subjects is the given image digest
    /// (`<algorithm>:<hex>`).
    pub fn has_subject_digest(&self, image_digest: &str) -> bool {
        let Some((algorithm, hex)) = image_digest.split_once(':') else {
            return false;
        };
        self.subject
            .iter()
            .any(|s| s.digest.get(algorithm).is_some_and(|d| d == hex))
    }
}
