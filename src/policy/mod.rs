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

//! Declarative policy model, as authored by cluster administrators.
//!
//! All the types can be deserialized from the JSON (or YAML converted to
//! JSON) representation of a policy. Field names are camelCase.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A policy: an ordered list of rules and the way they are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub name: String,
    #[serde(default)]
    pub apply_rules: ApplyRules,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// How the rules of a policy are applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyRules {
    /// Every rule is evaluated.
    #[default]
    All,
    /// Evaluation stops at the first rule that applies.
    One,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub name: String,
    /// Data made available to variables, loaded only when an image of the
    /// resource is matched by the rule.
    #[serde(default)]
    pub context: Vec<ContextEntry>,
    #[serde(default)]
    pub verify_images: Vec<ImageVerification>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<VariableEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMapReference {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

/// A variable defined either by a literal value or by a path into the
/// context, with an optional fallback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn default_true() -> bool {
    true
}

/// The trust requirements of the images matching a set of patterns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageVerification {
    /// Deprecated single image pattern, use `image_references`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Image patterns, `*` and `?` are wildcards.
    #[serde(default)]
    pub image_references: Vec<String>,
    /// Deprecated single public key, use `attestors`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Trust sources of the image signatures. All the sets must be
    /// satisfied.
    #[serde(default)]
    pub attestors: Vec<AttestorSet>,
    #[serde(default)]
    pub attestations: Vec<Attestation>,
    /// Replace tags with digests once the image is verified.
    #[serde(default = "default_true")]
    pub mutate_digest: bool,
    /// Require images to be referenced by digest.
    #[serde(default = "default_true")]
    pub verify_digest: bool,
}

impl Default for ImageVerification {
    fn default() -> Self {
        ImageVerification {
            image: None,
            image_references: Vec::new(),
            key: None,
            attestors: Vec::new(),
            attestations: Vec::new(),
            mutate_digest: true,
            verify_digest: true,
        }
    }
}

impl ImageVerification {
    /// Rewrite the deprecated `image` and `key` fields into
    /// `image_references` and `attestors`. Attestations declaring no
    /// attestor of their own inherit the image ones.
    pub fn normalized(&self) -> ImageVerification {
        let mut iv = self.clone();

        if let Some(image) = iv.image.take() {
            if !iv.image_references.contains(&image) {
                iv.image_references.push(image);
            }
        }

        if let Some(key) = iv.key.take() {
            iv.attestors.push(AttestorSet {
                count: None,
                entries: vec![Attestor {
                    keys: Some(StaticKeyAttestor {
                        public_keys: key,
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
            });
        }

        for attestation in iv.attestations.iter_mut() {
            if attestation.attestors.is_empty() {
                attestation.attestors = iv.attestors.clone();
            }
        }

        iv
    }
}

/// A set of attestors and how many of them must be satisfied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestorSet {
    /// Minimum number of entries that must be satisfied. Unset or `0`
    /// means all of them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default)]
    pub entries: Vec<Attestor>,
}

/// One trust source. Exactly one of the fields is expected to be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<StaticKeyAttestor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificates: Option<CertificateAttestor>,
    /// A nested set of attestors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestor: Option<Box<AttestorSet>>,
    /// Name of an attestor set registered on the verifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestor_ref: Option<String>,
}

/// Public keys given inline, through a secret or through a KMS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticKeyAttestor {
    /// One or more concatenated PEM encoded public keys.
    #[serde(default)]
    pub public_keys: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretReference>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kms: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretReference {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

/// A PEM encoded certificate whose public key verifies the signatures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateAttestor {
    pub cert: String,
}

/// A signed in-toto statement the image must carry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    pub predicate_type: String,
    #[serde(default)]
    pub attestors: Vec<AttestorSet>,
    /// Every block must hold for the predicate to be accepted.
    #[serde(default)]
    pub conditions: Vec<AnyAllConditions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnyAllConditions {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub all: Vec<Condition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub key: Value,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}
