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

//! Container signature format written by `cosign sign`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

pub(crate) const COSIGN_SIGNATURE_TYPE: &str = "cosign container image signature";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SimpleSigning {
    pub critical: Critical,
    #[serde(default)]
    pub optional: Option<Optional>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Critical {
    #[serde(rename = "type")]
    pub type_name: String,
    pub image: Image,
    pub identity: Identity,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Image {
    pub docker_manifest_digest: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Identity {
    pub docker_reference: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Optional {
    pub creator: Option<String>,
    pub timestamp: Option<i64>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl SimpleSigning {
    /// Payload that signs `manifest_digest` for the repository
    /// `docker_reference`.
    pub fn new(docker_reference: &str, manifest_digest: &str) -> Self {
        SimpleSigning {
            critical: Critical {
                type_name: COSIGN_SIGNATURE_TYPE.to_string(),
                image: Image {
                    docker_manifest_digest: manifest_digest.to_string(),
                },
                identity: Identity {
                    docker_reference: docker_reference.to_string(),
                },
            },
            optional: None,
        }
    }

    /// Checks whether the payload refers to the given manifest digest.
    pub fn satisfies_manifest_digest(&self, manifest_digest: &str) -> bool {
        self.critical.image.docker_manifest_digest == manifest_digest
    }
}

impl fmt::Display for SimpleSigning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pretty = serde_json::to_string_pretty(self).map_err(|_| fmt::Error)?;
        write!(f, "{pretty}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_cosign_payload() {
        let raw = r#"{
            "critical": {
                "identity": {"docker-reference": "ghcr.io/kyverno/test-verify-image"},
                "image": {"docker-manifest-digest": "sha256:b31bfb4d0213f254d361e0079deaaebefa4f82ba7aa76ef82e90b4935ad5b105"},
                "type": "cosign container image signature"
            },
            "optional": null
        }"#;
        let ss: SimpleSigning = serde_json::from_str(raw).expect("cannot parse payload");

        assert!(ss.satisfies_manifest_digest(
            "sha256:b31bfb4d0213f254d361e0079deaaebefa4f82ba7aa76ef82e90b4935ad5b105"
        ));
        assert!(!ss.satisfies_manifest_digest("sha256:0000"));
        assert_eq!(
            ss.critical.identity.docker_reference,
            "ghcr.io/kyverno/test-verify-image"
        );
    }

    #[test]
    fn optional_section_keeps_extra_fields() {
        let raw = r#"{
            "critical": {
                "identity": {"docker-reference": "registry/repo"},
                "image": {"docker-manifest-digest": "sha256:1234"},
                "type": "cosign container image signature"
            },
            "optional": {"creator": "ci", "env": "prod"}
        }"#;
        let ss: SimpleSigning = serde_json::from_str(raw).unwrap();
        let optional = ss.optional.unwrap();
        assert_eq!(optional.creator.as_deref(), Some("ci"));
        assert_eq!(optional.extra.get("env"), Some(&Value::from("prod")));
    }
}
