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

//! Verification of the leaves of a trust tree against the cosign objects
//! stored next to an image.

use async_trait::async_trait;
use tokio::sync::{OnceCell, Semaphore};
use tracing::debug;

use super::conditions::Conditions;
use super::keys::{verification_key, KeyStore};
use super::threshold::{LeafResult, LeafVerifier};
use super::trust_tree::LeafAttestor;
use crate::context::VariableContext;
use crate::cosign::SignatureLayer;
use crate::errors::{ImageGuardError, Result};
use crate::registry::{OciReference, RegistryTransport};

/// Collaborators shared by every check of an evaluation.
pub(crate) struct Executor<'a> {
    pub transport: &'a dyn RegistryTransport,
    pub key_store: Option<&'a dyn KeyStore>,
    /// Bounds the number of concurrent registry requests.
    pub limiter: &'a Semaphore,
}

impl Executor<'_> {
    pub async fn resolve_digest(&self, image: &OciReference) -> Result<String> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| ImageGuardError::Cancelled)?;
        self.transport.resolve_digest(image).await
    }
}

/// What the leaves of a tree are checked against.
pub(crate) enum Check<'a> {
    /// A simple-signing signature of the image.
    Signature,
    /// A signed in-toto statement about the image.
    Attestation {
        predicate_type: &'a str,
        conditions: &'a Conditions,
        context: &'a dyn VariableContext,
    },
}

/// Checks the leaves of one trust tree for one image digest.
///
/// The cosign objects are fetched once, by the first leaf needing them.
pub(crate) struct ImageCheck<'a> {
    executor: &'a Executor<'a>,
    image: &'a OciReference,
    digest: &'a str,
    check: Check<'a>,
    layers: OnceCell<Vec<SignatureLayer>>,
}

impl<'a> ImageCheck<'a> {
    pub fn new(
        executor: &'a Executor<'a>,
        image: &'a OciReference,
        digest: &'a str,
        check: Check<'a>,
    ) -> Self {
        ImageCheck {
            executor,
            image,
            digest,
            check,
            layers: OnceCell::new(),
        }
    }

    async fn layers(&self) -> Result<&Vec<SignatureLayer>> {
        self.layers
            .get_or_try_init(|| async {
                let _permit = self
                    .executor
                    .limiter
                    .acquire()
                    .await
                    .map_err(|_| ImageGuardError::Cancelled)?;
                let transport = self.executor.transport;
                let layers = match self.check {
                    Check::Signature => transport.fetch_signatures(self.image, self.digest).await?,
                    Check::Attestation { .. } => {
                        transport.fetch_attestations(self.image, self.digest).await?
                    }
                };
                debug!(image = %self.image, digest = self.digest, layers = layers.len(), "fetched cosign layers");
                Ok(layers)
            })
            .await
    }

    async fn check_leaf(&self, leaf: &LeafAttestor) -> Result<bool> {
        let key = verification_key(&leaf.source, self.executor.key_store).await?;
        let layers = self.layers().await?;

        match &self.check {
            Check::Signature => Ok(layers
                .iter()
                .any(|layer| layer.signs_manifest_digest(&key, self.digest))),
            Check::Attestation {
                predicate_type,
                conditions,
                context,
            } => {
                for layer in layers {
                    let envelope = match layer.envelope() {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            debug!(digest = layer.oci_digest.as_str(), error = ?e, "Skipping attestation layer");
                            continue;
                        }
                    };
                    if !envelope.is_signed_by_key(&key) {
                        continue;
                    }
                    let statement = match envelope.statement() {
                        Ok(statement) => statement,
                        Err(e) => {
                            debug!(error = ?e, "Skipping signed attestation");
                            continue;
                        }
                    };
                    if statement.predicate_type != *predicate_type {
                        debug!(
                            found = statement.predicate_type.as_str(),
                            expected = *predicate_type,
                            "predicate type does not match"
                        );
                        continue;
                    }
                    if !statement.has_subject_digest(self.digest) {
                        debug!(digest = self.digest, "attestation is about another image");
                        continue;
                    }
                    if conditions.evaluate(&statement.predicate, *context)? {
                        return Ok(true);
                    }
                    debug!(predicate_type = *predicate_type, "predicate does not satisfy the conditions");
                }
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl LeafVerifier for ImageCheck<'_> {
    async fn verify_leaf(&self, leaf: &LeafAttestor) -> Result<LeafResult> {
        let attestor = leaf.to_string();
        match self.check_leaf(leaf).await {
            Ok(verified) => Ok(LeafResult {
                attestor,
                verified,
                error: None,
            }),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => Ok(LeafResult {
                attestor,
                verified: false,
                error: Some(e.to_string()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JsonContext;
    use crate::cosign::{attestation_layer, signed_layer};
    use crate::crypto::tests::generate_p256_key;
    use crate::errors::ErrorKind;
    use crate::policy::{AnyAllConditions, Condition};
    use crate::registry::StaticTransport;
    use crate::verify::trust_tree::KeySource;
    use serde_json::json;

    const IMAGE: &str = "ghcr.io/kyverno/test-verify-image:signed";
    const DIGEST: &str = "sha256:b31bfb4d0213f254d361e0079deaaebefa4f82ba7aa76ef82e90b4935ad5b105";
    const PREDICATE_TYPE: &str = "https://example.com/CodeReview/v1";

    fn leaf(pem: &str) -> LeafAttestor {
        LeafAttestor {
            source: KeySource::StaticKey(pem.to_string()),
        }
    }

    fn statement(digest_hex: &str, branch: &str) -> serde_json::Value {
        json!({
            "_type": "https://in-toto.io/Statement/v0.1",
            "predicateType": PREDICATE_TYPE,
            "subject": [{"name": "ghcr.io/kyverno/test-verify-image", "digest": {"sha256": digest_hex}}],
            "predicate": {"repo": {"uri": "https://github.com/example/my-project", "branch": branch}}
        })
    }

    fn branch_is_main() -> Conditions {
        Conditions::compile(&[AnyAllConditions {
            all: vec![Condition {
                key: json!("{{ repo.branch }}"),
                operator: "Equals".to_string(),
                value: json!("main"),
            }],
            any: vec![],
        }])
        .unwrap()
    }

    #[tokio::test]
    async fn signature_leaves() {
        let (signing_key, pem) = generate_p256_key();
        let (_, other_pem) = generate_p256_key();
        let transport = StaticTransport::new()
            .with_signature(IMAGE, DIGEST, signed_layer(&signing_key, "ghcr.io/kyverno/test-verify-image", DIGEST))
            .unwrap();
        let limiter = Semaphore::new(2);
        let executor = Executor {
            transport: &transport,
            key_store: None,
            limiter: &limiter,
        };
        let image: OciReference = IMAGE.parse().unwrap();
        let check = ImageCheck::new(&executor, &image, DIGEST, Check::Signature);

        assert!(check.verify_leaf(&leaf(&pem)).await.unwrap().verified);
        assert!(!check.verify_leaf(&leaf(&other_pem)).await.unwrap().verified);
        // layers are fetched once
        assert_eq!(transport.requests(), 1);
    }

    #[tokio::test]
    async fn attestation_leaves() {
        let (signing_key, pem) = generate_p256_key();
        let digest_hex = DIGEST.trim_start_matches("sha256:");
        let transport = StaticTransport::new()
            .with_attestation(IMAGE, DIGEST, attestation_layer(&signing_key, &statement(digest_hex, "prod")))
            .unwrap()
            .with_attestation(IMAGE, DIGEST, attestation_layer(&signing_key, &statement("0000", "main")))
            .unwrap();
        let limiter = Semaphore::new(2);
        let executor = Executor {
            transport: &transport,
            key_store: None,
            limiter: &limiter,
        };
        let image: OciReference = IMAGE.parse().unwrap();
        let conditions = branch_is_main();
        let ctx = JsonContext::new();
        let check = ImageCheck::new(
            &executor,
            &image,
            DIGEST,
            Check::Attestation {
                predicate_type: PREDICATE_TYPE,
                conditions: &conditions,
                context: &ctx,
            },
        );

        // one attestation is on the wrong branch, the other about another image
        assert!(!check.verify_leaf(&leaf(&pem)).await.unwrap().verified);

        let transport = StaticTransport::new()
            .with_attestation(IMAGE, DIGEST, attestation_layer(&signing_key, &statement(digest_hex, "main")))
            .unwrap();
        let executor = Executor {
            transport: &transport,
            key_store: None,
            limiter: &limiter,
        };
        let check = ImageCheck::new(
            &executor,
            &image,
            DIGEST,
            Check::Attestation {
                predicate_type: PREDICATE_TYPE,
                conditions: &conditions,
                context: &ctx,
            },
        );
        assert!(check.verify_leaf(&leaf(&pem)).await.unwrap().verified);
    }

    #[tokio::test]
    async fn transport_errors_are_fatal() {
        let (_, pem) = generate_p256_key();
        let transport = StaticTransport::new().with_unreachable(IMAGE).unwrap();
        let limiter = Semaphore::new(1);
        let executor = Executor {
            transport: &transport,
            key_store: None,
            limiter: &limiter,
        };
        let image: OciReference = IMAGE.parse().unwrap();
        let check = ImageCheck::new(&executor, &image, DIGEST, Check::Signature);

        let err = check.verify_leaf(&leaf(&pem)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
