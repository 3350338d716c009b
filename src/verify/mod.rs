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

//! The image verification engine.
//!
//! An [`ImageVerifier`] evaluates the `verifyImages` rules of a [`Policy`]
//! against a resource. For every image of the resource matched by a rule,
//! the attestors declared by the rule are turned into a trust tree whose
//! leaves are checked against the signatures and attestations stored in
//! the registry. The outcome is a verdict per rule, plus the patches
//! pinning the verified images to their digest and recording the
//! verification inside of an annotation of the resource.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use imageguard::registry::{Auth, ClientConfig, OciTransport};
//! use imageguard::verify::{ImageVerifierBuilder, PolicyContext};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(policy: imageguard::policy::Policy, pod: serde_json::Value) -> imageguard::errors::Result<()> {
//! let verifier = ImageVerifierBuilder::default()
//!     .with_transport(Arc::new(OciTransport::new(ClientConfig::default(), Auth::Anonymous)))
//!     .build()?;
//!
//! let (response, _metadata) = verifier
//!     .verify_and_patch(&policy, &PolicyContext::new(pod, None), &CancellationToken::new())
//!     .await;
//! if !response.is_successful() {
//!     println!("rejected: {:?}", response.rules);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::context::{load_context_entries, ConfigMapResolver, JsonContext, VariableContext};
use crate::errors::{ImageGuardError, Result};
use crate::policy::{ApplyRules, AttestorSet, ImageVerification, Policy, Rule};
use crate::registry::RegistryTransport;

mod conditions;
pub use conditions::{ConditionOperator, Conditions};

mod executor;
use executor::{Check, Executor, ImageCheck};

mod images;
pub use images::{extract_images, ImageInfo};

mod keys;
pub use keys::{KeyStore, StaticKeyStore};

mod outcome;
pub use outcome::{
    annotation_value, has_verification_annotation_changed, EngineResponse,
    ImageVerificationMetadata, PatchOp, PatchOperation, RuleResponse, RuleStatus, VerifiedImage,
};

mod threshold;
pub use threshold::{evaluate, LeafResult, LeafVerifier};

mod trust_tree;
pub use trust_tree::{expand_static_keys, AttestorNode, KeySource, LeafAttestor, TrustTreeResolver};

mod wildcard;
use wildcard::Pattern;

/// Default annotation holding the verified images of a resource.
pub const DEFAULT_ANNOTATION_KEY: &str = "imageguard.dev/verify-images";

fn default_timeout_seconds() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    8
}

fn default_annotation_key() -> String {
    DEFAULT_ANNOTATION_KEY.to_string()
}

/// Settings of an [`ImageVerifier`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifierConfig {
    /// Deadline of a whole policy evaluation.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Maximum number of registry requests in flight.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_annotation_key")]
    pub annotation_key: String,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        VerifierConfig {
            timeout_seconds: default_timeout_seconds(),
            max_concurrency: default_max_concurrency(),
            annotation_key: default_annotation_key(),
        }
    }
}

/// A builder that generates [`ImageVerifier`] objects.
///
/// Only the registry transport is required. Without a key store, attestors
/// using secrets or KMS keys make the rule fail with a configuration
/// error; the same goes for config map context entries without a config
/// map resolver.
#[derive(Default)]
pub struct ImageVerifierBuilder {
    config: VerifierConfig,
    transport: Option<Arc<dyn RegistryTransport>>,
    key_store: Option<Arc<dyn KeyStore>>,
    config_maps: Option<Arc<dyn ConfigMapResolver>>,
    attestor_library: HashMap<String, AttestorSet>,
}

impl ImageVerifierBuilder {
    pub fn with_config(mut self, config: VerifierConfig) -> Self {
        self.config = config;
        self
    }

    /// Required - the transport used to reach the registries.
    pub fn with_transport(mut self, transport: Arc<dyn RegistryTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Optional - resolves secret and KMS backed public keys.
    pub fn with_key_store(mut self, key_store: Arc<dyn KeyStore>) -> Self {
        self.key_store = Some(key_store);
        self
    }

    /// Optional - resolves the config maps referenced by rule contexts.
    pub fn with_config_map_resolver(mut self, resolver: Arc<dyn ConfigMapResolver>) -> Self {
        self.config_maps = Some(resolver);
        self
    }

    /// Optional - attestor sets that rules reference through `attestorRef`.
    pub fn with_attestor_library(mut self, library: HashMap<String, AttestorSet>) -> Self {
        self.attestor_library = library;
        self
    }

    pub fn build(self) -> Result<ImageVerifier> {
        let transport = self
            .transport
            .ok_or(ImageGuardError::TransportNotConfigured)?;

        if self.key_store.is_none() {
            info!("Key store not provided. Secret and KMS attestors disabled");
        }
        if self.config_maps.is_none() {
            info!("Config map resolver not provided. Config map context entries disabled");
        }

        Ok(ImageVerifier {
            config: self.config,
            transport,
            key_store: self.key_store,
            config_maps: self.config_maps,
            attestor_library: self.attestor_library,
        })
    }
}

/// The resource under admission.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyContext {
    pub new_resource: Value,
    /// Previous version of the resource, set on updates.
    pub old_resource: Option<Value>,
}

impl PolicyContext {
    pub fn new(new_resource: Value, old_resource: Option<Value>) -> Self {
        PolicyContext {
            new_resource,
            old_resource,
        }
    }
}

/// Outcome of the verification of one image against one
/// [`ImageVerification`].
enum ImageOutcome {
    Verified {
        /// Key of the verification record.
        record: String,
        /// Digest pinned reference to patch the resource with.
        pinned: Option<String>,
    },
    Failed(String),
}

/// Verifies the images of resources against policies.
pub struct ImageVerifier {
    config: VerifierConfig,
    transport: Arc<dyn RegistryTransport>,
    key_store: Option<Arc<dyn KeyStore>>,
    config_maps: Option<Arc<dyn ConfigMapResolver>>,
    attestor_library: HashMap<String, AttestorSet>,
}

impl ImageVerifier {
    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Evaluate the `verifyImages` rules of `policy` against the resource.
    ///
    /// Returns a verdict per evaluated rule, together with the images
    /// known to be verified: the ones verified by the rules that passed and
    /// the ones recorded in a trusted verification annotation. Rules without `verifyImages` are
    /// ignored. Once `cancel` fires or the configured timeout elapses, the
    /// rule being evaluated and every following one end with an `Error`
    /// verdict.
    pub async fn verify_and_patch(
        &self,
        policy: &Policy,
        ctx: &PolicyContext,
        cancel: &CancellationToken,
    ) -> (EngineResponse, ImageVerificationMetadata) {
        let timeout = Duration::from_secs(self.config.timeout_seconds);
        let deadline = Instant::now() + timeout;
        let limiter = Semaphore::new(self.config.max_concurrency.max(1));
        let executor = Executor {
            transport: self.transport.as_ref(),
            key_store: self.key_store.as_deref(),
            limiter: &limiter,
        };
        let trusted = self.trusted_metadata(ctx);

        let mut response = EngineResponse {
            policy: policy.name.clone(),
            rules: Vec::new(),
        };
        // records of a trusted annotation are kept when it is rewritten
        let mut metadata = trusted.clone().unwrap_or_default();
        let mut last_passed = None;

        for rule in policy.rules.iter().filter(|r| !r.verify_images.is_empty()) {
            let span = info_span!("verify_images", policy = policy.name.as_str(), rule = rule.name.as_str());
            let evaluation = self
                .evaluate_rule(rule, ctx, &executor, trusted.as_ref())
                .instrument(span);

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ImageGuardError::Cancelled),
                result = timeout_at(deadline, evaluation) => {
                    result
                        .map_err(|_| ImageGuardError::Timeout(timeout))
                        .and_then(|evaluation| evaluation)
                }
            };

            let rule_response = match result {
                Ok(RuleEvaluation::Skipped) => {
                    RuleResponse::new(&rule.name, RuleStatus::Skip, "no image matched the rule")
                }
                Ok(RuleEvaluation::Failed(message)) => {
                    RuleResponse::new(&rule.name, RuleStatus::Fail, message)
                }
                Ok(RuleEvaluation::Passed {
                    verified,
                    digest_patches,
                }) => {
                    metadata.merge(&verified);
                    last_passed = Some(response.rules.len());
                    RuleResponse::new(
                        &rule.name,
                        RuleStatus::Pass,
                        format!("verified {} image(s)", verified.len()),
                    )
                    .with_patches(digest_patches)
                }
                Err(e) => {
                    warn!(rule = rule.name.as_str(), error = %e, "image verification error");
                    RuleResponse::new(&rule.name, RuleStatus::Error, e.to_string())
                }
            };

            info!(rule = rule.name.as_str(), status = ?rule_response.status, message = rule_response.message.as_str(), "rule evaluated");
            let status = rule_response.status;
            response.rules.push(rule_response);
            if policy.apply_rules == ApplyRules::One && status != RuleStatus::Skip {
                break;
            }
        }

        // one annotation patch, carried by the last rule that passed
        if let Some(index) = last_passed {
            let rule_response = &mut response.rules[index];
            match metadata.patches(&self.config.annotation_key, &ctx.new_resource) {
                Ok(patches) => rule_response.patches.extend(patches),
                Err(e) => {
                    warn!(rule = rule_response.name.as_str(), error = %e, "cannot record verified images");
                    rule_response.status = RuleStatus::Error;
                    rule_response.message = e.to_string();
                    rule_response.patches.clear();
                }
            }
        }

        (response, metadata)
    }

    /// The verification recorded on the resource, when it can be trusted:
    /// an annotation that changed between the old and the new version of
    /// the resource was not written by the engine.
    fn trusted_metadata(&self, ctx: &PolicyContext) -> Option<ImageVerificationMetadata> {
        let key = &self.config.annotation_key;
        if has_verification_annotation_changed(&ctx.new_resource, ctx.old_resource.as_ref(), key) {
            debug!(annotation = key.as_str(), "verification annotation changed, ignoring it");
            return None;
        }
        match ImageVerificationMetadata::from_resource(&ctx.new_resource, key) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(annotation = key.as_str(), error = %e, "cannot parse verification annotation");
                None
            }
        }
    }

    async fn evaluate_rule(
        &self,
        rule: &Rule,
        ctx: &PolicyContext,
        executor: &Executor<'_>,
        trusted: Option<&ImageVerificationMetadata>,
    ) -> Result<RuleEvaluation> {
        let images = extract_images(&ctx.new_resource)?;
        let mut context = JsonContext::from_resource(&ctx.new_resource, ctx.old_resource.as_ref());

        // compiled once, matched against every image
        let mut verifications = Vec::with_capacity(rule.verify_images.len());
        for iv in &rule.verify_images {
            let mut iv = iv.normalized();
            iv.image_references = iv
                .image_references
                .iter()
                .map(|pattern| context.substitute_str(pattern))
                .collect::<Result<_>>()?;
            let patterns = iv
                .image_references
                .iter()
                .map(|pattern| Pattern::new(pattern))
                .collect::<Result<Vec<_>>>()?;
            verifications.push((iv, patterns));
        }

        let mut matched = Vec::new();
        for image in &images {
            for (iv, patterns) in &verifications {
                if image.matches_compiled(patterns) {
                    matched.push((image, iv));
                }
            }
        }
        if matched.is_empty() {
            debug!(images = images.len(), "no image matched");
            return Ok(RuleEvaluation::Skipped);
        }

        load_context_entries(&rule.context, self.config_maps.as_deref(), &mut context).await?;

        let context = &context;
        let outcomes = join_all(
            matched
                .iter()
                .map(|(image, iv)| self.verify_image(iv, image, context, executor, trusted)),
        )
        .await;

        let mut verified = ImageVerificationMetadata::new();
        let mut digest_patches = Vec::new();
        let mut patched = HashSet::new();
        let mut failures = Vec::new();
        for ((image, iv), outcome) in matched.iter().zip(outcomes) {
            match outcome? {
                ImageOutcome::Failed(message) => failures.push(message),
                ImageOutcome::Verified { record, pinned } => {
                    verified.add(&record, true);
                    if let Some(pinned) = pinned.filter(|_| iv.mutate_digest) {
                        if patched.insert(image.pointer.clone()) {
                            digest_patches.push(PatchOperation::replace(
                                image.pointer.clone(),
                                Value::String(pinned),
                            ));
                        }
                    }
                }
            }
        }

        if !failures.is_empty() {
            return Ok(RuleEvaluation::Failed(failures.join("; ")));
        }
        Ok(RuleEvaluation::Passed {
            verified,
            digest_patches,
        })
    }

    async fn verify_image(
        &self,
        iv: &ImageVerification,
        image: &ImageInfo,
        context: &dyn VariableContext,
        executor: &Executor<'_>,
        trusted: Option<&ImageVerificationMetadata>,
    ) -> Result<ImageOutcome> {
        let reference = &image.reference;

        if iv.verify_digest && !iv.mutate_digest && !reference.is_pinned() {
            return Ok(ImageOutcome::Failed(format!(
                "missing digest for {reference}"
            )));
        }

        if let Some(record) = trusted.and_then(|t| t.verified_record(reference.original())) {
            debug!(image = %reference, record, "image already verified");
            return Ok(ImageOutcome::Verified {
                record: record.to_string(),
                pinned: None,
            });
        }

        if iv.attestors.is_empty() && iv.attestations.is_empty() {
            return Err(ImageGuardError::EmptyAttestorSet);
        }

        // Build every tree before any registry I/O, configuration errors
        // take precedence over transport ones.
        let resolver = TrustTreeResolver::new(&self.attestor_library, context);
        let signatures = if iv.attestors.is_empty() {
            None
        } else {
            Some(resolver.resolve(&iv.attestors)?)
        };
        let attestations = iv
            .attestations
            .iter()
            .map(|a| -> Result<_> {
                Ok((
                    a.predicate_type.as_str(),
                    resolver.resolve(&a.attestors)?,
                    Conditions::compile(&a.conditions)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let digest = executor.resolve_digest(reference).await?;
        debug!(image = %reference, %digest, "resolved digest");

        if let Some(tree) = &signatures {
            let check = ImageCheck::new(executor, reference, &digest, Check::Signature);
            if !evaluate(tree, &check).await? {
                return Ok(ImageOutcome::Failed(format!(
                    "image {reference}: signature verification failed"
                )));
            }
        }

        for (predicate_type, tree, conditions) in &attestations {
            let check = ImageCheck::new(
                executor,
                reference,
                &digest,
                Check::Attestation {
                    predicate_type: *predicate_type,
                    conditions,
                    context,
                },
            );
            if !evaluate(tree, &check).await? {
                return Ok(ImageOutcome::Failed(format!(
                    "image {reference}: attestation {predicate_type} verification failed"
                )));
            }
        }

        let pinned = reference.pinned(&digest);
        Ok(ImageOutcome::Verified {
            record: pinned.clone(),
            pinned: (!reference.is_pinned()).then_some(pinned),
        })
    }
}

enum RuleEvaluation {
    Skipped,
    Failed(String),
    Passed {
        verified: ImageVerificationMetadata,
        digest_patches: Vec<PatchOperation>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StaticTransport;

    #[test]
    fn deserialize_config() {
        let config: VerifierConfig =
            serde_json::from_value(serde_json::json!({"timeoutSeconds": 10})).unwrap();
        assert_eq!(config.timeout_seconds, 10);
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.annotation_key, DEFAULT_ANNOTATION_KEY);
        assert_eq!(
            serde_json::from_value::<VerifierConfig>(serde_json::json!({})).unwrap(),
            VerifierConfig::default()
        );
    }

    #[test]
    fn builder_requires_a_transport() {
        let err = ImageVerifierBuilder::default().build().err().unwrap();
        assert!(matches!(err, ImageGuardError::TransportNotConfigured));

        let verifier = ImageVerifierBuilder::default()
            .with_transport(Arc::new(StaticTransport::new()))
            .build()
            .unwrap();
        assert_eq!(verifier.config().timeout_seconds, 30);
    }
}
