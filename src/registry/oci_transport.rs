//
// Copyright 2022 The Sigstore Authors.
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

use async_trait::async_trait;
use oci_client::errors::{OciDistributionError, OciErrorCode};
use tracing::{debug, info};

use super::{Auth, ClientConfig, OciReference, RegistryTransport};
use crate::cosign::constants::{
    ATTESTATION_SUFFIX, COSIGN_SIGNATURE_ANNOTATION, DSSE_ENVELOPE_MEDIA_TYPE,
    SIGNATURE_SUFFIX, SIMPLE_SIGNING_MEDIA_TYPE,
};
use crate::cosign::SignatureLayer;
use crate::errors::{ImageGuardError, Result};

/// Registry transport that performs actual calls against remote OCI
/// registries.
///
/// For testing purposes, use [`super::StaticTransport`] instead.
pub struct OciTransport {
    registry_client: oci_client::Client,
    auth: Auth,
}

impl OciTransport {
    pub fn new(config: ClientConfig, auth: Auth) -> Self {
        OciTransport {
            registry_client: oci_client::Client::new(config.into()),
            auth,
        }
    }

    /// Pull the cosign object stored next to the image and turn every layer
    /// of the expected media type into a [`SignatureLayer`].
    async fn pull_cosign_object(
        &self,
        image: &OciReference,
        digest: &str,
        suffix: &str,
        media_type: &str,
    ) -> Result<Vec<SignatureLayer>> {
        let reference = image.cosign_object(digest, suffix);
        debug!(object = %reference, "pulling cosign object");

        let image_data = match self
            .registry_client
            .pull(&reference, &(&self.auth).into(), vec![media_type])
            .await
        {
            Ok(data) => data,
            Err(e) if is_not_found(&e) => {
                info!(object = %reference, "no cosign object found");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(ImageGuardError::RegistryPullError {
                    image: reference.whole(),
                    error: e.to_string(),
                })
            }
        };

        let manifest = image_data
            .manifest
            .ok_or_else(|| ImageGuardError::RegistryPullManifestError {
                image: reference.whole(),
                error: "pulled object has no image manifest".to_string(),
            })?;

        let mut layers = Vec::new();
        for descriptor in manifest.layers.iter() {
            if descriptor.media_type != media_type {
                debug!(media_type = %descriptor.media_type, "ignoring layer");
                continue;
            }
            let Some(layer) = image_data
                .layers
                .iter()
                .find(|l| l.sha256_digest() == descriptor.digest)
            else {
                info!(digest = %descriptor.digest, "layer listed in manifest was not pulled");
                continue;
            };
            let signature = descriptor
                .annotations
                .as_ref()
                .and_then(|a| a.get(COSIGN_SIGNATURE_ANNOTATION))
                .cloned();
            layers.push(SignatureLayer::new(layer.data.to_vec(), signature));
        }

        Ok(layers)
    }
}

/// A cosign object that was never pushed is reported by the registry as an
/// unknown manifest.
fn is_not_found(error: &OciDistributionError) -> bool {
    match error {
        OciDistributionError::ImageManifestNotFoundError(_) => true,
        OciDistributionError::RegistryError { envelope, .. } => envelope.errors.iter().any(|e| {
            matches!(
                e.code,
                OciErrorCode::ManifestUnknown | OciErrorCode::NameUnknown
            )
        }),
        _ => false,
    }
}

#[async_trait]
impl RegistryTransport for OciTransport {
    async fn resolve_digest(&self, image: &OciReference) -> Result<String> {
        if let Some(digest) = image.digest() {
            return Ok(digest.to_string());
        }

        self.registry_client
            .fetch_manifest_digest(&image.oci_reference, &(&self.auth).into())
            .await
            .map_err(|e| ImageGuardError::RegistryFetchManifestError {
                image: image.whole(),
                error: e.to_string(),
            })
    }

    async fn fetch_signatures(
        &self,
        image: &OciReference,
        digest: &str,
    ) -> Result<Vec<SignatureLayer>> {
        self.pull_cosign_object(image, digest, SIGNATURE_SUFFIX, SIMPLE_SIGNING_MEDIA_TYPE)
            .await
    }

    async fn fetch_attestations(
        &self,
        image: &OciReference,
        digest: &str,
    ) -> Result<Vec<SignatureLayer>> {
        self.pull_cosign_object(image, digest, ATTESTATION_SUFFIX, DSSE_ENVELOPE_MEDIA_TYPE)
            .await
    }
}
