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

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{OciReference, RegistryTransport};
use crate::cosign::SignatureLayer;
use crate::errors::{ImageGuardError, Result};

#[derive(Debug, Clone, Default)]
struct StaticImage {
    digest: String,
    signatures: Vec<SignatureLayer>,
    attestations: Vec<SignatureLayer>,
    unreachable: bool,
}

/// Registry transport serving fixed responses.
///
/// Images are registered by repository. Tags resolve to the registered
/// digest; signatures and attestations are only served for that digest.
/// A tag-only reference of an unknown repository fails to resolve, like a
/// registry answering "manifest unknown".
#[derive(Debug, Default)]
pub struct StaticTransport {
    images: HashMap<String, StaticImage>,
    requests: AtomicUsize,
}

impl StaticTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(image: &OciReference) -> String {
        format!("{}/{}", image.registry(), image.repository())
    }

    fn entry(&mut self, image: &str, digest: &str) -> Result<&mut StaticImage> {
        let reference: OciReference = image.parse()?;
        let entry = self.images.entry(Self::key(&reference)).or_default();
        entry.digest = digest.to_string();
        Ok(entry)
    }

    /// Register `image` as resolving to `digest`, with no cosign objects.
    pub fn with_image(mut self, image: &str, digest: &str) -> Result<Self> {
        self.entry(image, digest)?;
        Ok(self)
    }

    /// Add a signature layer stored for `image` at `digest`.
    pub fn with_signature(
        mut self,
        image: &str,
        digest: &str,
        layer: SignatureLayer,
    ) -> Result<Self> {
        self.entry(image, digest)?.signatures.push(layer);
        Ok(self)
    }

    /// Add an attestation layer stored for `image` at `digest`.
    pub fn with_attestation(
        mut self,
        image: &str,
        digest: &str,
        layer: SignatureLayer,
    ) -> Result<Self> {
        self.entry(image, digest)?.attestations.push(layer);
        Ok(self)
    }

    /// Make every request about the repository of `image` fail with a
    /// transport error.
    pub fn with_unreachable(mut self, image: &str) -> Result<Self> {
        let reference: OciReference = image.parse()?;
        self.images
            .entry(Self::key(&reference))
            .or_default()
            .unreachable = true;
        Ok(self)
    }

    /// Number of requests served so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn lookup(&self, image: &OciReference) -> Result<Option<&StaticImage>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        match self.images.get(&Self::key(image)) {
            Some(entry) if entry.unreachable => Err(ImageGuardError::RegistryPullError {
                image: image.whole(),
                error: "registry unreachable".to_string(),
            }),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl RegistryTransport for StaticTransport {
    async fn resolve_digest(&self, image: &OciReference) -> Result<String> {
        let entry = self.lookup(image)?;
        if let Some(digest) = image.digest() {
            return Ok(digest.to_string());
        }
        entry
            .map(|e| e.digest.clone())
            .ok_or_else(|| ImageGuardError::RegistryFetchManifestError {
                image: image.whole(),
                error: "manifest unknown".to_string(),
            })
    }

    async fn fetch_signatures(
        &self,
        image: &OciReference,
        digest: &str,
    ) -> Result<Vec<SignatureLayer>> {
        Ok(self
            .lookup(image)?
            .filter(|e| e.digest == digest)
            .map(|e| e.signatures.clone())
            .unwrap_or_default())
    }

    async fn fetch_attestations(
        &self,
        image: &OciReference,
        digest: &str,
    ) -> Result<Vec<SignatureLayer>> {
        Ok(self
            .lookup(image)?
            .filter(|e| e.digest == digest)
            .map(|e| e.attestations.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:b31bfb4d0213f254d361e0079deaaebefa4f82ba7aa76ef82e90b4935ad5b105";

    #[tokio::test]
    async fn resolve_registered_tag() {
        let transport = StaticTransport::new()
            .with_image("ghcr.io/kyverno/test-verify-image:signed", DIGEST)
            .unwrap();

        let image: OciReference = "ghcr.io/kyverno/test-verify-image:other".parse().unwrap();
        assert_eq!(transport.resolve_digest(&image).await.unwrap(), DIGEST);
        assert_eq!(transport.requests(), 1);
    }

    #[tokio::test]
    async fn unknown_tag_is_a_transport_error() {
        let transport = StaticTransport::new();
        let image: OciReference = "ghcr.io/kyverno/unknown:latest".parse().unwrap();

        let err = transport.resolve_digest(&image).await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Transport);
    }

    #[tokio::test]
    async fn signatures_are_served_for_the_registered_digest_only() {
        let layer = SignatureLayer::new(b"{}".to_vec(), Some("c2ln".to_string()));
        let transport = StaticTransport::new()
            .with_signature("ghcr.io/foo/bar:1", DIGEST, layer)
            .unwrap();
        let image: OciReference = "ghcr.io/foo/bar:1".parse().unwrap();

        assert_eq!(transport.fetch_signatures(&image, DIGEST).await.unwrap().len(), 1);
        assert!(transport
            .fetch_signatures(&image, "sha256:other")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unreachable_registry() {
        let transport = StaticTransport::new()
            .with_unreachable("ghcr.io/foo/bar")
            .unwrap();
        let image: OciReference = format!("ghcr.io/foo/bar@{DIGEST}").parse().unwrap();

        assert!(transport.resolve_digest(&image).await.is_err());
        assert!(transport.fetch_attestations(&image, DIGEST).await.is_err());
    }
}
