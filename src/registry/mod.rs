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

//! Access to the registry holding images and the cosign objects stored
//! next to them.

pub mod config;
pub use config::*;

mod oci_reference;
pub use oci_reference::OciReference;

mod oci_transport;
pub use oci_transport::OciTransport;

mod static_transport;
pub use static_transport::StaticTransport;

use crate::cosign::SignatureLayer;
use crate::errors::Result;

use async_trait::async_trait;

/// Capabilities that are expected to be provided by a registry transport.
///
/// The engine never talks to a registry directly: it is handed an
/// implementation of this trait. [`OciTransport`] talks to real OCI
/// registries, [`StaticTransport`] serves fixed responses.
///
/// Errors returned by these methods are transport errors: they make the
/// rule verdict `Error`, they are never counted as a failed signature.
/// A missing signature object is not an error, it is an empty list.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Resolve the image to its immutable manifest digest
    /// (`sha256:<hex>`). Pinned references resolve without I/O.
    async fn resolve_digest(&self, image: &OciReference) -> Result<String>;

    /// Fetch every simple-signing layer stored for the image `digest`.
    async fn fetch_signatures(
        &self,
        image: &OciReference,
        digest: &str,
    ) -> Result<Vec<SignatureLayer>>;

    /// Fetch every attestation layer stored for the image `digest`. The
    /// payload of each layer is a DSSE envelope.
    async fn fetch_attestations(
        &self,
        image: &OciReference,
        digest: &str,
    ) -> Result<Vec<SignatureLayer>>;
}
