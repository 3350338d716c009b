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

//! The errors that can be raised by imageguard

use thiserror::Error;

/// Broad classification of an [`ImageGuardError`].
///
/// The classification decides how an error surfaces in a rule verdict:
/// configuration, transport and cancellation problems become `Error`,
/// verification problems become `Fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The policy itself is malformed. Never retried.
    Configuration,
    /// Something needed for verification could not be reached.
    Transport,
    /// A signature or attestation was checked and rejected.
    Verification,
    /// The evaluation deadline elapsed or the caller cancelled it.
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ImageGuardError>;

#[derive(Error, Debug)]
pub enum ImageGuardError {
    #[error("attestor set declares count {count} but has only {entries} entries")]
    AttestorCountOutOfRange { count: usize, entries: usize },

    #[error("attestor entry {index} has no key source")]
    AttestorWithoutKeySource { index: usize },

    #[error("attestor entry {index} mixes a nested attestor set with keys or certificates")]
    AttestorWithMixedSources { index: usize },

    #[error("attestor set has no entries")]
    EmptyAttestorSet,

    #[error("named attestor {0} not found")]
    AttestorRefNotFound(String),

    #[error("named attestor {0} references itself")]
    AttestorRefCycle(String),

    #[error("unknown condition operator: {0}")]
    UnknownConditionOperator(String),

    #[error("invalid condition: {0}")]
    InvalidCondition(String),

    #[error("invalid image pattern {pattern}: {error}")]
    InvalidImagePattern { pattern: String, error: String },

    #[error("variable {0} could not be resolved")]
    UnresolvedVariable(String),

    #[error("invalid key format: {error}")]
    InvalidKeyFormat { error: String },

    #[error("Public key with unsupported algorithm: {0}")]
    PublicKeyUnsupportedAlgorithmError(String),

    #[error("Public key verification error")]
    PublicKeyVerificationError,

    #[error("no key store configured to resolve {0}")]
    KeyStoreNotConfigured(String),

    #[error("key store lookup of {reference} failed: {error}")]
    KeyStoreError { reference: String, error: String },

    #[error("no config map resolver configured to load {0}")]
    ConfigMapResolverNotConfigured(String),

    #[error("config map {namespace}/{name} could not be resolved: {error}")]
    ConfigMapError {
        namespace: String,
        name: String,
        error: String,
    },

    #[error("OCI reference not valid: {reference}")]
    OciReferenceNotValidError { reference: String },

    #[error("Cannot fetch manifest digest of {image}: {error}")]
    RegistryFetchManifestError { image: String, error: String },

    #[error("Cannot pull manifest of {image}: {error}")]
    RegistryPullManifestError { image: String, error: String },

    #[error("Cannot pull {image}: {error}")]
    RegistryPullError { image: String, error: String },

    #[error("no registry transport configured")]
    TransportNotConfigured,

    #[error("Layer doesn't have a signature annotation")]
    SignatureAnnotationNotFoundError,

    #[error("malformed attestation envelope: {0}")]
    MalformedEnvelope(String),

    #[error("image {image} is not pinned to a digest")]
    MissingDigest { image: String },

    #[error("verification timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("verification cancelled")]
    Cancelled,

    #[error("invalid resource: {0}")]
    InvalidResource(String),

    #[error(transparent)]
    FromPEMError(#[from] pem::PemError),

    #[error(transparent)]
    Base64DecodeError(#[from] base64::DecodeError),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::error::Error),

    #[error(transparent)]
    X509ParseError(#[from] x509_cert::der::Error),

    #[error(transparent)]
    RegexError(#[from] regex::Error),

    #[error(transparent)]
    ECDSAError(#[from] ecdsa::Error),

    #[error(transparent)]
    RSAError(#[from] rsa::errors::Error),

    #[error(transparent)]
    Ed25519PKCS8Error(#[from] ed25519_dalek::pkcs8::spki::Error),
}

impl ImageGuardError {
    /// Classify the error, see [`ErrorKind`].
    pub fn kind(&self) -> ErrorKind {
        use ImageGuardError::*;

        match self {
            KeyStoreError { .. }
            | ConfigMapError { .. }
            | RegistryFetchManifestError { .. }
            | RegistryPullManifestError { .. }
            | RegistryPullError { .. } => ErrorKind::Transport,
            PublicKeyVerificationError
            | SignatureAnnotationNotFoundError
            | MalformedEnvelope(_)
            | MissingDigest { .. }
            | Base64DecodeError(_)
            | SerdeJsonError(_)
            | ECDSAError(_)
            | RSAError(_) => ErrorKind::Verification,
            Timeout(_) | Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Configuration,
        }
    }

    /// `true` when the error must abort the whole rule instead of being
    /// counted as a failed trust check.
    pub fn is_fatal(&self) -> bool {
        self.kind() != ErrorKind::Verification
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_errors() {
        let err = ImageGuardError::RegistryFetchManifestError {
            image: "ghcr.io/foo/bar:1".into(),
            error: "connection refused".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(err.is_fatal());

        let err = ImageGuardError::PublicKeyVerificationError;
        assert_eq!(err.kind(), ErrorKind::Verification);
        assert!(!err.is_fatal());

        let err = ImageGuardError::AttestorCountOutOfRange {
            count: 3,
            entries: 2,
        };
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(
            err.to_string(),
            "attestor set declares count 3 but has only 2 entries"
        );

        assert_eq!(ImageGuardError::Cancelled.kind(), ErrorKind::Cancelled);
    }
}
