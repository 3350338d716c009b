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

use crate::errors::ImageGuardError;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// `OciReference` represents an image reference as it was written inside of
/// a resource, together with its normalized form.
///
/// The original spelling is kept because digest pinning must rewrite the
/// reference the way the author wrote it (`nginx:1.25` stays `nginx:1.25@sha256:...`
/// instead of becoming `docker.io/library/nginx:1.25@sha256:...`).
#[derive(Debug, Clone, PartialEq)]
pub struct OciReference {
    pub(crate) oci_reference: oci_client::Reference,
    original: String,
}

impl FromStr for OciReference {
    type Err = ImageGuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        trimmed
            .parse::<oci_client::Reference>()
            .map_err(|_| ImageGuardError::OciReferenceNotValidError {
                reference: s.to_string(),
            })
            .map(|oci_reference| OciReference {
                oci_reference,
                original: trimmed.to_string(),
            })
    }
}

impl OciReference {
    /// registry returns the name of the registry.
    pub fn registry(&self) -> &str {
        self.oci_reference.registry()
    }

    /// repository returns the name of the repository
    pub fn repository(&self) -> &str {
        self.oci_reference.repository()
    }

    /// digest returns the object's digest, if present.
    pub fn digest(&self) -> Option<&str> {
        self.oci_reference.digest()
    }

    /// tag returns the object's tag, if present.
    pub fn tag(&self) -> Option<&str> {
        self.oci_reference.tag()
    }

    /// whole returns the whole normalized reference.
    pub fn whole(&self) -> String {
        self.oci_reference.whole()
    }

    /// The reference exactly as it was written in the resource.
    pub fn original(&self) -> &str {
        &self.original
    }

    /// `true` when the reference carries an immutable digest.
    pub fn is_pinned(&self) -> bool {
        self.digest().is_some()
    }

    /// The original spelling, with the implicit `latest` tag written out
    /// when the reference has neither a tag nor a digest.
    pub fn tagged(&self) -> String {
        if self.is_pinned() || self.has_explicit_tag() {
            self.original.clone()
        } else {
            format!("{}:latest", self.original)
        }
    }

    /// Return the reference pinned to `digest`, keeping the original
    /// spelling: `<repo>:<tag>@<digest>`.
    ///
    /// A reference already carrying a digest is returned unchanged.
    pub fn pinned(&self, digest: &str) -> String {
        if self.is_pinned() {
            self.original.clone()
        } else {
            format!("{}@{}", self.tagged(), digest)
        }
    }

    // The registry port is followed by a `/`, a tag is not.
    fn has_explicit_tag(&self) -> bool {
        self.original
            .rsplit('/')
            .next()
            .is_some_and(|name| name.contains(':'))
    }

    /// Reference to the object cosign stores next to the image, for example
    /// `<repo>:sha256-<hex>.sig` for signatures.
    pub(crate) fn cosign_object(&self, digest: &str, suffix: &str) -> oci_client::Reference {
        oci_client::Reference::with_tag(
            self.registry().to_string(),
            self.repository().to_string(),
            format!("{}.{}", digest.replace(':', "-"), suffix),
        )
    }
}

impl Display for OciReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const DIGEST: &str = "sha256:b31bfb4d0213f254d361e0079deaaebefa4f82ba7aa76ef82e90b4935ad5b105";

    #[test]
    fn pin_tagged_reference() {
        let image: OciReference = "ghcr.io/kyverno/test-verify-image:signed".parse().unwrap();
        assert!(!image.is_pinned());
        assert_eq!(image.tag(), Some("signed"));
        assert_eq!(
            image.pinned(DIGEST),
            format!("ghcr.io/kyverno/test-verify-image:signed@{DIGEST}")
        );
    }

    #[rstest]
    #[case("ghcr.io/kyverno/test-verify-image", "ghcr.io/kyverno/test-verify-image:latest")]
    #[case("nginx", "nginx:latest")]
    #[case("localhost:5000/app", "localhost:5000/app:latest")]
    #[case("localhost:5000/app:v1", "localhost:5000/app:v1")]
    fn pin_reference_without_tag(#[case] raw: &str, #[case] tagged: &str) {
        let image: OciReference = raw.parse().unwrap();
        assert_eq!(image.tagged(), tagged);
        assert_eq!(image.pinned(DIGEST), format!("{tagged}@{DIGEST}"));
    }

    #[test]
    fn pinned_reference_is_left_alone() {
        let raw = format!("ghcr.io/kyverno/test-verify-image@{DIGEST}");
        let image: OciReference = raw.parse().unwrap();
        assert!(image.is_pinned());
        assert_eq!(image.pinned("sha256:other"), raw);
    }

    #[test]
    fn keep_original_spelling() {
        let image: OciReference = "nginx:latest".parse().unwrap();
        assert_eq!(image.registry(), "docker.io");
        assert_eq!(image.repository(), "library/nginx");
        assert_eq!(image.to_string(), "nginx:latest");
    }

    #[test]
    fn cosign_signature_object() {
        let image: OciReference = "ghcr.io/kyverno/test-verify-image:signed".parse().unwrap();
        let sig = image.cosign_object(DIGEST, "sig");
        assert_eq!(
            sig.whole(),
            "ghcr.io/kyverno/test-verify-image:sha256-b31bfb4d0213f254d361e0079deaaebefa4f82ba7aa76ef82e90b4935ad5b105.sig"
        );
    }

    #[test]
    fn reject_invalid_reference() {
        assert!("UPPER/Case:tag".parse::<OciReference>().is_err());
    }
}
