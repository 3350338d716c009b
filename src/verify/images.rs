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

//! Extraction of the container images referenced by a resource.

use serde_json::Value;

use super::wildcard::Pattern;
use crate::errors::{ImageGuardError, Result};
use crate::registry::OciReference;

const CONTAINER_FIELDS: [&str; 3] = ["containers", "initContainers", "ephemeralContainers"];

/// Where pod specs live inside of the supported resources: pods, pod
/// templates (deployments, jobs, ...) and cron job templates.
const POD_SPEC_PATHS: [&[&str]; 3] = [
    &["spec"],
    &["spec", "template", "spec"],
    &["spec", "jobTemplate", "spec", "template", "spec"],
];

/// A container image found in a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInfo {
    /// Name of the container using the image.
    pub container: String,
    pub reference: OciReference,
    /// JSON pointer to the `image` field, used to patch it.
    pub pointer: String,
}

impl ImageInfo {
    /// `true` when one of the patterns matches the image, as written or
    /// in its normalized form.
    pub fn matches_any(&self, patterns: &[String]) -> Result<bool> {
        let patterns = patterns
            .iter()
            .map(|p| Pattern::new(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.matches_compiled(&patterns))
    }

    pub(crate) fn matches_compiled(&self, patterns: &[Pattern]) -> bool {
        let whole = self.reference.whole();
        patterns
            .iter()
            .any(|p| p.is_match(self.reference.original()) || p.is_match(&whole))
    }
}

/// Escape a JSON pointer token.
pub(crate) fn escape_pointer_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// List every container image of `resource`, in document order.
pub fn extract_images(resource: &Value) -> Result<Vec<ImageInfo>> {
    if !resource.is_object() {
        return Err(ImageGuardError::InvalidResource(
            "resource is not an object".to_string(),
        ));
    }

    let mut images = Vec::new();
    for path in POD_SPEC_PATHS {
        let Some(pod_spec) = path.iter().try_fold(resource, |v, key| v.get(*key)) else {
            continue;
        };
        let prefix: String = path.iter().map(|p| format!("/{p}")).collect();

        for field in CONTAINER_FIELDS {
            let Some(containers) = pod_spec.get(field).and_then(Value::as_array) else {
                continue;
            };
            for (index, container) in containers.iter().enumerate() {
                let Some(image) = container.get("image").and_then(Value::as_str) else {
                    continue;
                };
                images.push(ImageInfo {
                    container: container
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    reference: image.parse()?,
                    pointer: format!("{prefix}/{field}/{index}/image"),
                });
            }
        }
    }

    Ok(images)
}
