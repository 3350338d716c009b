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

//! Verdicts, patches and the verification annotation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::images::escape_pointer_token;
use crate::errors::Result;
use crate::registry::OciReference;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    /// Every matched image satisfied the rule.
    Pass,
    /// An image was checked and rejected.
    Fail,
    /// The rule matched no image.
    Skip,
    /// The rule could not be evaluated.
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleResponse {
    pub name: String,
    pub status: RuleStatus,
    pub message: String,
    /// Patches to apply to the resource, in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<PatchOperation>,
}

impl RuleResponse {
    pub(crate) fn new(name: &str, status: RuleStatus, message: impl Into<String>) -> Self {
        RuleResponse {
            name: name.to_string(),
            status,
            message: message.into(),
            patches: Vec::new(),
        }
    }

    pub(crate) fn with_patches(mut self, patches: Vec<PatchOperation>) -> Self {
        self.patches = patches;
        self
    }
}

/// Outcome of a policy against a resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineResponse {
    pub policy: String,
    pub rules: Vec<RuleResponse>,
}

impl EngineResponse {
    /// `true` when no rule failed or errored.
    pub fn is_successful(&self) -> bool {
        self.rules
            .iter()
            .all(|r| matches!(r.status, RuleStatus::Pass | RuleStatus::Skip))
    }

    /// The patches of every rule, in order.
    pub fn patches(&self) -> Vec<PatchOperation> {
        self.rules
            .iter()
            .flat_map(|r| r.patches.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Add,
    Replace,
}

/// A JSON Patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    pub op: PatchOp,
    pub path: String,
    pub value: Value,
}

impl PatchOperation {
    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        PatchOperation {
            op: PatchOp::Replace,
            path: path.into(),
            value,
        }
    }

    pub fn add(path: impl Into<String>, value: Value) -> Self {
        PatchOperation {
            op: PatchOp::Add,
            path: path.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedImage {
    pub verified: bool,
}

/// The images verified for a resource, keyed by their digest pinned
/// reference. Persisted as a JSON object inside of an annotation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageVerificationMetadata {
    data: BTreeMap<String, VerifiedImage>,
}

impl ImageVerificationMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, image: &str, verified: bool) {
        self.data.insert(image.to_string(), VerifiedImage { verified });
    }

    /// `true` when `image` is recorded as verified. A tag reference matches
    /// the record of its pinned form, a reference without tag is read as
    /// `:latest`.
    pub fn is_verified(&self, image: &str) -> bool {
        let image = image
            .parse::<OciReference>()
            .map(|r| r.tagged())
            .unwrap_or_else(|_| image.to_string());
        self.data.iter().any(|(recorded, v)| {
            v.verified
                && (*recorded == image
                    || recorded
                        .strip_prefix(image.as_str())
                        .is_some_and(|rest| rest.starts_with('@')))
        })
    }

    /// The record stating that exactly `image` is verified. The tag of a
    /// record may have moved since, so only exact matches count.
    pub(crate) fn verified_record(&self, image: &str) -> Option<&str> {
        self.data
            .get_key_value(image)
            .filter(|(_, v)| v.verified)
            .map(|(recorded, _)| recorded.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &VerifiedImage)> {
        self.data.iter()
    }

    pub fn merge(&mut self, other: &ImageVerificationMetadata) {
        for (image, record) in &other.data {
            self.data.insert(image.clone(), *record);
        }
    }

    /// Parse the value of the verification annotation.
    pub fn from_annotation(value: &str) -> Result<Self> {
        Ok(serde_json::from_str(value)?)
    }

    pub fn to_annotation(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Read the metadata stored in the `annotation_key` annotation of
    /// `resource`, if any.
    pub fn from_resource(resource: &Value, annotation_key: &str) -> Result<Option<Self>> {
        annotation_value(resource, annotation_key)
            .map(Self::from_annotation)
            .transpose()
    }

    /// The patch storing the metadata inside of the `annotation_key`
    /// annotation of `resource`.
    ///
    /// Nothing is returned when the annotation already holds the same
    /// metadata.
    pub fn patches(&self, annotation_key: &str, resource: &Value) -> Result<Vec<PatchOperation>> {
        let value = self.to_annotation()?;

        if let Some(current) = annotation_value(resource, annotation_key) {
            if annotation_values_equal(current, &value) {
                return Ok(Vec::new());
            }
            return Ok(vec![PatchOperation::replace(
                annotation_pointer(annotation_key),
                Value::String(value),
            )]);
        }

        // a null member is replaced as a whole
        let patch = if resource
            .pointer("/metadata/annotations")
            .is_some_and(Value::is_object)
        {
            PatchOperation::add(annotation_pointer(annotation_key), Value::String(value))
        } else if resource.get("metadata").is_some_and(Value::is_object) {
            PatchOperation::add(
                "/metadata/annotations",
                json!({ annotation_key: value }),
            )
        } else {
            PatchOperation::add(
                "/metadata",
                json!({ "annotations": { annotation_key: value } }),
            )
        };
        Ok(vec![patch])
    }
}

fn annotation_pointer(annotation_key: &str) -> String {
    format!("/metadata/annotations/{}", escape_pointer_token(annotation_key))
}

/// The raw value of an annotation of `resource`.
pub fn annotation_value<'a>(resource: &'a Value, annotation_key: &str) -> Option<&'a str> {
    resource
        .get("metadata")?
        .get("annotations")?
        .get(annotation_key)?
        .as_str()
}

/// Compare two annotation values as JSON documents when both parse, as
/// strings otherwise.
fn annotation_values_equal(a: &str, b: &str) -> bool {
    match (
        serde_json::from_str::<Value>(a),
        serde_json::from_str::<Value>(b),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Detect whether the verification annotation differs between the previous
/// and the incoming version of a resource.
///
/// A missing annotation and an explicit one are different, whatever the
/// explicit value is. Without a previous version, any annotation counts as
/// a change.
pub fn has_verification_annotation_changed(
    new_resource: &Value,
    old_resource: Option<&Value>,
    annotation_key: &str,
) -> bool {
    let new = annotation_value(new_resource, annotation_key);
    let old = old_resource.and_then(|r| annotation_value(r, annotation_key));

    match (new, old) {
        (None, None) => false,
        (Some(new), Some(old)) => !annotation_values_equal(new, old),
        _ => true,
    }
}
