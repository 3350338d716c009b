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

//! Variables available to policies.
//!
//! Policy strings can reference data with the `{{ path }}` syntax, where
//! `path` is a dotted path with optional `[n]` array indexes, for example
//! `{{ request.object.spec.containers[0].image }}`.
//!
//! The engine only relies on the [`VariableContext`] trait; [`JsonContext`]
//! is the implementation backed by a JSON document.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::errors::{ImageGuardError, Result};
use crate::policy::ContextEntry;

/// Resolves variables against some data.
pub trait VariableContext: Send + Sync {
    /// Look up `path`. `Ok(None)` means the path does not exist.
    fn query(&self, path: &str) -> Result<Option<Value>>;

    /// Replace every variable found inside of `value`, recursively.
    ///
    /// A string made of a single variable is replaced by the value of the
    /// variable, whatever its type. Otherwise variables are interpolated
    /// as strings.
    fn substitute(&self, value: &Value) -> Result<Value> {
        substitute_value(self, value)
    }

    /// Like [`VariableContext::substitute`], for a string that must remain a
    /// string.
    fn substitute_str(&self, value: &str) -> Result<String> {
        match substitute_string(self, value)? {
            Value::String(s) => Ok(s),
            other => Ok(other.to_string()),
        }
    }
}

fn resolve<C: VariableContext + ?Sized>(ctx: &C, path: &str) -> Result<Value> {
    ctx.query(path)?
        .ok_or_else(|| ImageGuardError::UnresolvedVariable(path.to_string()))
}

fn single_variable(s: &str) -> Option<&str> {
    let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn substitute_string<C: VariableContext + ?Sized>(ctx: &C, s: &str) -> Result<Value> {
    if let Some(path) = single_variable(s) {
        return resolve(ctx, path);
    }

    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            // unterminated, kept verbatim
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        match resolve(ctx, after[..end].trim())? {
            Value::String(v) => out.push_str(&v),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    Ok(Value::String(out))
}

fn substitute_value<C: VariableContext + ?Sized>(ctx: &C, value: &Value) -> Result<Value> {
    match value {
        Value::String(s) => substitute_string(ctx, s),
        Value::Array(items) => items
            .iter()
            .map(|v| substitute_value(ctx, v))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), substitute_value(ctx, v)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Walk `root` following a dotted path with optional `[n]` indexes.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }

    let mut current = root;
    for segment in path.split('.') {
        let (name, indexes) = match segment.find('[') {
            Some(i) => segment.split_at(i),
            None => (segment, ""),
        };
        if !name.is_empty() {
            current = current.get(name)?;
        }
        for index in indexes.split('[').skip(1) {
            let n: usize = index.strip_suffix(']')?.trim().parse().ok()?;
            current = current.get(n)?;
        }
    }
    Some(current)
}

/// A [`VariableContext`] backed by a JSON object.
///
/// The resource under admission is available at `request.object`, its
/// previous version at `request.oldObject`. Context entries are added at
/// the top level, under their name.
#[derive(Debug, Clone)]
pub struct JsonContext {
    data: Value,
}

impl Default for JsonContext {
    fn default() -> Self {
        JsonContext { data: json!({}) }
    }
}

impl JsonContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_resource(resource: &Value, old_resource: Option<&Value>) -> Self {
        let mut request = Map::new();
        request.insert("object".to_string(), resource.clone());
        if let Some(old) = old_resource {
            request.insert("oldObject".to_string(), old.clone());
        }
        JsonContext {
            data: json!({ "request": request }),
        }
    }

    /// Add `value` at the top level, under `name`.
    pub fn add(&mut self, name: &str, value: Value) {
        if let Value::Object(map) = &mut self.data {
            map.insert(name.to_string(), value);
        }
    }

    pub fn data(&self) -> &Value {
        &self.data
    }
}

impl VariableContext for JsonContext {
    fn query(&self, path: &str) -> Result<Option<Value>> {
        Ok(lookup(&self.data, path).cloned())
    }
}

/// Extra data layered on top of another context. Paths are looked up in
/// the extra data first.
pub struct DataOverlay<'a> {
    data: &'a Value,
    parent: &'a dyn VariableContext,
}

impl<'a> DataOverlay<'a> {
    pub fn new(data: &'a Value, parent: &'a dyn VariableContext) -> Self {
        DataOverlay { data, parent }
    }
}

impl VariableContext for DataOverlay<'_> {
    fn query(&self, path: &str) -> Result<Option<Value>> {
        match lookup(self.data, path) {
            Some(v) => Ok(Some(v.clone())),
            None => self.parent.query(path),
        }
    }
}

/// Capability to read config maps from the cluster.
#[async_trait]
pub trait ConfigMapResolver: Send + Sync {
    /// Return the whole config map object, with its `data` section.
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Value>;
}

/// Config maps held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigMapResolver {
    config_maps: HashMap<(String, String), Value>,
}

impl StaticConfigMapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_map(
        mut self,
        namespace: &str,
        name: &str,
        data: HashMap<String, String>,
    ) -> Self {
        let config_map = json!({
            "metadata": {"name": name, "namespace": namespace},
            "data": data,
        });
        self.config_maps
            .insert((namespace.to_string(), name.to_string()), config_map);
        self
    }
}

#[async_trait]
impl ConfigMapResolver for StaticConfigMapResolver {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Value> {
        self.config_maps
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ImageGuardError::ConfigMapError {
                namespace: namespace.to_string(),
                name: name.to_string(),
                error: "not found".to_string(),
            })
    }
}

/// Load the context entries of a rule into `context`, in order. Entries
/// can reference the ones defined before them.
pub async fn load_context_entries(
    entries: &[ContextEntry],
    resolver: Option<&dyn ConfigMapResolver>,
    context: &mut JsonContext,
) -> Result<()> {
    for entry in entries {
        if let Some(reference) = &entry.config_map {
            let name = context.substitute_str(&reference.name)?;
            let namespace = context.substitute_str(&reference.namespace)?;
            let resolver = resolver.ok_or_else(|| {
                ImageGuardError::ConfigMapResolverNotConfigured(format!("{namespace}/{name}"))
            })?;
            debug!(entry = entry.name.as_str(), %namespace, %name, "loading config map");
            let config_map = resolver.get_config_map(&namespace, &name).await?;
            context.add(&entry.name, config_map);
        } else if let Some(variable) = &entry.variable {
            let value = match (&variable.value, &variable.path) {
                (Some(value), _) => Some(context.substitute(value)?),
                (None, Some(path)) => context.query(&context.substitute_str(path)?)?,
                (None, None) => None,
            };
            let value = value
                .or_else(|| variable.default.clone())
                .ok_or_else(|| ImageGuardError::UnresolvedVariable(entry.name.clone()))?;
            context.add(&entry.name, value);
        } else {
            return Err(ImageGuardError::InvalidResource(format!(
                "context entry {} has no source",
                entry.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::policy::{ConfigMapReference, VariableEntry};
    use rstest::rstest;

    fn pod_context() -> JsonContext {
        JsonContext::from_resource(
            &json!({
                "metadata": {"name": "test", "namespace": "default"},
                "spec": {"containers": [
                    {"name": "a", "image": "nginx:1.25"},
                    {"name": "b", "image": "ghcr.io/foo/bar:1", "ports": [80, 443]}
                ]}
            }),
            None,
        )
    }

    #[rstest]
    #[case("request.object.metadata.name", Some(json!("test")))]
    #[case("request.object.spec.containers[1].image", Some(json!("ghcr.io/foo/bar:1")))]
    #[case("request.object.spec.containers[1].ports[1]", Some(json!(443)))]
    #[case("request.object.spec.containers[7].image", None)]
    #[case("request.object.missing", None)]
    #[case("request.oldObject", None)]
    #[case("", None)]
    fn query_paths(#[case] path: &str, #[case] expected: Option<Value>) {
        assert_eq!(pod_context().query(path).unwrap(), expected);
    }

    #[test]
    fn substitute_single_variable_keeps_type() {
        let ctx = pod_context();
        let value = ctx
            .substitute(&json!("{{ request.object.spec.containers[1].ports }}"))
            .unwrap();
        assert_eq!(value, json!([80, 443]));
    }

    #[test]
    fn substitute_interpolates() {
        let ctx = pod_context();
        let value = ctx
            .substitute(&json!({
                "msg": "pod {{request.object.metadata.namespace}}/{{ request.object.metadata.name }}",
                "list": ["{{ request.object.spec.containers[0].name }}", 3]
            }))
            .unwrap();
        assert_eq!(value, json!({"msg": "pod default/test", "list": ["a", 3]}));
    }

    #[test]
    fn unresolved_variable_is_a_configuration_error() {
        let ctx = pod_context();
        let err = ctx.substitute_str("{{ nothing.here }}").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn overlay_takes_precedence() {
        let ctx = pod_context();
        let predicate = json!({"repo": {"branch": "main"}, "request": {"object": "shadow"}});
        let overlay = DataOverlay::new(&predicate, &ctx);

        assert_eq!(
            overlay.substitute_str("{{ repo.branch }}").unwrap(),
            "main".to_string()
        );
        assert_eq!(
            overlay.query("request.object").unwrap(),
            Some(json!("shadow"))
        );
        assert_eq!(
            overlay.query("request.oldObject").unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn load_config_map_entry() {
        let resolver = StaticConfigMapResolver::new().with_config_map(
            "default",
            "keys",
            HashMap::from([("pub".to_string(), "PEM".to_string())]),
        );
        let entries = vec![
            ContextEntry {
                name: "myconfigmap".to_string(),
                config_map: Some(ConfigMapReference {
                    name: "keys".to_string(),
                    namespace: "{{ request.object.metadata.namespace }}".to_string(),
                }),
                variable: None,
            },
            ContextEntry {
                name: "key".to_string(),
                config_map: None,
                variable: Some(VariableEntry {
                    path: Some("myconfigmap.data.pub".to_string()),
                    ..Default::default()
                }),
            },
        ];
        let mut ctx = pod_context();

        load_context_entries(&entries, Some(&resolver), &mut ctx)
            .await
            .expect("cannot load context");
        assert_eq!(ctx.substitute_str("{{ key }}").unwrap(), "PEM");
    }

    #[tokio::test]
    async fn missing_config_map_is_a_transport_error() {
        let entries = vec![ContextEntry {
            name: "myconfigmap".to_string(),
            config_map: Some(ConfigMapReference {
                name: "missing".to_string(),
                namespace: "default".to_string(),
            }),
            variable: None,
        }];
        let mut ctx = pod_context();

        let err = load_context_entries(&entries, Some(&StaticConfigMapResolver::new()), &mut ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        let err = load_context_entries(&entries, None, &mut ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn variable_default() {
        let entries = vec![ContextEntry {
            name: "branch".to_string(),
            config_map: None,
            variable: Some(VariableEntry {
                path: Some("request.object.metadata.labels.branch".to_string()),
                default: Some(json!("main")),
                ..Default::default()
            }),
        }];
        let mut ctx = pod_context();
        load_context_entries(&entries, None, &mut ctx).await.unwrap();
        assert_eq!(ctx.query("branch").unwrap(), Some(json!("main")));
    }
}
