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

//! Normalization of the attestors declared by a policy into a tree of
//! checks.
//!
//! Resolution happens in four steps:
//!   1. references to named attestor sets are inlined
//!   2. variables are substituted
//!   3. static keys are expanded, see [`expand_static_keys`]
//!   4. the result is validated and turned into an [`AttestorNode`]

use std::collections::HashMap;
use std::fmt;

use crate::context::VariableContext;
use crate::crypto::split_pem_keys;
use crate::errors::{ImageGuardError, Result};
use crate::policy::{Attestor, AttestorSet, CertificateAttestor, SecretReference, StaticKeyAttestor};

/// Where the key of a leaf comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// A single PEM encoded public key.
    StaticKey(String),
    /// A public key stored inside of a secret.
    Secret(SecretReference),
    /// A public key held by a KMS.
    Kms(String),
    /// A PEM encoded certificate.
    Certificate(String),
}

/// A single trust check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafAttestor {
    pub source: KeySource,
}

impl fmt::Display for LeafAttestor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            KeySource::StaticKey(_) => write!(f, "public key"),
            KeySource::Secret(s) => write!(f, "secret {}/{}", s.namespace, s.name),
            KeySource::Kms(k) => write!(f, "kms {k}"),
            KeySource::Certificate(_) => write!(f, "certificate"),
        }
    }
}

/// Normalized trust tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttestorNode {
    Leaf(LeafAttestor),
    /// Satisfied when at least `count` children are, `count == 0` meaning
    /// all of them.
    Group {
        count: usize,
        children: Vec<AttestorNode>,
    },
}

impl AttestorNode {
    /// Number of leaves of the tree.
    pub fn leaves(&self) -> usize {
        match self {
            AttestorNode::Leaf(_) => 1,
            AttestorNode::Group { children, .. } => children.iter().map(|c| c.leaves()).sum(),
        }
    }
}

/// Expand the static keys of an attestor set.
///
/// An entry whose `publicKeys` field holds `k` PEM blocks becomes `k`
/// entries holding one key each, in their original order. An entry
/// combining several key sources becomes one entry per source, ordered:
/// public keys, secret, KMS, certificate. Nested sets are expanded too.
pub fn expand_static_keys(set: &AttestorSet) -> Result<AttestorSet> {
    let mut entries = Vec::with_capacity(set.entries.len());

    for (index, entry) in set.entries.iter().enumerate() {
        check_single_source(index, entry)?;
        if let Some(nested) = &entry.attestor {
            entries.push(Attestor {
                attestor: Some(Box::new(expand_static_keys(nested)?)),
                ..entry.clone()
            });
            continue;
        }

        let mut expanded = Vec::new();
        if let Some(keys) = &entry.keys {
            for pem in split_pem_keys(&keys.public_keys)? {
                expanded.push(key_entry(StaticKeyAttestor {
                    public_keys: pem,
                    ..Default::default()
                }));
            }
            if let Some(secret) = &keys.secret {
                expanded.push(key_entry(StaticKeyAttestor {
                    secret: Some(secret.clone()),
                    ..Default::default()
                }));
            }
            if !keys.kms.is_empty() {
                expanded.push(key_entry(StaticKeyAttestor {
                    kms: keys.kms.clone(),
                    ..Default::default()
                }));
            }
        }
        if let Some(certificates) = &entry.certificates {
            if entry.keys.is_some() {
                expanded.push(Attestor {
                    certificates: Some(certificates.clone()),
                    ..Default::default()
                });
            }
        }

        if expanded.is_empty() {
            entries.push(entry.clone());
        } else {
            entries.extend(expanded);
        }
    }

    Ok(AttestorSet {
        count: set.count,
        entries,
    })
}

/// A nested set, inline or named, cannot be combined with keys or
/// certificates in the same entry.
fn check_single_source(index: usize, entry: &Attestor) -> Result<()> {
    let nested = entry.attestor.is_some() || entry.attestor_ref.is_some();
    if nested && (entry.keys.is_some() || entry.certificates.is_some()) {
        return Err(ImageGuardError::AttestorWithMixedSources { index });
    }
    Ok(())
}

fn key_entry(keys: StaticKeyAttestor) -> Attestor {
    Attestor {
        keys: Some(keys),
        ..Default::default()
    }
}

/// Turns the attestor sets of a policy into an [`AttestorNode`].
pub struct TrustTreeResolver<'a> {
    library: &'a HashMap<String, AttestorSet>,
    context: &'a dyn VariableContext,
}

impl<'a> TrustTreeResolver<'a> {
    /// `library` holds the attestor sets that can be referenced by name.
    pub fn new(
        library: &'a HashMap<String, AttestorSet>,
        context: &'a dyn VariableContext,
    ) -> Self {
        TrustTreeResolver { library, context }
    }

    /// Resolve a list of attestor sets, all of them must be satisfied.
    pub fn resolve(&self, sets: &[AttestorSet]) -> Result<AttestorNode> {
        let mut nodes = sets
            .iter()
            .map(|set| self.resolve_set(set))
            .collect::<Result<Vec<_>>>()?;

        match nodes.len() {
            0 => Err(ImageGuardError::EmptyAttestorSet),
            1 => Ok(nodes.remove(0)),
            _ => Ok(AttestorNode::Group {
                count: 0,
                children: nodes,
            }),
        }
    }

    fn resolve_set(&self, set: &AttestorSet) -> Result<AttestorNode> {
        let inlined = self.inline_refs(set, &mut Vec::new())?;
        let substituted = self.substitute(&inlined)?;
        let expanded = expand_static_keys(&substituted)?;
        build_node(&expanded)
    }

    fn inline_refs(&self, set: &AttestorSet, stack: &mut Vec<String>) -> Result<AttestorSet> {
        let mut entries = Vec::with_capacity(set.entries.len());
        for (index, entry) in set.entries.iter().enumerate() {
            check_single_source(index, entry)?;
            let entry = if let Some(name) = &entry.attestor_ref {
                if stack.contains(name) {
                    return Err(ImageGuardError::AttestorRefCycle(name.clone()));
                }
                let referenced = self
                    .library
                    .get(name)
                    .ok_or_else(|| ImageGuardError::AttestorRefNotFound(name.clone()))?;
                stack.push(name.clone());
                let inlined = self.inline_refs(referenced, stack)?;
                stack.pop();
                Attestor {
                    attestor: Some(Box::new(inlined)),
                    ..Default::default()
                }
            } else if let Some(nested) = &entry.attestor {
                Attestor {
                    attestor: Some(Box::new(self.inline_refs(nested, stack)?)),
                    ..entry.clone()
                }
            } else {
                entry.clone()
            };
            entries.push(entry);
        }

        Ok(AttestorSet {
            count: set.count,
            entries,
        })
    }

    fn substitute(&self, set: &AttestorSet) -> Result<AttestorSet> {
        let ctx = self.context;
        let mut entries = Vec::with_capacity(set.entries.len());
        for entry in &set.entries {
            let keys = match &entry.keys {
                Some(keys) => Some(StaticKeyAttestor {
                    public_keys: ctx.substitute_str(&keys.public_keys)?,
                    secret: match &keys.secret {
                        Some(secret) => Some(SecretReference {
                            name: ctx.substitute_str(&secret.name)?,
                            namespace: ctx.substitute_str(&secret.namespace)?,
                        }),
                        None => None,
                    },
                    kms: ctx.substitute_str(&keys.kms)?,
                }),
                None => None,
            };
            let certificates = match &entry.certificates {
                Some(c) => Some(CertificateAttestor {
                    cert: ctx.substitute_str(&c.cert)?,
                }),
                None => None,
            };
            let attestor = match &entry.attestor {
                Some(nested) => Some(Box::new(self.substitute(nested)?)),
                None => None,
            };
            entries.push(Attestor {
                keys,
                certificates,
                attestor,
                attestor_ref: None,
            });
        }

        Ok(AttestorSet {
            count: set.count,
            entries,
        })
    }
}

fn build_node(set: &AttestorSet) -> Result<AttestorNode> {
    if set.entries.is_empty() {
        return Err(ImageGuardError::EmptyAttestorSet);
    }

    let children = set
        .entries
        .iter()
        .enumerate()
        .map(|(index, entry)| build_entry(index, entry))
        .collect::<Result<Vec<_>>>()?;

    let count = set.count.unwrap_or(0);
    if count > children.len() {
        return Err(ImageGuardError::AttestorCountOutOfRange {
            count,
            entries: children.len(),
        });
    }

    Ok(AttestorNode::Group { count, children })
}

fn build_entry(index: usize, entry: &Attestor) -> Result<AttestorNode> {
    if let Some(nested) = &entry.attestor {
        return build_node(nested);
    }

    let source = if let Some(keys) = &entry.keys {
        if !keys.public_keys.trim().is_empty() {
            Some(KeySource::StaticKey(keys.public_keys.clone()))
        } else if let Some(secret) = &keys.secret {
            Some(KeySource::Secret(secret.clone()))
        } else if !keys.kms.is_empty() {
            Some(KeySource::Kms(keys.kms.clone()))
        } else {
            None
        }
    } else {
        entry
            .certificates
            .as_ref()
            .filter(|c| !c.cert.trim().is_empty())
            .map(|c| KeySource::Certificate(c.cert.clone()))
    };

    source
        .map(|source| AttestorNode::Leaf(LeafAttestor { source }))
        .ok_or(ImageGuardError::AttestorWithoutKeySource { index })
}
