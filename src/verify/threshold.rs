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

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

use super::trust_tree::{AttestorNode, LeafAttestor};
use crate::errors::Result;

/// Outcome of a single leaf check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafResult {
    /// Human readable identity of the attestor.
    pub attestor: String,
    pub verified: bool,
    /// Why the leaf was not verified, when known.
    pub error: Option<String>,
}

/// Checks a single leaf of the trust tree.
///
/// Errors returned by `verify_leaf` abort the evaluation of the whole tree;
/// checks that merely did not verify must be reported as a [`LeafResult`]
/// with `verified == false`.
#[async_trait]
pub trait LeafVerifier: Sync {
    async fn verify_leaf(&self, leaf: &LeafAttestor) -> Result<LeafResult>;
}

/// Evaluate the trust tree rooted at `node`.
///
/// The children of a group are checked concurrently. Evaluation of a group
/// stops as soon as its outcome is known, the checks still in flight are
/// dropped.
pub fn evaluate<'a>(
    node: &'a AttestorNode,
    verifier: &'a dyn LeafVerifier,
) -> BoxFuture<'a, Result<bool>> {
    async move {
        match node {
            AttestorNode::Leaf(leaf) => {
                let result = verifier.verify_leaf(leaf).await?;
                debug!(attestor = %result.attestor, verified = result.verified, error = ?result.error, "leaf checked");
                Ok(result.verified)
            }
            AttestorNode::Group { count, children } => {
                let required = if *count == 0 { children.len() } else { *count };
                let mut pending: FuturesUnordered<_> = children
                    .iter()
                    .map(|child| evaluate(child, verifier))
                    .collect();

                let (mut passed, mut failed) = (0, 0);
                while let Some(result) = pending.next().await {
                    if result? {
                        passed += 1;
                    } else {
                        failed += 1;
                    }
                    if passed >= required {
                        return Ok(true);
                    }
                    if children.len() - failed < required {
                        return Ok(false);
                    }
                }
                Ok(passed >= required)
            }
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ErrorKind, ImageGuardError};
    use crate::verify::trust_tree::KeySource;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Leaves are named after their outcome: "pass", "fail" or "error".
    #[derive(Default)]
    struct NamedVerifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LeafVerifier for NamedVerifier {
        async fn verify_leaf(&self, leaf: &LeafAttestor) -> Result<LeafResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let KeySource::StaticKey(name) = &leaf.source else {
                panic!("unexpected leaf");
            };
            match name.as_str() {
                "error" => Err(ImageGuardError::RegistryPullError {
                    image: "ghcr.io/foo/bar".to_string(),
                    error: "connection refused".to_string(),
                }),
                other => Ok(LeafResult {
                    attestor: other.to_string(),
                    verified: other == "pass",
                    error: None,
                }),
            }
        }
    }

    fn leaf(name: &str) -> AttestorNode {
        AttestorNode::Leaf(LeafAttestor {
            source: KeySource::StaticKey(name.to_string()),
        })
    }

    fn group(count: usize, children: Vec<AttestorNode>) -> AttestorNode {
        AttestorNode::Group { count, children }
    }

    #[rstest]
    #[case(0, &["pass", "pass"], true)]
    #[case(0, &["pass", "fail"], false)]
    #[case(0, &["fail", "fail"], false)]
    #[case(1, &["pass", "fail"], true)]
    #[case(1, &["fail", "pass"], true)]
    #[case(1, &["fail", "fail"], false)]
    #[case(2, &["pass", "fail", "pass"], true)]
    #[case(2, &["pass", "fail", "fail"], false)]
    #[case(3, &["pass", "pass", "pass"], true)]
    #[tokio::test]
    async fn flat_groups(#[case] count: usize, #[case] leaves: &[&str], #[case] expected: bool) {
        let node = group(count, leaves.iter().map(|l| leaf(l)).collect());
        let verifier = NamedVerifier::default();
        assert_eq!(evaluate(&node, &verifier).await.unwrap(), expected);
    }

    #[rstest]
    // AND of ANDs
    #[case(group(0, vec![leaf("pass"), group(0, vec![leaf("pass"), leaf("pass")])]), true)]
    #[case(group(0, vec![leaf("pass"), group(0, vec![leaf("pass"), leaf("fail")])]), false)]
    // AND of ORs
    #[case(group(0, vec![leaf("pass"), group(1, vec![leaf("fail"), leaf("pass")])]), true)]
    #[case(group(0, vec![leaf("pass"), group(1, vec![leaf("fail"), leaf("fail")])]), false)]
    // OR of ANDs
    #[case(group(1, vec![leaf("fail"), group(0, vec![leaf("pass"), leaf("pass")])]), true)]
    // 2 of 3, where one child is itself 2 of 3
    #[case(group(2, vec![
        leaf("fail"),
        leaf("pass"),
        group(2, vec![leaf("pass"), leaf("fail"), leaf("pass")]),
    ]), true)]
    #[case(group(2, vec![
        leaf("fail"),
        leaf("pass"),
        group(2, vec![leaf("pass"), leaf("fail"), leaf("fail")]),
    ]), false)]
    #[case(group(1, vec![
        group(2, vec![leaf("fail"), leaf("pass"), leaf("fail")]),
        group(1, vec![leaf("fail"), group(0, vec![leaf("pass")])]),
    ]), true)]
    #[tokio::test]
    async fn nested_groups(#[case] node: AttestorNode, #[case] expected: bool) {
        let verifier = NamedVerifier::default();
        assert_eq!(evaluate(&node, &verifier).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn fatal_errors_abort_the_evaluation() {
        let node = group(1, vec![leaf("fail"), leaf("error"), leaf("fail")]);
        let verifier = NamedVerifier::default();
        let err = evaluate(&node, &verifier).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn evaluation_stops_once_the_outcome_is_known() {
        let node = group(
            0,
            vec![
                leaf("fail"),
                group(0, vec![leaf("pass"), leaf("pass")]),
                group(0, vec![leaf("pass"), leaf("pass")]),
            ],
        );
        let verifier = NamedVerifier::default();
        assert!(!evaluate(&node, &verifier).await.unwrap());
        assert!(verifier.calls.load(Ordering::SeqCst) < 5);
    }
}
