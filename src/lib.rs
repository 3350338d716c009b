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

//! Verification of container image signatures and attestations for
//! admission controllers.
//!
//! Given a resource (a Pod, a Deployment, a CronJob...) and a policy whose
//! rules declare the trust requirements of images, this crate:
//!
//! * finds the container images of the resource matched by each rule,
//! * checks them against trees of attestors (public keys, secret or KMS
//!   backed keys, certificates, nested sets with "m of n" thresholds),
//!   using the cosign signatures and in-toto attestations stored in the
//!   registry,
//! * evaluates conditions over the predicates of the verified attestations,
//! * returns a verdict per rule together with the JSON patches pinning the
//!   images to their digest and recording the verification on the resource.
//!
//! The entry point is [`verify::ImageVerifier`], built through
//! [`verify::ImageVerifierBuilder`]. Registry access goes through the
//! [`registry::RegistryTransport`] capability: [`registry::OciTransport`]
//! talks to OCI registries, [`registry::StaticTransport`] serves fixed
//! responses.
//!
//! This crate does not decide which rules apply to a resource, that is
//! left to the caller.

pub mod context;
pub mod cosign;
pub mod crypto;
pub mod errors;
pub mod policy;
pub mod registry;
pub mod verify;
