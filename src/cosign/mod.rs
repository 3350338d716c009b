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

//! Formats of the objects written by cosign next to a signed image.
//!
//! Signatures are stored at `<registry>/<repository>:sha256-<hex>.sig`,
//! attestations at `<registry>/<repository>:sha256-<hex>.att`. Each layer of
//! these objects is exposed as a [`SignatureLayer`].

pub mod constants;
pub mod payload;

mod signature_layers;
pub use signature_layers::SignatureLayer;

#[cfg(test)]
pub(crate) use signature_layers::tests::{attestation_layer, signed_layer};
