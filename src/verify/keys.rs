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

use std::collections::HashMap;

use async_trait::async_trait;

use super::trust_tree::KeySource;
use crate::crypto::CosignVerificationKey;
use crate::errors::{ImageGuardError, Result};
use crate::policy::SecretReference;

/// Capability to fetch public keys that are not written inline in the
/// policy.
///
/// Both methods return a PEM encoded public key.
#[async_trait]
pub trait KeyStore: Send + Sync {
    async fn secret_public_key(&self, secret: &SecretReference) -> Result<String>;

    async fn kms_public_key(&self, kms: &str) -> Result<String>;
}

/// Keys held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyStore {
    secrets: HashMap<SecretReference, String>,
    kms: HashMap<String, String>,
}

impl StaticKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, namespace: &str, name: &str, pem: &str) -> Self {
        self.secrets.insert(
            SecretReference {
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            pem.to_string(),
        );
        self
    }

    pub fn with_kms_key(mut self, kms: &str, pem: &str) -> Self {
        self.kms.insert(kms.to_string(), pem.to_string());
        self
    }
}

#[async_trait]
impl KeyStore for StaticKeyStore {
    async fn secret_public_key(&self, secret: &SecretReference) -> Result<String> {
        self.secrets
            .get(secret)
            .cloned()
            .ok_or_else(|| ImageGuardError::KeyStoreError {
                reference: format!("{}/{}", secret.namespace, secret.name),
                error: "secret not found".to_string(),
            })
    }

    async fn kms_public_key(&self, kms: &str) -> Result<String> {
        self.kms
            .get(kms)
            .cloned()
            .ok_or_else(|| ImageGuardError::KeyStoreError {
                reference: kms.to_string(),
                error: "key not found".to_string(),
            })
    }
}

/// Obtain the verification key of a leaf.
pub(crate) async fn verification_key(
    source: &KeySource,
    key_store: Option<&dyn KeyStore>,
) -> Result<CosignVerificationKey> {
    match source {
        KeySource::StaticKey(pem) => CosignVerificationKey::try_from_pem(pem.as_bytes()),
        KeySource::Certificate(pem) => CosignVerificationKey::try_from_certificate_pem(pem.as_bytes()),
        KeySource::Secret(secret) => {
            let store = key_store.ok_or_else(|| {
                ImageGuardError::KeyStoreNotConfigured(format!(
                    "secret {}/{}",
                    secret.namespace, secret.name
                ))
            })?;
            let pem = store.secret_public_key(secret).await?;
            CosignVerificationKey::try_from_pem(pem.as_bytes())
        }
        KeySource::Kms(kms) => {
            let store = key_store
                .ok_or_else(|| ImageGuardError::KeyStoreNotConfigured(kms.clone()))?;
            let pem = store.kms_public_key(kms).await?;
            CosignVerificationKey::try_from_pem(pem.as_bytes())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::tests::generate_p256_key;
    use crate::errors::ErrorKind;

    #[tokio::test]
    async fn resolve_key_sources() {
        let (_, pem) = generate_p256_key();
        let store = StaticKeyStore::new()
            .with_secret("default", "testsecret", &pem)
            .with_kms_key("gcpkms://foo", &pem);
        let secret = KeySource::Secret(SecretReference {
            name: "testsecret".to_string(),
            namespace: "default".to_string(),
        });

        verification_key(&KeySource::StaticKey(pem.clone()), None)
            .await
            .expect("inline key");
        verification_key(&secret, Some(&store))
            .await
            .expect("secret key");
        verification_key(&KeySource::Kms("gcpkms://foo".to_string()), Some(&store))
            .await
            .expect("kms key");
    }

    #[tokio::test]
    async fn key_store_errors() {
        let secret = KeySource::Secret(SecretReference {
            name: "missing".to_string(),
            namespace: "default".to_string(),
        });

        let err = verification_key(&secret, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = verification_key(&secret, Some(&StaticKeyStore::new()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        let err = verification_key(&KeySource::StaticKey("garbage".to_string()), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
