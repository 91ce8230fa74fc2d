//! HSM-backed key set manager
//!
//! Generation: resolve the algorithm, build attribute templates, generate on
//! the device, assemble entries. Retrieval: locate, classify usage, assemble.
//! Deletion: locate, destroy. Adding or updating keys is refused outright,
//! since the device never accepts key material from outside.

use async_trait::async_trait;
use std::sync::Arc;

use crate::algorithm::Algorithm;
use crate::attributes::{AttributeKind, KeyPairTemplates};
use crate::device::{DeviceStore, KeyPair, KeyPairHandle};
use crate::error::KeyManagerError;
use crate::jwk::{
    DeviceSigner, JsonWebKey, KeyMaterial, KeySet, Usage, private_key_id, public_key_id,
};

/// Uniform key set manager contract used by the issuer.
#[async_trait]
pub trait KeyManager: Send + Sync {
    /// Generate one key pair in `set` and return its private and public entries.
    async fn generate_key_set(
        &self,
        set: &str,
        kid: &str,
        algorithm: &str,
        usage: Usage,
    ) -> Result<KeySet, KeyManagerError>;

    async fn get_key(&self, set: &str, kid: &str) -> Result<KeySet, KeyManagerError>;

    async fn get_key_set(&self, set: &str) -> Result<KeySet, KeyManagerError>;

    async fn delete_key(&self, set: &str, kid: &str) -> Result<(), KeyManagerError>;

    /// Delete every key in `set`, stopping at the first failure. Keys already
    /// deleted stay deleted.
    async fn delete_key_set(&self, set: &str) -> Result<(), KeyManagerError>;

    async fn add_key(&self, set: &str, key: &JsonWebKey) -> Result<(), KeyManagerError>;

    async fn add_key_set(&self, set: &str, keys: &KeySet) -> Result<(), KeyManagerError>;

    async fn update_key(&self, set: &str, key: &JsonWebKey) -> Result<(), KeyManagerError>;

    async fn update_key_set(&self, set: &str, keys: &KeySet) -> Result<(), KeyManagerError>;
}

/// [`KeyManager`] whose keys live only on a [`DeviceStore`].
pub struct HsmKeyManager<S: DeviceStore> {
    store: Arc<S>,
}

impl<S: DeviceStore> std::fmt::Debug for HsmKeyManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmKeyManager").finish_non_exhaustive()
    }
}

impl<S: DeviceStore> HsmKeyManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // ==================== Key Generator ====================

    async fn generate(
        &self,
        set: &str,
        kid: &str,
        algorithm: Algorithm,
        usage: Usage,
    ) -> Result<Arc<S::KeyPair>, KeyManagerError> {
        let templates = KeyPairTemplates::for_usage(kid, set, usage);
        Ok(self
            .store
            .generate_key_pair(
                &templates.public,
                &templates.private,
                algorithm.key_parameters(),
            )
            .await?)
    }

    // ==================== Key Locator ====================

    async fn find_one(&self, set: &str, kid: &str) -> Result<Arc<S::KeyPair>, KeyManagerError> {
        self.store
            .find_key_pair(kid.as_bytes(), set.as_bytes())
            .await?
            .ok_or_else(|| KeyManagerError::NotFound(format!("{}/{}", set, kid)))
    }

    async fn find_all(&self, set: &str) -> Result<Vec<Arc<S::KeyPair>>, KeyManagerError> {
        let key_pairs = self.store.find_key_pairs(None, set.as_bytes()).await?;
        if key_pairs.is_empty() {
            return Err(KeyManagerError::NotFound(set.to_string()));
        }
        Ok(key_pairs)
    }

    // ==================== Usage Classifier ====================

    /// Encryption only when the flag reads back true; any read failure
    /// counts as a signing key.
    async fn classify(&self, key_pair: &S::KeyPair) -> Usage {
        match self
            .store
            .get_attribute(key_pair, AttributeKind::Encrypt)
            .await
        {
            Ok(Some(attribute)) if attribute.as_bool() == Some(true) => Usage::Encryption,
            _ => Usage::Signature,
        }
    }

    async fn read_kid(&self, key_pair: &S::KeyPair) -> Result<String, KeyManagerError> {
        let attribute = self
            .store
            .get_attribute(key_pair, AttributeKind::Id)
            .await?
            .ok_or_else(|| KeyManagerError::InvalidKeyId("key pair has no id".to_string()))?;
        let id = attribute
            .as_bytes()
            .ok_or_else(|| KeyManagerError::InvalidKeyId("id is not a byte string".to_string()))?;
        String::from_utf8(id.to_vec())
            .map_err(|e| KeyManagerError::InvalidKeyId(format!("id is not UTF-8: {}", e)))
    }
}

// ==================== Key-Set Assembler ====================

/// Private and public entries for one key pair, in that order.
pub fn assemble_one(
    handle: KeyPairHandle,
    kid: &str,
    algorithm: Algorithm,
    usage: Usage,
) -> [JsonWebKey; 2] {
    let public_key = handle.public_key().clone();
    [
        JsonWebKey {
            key_id: private_key_id(kid),
            algorithm,
            usage,
            key: KeyMaterial::Opaque(DeviceSigner::new(handle, algorithm)),
        },
        JsonWebKey {
            key_id: public_key_id(kid),
            algorithm,
            usage,
            key: KeyMaterial::Public(public_key),
        },
    ]
}

/// Entries for many key pairs, in the order supplied.
pub fn assemble_set(
    key_pairs: impl IntoIterator<Item = (KeyPairHandle, String, Algorithm, Usage)>,
) -> KeySet {
    KeySet {
        keys: key_pairs
            .into_iter()
            .flat_map(|(handle, kid, algorithm, usage)| {
                assemble_one(handle, &kid, algorithm, usage)
            })
            .collect(),
    }
}

#[async_trait]
impl<S: DeviceStore> KeyManager for HsmKeyManager<S> {
    async fn generate_key_set(
        &self,
        set: &str,
        kid: &str,
        algorithm: &str,
        usage: Usage,
    ) -> Result<KeySet, KeyManagerError> {
        let algorithm: Algorithm = algorithm.parse()?;
        let key_pair = self.generate(set, kid, algorithm, usage).await?;
        Ok(assemble_set([(key_pair as KeyPairHandle, kid.to_string(), algorithm, usage)]))
    }

    async fn get_key(&self, set: &str, kid: &str) -> Result<KeySet, KeyManagerError> {
        let key_pair = self.find_one(set, kid).await?;
        let usage = self.classify(&key_pair).await;
        let algorithm = Algorithm::for_public_key(key_pair.public_key())?;
        Ok(assemble_set([(key_pair as KeyPairHandle, kid.to_string(), algorithm, usage)]))
    }

    async fn get_key_set(&self, set: &str) -> Result<KeySet, KeyManagerError> {
        let key_pairs = self.find_all(set).await?;

        let mut entries = Vec::with_capacity(key_pairs.len());
        for key_pair in key_pairs {
            let kid = self.read_kid(&key_pair).await?;
            let usage = self.classify(&key_pair).await;
            let algorithm = Algorithm::for_public_key(key_pair.public_key())?;
            entries.push((key_pair as KeyPairHandle, kid, algorithm, usage));
        }

        Ok(assemble_set(entries))
    }

    // ==================== Lifecycle Gate ====================

    async fn delete_key(&self, set: &str, kid: &str) -> Result<(), KeyManagerError> {
        let key_pair = self.find_one(set, kid).await?;
        Ok(key_pair.delete().await?)
    }

    async fn delete_key_set(&self, set: &str) -> Result<(), KeyManagerError> {
        for key_pair in self.find_all(set).await? {
            key_pair.delete().await?;
        }
        Ok(())
    }

    async fn add_key(&self, _set: &str, _key: &JsonWebKey) -> Result<(), KeyManagerError> {
        Err(KeyManagerError::PreGeneratedKeysOnly)
    }

    async fn add_key_set(&self, _set: &str, _keys: &KeySet) -> Result<(), KeyManagerError> {
        Err(KeyManagerError::PreGeneratedKeysOnly)
    }

    async fn update_key(&self, _set: &str, _key: &JsonWebKey) -> Result<(), KeyManagerError> {
        Err(KeyManagerError::PreGeneratedKeysOnly)
    }

    async fn update_key_set(&self, _set: &str, _keys: &KeySet) -> Result<(), KeyManagerError> {
        Err(KeyManagerError::PreGeneratedKeysOnly)
    }
}
