//! In-process device store
//!
//! Keeps key pairs in memory with random public key material, records every
//! device call, and can inject failures. Signatures and decryptions are
//! deterministic stand-ins, not real cryptography; use it for tests and local
//! development only.

use async_trait::async_trait;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::algorithm::{Algorithm, KeyParameters, RSA_PUBLIC_EXPONENT};
use crate::attributes::{Attribute, AttributeKind, AttributeSet};
use crate::device::{DeviceStore, KeyPair, PublicKey};
use crate::error::DeviceError;

/// One recorded `generate_key_pair` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateCall {
    pub public_template: AttributeSet,
    pub private_template: AttributeSet,
    pub parameters: KeyParameters,
}

#[derive(Debug)]
struct StoredObject {
    handle: u64,
    attributes: AttributeSet,
    public_key: PublicKey,
    secret: [u8; 32],
}

#[derive(Debug, Default)]
struct State {
    next_handle: u64,
    objects: Vec<StoredObject>,
    generate_calls: Vec<GenerateCall>,
    attribute_reads: Vec<AttributeKind>,
    deletion_attempts: usize,
    fail_generation: bool,
    fail_lookups: bool,
    failing_attributes: Vec<AttributeKind>,
    fail_deletion_at: Option<usize>,
}

impl State {
    fn object(&self, handle: u64) -> Result<&StoredObject, DeviceError> {
        self.objects
            .iter()
            .find(|o| o.handle == handle)
            .ok_or_else(|| DeviceError::InvalidObject(format!("object {} destroyed", handle)))
    }

    fn insert(&mut self, attributes: AttributeSet, public_key: PublicKey) -> u64 {
        self.next_handle += 1;
        let handle = self.next_handle;
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        self.objects.push(StoredObject {
            handle,
            attributes,
            public_key,
            secret,
        });
        handle
    }
}

fn lock(state: &Mutex<State>) -> Result<MutexGuard<'_, State>, DeviceError> {
    state
        .lock()
        .map_err(|_| DeviceError::Internal("Memory store lock poisoned".into()))
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place a key pair directly, bypassing generation. Useful for keys a
    /// real token might hold without this manager having created them.
    pub fn insert_key_pair(
        &self,
        attributes: AttributeSet,
        public_key: PublicKey,
    ) -> Arc<MemoryKeyPair> {
        let mut state = self.inspect();
        let object = state.insert(attributes, public_key.clone());
        Arc::new(MemoryKeyPair {
            state: Arc::clone(&self.state),
            object,
            public_key,
        })
    }

    // ==================== Fault Injection ====================

    pub fn fail_generation(&self) {
        self.inspect().fail_generation = true;
    }

    pub fn fail_lookups(&self) {
        self.inspect().fail_lookups = true;
    }

    pub fn fail_attribute_reads(&self, kind: AttributeKind) {
        self.inspect().failing_attributes.push(kind);
    }

    /// Fail the `attempt`-th deletion (1-based) made through this store.
    pub fn fail_deletion_at(&self, attempt: usize) {
        self.inspect().fail_deletion_at = Some(attempt);
    }

    // ==================== Call Recording ====================

    pub fn generate_calls(&self) -> Vec<GenerateCall> {
        self.inspect().generate_calls.clone()
    }

    pub fn attribute_reads(&self) -> Vec<AttributeKind> {
        self.inspect().attribute_reads.clone()
    }

    pub fn deletion_attempts(&self) -> usize {
        self.inspect().deletion_attempts
    }

    pub fn object_count(&self) -> usize {
        self.inspect().objects.len()
    }

    fn inspect(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle_for(&self, object: &StoredObject) -> Arc<MemoryKeyPair> {
        Arc::new(MemoryKeyPair {
            state: Arc::clone(&self.state),
            object: object.handle,
            public_key: object.public_key.clone(),
        })
    }
}

fn random_public_key(parameters: KeyParameters) -> PublicKey {
    let mut rng = rand::thread_rng();
    match parameters {
        KeyParameters::Rsa { modulus_bits } => {
            let mut modulus = vec![0u8; (modulus_bits / 8) as usize];
            rng.fill_bytes(&mut modulus);
            if let Some(first) = modulus.first_mut() {
                *first |= 0x80;
            }
            if let Some(last) = modulus.last_mut() {
                *last |= 0x01;
            }
            PublicKey::Rsa {
                modulus,
                public_exponent: RSA_PUBLIC_EXPONENT.to_vec(),
            }
        }
        KeyParameters::Ec { curve } => {
            let mut point = vec![0u8; 1 + 2 * curve.coordinate_len()];
            rng.fill_bytes(&mut point);
            point[0] = 0x04;
            PublicKey::Ec { curve, point }
        }
    }
}

fn matches_label(object: &StoredObject, id: Option<&[u8]>, label: &[u8]) -> bool {
    let label_matches = object
        .attributes
        .get(AttributeKind::Label)
        .and_then(Attribute::as_bytes)
        == Some(label);
    let id_matches = id.is_none_or(|id| {
        object.attributes.get(AttributeKind::Id).and_then(Attribute::as_bytes) == Some(id)
    });
    label_matches && id_matches
}

#[async_trait]
impl DeviceStore for MemoryStore {
    type KeyPair = MemoryKeyPair;

    async fn generate_key_pair(
        &self,
        public_template: &AttributeSet,
        private_template: &AttributeSet,
        parameters: KeyParameters,
    ) -> Result<Arc<MemoryKeyPair>, DeviceError> {
        let mut state = lock(&self.state)?;
        state.generate_calls.push(GenerateCall {
            public_template: public_template.clone(),
            private_template: private_template.clone(),
            parameters,
        });
        if state.fail_generation {
            return Err(DeviceError::Internal("injected generation failure".into()));
        }

        let mut attributes = private_template.clone();
        attributes.add_if_not_present(public_template.iter().cloned());
        let public_key = random_public_key(parameters);
        let object = state.insert(attributes, public_key.clone());

        Ok(Arc::new(MemoryKeyPair {
            state: Arc::clone(&self.state),
            object,
            public_key,
        }))
    }

    async fn find_key_pair(
        &self,
        id: &[u8],
        label: &[u8],
    ) -> Result<Option<Arc<MemoryKeyPair>>, DeviceError> {
        Ok(self.find_key_pairs(Some(id), label).await?.into_iter().next())
    }

    async fn find_key_pairs(
        &self,
        id: Option<&[u8]>,
        label: &[u8],
    ) -> Result<Vec<Arc<MemoryKeyPair>>, DeviceError> {
        let state = lock(&self.state)?;
        if state.fail_lookups {
            return Err(DeviceError::Internal("injected lookup failure".into()));
        }
        Ok(state
            .objects
            .iter()
            .filter(|o| matches_label(o, id, label))
            .map(|o| self.handle_for(o))
            .collect())
    }

    async fn get_attribute(
        &self,
        key_pair: &MemoryKeyPair,
        kind: AttributeKind,
    ) -> Result<Option<Attribute>, DeviceError> {
        let mut state = lock(&self.state)?;
        state.attribute_reads.push(kind);
        if state.failing_attributes.contains(&kind) {
            return Err(DeviceError::Internal(format!(
                "injected failure reading {:?}",
                kind
            )));
        }
        Ok(state.object(key_pair.object)?.attributes.get(kind).cloned())
    }
}

/// Handle into a [`MemoryStore`].
#[derive(Debug)]
pub struct MemoryKeyPair {
    state: Arc<Mutex<State>>,
    object: u64,
    public_key: PublicKey,
}

impl MemoryKeyPair {
    fn capability(&self, kind: AttributeKind) -> Result<([u8; 32], bool), DeviceError> {
        let state = lock(&self.state)?;
        let object = state.object(self.object)?;
        let enabled = object
            .attributes
            .get(kind)
            .and_then(Attribute::as_bool)
            .unwrap_or(false);
        Ok((object.secret, enabled))
    }
}

#[async_trait]
impl KeyPair for MemoryKeyPair {
    fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    async fn sign(&self, algorithm: Algorithm, payload: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let (secret, can_sign) = self.capability(AttributeKind::Sign)?;
        if !can_sign {
            return Err(DeviceError::Unsupported("key is not sign-capable".into()));
        }
        let signature = match algorithm {
            Algorithm::ES512 => Sha512::new()
                .chain_update(secret)
                .chain_update(payload)
                .finalize()
                .to_vec(),
            Algorithm::RS256 | Algorithm::ES256 => Sha256::new()
                .chain_update(secret)
                .chain_update(payload)
                .finalize()
                .to_vec(),
        };
        Ok(signature)
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let (secret, can_decrypt) = self.capability(AttributeKind::Decrypt)?;
        if !can_decrypt {
            return Err(DeviceError::Unsupported("key is not decrypt-capable".into()));
        }
        Ok(ciphertext
            .iter()
            .zip(secret.iter().cycle())
            .map(|(c, k)| c ^ k)
            .collect())
    }

    async fn delete(&self) -> Result<(), DeviceError> {
        let mut state = lock(&self.state)?;
        state.deletion_attempts += 1;
        if state.fail_deletion_at == Some(state.deletion_attempts) {
            return Err(DeviceError::Internal("injected deletion failure".into()));
        }
        let before = state.objects.len();
        state.objects.retain(|o| o.handle != self.object);
        if state.objects.len() == before {
            return Err(DeviceError::InvalidObject(format!(
                "object {} destroyed",
                self.object
            )));
        }
        Ok(())
    }
}
