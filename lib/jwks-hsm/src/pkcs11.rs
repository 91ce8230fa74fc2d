//! PKCS#11 device store via cryptoki
//!
//! Wraps one already opened and logged-in session. Each key pair is a
//! private-key object and a public-key object sharing `CKA_ID` and
//! `CKA_LABEL`; lookups match on the private object and pair it with its
//! public half.
//!
//! Token calls block (RSA-4096 generation takes seconds), so every device
//! operation runs on tokio's blocking pool while holding the session lock.

use async_trait::async_trait;
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute as CkAttribute, AttributeType, KeyType, ObjectClass, ObjectHandle};
use cryptoki::session::Session;
use sha2::{Digest, Sha256, Sha512};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::algorithm::{Algorithm, Curve, KeyParameters, RSA_PUBLIC_EXPONENT};
use crate::attributes::{Attribute, AttributeKind, AttributeSet};
use crate::device::{DeviceStore, KeyPair, PublicKey};
use crate::error::DeviceError;

type SharedSession = Arc<Mutex<Session>>;

async fn run_blocking<T, F>(operation: &'static str, f: F) -> Result<T, DeviceError>
where
    F: FnOnce() -> Result<T, DeviceError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DeviceError::Internal(format!("{} task failed: {}", operation, e)))?
}

fn lock<'a>(
    session: &'a Mutex<Session>,
    operation: &str,
) -> Result<MutexGuard<'a, Session>, DeviceError> {
    session
        .lock()
        .map_err(|_| DeviceError::Internal(format!("Session lock poisoned during {}", operation)))
}

fn to_cryptoki(attribute: &Attribute) -> CkAttribute {
    match attribute {
        Attribute::Id(id) => CkAttribute::Id(id.clone()),
        Attribute::Label(label) => CkAttribute::Label(label.clone()),
        Attribute::Sign(v) => CkAttribute::Sign(*v),
        Attribute::Verify(v) => CkAttribute::Verify(*v),
        Attribute::Encrypt(v) => CkAttribute::Encrypt(*v),
        Attribute::Decrypt(v) => CkAttribute::Decrypt(*v),
    }
}

fn from_cryptoki(attribute: CkAttribute) -> Option<Attribute> {
    match attribute {
        CkAttribute::Id(id) => Some(Attribute::Id(id)),
        CkAttribute::Label(label) => Some(Attribute::Label(label)),
        CkAttribute::Sign(v) => Some(Attribute::Sign(v)),
        CkAttribute::Verify(v) => Some(Attribute::Verify(v)),
        CkAttribute::Encrypt(v) => Some(Attribute::Encrypt(v)),
        CkAttribute::Decrypt(v) => Some(Attribute::Decrypt(v)),
        _ => None,
    }
}

fn attribute_type(kind: AttributeKind) -> AttributeType {
    match kind {
        AttributeKind::Id => AttributeType::Id,
        AttributeKind::Label => AttributeType::Label,
        AttributeKind::Sign => AttributeType::Sign,
        AttributeKind::Verify => AttributeType::Verify,
        AttributeKind::Encrypt => AttributeType::Encrypt,
        AttributeKind::Decrypt => AttributeType::Decrypt,
    }
}

/// `CKA_ENCRYPT` and `CKA_VERIFY` live on public-key objects, everything
/// else this crate reads on the private one.
fn on_public_object(kind: AttributeKind) -> bool {
    matches!(kind, AttributeKind::Encrypt | AttributeKind::Verify)
}

/// Read the public key material of a public-key object.
fn read_public_key(session: &Session, handle: ObjectHandle) -> Result<PublicKey, DeviceError> {
    let attrs = session.get_attributes(handle, &[AttributeType::KeyType])?;
    let key_type = attrs
        .into_iter()
        .find_map(|attr| match attr {
            CkAttribute::KeyType(key_type) => Some(key_type),
            _ => None,
        })
        .ok_or_else(|| DeviceError::InvalidObject("Public key has no key type".into()))?;

    if key_type == KeyType::RSA {
        let attrs = session.get_attributes(
            handle,
            &[AttributeType::Modulus, AttributeType::PublicExponent],
        )?;
        let mut modulus = Vec::new();
        let mut public_exponent = Vec::new();
        for attr in attrs {
            match attr {
                CkAttribute::Modulus(n) => modulus = n,
                CkAttribute::PublicExponent(e) => public_exponent = e,
                _ => {}
            }
        }
        if modulus.is_empty() || public_exponent.is_empty() {
            return Err(DeviceError::InvalidObject("Incomplete RSA public key".into()));
        }
        Ok(PublicKey::Rsa {
            modulus,
            public_exponent,
        })
    } else if key_type == KeyType::EC {
        let attrs = session.get_attributes(handle, &[AttributeType::EcParams, AttributeType::EcPoint])?;
        let mut params = Vec::new();
        let mut ec_point = Vec::new();
        for attr in attrs {
            match attr {
                CkAttribute::EcParams(p) => params = p,
                CkAttribute::EcPoint(p) => ec_point = p,
                _ => {}
            }
        }
        let curve = Curve::from_der_oid(&params).ok_or_else(|| {
            DeviceError::InvalidObject(format!("Unrecognised EC parameters: {:02x?}", params))
        })?;
        PublicKey::ec_from_device_point(curve, &ec_point)
    } else {
        Err(DeviceError::InvalidObject(format!(
            "Unsupported key type: {}",
            key_type
        )))
    }
}

fn find_objects(
    session: &Session,
    class: ObjectClass,
    id: Option<&[u8]>,
    label: &[u8],
) -> Result<Vec<ObjectHandle>, DeviceError> {
    let mut template = vec![CkAttribute::Class(class), CkAttribute::Label(label.to_vec())];
    if let Some(id) = id {
        template.push(CkAttribute::Id(id.to_vec()));
    }
    Ok(session.find_objects(&template)?)
}

fn read_id(session: &Session, handle: ObjectHandle) -> Result<Vec<u8>, DeviceError> {
    session
        .get_attributes(handle, &[AttributeType::Id])?
        .into_iter()
        .find_map(|attr| match attr {
            CkAttribute::Id(id) => Some(id),
            _ => None,
        })
        .ok_or_else(|| DeviceError::InvalidObject("Private key has no id".into()))
}

/// [`DeviceStore`] backed by a PKCS#11 token.
#[derive(Clone)]
pub struct Pkcs11Store {
    session: SharedSession,
}

impl std::fmt::Debug for Pkcs11Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkcs11Store").finish_non_exhaustive()
    }
}

impl Pkcs11Store {
    /// Use an open read-write session on which the user is logged in.
    pub fn new(session: Session) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
        }
    }

    fn key_pair(
        &self,
        session: &Session,
        private: ObjectHandle,
        label: &[u8],
    ) -> Result<Arc<Pkcs11KeyPair>, DeviceError> {
        let id = read_id(session, private)?;
        let public = find_objects(session, ObjectClass::PUBLIC_KEY, Some(&id), label)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                DeviceError::InvalidObject(format!(
                    "No public key paired with private key {}",
                    String::from_utf8_lossy(&id)
                ))
            })?;
        let public_key = read_public_key(session, public)?;

        Ok(Arc::new(Pkcs11KeyPair {
            session: Arc::clone(&self.session),
            public,
            private,
            public_key,
        }))
    }

    fn generate_sync(
        &self,
        public_template: &AttributeSet,
        private_template: &AttributeSet,
        parameters: KeyParameters,
    ) -> Result<Arc<Pkcs11KeyPair>, DeviceError> {
        let session = lock(&self.session, "key generation")?;

        let (mechanism, key_type, mut pub_template) = match parameters {
            KeyParameters::Rsa { modulus_bits } => (
                Mechanism::RsaPkcsKeyPairGen,
                KeyType::RSA,
                vec![
                    CkAttribute::ModulusBits(modulus_bits.into()),
                    CkAttribute::PublicExponent(RSA_PUBLIC_EXPONENT.to_vec()),
                ],
            ),
            KeyParameters::Ec { curve } => (
                Mechanism::EccKeyPairGen,
                KeyType::EC,
                vec![CkAttribute::EcParams(curve.der_oid().to_vec())],
            ),
        };

        pub_template.extend([
            CkAttribute::Class(ObjectClass::PUBLIC_KEY),
            CkAttribute::KeyType(key_type),
            CkAttribute::Token(true),
        ]);
        pub_template.extend(public_template.iter().map(to_cryptoki));

        let mut priv_template = vec![
            CkAttribute::Class(ObjectClass::PRIVATE_KEY),
            CkAttribute::KeyType(key_type),
            CkAttribute::Token(true),
            CkAttribute::Private(true),
            CkAttribute::Sensitive(true),
            CkAttribute::Extractable(false),
        ];
        priv_template.extend(private_template.iter().map(to_cryptoki));

        debug!(?parameters, "Generating key pair on token");
        let (public, private) =
            session.generate_key_pair(&mechanism, &pub_template, &priv_template)?;
        let public_key = read_public_key(&session, public)?;

        Ok(Arc::new(Pkcs11KeyPair {
            session: Arc::clone(&self.session),
            public,
            private,
            public_key,
        }))
    }

    fn find_sync(
        &self,
        id: Option<&[u8]>,
        label: &[u8],
    ) -> Result<Vec<Arc<Pkcs11KeyPair>>, DeviceError> {
        let session = lock(&self.session, "key lookup")?;
        let handles = find_objects(&session, ObjectClass::PRIVATE_KEY, id, label)?;
        debug!(count = handles.len(), "Found private keys on token");
        handles
            .into_iter()
            .map(|private| self.key_pair(&session, private, label))
            .collect()
    }

    fn get_attribute_sync(
        &self,
        object: ObjectHandle,
        kind: AttributeKind,
    ) -> Result<Option<Attribute>, DeviceError> {
        let session = lock(&self.session, "attribute read")?;
        let attrs = session.get_attributes(object, &[attribute_type(kind)])?;
        Ok(attrs.into_iter().find_map(from_cryptoki))
    }
}

#[async_trait]
impl DeviceStore for Pkcs11Store {
    type KeyPair = Pkcs11KeyPair;

    async fn generate_key_pair(
        &self,
        public_template: &AttributeSet,
        private_template: &AttributeSet,
        parameters: KeyParameters,
    ) -> Result<Arc<Pkcs11KeyPair>, DeviceError> {
        let store = self.clone();
        let public_template = public_template.clone();
        let private_template = private_template.clone();
        run_blocking("key generation", move || {
            store.generate_sync(&public_template, &private_template, parameters)
        })
        .await
    }

    async fn find_key_pair(
        &self,
        id: &[u8],
        label: &[u8],
    ) -> Result<Option<Arc<Pkcs11KeyPair>>, DeviceError> {
        Ok(self.find_key_pairs(Some(id), label).await?.into_iter().next())
    }

    async fn find_key_pairs(
        &self,
        id: Option<&[u8]>,
        label: &[u8],
    ) -> Result<Vec<Arc<Pkcs11KeyPair>>, DeviceError> {
        let store = self.clone();
        let id = id.map(<[u8]>::to_vec);
        let label = label.to_vec();
        run_blocking("key lookup", move || store.find_sync(id.as_deref(), &label)).await
    }

    async fn get_attribute(
        &self,
        key_pair: &Pkcs11KeyPair,
        kind: AttributeKind,
    ) -> Result<Option<Attribute>, DeviceError> {
        let store = self.clone();
        let object = if on_public_object(kind) {
            key_pair.public
        } else {
            key_pair.private
        };
        run_blocking("attribute read", move || store.get_attribute_sync(object, kind)).await
    }
}

/// Private and public object handles of one token key pair.
#[derive(Clone)]
pub struct Pkcs11KeyPair {
    session: SharedSession,
    public: ObjectHandle,
    private: ObjectHandle,
    public_key: PublicKey,
}

impl std::fmt::Debug for Pkcs11KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pkcs11KeyPair")
            .field("public", &self.public)
            .field("private", &self.private)
            .finish_non_exhaustive()
    }
}

impl Pkcs11KeyPair {
    fn sign_sync(&self, algorithm: Algorithm, payload: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let session = lock(&self.session, "signing")?;
        // Hash ECDSA payloads here; not every token implements the combined
        // CKM_ECDSA_SHA* mechanisms.
        let signature = match algorithm {
            Algorithm::RS256 => session.sign(&Mechanism::Sha256RsaPkcs, self.private, payload)?,
            Algorithm::ES256 => {
                session.sign(&Mechanism::Ecdsa, self.private, &Sha256::digest(payload))?
            }
            Algorithm::ES512 => {
                session.sign(&Mechanism::Ecdsa, self.private, &Sha512::digest(payload))?
            }
        };
        Ok(signature)
    }

    fn decrypt_sync(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let session = lock(&self.session, "decryption")?;
        Ok(session.decrypt(&Mechanism::RsaPkcs, self.private, ciphertext)?)
    }

    fn delete_sync(&self) -> Result<(), DeviceError> {
        let session = lock(&self.session, "key deletion")?;
        debug!(private = ?self.private, public = ?self.public, "Destroying key pair");
        session.destroy_object(self.private)?;
        session.destroy_object(self.public)?;
        Ok(())
    }
}

#[async_trait]
impl KeyPair for Pkcs11KeyPair {
    fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    async fn sign(&self, algorithm: Algorithm, payload: &[u8]) -> Result<Vec<u8>, DeviceError> {
        let key_pair = self.clone();
        let payload = payload.to_vec();
        run_blocking("signing", move || key_pair.sign_sync(algorithm, &payload)).await
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DeviceError> {
        if let PublicKey::Ec { .. } = self.public_key {
            return Err(DeviceError::Unsupported("decryption with an EC key".into()));
        }
        let key_pair = self.clone();
        let ciphertext = ciphertext.to_vec();
        run_blocking("decryption", move || key_pair.decrypt_sync(&ciphertext)).await
    }

    async fn delete(&self) -> Result<(), DeviceError> {
        let key_pair = self.clone();
        run_blocking("key deletion", move || key_pair.delete_sync()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_round_trip_through_cryptoki() {
        let attributes = [
            Attribute::Id(b"kid".to_vec()),
            Attribute::Label(b"set".to_vec()),
            Attribute::Sign(true),
            Attribute::Verify(true),
            Attribute::Encrypt(false),
            Attribute::Decrypt(false),
        ];
        for attribute in attributes {
            assert_eq!(from_cryptoki(to_cryptoki(&attribute)), Some(attribute));
        }
    }

    #[test]
    fn test_unmapped_cryptoki_attribute_ignored() {
        assert_eq!(from_cryptoki(CkAttribute::Token(true)), None);
    }

    #[test]
    fn test_capability_flags_read_from_owning_object() {
        assert!(on_public_object(AttributeKind::Encrypt));
        assert!(on_public_object(AttributeKind::Verify));
        assert!(!on_public_object(AttributeKind::Sign));
        assert!(!on_public_object(AttributeKind::Decrypt));
        assert!(!on_public_object(AttributeKind::Id));
    }

    #[test]
    fn test_attribute_type_mapping() {
        assert_eq!(attribute_type(AttributeKind::Encrypt), AttributeType::Encrypt);
        assert_eq!(attribute_type(AttributeKind::Id), AttributeType::Id);
    }
}
