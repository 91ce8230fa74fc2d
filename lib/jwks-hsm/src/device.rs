//! Device store boundary
//!
//! The device store owns key pairs; this crate only ever holds handles to
//! them. Implementations: [`crate::pkcs11::Pkcs11Store`] for real tokens and,
//! with the `memory-store` feature, [`crate::memory::MemoryStore`].

use async_trait::async_trait;
use std::{fmt, sync::Arc};

use crate::algorithm::{Algorithm, Curve, KeyParameters};
use crate::attributes::{Attribute, AttributeKind, AttributeSet};
use crate::error::DeviceError;

/// Public half of a device key pair as reported by the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// Big-endian modulus and public exponent.
    Rsa {
        modulus: Vec<u8>,
        public_exponent: Vec<u8>,
    },
    /// Uncompressed SEC1 point (`0x04 || X || Y`).
    Ec { curve: Curve, point: Vec<u8> },
}

impl PublicKey {
    /// Build an EC key from a `CKA_EC_POINT` value, which tokens may return
    /// either raw or wrapped in a DER OCTET STRING.
    pub fn ec_from_device_point(curve: Curve, ec_point: &[u8]) -> Result<Self, DeviceError> {
        let expected = 1 + 2 * curve.coordinate_len();

        let point = if ec_point.len() == expected && ec_point.first() == Some(&0x04) {
            ec_point
        } else {
            match ec_point {
                [0x04, len, rest @ ..] if usize::from(*len) == expected => rest,
                [0x04, 0x81, len, rest @ ..] if usize::from(*len) == expected => rest,
                _ => {
                    return Err(DeviceError::InvalidObject(format!(
                        "Unexpected EC point format: {} bytes for {}",
                        ec_point.len(),
                        curve.jwk_name()
                    )));
                }
            }
        };

        if point.len() != expected || point[0] != 0x04 {
            return Err(DeviceError::InvalidObject(format!(
                "Invalid uncompressed point: {} bytes",
                point.len()
            )));
        }

        Ok(PublicKey::Ec {
            curve,
            point: point.to_vec(),
        })
    }

    /// Affine coordinates of an EC key.
    pub fn ec_coordinates(&self) -> Option<(&[u8], &[u8])> {
        match self {
            PublicKey::Ec { curve, point } => {
                let len = curve.coordinate_len();
                if point.len() != 1 + 2 * len {
                    return None;
                }
                Some((&point[1..1 + len], &point[1 + len..]))
            }
            PublicKey::Rsa { .. } => None,
        }
    }
}

/// One asymmetric key pair held by the device.
///
/// Sign and decrypt delegate to the device; private key bytes are never
/// available.
#[async_trait]
pub trait KeyPair: Send + Sync + fmt::Debug {
    /// The public half, known from generation or lookup.
    fn public_key(&self) -> &PublicKey;

    /// Produce a JWS signature over `payload` for the given algorithm.
    async fn sign(&self, algorithm: Algorithm, payload: &[u8]) -> Result<Vec<u8>, DeviceError>;

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, DeviceError>;

    /// Destroy both halves on the device.
    async fn delete(&self) -> Result<(), DeviceError>;
}

/// Shared handle to a device key pair.
pub type KeyPairHandle = Arc<dyn KeyPair>;

/// Attribute-based object store on the HSM.
#[async_trait]
pub trait DeviceStore: Send + Sync + 'static {
    type KeyPair: KeyPair + 'static;

    async fn generate_key_pair(
        &self,
        public_template: &AttributeSet,
        private_template: &AttributeSet,
        parameters: KeyParameters,
    ) -> Result<Arc<Self::KeyPair>, DeviceError>;

    /// The key pair with this id and label, if any.
    async fn find_key_pair(
        &self,
        id: &[u8],
        label: &[u8],
    ) -> Result<Option<Arc<Self::KeyPair>>, DeviceError>;

    /// All key pairs with this label, optionally narrowed by id, in device
    /// iteration order.
    async fn find_key_pairs(
        &self,
        id: Option<&[u8]>,
        label: &[u8],
    ) -> Result<Vec<Arc<Self::KeyPair>>, DeviceError>;

    /// Read one attribute; `None` when the object does not carry it.
    async fn get_attribute(
        &self,
        key_pair: &Self::KeyPair,
        kind: AttributeKind,
    ) -> Result<Option<Attribute>, DeviceError>;
}
