//! HSM-backed JSON Web Key Set manager
//!
//! Signing keys for an OpenID Connect issuer are generated, stored, and used
//! only inside a hardware security module. This crate maps the issuer's key
//! set vocabulary (set, kid, algorithm, usage) onto a PKCS#11-style object
//! store and hands back key sets whose private entries are opaque signers.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

#[cfg(any(test, feature = "memory-store"))]
pub mod memory;

pub mod algorithm;
pub mod attributes;
pub mod device;
pub mod error;
pub mod jwk;
pub mod manager;
pub mod pkcs11;

#[cfg(feature = "memory-store")]
pub use memory::{MemoryKeyPair, MemoryStore};

pub use algorithm::{Algorithm, Curve, KeyParameters};
pub use attributes::{Attribute, AttributeKind, AttributeSet, KeyPairTemplates};
pub use device::{DeviceStore, KeyPair, KeyPairHandle, PublicKey};
pub use error::{DeviceError, KeyManagerError};
pub use jwk::{
    DeviceSigner, JsonWebKey, KeyMaterial, KeySet, OpaqueSigner, PublicJwk, PublicJwkSet, Usage,
};
pub use manager::{HsmKeyManager, KeyManager};
pub use pkcs11::{Pkcs11KeyPair, Pkcs11Store};
