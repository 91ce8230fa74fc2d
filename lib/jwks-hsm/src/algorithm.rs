//! Signing algorithms and the key-generation parameters behind them
//!
//! The table is closed: curve and modulus sizes are fixed per algorithm and
//! anything not listed is refused rather than approximated.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::device::PublicKey;
use crate::error::KeyManagerError;

/// RSA modulus size for every generated RS256 key.
pub const RSA_MODULUS_BITS: u64 = 4096;

/// RSA public exponent 65537, big-endian.
pub const RSA_PUBLIC_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    RS256,
    ES256,
    ES512,
}

/// NIST prime curves a device may report.
///
/// P-384 is representable so that keys created outside this manager can be
/// recognised and refused, but no algorithm generates on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Curve {
    P256,
    P384,
    P521,
}

/// Concrete parameters handed to the device's key-pair generation primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyParameters {
    Rsa { modulus_bits: u64 },
    Ec { curve: Curve },
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RS256 => "RS256",
            Algorithm::ES256 => "ES256",
            Algorithm::ES512 => "ES512",
        }
    }

    pub fn key_parameters(&self) -> KeyParameters {
        match self {
            Algorithm::RS256 => KeyParameters::Rsa {
                modulus_bits: RSA_MODULUS_BITS,
            },
            Algorithm::ES256 => KeyParameters::Ec { curve: Curve::P256 },
            Algorithm::ES512 => KeyParameters::Ec { curve: Curve::P521 },
        }
    }

    /// Recover the algorithm of a key read back from the device.
    ///
    /// Device objects carry no algorithm marker, so the tag is derived from
    /// the stored key type and curve.
    pub fn for_public_key(public_key: &PublicKey) -> Result<Self, KeyManagerError> {
        match public_key {
            PublicKey::Rsa { .. } => Ok(Algorithm::RS256),
            PublicKey::Ec {
                curve: Curve::P256, ..
            } => Ok(Algorithm::ES256),
            PublicKey::Ec {
                curve: Curve::P521, ..
            } => Ok(Algorithm::ES512),
            PublicKey::Ec { curve, .. } => Err(KeyManagerError::UnsupportedKeyType(format!(
                "EC key on {}",
                curve.jwk_name()
            ))),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = KeyManagerError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag {
            "RS256" => Ok(Algorithm::RS256),
            "ES256" => Ok(Algorithm::ES256),
            "ES512" => Ok(Algorithm::ES512),
            other => Err(KeyManagerError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl Curve {
    /// Byte length of one affine coordinate.
    pub fn coordinate_len(&self) -> usize {
        match self {
            Curve::P256 => 32,
            Curve::P384 => 48,
            Curve::P521 => 66,
        }
    }

    pub fn jwk_name(&self) -> &'static str {
        match self {
            Curve::P256 => "P-256",
            Curve::P384 => "P-384",
            Curve::P521 => "P-521",
        }
    }

    /// DER-encoded named-curve OID, as stored in `CKA_EC_PARAMS`.
    pub fn der_oid(&self) -> &'static [u8] {
        match self {
            // 1.2.840.10045.3.1.7
            Curve::P256 => &[0x06, 0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07],
            // 1.3.132.0.34
            Curve::P384 => &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x22],
            // 1.3.132.0.35
            Curve::P521 => &[0x06, 0x05, 0x2b, 0x81, 0x04, 0x00, 0x23],
        }
    }

    pub fn from_der_oid(oid: &[u8]) -> Option<Self> {
        [Curve::P256, Curve::P384, Curve::P521]
            .into_iter()
            .find(|curve| curve.der_oid() == oid)
    }
}
