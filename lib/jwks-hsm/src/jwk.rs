//! Key-set representation handed to the issuer
//!
//! Every device key pair surfaces as two entries: `private:<kid>`, whose key
//! is an [`OpaqueSigner`] bound to the device handle, and `public:<kid>`,
//! carrying the public key material. Only public entries serialize.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};

use crate::algorithm::Algorithm;
use crate::device::{KeyPairHandle, PublicKey};
use crate::error::{DeviceError, KeyManagerError};

pub const PRIVATE_KID_PREFIX: &str = "private:";
pub const PUBLIC_KID_PREFIX: &str = "public:";

/// Declared purpose of a key pair (JWK `use`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Usage {
    #[serde(rename = "sig")]
    Signature,
    #[serde(rename = "enc")]
    Encryption,
}

impl Usage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Usage::Signature => "sig",
            Usage::Encryption => "enc",
        }
    }
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Usage {
    type Err = KeyManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sig" => Ok(Usage::Signature),
            "enc" => Ok(Usage::Encryption),
            other => Err(KeyManagerError::UnsupportedUsage(other.to_string())),
        }
    }
}

// ==================== Opaque Signer ====================

/// Signing and decryption capability whose private key never leaves the
/// device.
#[async_trait]
pub trait OpaqueSigner: Send + Sync + fmt::Debug {
    fn public_key(&self) -> &PublicKey;

    fn algorithm(&self) -> Algorithm;

    async fn sign_payload(&self, payload: &[u8]) -> Result<Vec<u8>, KeyManagerError>;

    async fn decrypt_payload(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KeyManagerError>;
}

/// [`OpaqueSigner`] forwarding to a device key-pair handle.
#[derive(Clone)]
pub struct DeviceSigner {
    handle: KeyPairHandle,
    algorithm: Algorithm,
}

impl DeviceSigner {
    pub fn new(handle: KeyPairHandle, algorithm: Algorithm) -> Self {
        Self { handle, algorithm }
    }

    pub fn handle(&self) -> &KeyPairHandle {
        &self.handle
    }
}

impl fmt::Debug for DeviceSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSigner")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Two signers are equal when bound to the same device handle.
impl PartialEq for DeviceSigner {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.handle), Arc::as_ptr(&other.handle))
            && self.algorithm == other.algorithm
    }
}

#[async_trait]
impl OpaqueSigner for DeviceSigner {
    fn public_key(&self) -> &PublicKey {
        self.handle.public_key()
    }

    fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    async fn sign_payload(&self, payload: &[u8]) -> Result<Vec<u8>, KeyManagerError> {
        Ok(self.handle.sign(self.algorithm, payload).await?)
    }

    async fn decrypt_payload(&self, ciphertext: &[u8]) -> Result<Vec<u8>, KeyManagerError> {
        if let PublicKey::Ec { .. } = self.handle.public_key() {
            return Err(DeviceError::Unsupported("decryption with an EC key".to_string()).into());
        }
        Ok(self.handle.decrypt(ciphertext).await?)
    }
}

// ==================== Key Set ====================

#[derive(Debug, Clone, PartialEq)]
pub enum KeyMaterial {
    Opaque(DeviceSigner),
    Public(PublicKey),
}

#[derive(Debug, Clone, PartialEq)]
pub struct JsonWebKey {
    pub key_id: String,
    pub algorithm: Algorithm,
    pub usage: Usage,
    pub key: KeyMaterial,
}

impl JsonWebKey {
    pub fn is_private(&self) -> bool {
        matches!(self.key, KeyMaterial::Opaque(_))
    }

    pub fn signer(&self) -> Option<&DeviceSigner> {
        match &self.key {
            KeyMaterial::Opaque(signer) => Some(signer),
            KeyMaterial::Public(_) => None,
        }
    }

    pub fn public_key(&self) -> &PublicKey {
        match &self.key {
            KeyMaterial::Opaque(signer) => signer.public_key(),
            KeyMaterial::Public(public_key) => public_key,
        }
    }

    /// RFC 7517 form of a public entry; `None` for private entries.
    pub fn to_public_jwk(&self) -> Result<Option<PublicJwk>, KeyManagerError> {
        let KeyMaterial::Public(public_key) = &self.key else {
            return Ok(None);
        };

        let mut jwk = PublicJwk {
            kty: "",
            crv: None,
            x: None,
            y: None,
            n: None,
            e: None,
            kid: self.key_id.clone(),
            alg: self.algorithm,
            usage: self.usage,
        };

        match public_key {
            PublicKey::Rsa {
                modulus,
                public_exponent,
            } => {
                jwk.kty = "RSA";
                jwk.n = Some(URL_SAFE_NO_PAD.encode(strip_leading_zeros(modulus)));
                jwk.e = Some(URL_SAFE_NO_PAD.encode(strip_leading_zeros(public_exponent)));
            }
            PublicKey::Ec { curve, .. } => {
                let (x, y) = public_key.ec_coordinates().ok_or_else(|| {
                    DeviceError::InvalidObject(format!(
                        "Malformed {} point for {}",
                        curve.jwk_name(),
                        self.key_id
                    ))
                })?;
                jwk.kty = "EC";
                jwk.crv = Some(curve.jwk_name());
                jwk.x = Some(URL_SAFE_NO_PAD.encode(x));
                jwk.y = Some(URL_SAFE_NO_PAD.encode(y));
            }
        }

        Ok(Some(jwk))
    }
}

/// Key set in entry order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeySet {
    pub keys: Vec<JsonWebKey>,
}

impl KeySet {
    pub fn key(&self, key_id: &str) -> Option<&JsonWebKey> {
        self.keys.iter().find(|k| k.key_id == key_id)
    }

    /// Public entries only, ready to publish. Fails rather than omitting an
    /// entry whose key material cannot be encoded.
    pub fn public_jwks(&self) -> Result<PublicJwkSet, KeyManagerError> {
        let mut keys = Vec::new();
        for entry in &self.keys {
            if let Some(jwk) = entry.to_public_jwk()? {
                keys.push(jwk);
            }
        }
        Ok(PublicJwkSet { keys })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicJwk {
    pub kty: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    pub kid: String,
    pub alg: Algorithm,
    #[serde(rename = "use")]
    pub usage: Usage,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublicJwkSet {
    pub keys: Vec<PublicJwk>,
}

pub fn private_key_id(kid: &str) -> String {
    format!("{}{}", PRIVATE_KID_PREFIX, kid)
}

pub fn public_key_id(kid: &str) -> String {
    format!("{}{}", PUBLIC_KID_PREFIX, kid)
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(bytes.len().saturating_sub(1));
    &bytes[start..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::Curve;

    fn ec_key() -> PublicKey {
        let mut point = vec![0x04];
        point.extend([0x11; 32]);
        point.extend([0x22; 32]);
        PublicKey::Ec {
            curve: Curve::P256,
            point,
        }
    }

    #[test]
    fn test_usage_wire_names() {
        assert_eq!("sig".parse::<Usage>().unwrap(), Usage::Signature);
        assert_eq!("enc".parse::<Usage>().unwrap(), Usage::Encryption);
        assert!(matches!(
            "signature".parse::<Usage>(),
            Err(KeyManagerError::UnsupportedUsage(tag)) if tag == "signature"
        ));
        assert_eq!(
            serde_json::to_string(&Usage::Encryption).unwrap(),
            "\"enc\""
        );
    }

    #[test]
    fn test_key_id_prefixes() {
        assert_eq!(private_key_id("abc"), "private:abc");
        assert_eq!(public_key_id("abc"), "public:abc");
    }

    #[test]
    fn test_ec_public_jwk() {
        let key = JsonWebKey {
            key_id: public_key_id("k1"),
            algorithm: Algorithm::ES256,
            usage: Usage::Signature,
            key: KeyMaterial::Public(ec_key()),
        };

        let json = serde_json::to_value(key.to_public_jwk().unwrap().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "kty": "EC",
                "crv": "P-256",
                "x": URL_SAFE_NO_PAD.encode([0x11; 32]),
                "y": URL_SAFE_NO_PAD.encode([0x22; 32]),
                "kid": "public:k1",
                "alg": "ES256",
                "use": "sig",
            })
        );
    }

    #[test]
    fn test_rsa_public_jwk_strips_leading_zeros() {
        let key = JsonWebKey {
            key_id: public_key_id("k2"),
            algorithm: Algorithm::RS256,
            usage: Usage::Encryption,
            key: KeyMaterial::Public(PublicKey::Rsa {
                modulus: vec![0x00, 0xc3, 0x01],
                public_exponent: vec![0x00, 0x01, 0x00, 0x01],
            }),
        };

        let jwk = key.to_public_jwk().unwrap().unwrap();
        assert_eq!(jwk.kty, "RSA");
        assert_eq!(jwk.n.as_deref(), Some(URL_SAFE_NO_PAD.encode([0xc3, 0x01]).as_str()));
        assert_eq!(jwk.e.as_deref(), Some("AQAB"));
        assert_eq!(jwk.usage, Usage::Encryption);
        assert!(jwk.crv.is_none());
    }

    #[test]
    fn test_malformed_ec_point_fails_publication() {
        let good = JsonWebKey {
            key_id: public_key_id("good"),
            algorithm: Algorithm::ES256,
            usage: Usage::Signature,
            key: KeyMaterial::Public(ec_key()),
        };
        let truncated = JsonWebKey {
            key_id: public_key_id("bad"),
            algorithm: Algorithm::ES256,
            usage: Usage::Signature,
            key: KeyMaterial::Public(PublicKey::Ec {
                curve: Curve::P256,
                point: vec![0x04, 0x11, 0x22],
            }),
        };

        assert!(matches!(
            truncated.to_public_jwk(),
            Err(KeyManagerError::Device(DeviceError::InvalidObject(_)))
        ));

        let keys = KeySet {
            keys: vec![good, truncated],
        };
        assert!(matches!(
            keys.public_jwks(),
            Err(KeyManagerError::Device(DeviceError::InvalidObject(_)))
        ));
    }

    #[test]
    fn test_strip_leading_zeros_keeps_single_zero() {
        assert_eq!(strip_leading_zeros(&[0, 0, 0]), &[0]);
        assert_eq!(strip_leading_zeros(&[]), &[] as &[u8]);
    }
}
