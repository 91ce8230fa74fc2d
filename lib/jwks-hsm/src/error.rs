//! Key manager error types

use thiserror::Error;

/// Failures originating in the device store.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("PKCS#11 error: {0}")]
    Pkcs11(#[from] cryptoki::error::Error),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Invalid device object: {0}")]
    InvalidObject(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Error, Debug)]
pub enum KeyManagerError {
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Unsupported key usage: {0}")]
    UnsupportedUsage(String),

    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Invalid key identifier: {0}")]
    InvalidKeyId(String),

    #[error("Keys are pre-generated on the HSM and cannot be added or updated")]
    PreGeneratedKeysOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = KeyManagerError::NotFound("openid.id-token/abc".to_string());
        assert_eq!(err.to_string(), "Key not found: openid.id-token/abc");
    }

    #[test]
    fn test_device_error_converts() {
        let err: KeyManagerError = DeviceError::Internal("lock poisoned".to_string()).into();
        assert!(matches!(err, KeyManagerError::Device(DeviceError::Internal(_))));
        assert_eq!(err.to_string(), "Device error: Internal error: lock poisoned");
    }
}
