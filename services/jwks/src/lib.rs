//! JWKS Service - HTTP front for HSM-backed signing key sets
//!
//! Exposes generation, lookup, signing, and deletion of key sets whose
//! private keys live on a PKCS#11 token. Only public keys are ever returned.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod handlers;
pub mod server;

pub use server::{create_router, run};
