//! JWKS Service HTTP Server

use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info};

use axum::{
    Router,
    routing::{get, post},
};
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::session::{Session, UserType};
use cryptoki::types::AuthPin;
use jwks_hsm::{HsmKeyManager, KeyManager, Pkcs11Store};

use crate::handlers;

/// Create and configure the Axum router
pub fn create_router(manager: Arc<dyn KeyManager>) -> Router {
    Router::new()
        // Health
        .route("/health", get(handlers::health))
        // Key sets
        .route(
            "/api/keys/:set",
            post(handlers::generate_key)
                .get(handlers::get_key_set)
                .put(handlers::update_key_set)
                .delete(handlers::delete_key_set),
        )
        .route(
            "/api/keys/:set/:kid",
            get(handlers::get_key).delete(handlers::delete_key),
        )
        .route("/api/keys/:set/:kid/sign", post(handlers::sign))
        .with_state(manager)
}

/// Open a logged-in read-write session on the configured token.
fn open_session(library_path: &str, slot_index: usize, pin: &str) -> Result<Session, String> {
    let pkcs11 = Pkcs11::new(library_path)
        .map_err(|e| format!("Failed to load PKCS#11 library: {}", e))?;
    pkcs11
        .initialize(CInitializeArgs::OsThreads)
        .map_err(|e| format!("Failed to initialize PKCS#11 library: {}", e))?;

    let slots = pkcs11
        .get_slots_with_token()
        .map_err(|e| format!("Failed to list slots: {}", e))?;
    let slot = slots
        .get(slot_index)
        .copied()
        .ok_or_else(|| format!("No token in slot {}", slot_index))?;

    let session = pkcs11
        .open_rw_session(slot)
        .map_err(|e| format!("Failed to open session: {}", e))?;
    session
        .login(UserType::User, Some(&AuthPin::new(pin.into())))
        .map_err(|e| format!("Failed to log in: {}", e))?;

    Ok(session)
}

/// Run the HTTP server
pub async fn run(listener: tokio::net::TcpListener) -> Result<(), Box<dyn std::error::Error>> {
    let library_path = std::env::var("PKCS11_LIBRARY")
        .unwrap_or_else(|_| "/usr/lib/softhsm/libsofthsm2.so".to_string());
    let slot_index: usize = std::env::var("HSM_SLOT")
        .unwrap_or_else(|_| "0".to_string())
        .parse()
        .map_err(|e| format!("HSM_SLOT must be a valid number: {}", e))?;
    let pin = std::env::var("HSM_PIN").unwrap_or_else(|_| "1234".to_string());

    info!("Opening PKCS#11 session via {}", library_path);
    let session = open_session(&library_path, slot_index, &pin)?;
    info!("PKCS#11 session ready on slot {}", slot_index);

    let manager: Arc<dyn KeyManager> =
        Arc::new(HsmKeyManager::new(Arc::new(Pkcs11Store::new(session))));

    let app = create_router(manager);

    info!(
        "JWKS service listening on {}",
        listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wait for SIGTERM or SIGINT signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Starting graceful shutdown...");
}
