//! Binary entrypoint for the labrig lock server.
//!
//! Reads configuration from environment variables:
//! - `LABRIG_DB_PATH`: SQLite database file path (default: "labrig.db",
//!   ":memory:" for a non-persistent store)
//! - `LABRIG_PORT`: Server listen port (default: "3000")

use std::process::ExitCode;

use labrig_server::router::build_router;
use labrig_server::state::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let db_path = std::env::var("LABRIG_DB_PATH").unwrap_or_else(|_| "labrig.db".to_string());
    let port = std::env::var("LABRIG_PORT").unwrap_or_else(|_| "3000".to_string());

    let state = match AppState::new(&db_path) {
        Ok(state) => state,
        Err(err) => {
            tracing::error!("Failed to open lock registry at {}: {}", db_path, err);
            return ExitCode::FAILURE;
        }
    };

    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!("labrig lock server starting on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!("Failed to bind {}: {}", addr, err);
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", err);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
