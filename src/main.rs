use session_keeper::configuration::get_configuration;
use session_keeper::startup::{build_session_manager, run, spawn_expiry_sweeper};
use session_keeper::store::{PgPurposeTokenStore, PgSessionStore, PurposeTokenStore, SessionStore};
use session_keeper::telemetry::init_telemetry;
use sqlx::postgres::PgPoolOptions;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

const EXPIRY_SWEEP_PERIOD: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_telemetry();

    tracing::info!("Starting application");

    let configuration = match get_configuration() {
        Ok(config) => {
            tracing::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            tracing::error!("Failed to read configuration: {}", e);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "Configuration error",
            ));
        }
    };

    // Connections are opened on first use so the service starts even when
    // the database is still coming up.
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(2))
        .connect_lazy(&configuration.database.connection_string())
        .map_err(|e| {
            tracing::error!("Invalid database settings: {}", e);
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "Database configuration error")
        })?;

    let sessions: Arc<dyn SessionStore> = Arc::new(PgSessionStore::new(pool.clone()));
    let purpose_tokens: Arc<dyn PurposeTokenStore> = Arc::new(PgPurposeTokenStore::new(pool.clone()));
    let manager = build_session_manager(&configuration, sessions.clone(), purpose_tokens.clone(), pool)
        .map_err(|e| {
            tracing::error!("Invalid configuration: {}", e);
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "Configuration error")
        })?;
    spawn_expiry_sweeper(sessions, purpose_tokens, EXPIRY_SWEEP_PERIOD);

    let address = format!(
        "{}:{}",
        configuration.application.host, configuration.application.port
    );
    let listener = TcpListener::bind(&address)?;
    tracing::info!("Server listening on: {}", address);

    run(listener, manager)?.await
}
