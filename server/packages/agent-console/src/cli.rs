use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderValue;
use clap::Parser;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Settings;
use crate::config_files::AgentConfigFiles;
use crate::registry::RuntimeRegistry;
use crate::router::{build_router_with_state, shutdown, AppState};
use crate::runtime::{RetryPolicy, RuntimeContext, MAX_ATTEMPTS};
use crate::service::AgentService;
use crate::store::{Store, StoreError};
use agent_console_error::ConsoleError;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8000;
const DATABASE_PROBES: u32 = 30;
const DATABASE_PROBE_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "agent-console", bin_name = "agent-console")]
#[command(about = "Multi-user web console for coding agent sessions", version)]
pub struct ServerArgs {
    #[arg(long, short = 'H', env = "AGENT_CONSOLE_HOST", default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', env = "AGENT_CONSOLE_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// sqlite database URL; defaults to the platform data directory.
    #[arg(long = "database-url", env = "AGENT_CONSOLE_DATABASE_URL")]
    database_url: Option<String>,

    /// Allowed CORS origin; repeatable. Any origin is allowed when omitted.
    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Console(#[from] ConsoleError),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_agent_console() -> Result<(), CliError> {
    let args = ServerArgs::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_server(&args)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

fn run_server(args: &ServerArgs) -> Result<(), CliError> {
    let mut settings = Settings::from_env();
    if let Some(database_url) = &args.database_url {
        settings.database_url = database_url.clone();
    }
    let cors = build_cors_layer(args)?;
    let addr = format!("{}:{}", args.host, args.port);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let state = Arc::new(AppState::new(build_service(settings).await?));
        let (router, state) = build_router_with_state(state);
        let router = router.layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown requested");
                shutdown(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))?;
        state.service().store().close().await;
        Ok::<(), CliError>(())
    })
}

/// Opens the database, seeds default users and wires the agent runtime.
pub async fn build_service(settings: Settings) -> Result<AgentService, CliError> {
    tracing::info!(
        database_url = %settings.database_url,
        agent = ?settings.agent_backend,
        model = %settings.model,
        "starting agent console"
    );
    let config_files = AgentConfigFiles::from_home_dir();
    config_files.ensure().await;

    let store = Store::connect(&settings.database_url)?;
    store
        .wait_until_available(DATABASE_PROBES, DATABASE_PROBE_DELAY)
        .await?;
    store.migrate().await?;

    let registry = RuntimeRegistry::new(RuntimeContext {
        connector: settings.build_connector(),
        config_files,
        retry: RetryPolicy {
            max_attempts: MAX_ATTEMPTS,
            base_delay: settings.retry_base_delay,
        },
    });
    let service = AgentService::new(store, registry, settings);
    service.ensure_default_users().await?;
    Ok(service)
}

fn build_cors_layer(args: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    let mut origins = Vec::new();
    for origin in &args.cors_allow_origin {
        let value: HeaderValue = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    cors = if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(origins)
    };

    Ok(cors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_flags() {
        let args = ServerArgs::try_parse_from([
            "agent-console",
            "--host",
            "0.0.0.0",
            "--port",
            "9000",
            "--database-url",
            "sqlite::memory:",
            "-O",
            "http://localhost:5173",
        ])
        .expect("parse");
        assert_eq!(args.host, "0.0.0.0");
        assert_eq!(args.port, 9000);
        assert_eq!(args.database_url.as_deref(), Some("sqlite::memory:"));
        assert!(build_cors_layer(&args).is_ok());
    }

    #[test]
    fn rejects_invalid_cors_origin() {
        let args = ServerArgs::try_parse_from(["agent-console", "-O", "not a header\n"])
            .expect("parse");
        assert!(matches!(
            build_cors_layer(&args),
            Err(CliError::InvalidCorsOrigin(_))
        ));
    }
}
