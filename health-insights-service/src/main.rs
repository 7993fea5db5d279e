use health_insights_service::{AppState, GeminiClient, build_router};
use panel_flow::OrchestratorConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured JSON tracing based on environment variables
fn init_tracing() {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "health_insights_service=debug,panel_flow=debug,tower_http=debug".into()
    });

    match log_format.as_str() {
        "pretty" => {
            // Human-readable logging for development
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
        _ => {
            // Structured JSON logging for production
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_level(true),
                )
                .init();
        }
    }
}

fn timeout_from_env(var: &str, default_secs: u64) -> Duration {
    let secs = std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_secs);
    Duration::from_secs(secs)
}

#[tokio::main]
async fn main() {
    init_tracing();

    // The API key is the one required piece of configuration.
    let api_key = match std::env::var("GEMINI_API_KEY") {
        Ok(key) if !key.trim().is_empty() => key,
        _ => {
            error!("GEMINI_API_KEY not set");
            std::process::exit(1);
        }
    };

    let config = OrchestratorConfig {
        specialist_timeout: timeout_from_env("SPECIALIST_TIMEOUT_SECS", 120),
        synthesis_timeout: timeout_from_env("SYNTHESIS_TIMEOUT_SECS", 180),
    };

    let client = Arc::new(GeminiClient::new(api_key));
    let state = AppState::new(client, config);
    let app = build_router(state);

    let port = std::env::var("PORT")
        .unwrap_or_else(|_| "3000".to_string())
        .parse::<u16>()
        .unwrap_or(3000);

    let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, port, "failed to bind");
            std::process::exit(1);
        }
    };

    info!("Health Insights Analysis Service running on http://0.0.0.0:{port}");
    info!("Case submission endpoint: POST http://0.0.0.0:{port}/cases");

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server exited with error");
        std::process::exit(1);
    }
}
