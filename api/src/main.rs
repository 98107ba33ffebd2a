use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use serde::Serialize;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod auth;
mod backend;
mod config;
mod error;
mod extract;
mod ledger;
mod middleware;
mod routes;
mod state;
#[cfg(test)]
mod testing;
mod verify;

use config::{ServerConfig, VerifierConfig};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Motorchat API",
        version = "0.1.0",
        description = "Metered automotive assistant chat. Every call needs a bearer token from the identity provider."
    ),
    paths(routes::health::health_check, routes::chat::chat),
    components(schemas(
        HealthResponse,
        motorchat_core::error::ApiError,
        motorchat_core::chat::Role,
        motorchat_core::chat::ChatMessage,
        motorchat_core::chat::ChatRequest,
        motorchat_core::chat::ChatResponse,
        motorchat_core::chat::QuotaExceededResponse,
    )),
    modifiers(&SecurityAddon)
)]
struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            utoipa::openapi::security::SecurityScheme::Http(
                utoipa::openapi::security::Http::new(
                    utoipa::openapi::security::HttpAuthScheme::Bearer,
                ),
            ),
        );
    }
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Identities with a live session in this process
    pub active_sessions: usize,
}

fn build_verifier(config: &VerifierConfig) -> Arc<dyn verify::TokenVerifier> {
    match config {
        VerifierConfig::Jwks {
            project_id,
            jwks_url,
        } => Arc::new(verify::JwtVerifier::firebase(
            project_id,
            jwks_url.as_str(),
            reqwest::Client::new(),
        )),
        VerifierConfig::SharedSecret { project_id, secret } => {
            tracing::warn!("verifying bearer tokens with a shared secret; use JWKS in production");
            Arc::new(verify::JwtVerifier::shared_secret(project_id, secret.as_bytes()))
        }
    }
}

fn exit_with(message: &str, error: &dyn std::fmt::Display) -> ! {
    tracing::error!(error = %error, "{message}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "motorchat_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = ServerConfig::from_env()
        .unwrap_or_else(|err| exit_with("invalid configuration", &err));

    let backend = backend::OpenAiBackend::new(&config.openai)
        .unwrap_or_else(|err| exit_with("failed to build completion client", &err));

    let ledger = Arc::new(ledger::SessionLedger::new(
        Arc::new(backend),
        config.quota,
        config.system_prompt.clone(),
    ));
    tracing::info!(
        quota_limit = ledger.policy().limit,
        quota_window_secs = ledger.policy().window.num_seconds(),
        model = %config.openai.model,
        "session ledger ready"
    );

    let app_state = state::AppState {
        ledger,
        verifier: build_verifier(&config.verifier),
        display_tz: config.display_tz,
    };

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::chat::router().layer(middleware::rate_limit::chat_layer()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::cors::build_cors_layer(&config.cors_origins)),
        )
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|err| exit_with("failed to bind listener", &err));
    tracing::info!("Motorchat API listening on {}", addr);

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        exit_with("server error", &err);
    }
}
