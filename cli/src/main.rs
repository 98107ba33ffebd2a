mod chat;
mod commands;
mod gate;
mod guard;
mod identity;
mod util;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::chat::ChatClient;
use crate::gate::{AuthGate, Routes};
use crate::guard::{Navigator, RouteGuard};
use crate::identity::firebase::{
    DEFAULT_IDENTITY_URL, DEFAULT_TOKEN_URL, FirebaseConfig, FirebaseIdentityProvider,
};
use crate::identity::store::default_session_path;
use crate::util::{client, exit_error};

#[derive(Parser)]
#[command(name = "motorchat", version, about = "motorchat CLI: sign in, then ask the car assistant")]
struct Cli {
    /// API base URL
    #[arg(long, env = "MOTORCHAT_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Web API key of the Firebase project
    #[arg(long, env = "FIREBASE_API_KEY", hide_env_values = true)]
    firebase_api_key: String,

    /// Identity Toolkit base URL (point at the auth emulator for local use)
    #[arg(long, env = "FIREBASE_IDENTITY_URL", default_value = DEFAULT_IDENTITY_URL)]
    identity_url: String,

    /// Secure token endpoint used to refresh id tokens
    #[arg(long, env = "FIREBASE_TOKEN_URL", default_value = DEFAULT_TOKEN_URL)]
    token_url: String,

    /// Hosted page that runs the federated sign-in and redirects back with an id_token
    #[arg(long, env = "MOTORCHAT_FEDERATED_AUTH_URL")]
    federated_auth_url: Option<String>,

    #[arg(long, env = "MOTORCHAT_FEDERATED_PROVIDER", default_value = "google.com")]
    federated_provider: String,

    /// Where the signed-in session is kept (defaults to the user config dir)
    #[arg(long, env = "MOTORCHAT_SESSION_FILE")]
    session_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create an account with email and password
    Register {
        #[arg(long)]
        email: String,
        /// Read from stdin when omitted
        #[arg(long, env = "MOTORCHAT_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Sign in with email and password, or through the browser
    Login {
        #[arg(long, required_unless_present = "federated")]
        email: Option<String>,
        #[arg(long, env = "MOTORCHAT_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Sign in with the configured federated provider in the browser
        #[arg(long, conflicts_with = "email")]
        federated: bool,
    },
    /// Sign out and forget the stored session
    Logout,
    /// Show the signed-in identity
    Whoami,
    /// Print a bearer token for the signed-in identity
    Token {
        #[arg(long)]
        force_refresh: bool,
    },
    /// Send one message, or start an interactive chat when none is given
    Chat { message: Option<String> },
}

impl Commands {
    /// The route a command runs on. `None` runs without passing the guard.
    fn route<'a>(&self, routes: &'a Routes) -> Option<&'a str> {
        match self {
            Commands::Register { .. } | Commands::Login { .. } => Some(routes.login.as_str()),
            Commands::Whoami => None,
            Commands::Logout | Commands::Token { .. } | Commands::Chat { .. } => {
                Some(routes.home.as_str())
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let http = client();
    let provider = Arc::new(FirebaseIdentityProvider::new(
        FirebaseConfig {
            api_key: cli.firebase_api_key,
            identity_url: cli.identity_url,
            token_url: cli.token_url,
            federated_auth_url: cli.federated_auth_url,
            federated_provider: cli.federated_provider,
            session_path: cli.session_file.unwrap_or_else(default_session_path),
        },
        http.clone(),
    ));
    tokio::spawn({
        let provider = provider.clone();
        async move { provider.restore().await }
    });

    let gate = Arc::new(AuthGate::new(provider, Routes::default()));
    let navigator = Navigator::new(RouteGuard::new(gate.clone()));

    match cli.command.route(gate.routes()).map(str::to_string) {
        Some(requested) => {
            let landed = match navigator.navigate(&requested).await {
                Ok(route) => route,
                Err(e) => exit_error(&e.to_string(), None),
            };
            tracing::debug!(route = %landed, phase = ?navigator.guard().phase(), "navigation settled");
            if landed != requested {
                if landed == gate.routes().login {
                    exit_error("Not signed in.", Some("Run `motorchat login` first."));
                }
                exit_error(
                    "Already signed in.",
                    Some("Run `motorchat logout` to switch accounts."),
                );
            }
        }
        None => {
            gate.initialize().await;
        }
    }

    let result = match cli.command {
        Commands::Register { email, password } => {
            commands::auth::register(&gate, &email, password).await
        }
        Commands::Login {
            email,
            password,
            federated,
        } => commands::auth::login(&gate, email.as_deref(), password, federated).await,
        Commands::Logout => commands::auth::logout(&gate).await,
        Commands::Whoami => commands::auth::whoami(&gate),
        Commands::Token { force_refresh } => commands::auth::token(&gate, force_refresh).await,
        Commands::Chat { message } => {
            let chat_client = ChatClient::new(http, cli.api_url);
            commands::chat::run(&gate, &navigator, &chat_client, message).await
        }
    };

    if let Err(e) = result {
        exit_error(&e.to_string(), None);
    }
}
