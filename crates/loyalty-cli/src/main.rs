//! Loyalty CLI - manage signed-in accounts and make authenticated API calls.
//!
//! Sessions live in the OS keychain. The active session's access token is
//! refreshed automatically when the API answers 401.

use std::io;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use loyalty_core::auth::token_endpoint_refresh;
use loyalty_core::{
    ApiRequest, AutoRefresh, ClientConfig, KeyringStore, ReqwestTransport, Session, SessionStore, StorageError,
    TokenPair, Transport,
};

/// What we remember about a signed-in account besides its tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccountInfo {
    email: String,
    signed_in_at: DateTime<Utc>,
}

type Sessions = SessionStore<AccountInfo, TokenPair>;

const USAGE: &str = "\
Usage: loyalty <command> [args]

Commands:
  sessions                    List stored sessions (* marks the active one)
  add <id> <email>            Store a session; tokens are read from the terminal
  use <id>                    Make <id> the active session
  remove <id>                 Delete a session and its tokens
  whoami                      Show the active session
  get <path> [key=value...]   GET <path> as the active session and print the body
  config                      Write the default config file if missing and print its path

Environment:
  LOYALTY_BASE_URL            API base URL (overrides the config file)
  LOYALTY_SERVICE_NAME        Keychain service name (overrides the config file)
  RUST_LOG                    Log filter, e.g. RUST_LOG=loyalty_core=debug";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // RUST_LOG controls the level, warnings only by default
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{}", USAGE);
        std::process::exit(2);
    };

    let config = ClientConfig::load()?.apply_env_overrides();
    let store: Sessions = SessionStore::new(Arc::new(KeyringStore::new()), config.service_name.clone());
    info!(command = %command, service = %config.service_name, "Running command");

    match (command.as_str(), &args[1..]) {
        ("sessions", []) => list_sessions(&store).await,
        ("add", [id, email]) => add_session(&store, id, email).await,
        ("use", [id]) => use_session(&store, id).await,
        ("remove", [id]) => remove_session(&store, id).await,
        ("whoami", []) => whoami(&store).await,
        ("get", [path, params @ ..]) => get(&store, &config, path, params).await,
        ("config", []) => write_config(&config),
        ("help" | "--help" | "-h", _) => {
            println!("{}", USAGE);
            Ok(())
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    }
}

// ============================================================================
// Session commands
// ============================================================================

async fn list_sessions(store: &Sessions) -> Result<()> {
    let sessions = store.list().await?;
    if sessions.is_empty() {
        println!("No sessions. Add one with `loyalty add <id> <email>`.");
        return Ok(());
    }

    let active = store.active_id().await?;
    for session in sessions {
        let marker = if active.as_deref() == Some(session.id()) { "*" } else { " " };
        let tokens = if session.has_tokens().await? { "" } else { "  (signed out)" };
        println!(
            "{} {:<16} {:<32} since {}{}",
            marker,
            session.id(),
            session.info().email,
            format_time(session.info().signed_in_at),
            tokens
        );
    }
    Ok(())
}

async fn add_session(store: &Sessions, id: &str, email: &str) -> Result<()> {
    let access_token = prompt_secret("Access token: ")?;
    let refresh_token = prompt_secret("Refresh token: ")?;

    let info = AccountInfo {
        email: email.to_string(),
        signed_in_at: Utc::now(),
    };
    match store
        .create(id, info, Some(TokenPair::new(access_token, refresh_token)))
        .await
    {
        Ok(_) => {}
        Err(StorageError::DuplicateSession(_)) => {
            bail!("Session '{}' already exists. Remove it first to replace it.", id)
        }
        Err(e) => return Err(e.into()),
    }

    if store.active_id().await?.is_none() {
        store.set_active(id).await?;
        println!("Added session '{}' and made it active.", id);
    } else {
        println!("Added session '{}'. Run `loyalty use {}` to switch to it.", id, id);
    }
    Ok(())
}

async fn use_session(store: &Sessions, id: &str) -> Result<()> {
    match store.set_active(id).await {
        Ok(()) => {
            println!("Now using '{}'.", id);
            Ok(())
        }
        Err(StorageError::NotFound(_)) => bail!("No session named '{}'.", id),
        Err(e) => Err(e.into()),
    }
}

async fn remove_session(store: &Sessions, id: &str) -> Result<()> {
    if !store.contains(id).await? {
        bail!("No session named '{}'.", id);
    }
    store.remove(id).await?;
    println!("Removed '{}'.", id);
    Ok(())
}

async fn whoami(store: &Sessions) -> Result<()> {
    let session = active_session(store).await?;
    println!("{} <{}>", session.id(), session.info().email);
    println!("Signed in {}", format_time(session.info().signed_in_at));
    if !session.has_tokens().await? {
        println!("Signed out: no tokens stored. Add the session again to sign in.");
    }
    Ok(())
}

fn write_config(config: &ClientConfig) -> Result<()> {
    let path = ClientConfig::config_path()?;
    if !path.exists() {
        config.save()?;
        println!("Wrote default config.");
    }
    println!("{}", path.display());
    Ok(())
}

// ============================================================================
// API access
// ============================================================================

async fn get(store: &Sessions, config: &ClientConfig, path: &str, params: &[String]) -> Result<()> {
    let session = active_session(store).await?;
    let base_url = base_url(config)?;

    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(config.request_timeout())?);
    let refresh = token_endpoint_refresh(
        Arc::clone(&transport),
        base_url.clone(),
        &config.refresh_path,
        session.clone(),
    );
    let authenticator = AutoRefresh::for_session(session, refresh, config.refresh.clone());

    let mut request = ApiRequest::new(transport, base_url.clone())
        .get(Some(path))
        .authenticate(Arc::new(authenticator));
    for param in params {
        let (key, value) = param
            .split_once('=')
            .with_context(|| format!("Expected key=value, got '{}'", param))?;
        request = request.parameter(key, Some(value));
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) if e.is_reauthentication_required() => {
            bail!("Your session has expired or was revoked. Please log in again with `loyalty add`.")
        }
        Err(e) if e.is_connectivity() => {
            bail!("Could not reach {}. Check your connection and try again. ({})", base_url, e)
        }
        Err(e) => return Err(e).context(format!("GET {} failed", path)),
    };

    match serde_json::from_slice::<serde_json::Value>(&response.body) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", response.text()),
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

async fn active_session(store: &Sessions) -> Result<Session<AccountInfo, TokenPair>> {
    match store.get_active().await {
        Ok(session) => Ok(session),
        Err(StorageError::NotFound(_)) => {
            bail!("No active session. Add one with `loyalty add <id> <email>` or pick one with `loyalty use <id>`.")
        }
        Err(e) => Err(e.into()),
    }
}

fn base_url(config: &ClientConfig) -> Result<Url> {
    if config.base_url.trim().is_empty() {
        bail!(
            "No API base URL configured. Set LOYALTY_BASE_URL or edit {}",
            ClientConfig::config_path()?.display()
        );
    }
    Url::parse(&config.base_url).with_context(|| format!("Invalid base URL '{}'", config.base_url))
}

fn prompt_secret(prompt: &str) -> Result<String> {
    let value = rpassword::prompt_password(prompt).context("Failed to read from terminal")?;
    let value = value.trim().to_string();
    if value.is_empty() {
        bail!("{} cannot be empty", prompt.trim_end_matches([':', ' ']));
    }
    Ok(value)
}

fn format_time(time: DateTime<Utc>) -> String {
    time.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}
