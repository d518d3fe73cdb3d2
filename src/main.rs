use anyhow::{Context, Result};
use dialoguer::Password;
use reqwest::{Method, Url};
use std::sync::Arc;
use std::time::Duration;

use session_pipeline::auth::{
    AuthClient, AuthEndpoints, CredentialStore, RefreshCoordinator, RefreshScheduler,
    RequestAuthenticator, SessionManager, SessionNotifier, SqliteStore,
};
use session_pipeline::config::{Command, Config};
use session_pipeline::error::AuthError;
use session_pipeline::http_client::SessionHttpClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let (config, command) = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::debug!("🚀 Session pipeline starting...");
    tracing::debug!(
        base_url = %config.api_base_url,
        db_file = %config.session_db_file.display(),
        "Configuration loaded"
    );

    let pipeline = Pipeline::build(&config)?;

    // Pick up the persisted session (refreshing it if it has expired)
    match pipeline.sessions.start().await {
        Some(credential) => tracing::debug!(
            subject_id = credential.subject_id,
            "✅ Session restored"
        ),
        None => tracing::debug!("No persisted session"),
    }

    match command {
        Command::Login { username, password } => {
            let password = match password {
                Some(password) => password,
                None => Password::new()
                    .with_prompt(format!("Password for {}", username))
                    .interact()
                    .context("Failed to read password")?,
            };
            login(&pipeline, &username, &password).await
        }
        Command::Logout => {
            pipeline.sessions.logout().await;
            println!("Logged out");
            Ok(())
        }
        Command::Status => {
            print_status(&pipeline);
            Ok(())
        }
        Command::Request { method, path, body } => {
            request(&pipeline, &config, &method, &path, body.as_deref()).await
        }
    }
}

/// Everything the commands need, wired together
struct Pipeline {
    sessions: SessionManager,
    http_client: SessionHttpClient,
}

impl Pipeline {
    fn build(config: &Config) -> Result<Self> {
        let storage = SqliteStore::open(&config.session_db_file)?;
        let store = Arc::new(CredentialStore::with_skew(
            Arc::new(storage),
            SessionNotifier::new(),
            config.expiry_skew_secs,
        ));

        let endpoints = AuthEndpoints::new(
            &config.api_base_url,
            &config.login_path,
            &config.refresh_path,
            &config.logout_path,
        )?;

        // One connection pool for auth calls and the request pipeline
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.http_connect_timeout))
            .timeout(Duration::from_secs(config.http_request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        let auth_client = AuthClient::with_client(client.clone(), endpoints.clone());
        let coordinator = RefreshCoordinator::new(
            store.clone(),
            auth_client.clone(),
            RefreshScheduler::new(config.refresh_margin_secs),
        );

        let http_client = SessionHttpClient::with_client(
            client,
            RequestAuthenticator::new(store.clone(), endpoints),
            coordinator.clone(),
        );
        tracing::debug!("✅ HTTP client initialized with connection pooling");

        let sessions = SessionManager::new(store, auth_client, coordinator, config.expiry_skew_secs);

        Ok(Self {
            sessions,
            http_client,
        })
    }
}

async fn login(pipeline: &Pipeline, username: &str, password: &str) -> Result<()> {
    match pipeline.sessions.login(username, password).await {
        Ok(outcome) => {
            println!("Logged in as {}", username);
            if outcome.redirect.is_some() {
                println!("First login: a password change is required before continuing");
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e.display_message());
            anyhow::bail!("Login failed: {}", e)
        }
    }
}

fn print_status(pipeline: &Pipeline) {
    let Some(credential) = pipeline.sessions.current() else {
        println!("Not logged in");
        return;
    };

    let expires = credential
        .expires_at_utc()
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| credential.expires_at.to_string());

    println!(
        "  Status:      {}",
        if pipeline.sessions.is_logged_in() {
            "logged in"
        } else {
            "expired"
        }
    );
    if credential.has_known_subject() {
        println!("  Subject:     {}", credential.subject_id);
    } else {
        println!("  Subject:     unknown");
    }
    println!("  Expires:     {}", expires);
    println!("  First login: {}", credential.first_login);
    match pipeline.sessions.coordinator().scheduler().fires_in() {
        Some(delay) => println!("  Next refresh in {}s", delay.as_secs()),
        None => println!("  No refresh scheduled"),
    }
}

async fn request(
    pipeline: &Pipeline,
    config: &Config,
    method: &str,
    path: &str,
    body: Option<&str>,
) -> Result<()> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))?;

    let base = if config.api_base_url.ends_with('/') {
        config.api_base_url.clone()
    } else {
        format!("{}/", config.api_base_url)
    };
    let url = Url::parse(&base)
        .and_then(|base| base.join(path.trim_start_matches('/')))
        .with_context(|| format!("Invalid request path: {}", path))?;

    let mut builder = pipeline.http_client.client().request(method, url);
    if let Some(body) = body {
        let json: serde_json::Value =
            serde_json::from_str(body).context("Request body is not valid JSON")?;
        builder = builder.json(&json);
    }
    let request = builder.build().context("Failed to build request")?;

    match pipeline.http_client.execute(request).await {
        Ok(response) => {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            println!("{}", status);
            println!("{}", text);
            Ok(())
        }
        Err(e @ AuthError::SessionEnded(_)) => {
            eprintln!("Session ended, please log in again");
            anyhow::bail!("{}", e)
        }
        Err(e) => anyhow::bail!("Request failed: {}", e),
    }
}
