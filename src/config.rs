use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;

use crate::auth::{
    DEFAULT_EXPIRY_SKEW_SECS, DEFAULT_LOGIN_PATH, DEFAULT_LOGOUT_PATH, DEFAULT_REFRESH_MARGIN_SECS,
    DEFAULT_REFRESH_PATH,
};

const DEFAULT_DB_FILE_NAME: &str = "session.sqlite3";
const APP_DIR_NAME: &str = "session-pipeline";

/// Session Pipeline - authenticated API client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Backend base URL (e.g. https://api.example.com/)
    #[arg(short = 'u', long, env = "API_BASE_URL")]
    pub api_base_url: Option<String>,

    /// Path to the SQLite file holding the persisted session
    #[arg(short = 'd', long, env = "SESSION_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Seconds before expiry at which the session is renewed proactively
    #[arg(long, env = "REFRESH_MARGIN_SECS", default_value_t = DEFAULT_REFRESH_MARGIN_SECS)]
    pub refresh_margin: i64,

    /// Seconds of clock skew tolerated when checking expiry
    #[arg(long, env = "EXPIRY_SKEW_SECS", default_value_t = DEFAULT_EXPIRY_SKEW_SECS)]
    pub expiry_skew: i64,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "30")]
    pub connect_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "30")]
    pub http_timeout: u64,

    /// Login endpoint, relative to the base URL
    #[arg(long, env = "LOGIN_PATH", default_value = DEFAULT_LOGIN_PATH)]
    pub login_path: String,

    /// Refresh endpoint, relative to the base URL
    #[arg(long, env = "REFRESH_PATH", default_value = DEFAULT_REFRESH_PATH)]
    pub refresh_path: String,

    /// Logout notification endpoint, relative to the base URL
    #[arg(long, env = "LOGOUT_PATH", default_value = DEFAULT_LOGOUT_PATH)]
    pub logout_path: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in and persist the session
    Login {
        /// Account name
        #[arg(short = 'n', long)]
        username: String,

        /// Password (prompted for when omitted)
        #[arg(short = 'p', long, env = "SESSION_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// End the session locally and notify the backend
    Logout,

    /// Show the persisted session
    Status,

    /// Send one request through the authenticated pipeline
    Request {
        /// HTTP method (GET, POST, ...)
        method: String,

        /// Path relative to the base URL
        path: String,

        /// JSON body
        #[arg(short = 'b', long)]
        body: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backend
    pub api_base_url: String,
    pub login_path: String,
    pub refresh_path: String,
    pub logout_path: String,

    // Session storage
    pub session_db_file: PathBuf,

    // Session timing
    pub refresh_margin_secs: i64,
    pub expiry_skew_secs: i64,

    // HTTP client
    pub http_connect_timeout: u64,
    pub http_request_timeout: u64,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Load configuration from all sources with priority: CLI > ENV > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let command = args.command.clone();
        Ok((Self::from_args(args)?, command))
    }

    /// Build configuration from parsed arguments
    pub fn from_args(args: CliArgs) -> Result<Self> {
        let api_base_url = args
            .api_base_url
            .filter(|s| !s.trim().is_empty())
            .context("API_BASE_URL is required (use -u or set API_BASE_URL env var)")?;

        let session_db_file = args
            .db_file
            .map(|s| expand_tilde(&s))
            .unwrap_or_else(default_db_file);

        Ok(Config {
            api_base_url,
            login_path: args.login_path,
            refresh_path: args.refresh_path,
            logout_path: args.logout_path,
            session_db_file,
            refresh_margin_secs: args.refresh_margin,
            expiry_skew_secs: args.expiry_skew,
            http_connect_timeout: args.connect_timeout,
            http_request_timeout: args.http_timeout,
            log_level: args.log_level,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.api_base_url)
            .with_context(|| format!("API_BASE_URL is not a valid URL: {}", self.api_base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            anyhow::bail!("API_BASE_URL must use http or https: {}", self.api_base_url);
        }

        if self.refresh_margin_secs < 0 {
            anyhow::bail!("REFRESH_MARGIN_SECS must not be negative");
        }
        if self.expiry_skew_secs < 0 {
            anyhow::bail!("EXPIRY_SKEW_SECS must not be negative");
        }
        if self.http_connect_timeout == 0 || self.http_request_timeout == 0 {
            anyhow::bail!("HTTP timeouts must be at least one second");
        }

        Ok(())
    }
}

/// Session database under the platform data directory
fn default_db_file() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR_NAME).join(DEFAULT_DB_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_FILE_NAME))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
