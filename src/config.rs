use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;

/// Bearer Session - authenticated HTTP client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Base URL that relative request targets resolve against
    #[arg(short = 'u', long, env = "API_BASE_URL", default_value = "http://127.0.0.1:8000/")]
    pub base_url: String,

    /// Token refresh endpoint, relative to the base URL
    #[arg(long, env = "AUTH_REFRESH_PATH", default_value = "api/token/refresh/")]
    pub refresh_path: String,

    /// Login endpoint, relative to the base URL
    #[arg(long, env = "AUTH_LOGIN_PATH", default_value = "user/login/")]
    pub login_path: String,

    /// Path to the SQLite database holding the session
    #[arg(short = 'd', long, env = "SESSION_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Token refresh timeout in seconds
    #[arg(long, env = "TOKEN_REFRESH_TIMEOUT", default_value = "30")]
    pub refresh_timeout: u64,

    /// HTTP request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "60")]
    pub http_timeout: u64,

    /// HTTP connect timeout in seconds
    #[arg(long, env = "HTTP_CONNECT_TIMEOUT", default_value = "10")]
    pub connect_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Log in with email and password
    Login {
        #[arg(short, long)]
        email: String,

        /// Prompted for when omitted
        #[arg(short, long, env = "LOGIN_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// End the current session
    Logout,

    /// Show the current session
    Status,

    /// Send an authenticated request and print the response body
    Request {
        /// Absolute URL or path relative to the base URL
        target: String,

        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// JSON request body
        #[arg(long)]
        data: Option<String>,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // Endpoints
    pub base_url: Url,
    pub refresh_url: Url,
    pub login_url: Url,

    // Session storage
    pub session_db_file: PathBuf,

    // Timeouts
    pub refresh_timeout: Duration,
    pub http_request_timeout: Duration,
    pub http_connect_timeout: Duration,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > .env > defaults
    pub fn load() -> Result<(Self, Command)> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let args = CliArgs::parse();
        let command = args.command.clone();
        Ok((Self::from_args(args)?, command))
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let base_url = parse_base_url(&args.base_url)?;
        let refresh_url = base_url
            .join(&args.refresh_path)
            .with_context(|| format!("Invalid refresh path: {}", args.refresh_path))?;
        let login_url = base_url
            .join(&args.login_path)
            .with_context(|| format!("Invalid login path: {}", args.login_path))?;

        let session_db_file = match args.db_file {
            Some(path) => expand_tilde(&path),
            None => default_db_path().context(
                "No data directory found; set SESSION_DB_FILE (or use -d) to choose where the session is stored",
            )?,
        };

        Ok(Config {
            base_url,
            refresh_url,
            login_url,
            session_db_file,
            refresh_timeout: Duration::from_secs(args.refresh_timeout),
            http_request_timeout: Duration::from_secs(args.http_timeout),
            http_connect_timeout: Duration::from_secs(args.connect_timeout),
            log_level: args.log_level,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("API_BASE_URL", &self.base_url),
            ("AUTH_REFRESH_PATH", &self.refresh_url),
            ("AUTH_LOGIN_PATH", &self.login_url),
        ] {
            if !matches!(url.scheme(), "http" | "https") {
                anyhow::bail!("{} must be an http(s) URL: {}", name, url);
            }
        }

        if self.refresh_timeout.is_zero() {
            anyhow::bail!("TOKEN_REFRESH_TIMEOUT must be greater than zero");
        }
        if self.http_request_timeout.is_zero() {
            anyhow::bail!("HTTP_REQUEST_TIMEOUT must be greater than zero");
        }
        if self.http_connect_timeout.is_zero() {
            anyhow::bail!("HTTP_CONNECT_TIMEOUT must be greater than zero");
        }

        Ok(())
    }
}

/// Parse the base URL, making sure relative joins keep its last path segment
fn parse_base_url(s: &str) -> Result<Url> {
    let trimmed = s.trim();
    let normalized = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{}/", trimmed)
    };
    Url::parse(&normalized).with_context(|| format!("Invalid API_BASE_URL: {}", s))
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

/// Platform data directory location of the session database
fn default_db_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("bearer-session").join("session.sqlite3"))
}
