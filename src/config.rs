//! Server configuration from environment variables.

use std::env;
use std::path::PathBuf;

/// Application configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bind host (`ORGBOARD_HOST`, default `0.0.0.0`)
    pub host: String,
    /// Bind port (`ORGBOARD_PORT`, default 8080)
    pub port: u16,
    /// SQLite database path (`ORGBOARD_DB`, default `orgboard.db`)
    pub database_path: PathBuf,
    /// JWT signing secret (`JWT_SECRET`, required)
    pub jwt_secret: String,
    /// Token lifetime in days (`JWT_TTL_DAYS`, default 30)
    pub jwt_ttl_days: i64,
    /// Salt mixed into password digests (`PASSWORD_SALT`)
    pub password_salt: String,
    /// Bootstrap superadmin, created at startup when both
    /// `ROOT_USERNAME` and `ROOT_PASSWORD` are set
    pub root_user: Option<(String, String)>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let host = env::var("ORGBOARD_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("ORGBOARD_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);
        let database_path = env::var("ORGBOARD_DB")
            .unwrap_or_else(|_| "orgboard.db".to_string())
            .into();
        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| anyhow::anyhow!("JWT_SECRET must be set"))?;
        let jwt_ttl_days = env::var("JWT_TTL_DAYS")
            .ok()
            .and_then(|d| d.parse().ok())
            .unwrap_or(30);
        let password_salt = env::var("PASSWORD_SALT").unwrap_or_else(|_| "orgboard".to_string());
        let root_user = match (env::var("ROOT_USERNAME").ok(), env::var("ROOT_PASSWORD").ok()) {
            (Some(u), Some(p)) if !u.trim().is_empty() && !p.is_empty() => Some((u, p)),
            _ => None,
        };

        Ok(Self {
            host,
            port,
            database_path,
            jwt_secret,
            jwt_ttl_days,
            password_salt,
            root_user,
        })
    }
}
