use serde::Deserialize;

use crate::types::Langcode;

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Redis list the delivery jobs are queued on
    pub delivery_queue: String,

    /// BRPOP timeout in seconds for the worker loop (default: 5)
    pub worker_poll_timeout_secs: u64,

    /// Languages the platform serves, in configuration order. The first entry
    /// is the site default; more than one entry makes the platform
    /// multilingual for recipient splitting.
    pub languages: Vec<Langcode>,

    /// Maximum number of PostgreSQL connections in the pool (default: 20)
    pub db_max_connections: u32,
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let languages: Vec<Langcode> = std::env::var("LANGUAGES")
            .unwrap_or_else(|_| "en".to_string())
            .split(',')
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(Langcode::new)
            .collect();
        if languages.is_empty() {
            anyhow::bail!("LANGUAGES must name at least one language");
        }

        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            delivery_queue: std::env::var("DELIVERY_QUEUE")
                .unwrap_or_else(|_| "murmur:delivery".to_string()),
            worker_poll_timeout_secs: std::env::var("WORKER_POLL_TIMEOUT_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("WORKER_POLL_TIMEOUT_SECS must be a valid u64"))?,
            languages,
            db_max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("DB_MAX_CONNECTIONS must be a valid u32"))?,
        })
    }

    /// Whether recipient pools must be split per language.
    pub fn multilingual(&self) -> bool {
        self.languages.len() > 1
    }

    /// The site default language (first configured entry).
    pub fn default_langcode(&self) -> &Langcode {
        &self.languages[0]
    }
}
