//! Application configuration loaded from environment variables.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::loader::BatchConfig;
use crate::router::PageDefaults;

#[derive(Debug, Clone)]
pub struct Config {
    /// Server port
    pub port: u16,

    /// Database URL or path. For SQLite either `DATABASE_PATH` or a
    /// `DATABASE_URL` with the `sqlite://` prefix works.
    pub database_url: String,

    /// Default page size for list routes
    pub per_page: i64,

    /// Largest page size a request may ask for
    pub max_per_page: i64,

    /// How long a relation batch stays open, in milliseconds
    pub batch_delay_ms: u64,

    /// Dispatch a relation batch early once it reaches this many parents
    pub batch_max_size: usize,
}

impl Config {
    /// Load configuration from the environment, reading a `.env` file first
    /// when one is present. Variables already set win over the file.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_PATH")
            .or_else(|_| env::var("DATABASE_URL"))
            .unwrap_or_else(|_| "./data/gantry.db".to_string());

        Ok(Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .context("Invalid PORT")?,

            database_url,

            per_page: env::var("PAGE_SIZE")
                .unwrap_or_else(|_| "25".to_string())
                .parse()
                .unwrap_or(25),

            max_per_page: env::var("MAX_PAGE_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .unwrap_or(100),

            batch_delay_ms: env::var("BATCH_DELAY_MS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .unwrap_or(1),

            batch_max_size: env::var("BATCH_MAX_SIZE")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
        })
    }

    pub fn page_defaults(&self) -> PageDefaults {
        PageDefaults {
            per_page: self.per_page,
            max_per_page: self.max_per_page,
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            delay: Duration::from_millis(self.batch_delay_ms),
            max_batch: self.batch_max_size,
        }
    }
}
