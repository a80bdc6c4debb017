// API server implementation using actix-web

use crate::api::handlers::StartedAt;
use crate::api::{middleware, routes};
use crate::util::db::Db;
use crate::util::env::{env_opt, env_parse};
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use std::time::Instant;

/// Env: API_HOST (0.0.0.0), API_PORT (8000), ALLOWED_ORIGINS (comma list, `*` for any)
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

impl ApiSettings {
    pub fn from_env() -> Result<Self> {
        crate::util::env::init_env();

        let port = match env_opt("API_PORT") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid API_PORT {raw:?}"))?,
            None => 8000,
        };
        let origins = env_opt("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000,http://localhost:8000".to_string());

        Ok(Self {
            host: env_opt("API_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            allowed_origins: split_origins(&origins),
        })
    }
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

pub struct ApiServer {
    settings: ApiSettings,
    workers: usize,
}

impl ApiServer {
    pub fn new(settings: ApiSettings) -> Self {
        Self {
            settings,
            workers: env_parse("API_WORKERS", 0usize),
        }
    }

    /// Create server from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(ApiSettings::from_env()?))
    }

    /// Start the HTTP server
    pub async fn run(self, db: Db) -> Result<()> {
        let bind_addr = format!("{}:{}", self.settings.host, self.settings.port);

        tracing::info!(
            host = %self.settings.host,
            port = %self.settings.port,
            origins = ?self.settings.allowed_origins,
            "Starting steam-catalog API server"
        );

        let db_data = web::Data::new(db);
        let started = web::Data::new(StartedAt(Instant::now()));
        let allowed_origins = self.settings.allowed_origins.clone();

        let mut server = HttpServer::new(move || {
            let (logger, compress) = middleware::setup_middleware();
            let cors = middleware::setup_cors(&allowed_origins);

            App::new()
                .app_data(db_data.clone())
                .app_data(started.clone())
                .wrap(logger)
                .wrap(compress)
                .wrap(cors)
                .configure(routes::configure_routes)
        });
        if self.workers > 0 {
            server = server.workers(self.workers);
        }

        server
            .bind(&bind_addr)
            .with_context(|| format!("Failed to bind to {}", bind_addr))?
            .run()
            .await
            .context("HTTP server error")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origins_are_trimmed_and_blank_entries_dropped() {
        assert_eq!(
            split_origins(" http://a.test, ,http://b.test "),
            vec!["http://a.test", "http://b.test"]
        );
    }
}
