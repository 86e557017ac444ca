// Environment-driven configuration. All knobs come from process env so the
// server can run unchanged in containers.
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub storage: StorageConfig,
    pub seed_gateway_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CorsConfig {
    pub allow_origins: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/chathub.db".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = ServerConfig::default();
        let host = env_string("HOST").unwrap_or(defaults.host);
        let port = env_string("PORT")
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(defaults.port);
        let db_path = env_string("DATABASE_PATH").unwrap_or(StorageConfig::default().db_path);
        let allow_origins = env_string("CORS_ORIGINS").map(|raw| {
            raw.split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect::<Vec<_>>()
        });
        Self {
            server: ServerConfig { host, port },
            cors: CorsConfig { allow_origins },
            storage: StorageConfig { db_path },
            seed_gateway_url: env_string("DEFAULT_GATEWAY_URL"),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_address_joins_host_and_port() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 9000,
            },
            cors: CorsConfig::default(),
            storage: StorageConfig::default(),
            seed_gateway_url: None,
        };
        assert_eq!(config.bind_address(), "127.0.0.1:9000");
    }
}
