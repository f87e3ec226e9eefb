use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub jwt_secret: String,
    pub keepalive_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("TANDEM_LOBBY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            jwt_secret: env::var("TANDEM_JWT_SECRET")
                .unwrap_or_else(|_| "tandem-dev-secret".to_string()),
            keepalive_seconds: env::var("TANDEM_KEEPALIVE_SECONDS")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(30),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            jwt_secret: "tandem-dev-secret".to_string(),
            keepalive_seconds: 30,
        }
    }
}
