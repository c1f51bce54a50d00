use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    /// Public base URL, used to build the webhook URL handed to WaveSpeed
    pub base_url: String,
    pub dev_mode: bool,
    /// Bearer token required on the accounts/tasks API
    pub api_token: String,
    pub creem_webhook_secret: String,
    pub wavespeed_webhook_secret: String,
    pub wavespeed_api_key: String,
    pub wavespeed_api_url: String,
    /// Credits granted when an account is created
    pub signup_credits: i64,
    /// Days to keep webhook event records (0 = keep forever)
    pub webhook_event_retention_days: i64,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let dev_mode = env::var("CREDITGATE_ENV")
            .map(|v| v == "dev" || v == "development")
            .unwrap_or(false);

        let host = env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port: u16 = env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);

        let base_url = env::var("BASE_URL")
            .unwrap_or_else(|_| format!("http://{}:{}", host, port));

        let api_token = env::var("API_TOKEN").unwrap_or_else(|_| {
            if dev_mode {
                tracing::warn!("API_TOKEN not set, using the dev token");
                "dev-token".to_string()
            } else {
                String::new()
            }
        });

        if api_token.is_empty() {
            tracing::warn!("API_TOKEN is empty: the accounts and tasks API will reject every request");
        }

        Self {
            host,
            port,
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "creditgate.db".to_string()),
            base_url,
            dev_mode,
            api_token,
            creem_webhook_secret: env::var("CREEM_WEBHOOK_SECRET").unwrap_or_default(),
            wavespeed_webhook_secret: env::var("WAVESPEED_WEBHOOK_SECRET").unwrap_or_default(),
            wavespeed_api_key: env::var("WAVESPEED_API_KEY").unwrap_or_default(),
            wavespeed_api_url: env::var("WAVESPEED_API_URL")
                .unwrap_or_else(|_| "https://api.wavespeed.ai/api/v3".to_string()),
            signup_credits: parse_i64("SIGNUP_CREDITS", 10),
            webhook_event_retention_days: parse_i64("WEBHOOK_EVENT_RETENTION_DAYS", 30),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_i64(key: &str, default: i64) -> i64 {
    match env::var(key) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid {} value '{}', using {}", key, v, default);
            default
        }),
        Err(_) => default,
    }
}
