use secrecy::Secret;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    pub host: String,
    pub port: u16,

    // Root secret the credential encryption key is derived from
    pub root_secret: Secret<String>,

    // POS provider OAuth (refresh-token grant)
    pub provider_name: String,
    pub provider_client_id: String,
    pub provider_client_secret: Secret<String>,
    pub provider_auth_url: String,
    pub provider_token_url: String,

    // Governance defaults
    pub refresh_margin_secs: i64,
    pub retention_default_days: i32,
    pub retention_schedule: String, // cron, with seconds field
}

impl Config {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        // Load .env file if it exists (for local development)
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .set_default("host", "127.0.0.1")?
            .set_default("provider_name", "square")?
            .set_default("refresh_margin_secs", 300)?
            .set_default("retention_default_days", 365)?
            .set_default("retention_schedule", "0 0 3 * * *")?
            .add_source(config::Environment::default().separator("__"))
            .build()?;

        let parsed = Self {
            database_url: config.get("database_url")?,
            host: config.get("host")?,
            port: config.get("port")?,

            root_secret: Secret::new(config.get("root_secret")?),

            provider_name: config.get("provider_name")?,
            provider_client_id: config.get("provider_client_id")?,
            provider_client_secret: Secret::new(config.get("provider_client_secret")?),
            provider_auth_url: config.get("provider_auth_url")?,
            provider_token_url: config.get("provider_token_url")?,

            refresh_margin_secs: config.get("refresh_margin_secs")?,
            retention_default_days: config.get("retention_default_days")?,
            retention_schedule: config.get("retention_schedule")?,
        };
        parsed.validate()?;

        Ok(parsed)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.refresh_margin_secs < 0 {
            return Err(config::ConfigError::Message(
                "refresh_margin_secs must not be negative".to_string(),
            ));
        }
        if self.retention_default_days <= 0 {
            return Err(config::ConfigError::Message(
                "retention_default_days must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_margin_secs)
    }
}
