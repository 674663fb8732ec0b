/// All process-level configuration loaded from environment variables at
/// startup. Per-user runtime options live in the `app_configs` collection.
/// Missing required variables cause an immediate panic with a clear message.
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,

    // Dashboard / WebSocket API
    pub dashboard_token: String,
    pub dashboard_port: u16,

    // Telegram listener; `None` disables inbound signal ingestion and alerts
    pub telegram_token: Option<String>,

    // Simulated accounts start with this quote balance when no explicit
    // bootstrap value is configured for the user
    pub default_virtual_balance: f64,
}

impl Config {
    /// Load all configuration from environment variables.
    /// Loads `.env` if present. Panics on any missing required variable.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv(); // ignore error if .env not present

        Config {
            database_url: required_env("DATABASE_URL"),
            dashboard_token: required_env("DASHBOARD_TOKEN"),
            dashboard_port: optional_env("DASHBOARD_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(8080),
            telegram_token: optional_env("TELEGRAM_TOKEN"),
            default_virtual_balance: optional_env("DEFAULT_VIRTUAL_BALANCE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000.0),
        }
    }
}

fn required_env(key: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| {
        panic!("Required environment variable '{key}' is not set. Check your .env file.")
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}
