use std::env;

/// Worker-process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres
    pub database_url: String,

    // Vision service
    pub vision_api_url: String,
    pub vision_api_key: String,

    // Workers
    pub worker_count: usize,
    /// Seconds between reclaim sweeps for expired verification claims.
    pub reclaim_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            vision_api_url: required_env("VISION_API_URL"),
            vision_api_key: required_env("VISION_API_KEY"),
            worker_count: env::var("VERIFY_WORKERS")
                .unwrap_or_else(|_| "4".to_string())
                .parse()
                .expect("VERIFY_WORKERS must be a number"),
            reclaim_interval_secs: env::var("RECLAIM_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .expect("RECLAIM_INTERVAL_SECS must be a number"),
        }
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}
