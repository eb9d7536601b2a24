use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    http_bind: SocketAddr,
    database_dsn: String,
    db_max_connections: u32,
    db_min_connections: u32,
    db_acquire_timeout: Duration,
    db_idle_timeout: Duration,
    db_max_lifetime: Duration,
    db_run_migrations: bool,
    broker_base_url: String,
    broker_token: String,
    broker_provider_id: String,
    broker_page_size: u32,
    broker_max_pages: u32,
    broker_connect_timeout: Duration,
    broker_total_timeout: Duration,
    voximplant_base_url: String,
    voximplant_token: String,
    voximplant_domain: String,
    voximplant_template_id: String,
    voximplant_channel_id: String,
    voximplant_connect_timeout: Duration,
    voximplant_total_timeout: Duration,
    notification_window: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// 環境変数から Feedback Worker の設定値を読み込み、検証する。
    ///
    /// # Errors
    /// 必須の環境変数が未設定、もしくは数値／アドレスのパースに失敗した場合は [`ConfigError`] を返す。
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_dsn = env_var("DATABASE_URI")?;
        let http_bind = parse_socket_addr("SERVER_ADDRESS", "0.0.0.0:8080")?;

        // Database connection pool settings
        let db_max_connections = parse_u32("DB_MAX_CONNECTIONS", 10)?;
        let db_min_connections = parse_u32("DB_MIN_CONNECTIONS", 1)?;
        let db_acquire_timeout = parse_duration_secs("DB_ACQUIRE_TIMEOUT_SECS", 30)?;
        let db_idle_timeout = parse_duration_secs("DB_IDLE_TIMEOUT_SECS", 600)?;
        let db_max_lifetime = parse_duration_secs("DB_MAX_LIFETIME_SECS", 1800)?;
        let db_run_migrations = parse_bool("DB_RUN_MIGRATIONS", true)?;

        // mb-broker
        let broker_base_url = env_var("MB_BROKER_BASE_URL")?;
        let broker_token = env_var("MB_BROKER_TOKEN")?;
        let broker_provider_id =
            env::var("MB_BROKER_PROVIDER_ID").unwrap_or_else(|_| "kaspi".to_string());
        let broker_page_size = parse_positive_u32("MB_BROKER_PAGE_SIZE", 100)?;
        let broker_max_pages = parse_positive_u32("MB_BROKER_MAX_PAGES", 50)?;
        let broker_connect_timeout = parse_duration_ms("MB_BROKER_CONNECT_TIMEOUT_MS", 3000)?;
        let broker_total_timeout = parse_duration_ms("MB_BROKER_TOTAL_TIMEOUT_MS", 30000)?;

        // Voximplant bot service
        let voximplant_base_url = env_var("VOXIMPLANT_BASE_URL")?;
        let voximplant_token = env_var("VOXIMPLANT_TOKEN")?;
        let voximplant_domain = env_var("VOXIMPLANT_DOMAIN")?;
        let voximplant_template_id = env_var("VOXIMPLANT_TEMPLATE_ID")?;
        let voximplant_channel_id = env_var("VOXIMPLANT_CHANNEL_ID")?;
        let voximplant_connect_timeout =
            parse_duration_ms("VOXIMPLANT_CONNECT_TIMEOUT_MS", 3000)?;
        let voximplant_total_timeout = parse_duration_ms("VOXIMPLANT_TOTAL_TIMEOUT_MS", 15000)?;

        let notification_window = parse_duration_secs("NOTIFICATION_WINDOW_SECS", 3600)?;

        Ok(Self {
            http_bind,
            database_dsn,
            db_max_connections,
            db_min_connections,
            db_acquire_timeout,
            db_idle_timeout,
            db_max_lifetime,
            db_run_migrations,
            broker_base_url,
            broker_token,
            broker_provider_id,
            broker_page_size,
            broker_max_pages,
            broker_connect_timeout,
            broker_total_timeout,
            voximplant_base_url,
            voximplant_token,
            voximplant_domain,
            voximplant_template_id,
            voximplant_channel_id,
            voximplant_connect_timeout,
            voximplant_total_timeout,
            notification_window,
        })
    }

    #[must_use]
    pub fn http_bind(&self) -> SocketAddr {
        self.http_bind
    }

    #[must_use]
    pub fn database_dsn(&self) -> &str {
        &self.database_dsn
    }

    #[must_use]
    pub fn db_max_connections(&self) -> u32 {
        self.db_max_connections
    }

    #[must_use]
    pub fn db_min_connections(&self) -> u32 {
        self.db_min_connections
    }

    #[must_use]
    pub fn db_acquire_timeout(&self) -> Duration {
        self.db_acquire_timeout
    }

    #[must_use]
    pub fn db_idle_timeout(&self) -> Duration {
        self.db_idle_timeout
    }

    #[must_use]
    pub fn db_max_lifetime(&self) -> Duration {
        self.db_max_lifetime
    }

    #[must_use]
    pub fn db_run_migrations(&self) -> bool {
        self.db_run_migrations
    }

    #[must_use]
    pub fn broker_base_url(&self) -> &str {
        &self.broker_base_url
    }

    #[must_use]
    pub fn broker_token(&self) -> &str {
        &self.broker_token
    }

    #[must_use]
    pub fn broker_provider_id(&self) -> &str {
        &self.broker_provider_id
    }

    #[must_use]
    pub fn broker_page_size(&self) -> u32 {
        self.broker_page_size
    }

    #[must_use]
    pub fn broker_max_pages(&self) -> u32 {
        self.broker_max_pages
    }

    #[must_use]
    pub fn broker_connect_timeout(&self) -> Duration {
        self.broker_connect_timeout
    }

    #[must_use]
    pub fn broker_total_timeout(&self) -> Duration {
        self.broker_total_timeout
    }

    #[must_use]
    pub fn voximplant_base_url(&self) -> &str {
        &self.voximplant_base_url
    }

    #[must_use]
    pub fn voximplant_token(&self) -> &str {
        &self.voximplant_token
    }

    #[must_use]
    pub fn voximplant_domain(&self) -> &str {
        &self.voximplant_domain
    }

    #[must_use]
    pub fn voximplant_template_id(&self) -> &str {
        &self.voximplant_template_id
    }

    #[must_use]
    pub fn voximplant_channel_id(&self) -> &str {
        &self.voximplant_channel_id
    }

    #[must_use]
    pub fn voximplant_connect_timeout(&self) -> Duration {
        self.voximplant_connect_timeout
    }

    #[must_use]
    pub fn voximplant_total_timeout(&self) -> Duration {
        self.voximplant_total_timeout
    }

    #[must_use]
    pub fn notification_window(&self) -> Duration {
        self.notification_window
    }
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_socket_addr(name: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());

    raw.parse().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_duration_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_secs)?;
    Ok(Duration::from_secs(value))
}

fn parse_duration_ms(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_ms)?;
    Ok(Duration::from_millis(value))
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u32>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_positive_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    let parsed = parse_u32(name, default)?;
    if parsed == 0 {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("must be greater than zero"),
        });
    }
    Ok(parsed)
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    match raw.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("invalid boolean value: {raw}"),
        }),
    }
}
