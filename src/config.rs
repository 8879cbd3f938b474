use std::{collections::HashSet, fmt::Display, str::FromStr};

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    /// Users allowed to drive every game's lifecycle.
    pub operators: HashSet<String>,
    pub session_idle_minutes: i64,
    /// Enables `POST /session`, which signs in as any user id.
    pub dev_login: bool,
    /// Outbound frames queued per chat session before it counts as slow.
    pub chat_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://influence.db".to_owned(),
            bind_addr: "0.0.0.0:8080".to_owned(),
            operators: HashSet::new(),
            session_idle_minutes: 5,
            dev_login: false,
            chat_buffer: 64,
        }
    }
}

fn parsed<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match dotenv::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow::anyhow!("{err}"))
            .with_context(|| format!("invalid {key}={raw:?}")),
        Err(_) => Ok(default),
    }
}

fn flag(key: &str) -> bool {
    dotenv::var(key)
        .map(|raw| matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

impl Config {
    /// Reads the process environment, with `.env` as a fallback.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let operators = dotenv::var("OPERATORS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|user| !user.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            database_url: dotenv::var("DATABASE_URL").unwrap_or(defaults.database_url),
            bind_addr: dotenv::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            operators,
            session_idle_minutes: parsed("SESSION_IDLE_MINUTES", defaults.session_idle_minutes)?,
            dev_login: flag("DEV_LOGIN"),
            chat_buffer: parsed("CHAT_BUFFER", defaults.chat_buffer)?,
        })
    }
}
