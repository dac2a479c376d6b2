use std::{fmt::Display, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, anyhow, bail};

/// Limits every room is created and checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomPolicy {
    /// Lifetime of a room in seconds, counted from creation.
    pub room_ttl: u64,
    pub max_participants: usize,
    pub sender_max_len: usize,
    pub text_max_len: usize,
    /// Newest messages kept per room; `None` keeps everything until the room expires.
    pub history_cap: Option<usize>,
}

impl Default for RoomPolicy {
    fn default() -> Self {
        Self {
            room_ttl: 600,
            max_participants: 3,
            sender_max_len: 100,
            text_max_len: 100,
            history_cap: Some(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Sqlite(String),
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(StoreBackend::Memory),
            url if url.starts_with("sqlite:") => Ok(StoreBackend::Sqlite(url.to_owned())),
            other => Err(anyhow!("unsupported store {other:?}, expected \"memory\" or a sqlite: url")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub policy: RoomPolicy,
    pub store: StoreBackend,
    pub sweep_interval: Duration,
    pub cookie_secure: bool,
    /// Events buffered per room for slow subscribers.
    pub event_buffer: usize,
}

fn var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|err| anyhow!("{err}"))
            .with_context(|| format!("invalid {key}={raw:?}")),
        None => Ok(default),
    }
}

impl Config {
    /// Reads the process environment, loading `.env` first if there is one.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = RoomPolicy::default();

        let history_cap: usize = var(&lookup, "HISTORY_CAP", defaults.history_cap.unwrap_or(0))?;
        let policy = RoomPolicy {
            room_ttl: var(&lookup, "ROOM_TTL", defaults.room_ttl)?,
            max_participants: var(&lookup, "MAX_PARTICIPANTS", defaults.max_participants)?,
            sender_max_len: var(&lookup, "SENDER_MAX_LEN", defaults.sender_max_len)?,
            text_max_len: var(&lookup, "TEXT_MAX_LEN", defaults.text_max_len)?,
            history_cap: (history_cap > 0).then_some(history_cap),
        };

        if policy.room_ttl == 0 {
            bail!("ROOM_TTL must be at least one second");
        }
        if policy.max_participants == 0 {
            bail!("MAX_PARTICIPANTS must be at least 1");
        }

        Ok(Config {
            bind_addr: var(&lookup, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            policy,
            store: var(&lookup, "STORE_URL", StoreBackend::Memory)?,
            sweep_interval: Duration::from_secs(var(&lookup, "SWEEP_INTERVAL", 30u64)?.max(1)),
            cookie_secure: var(&lookup, "COOKIE_SECURE", false)?,
            event_buffer: var(&lookup, "EVENT_BUFFER", 64usize)?,
        })
    }
}
