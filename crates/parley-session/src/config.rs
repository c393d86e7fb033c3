//! Session configuration loaded from environment variables, plus the account
//! record the session is created for.
//!
//! Every knob has a default, so `SessionConfig::default()` is a working
//! configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use parley_shared::constants::{
    APP_NAME, DEFAULT_BYTESTREAM_CHUNK_SIZE, DEFAULT_BYTESTREAM_CONNECT_TIMEOUT_SECS,
    DEFAULT_EVENT_BUFFER, DEFAULT_IBB_ACK_TIMEOUT_SECS, DEFAULT_IBB_BLOCK_SIZE,
    DEFAULT_IBB_SEND_INTERVAL_MS, DEFAULT_IQ_TIMEOUT_SECS, DEFAULT_TIMEOUT_CHECK_MS,
};
use parley_shared::Jid;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lifetime of an outstanding IQ request.
    /// Env: `PARLEY_IQ_TIMEOUT_SECS`
    pub iq_timeout: Duration,

    /// How often the request timeout table is scanned.
    /// Env: `PARLEY_TIMEOUT_CHECK_MS`
    pub timeout_check_interval: Duration,

    /// Buffered events per subscriber before new events are dropped.
    /// Env: `PARLEY_EVENT_BUFFER`
    pub event_buffer: usize,

    /// Initial in-band-bytes block size.
    /// Env: `PARLEY_IBB_BLOCK_SIZE`
    pub ibb_block_size: usize,

    /// Delay between two in-band-bytes bursts.
    /// Env: `PARLEY_IBB_SEND_INTERVAL_MS`
    pub ibb_send_interval: Duration,

    /// Ceiling on waiting for a single in-band-bytes acknowledgement.
    /// Env: `PARLEY_IBB_ACK_TIMEOUT_SECS`
    pub ibb_ack_timeout: Duration,

    /// Per-streamhost SOCKS5 connect timeout.
    /// Env: `PARLEY_BYTESTREAM_CONNECT_TIMEOUT_SECS`
    pub bytestream_connect_timeout: Duration,

    /// Buffer size used on an established byte-stream connection.
    /// Env: `PARLEY_BYTESTREAM_CHUNK_SIZE`
    pub bytestream_chunk_size: usize,

    /// SOCKS5 proxies offered when sending with the byte-stream method.
    /// The method is only offered when this is non-empty.
    /// Env: `PARLEY_FILE_TRANSFER_PROXIES` (comma separated addresses)
    pub file_transfer_proxies: Vec<Jid>,

    /// Answered to software version queries.
    /// Env: `PARLEY_CLIENT_NAME`, `PARLEY_CLIENT_VERSION`, `PARLEY_CLIENT_OS`
    pub client_name: String,
    /// Version string of the software version answer.
    pub client_version: String,
    /// Operating system of the software version answer.
    pub client_os: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            iq_timeout: Duration::from_secs(DEFAULT_IQ_TIMEOUT_SECS),
            timeout_check_interval: Duration::from_millis(DEFAULT_TIMEOUT_CHECK_MS),
            event_buffer: DEFAULT_EVENT_BUFFER,
            ibb_block_size: DEFAULT_IBB_BLOCK_SIZE,
            ibb_send_interval: Duration::from_millis(DEFAULT_IBB_SEND_INTERVAL_MS),
            ibb_ack_timeout: Duration::from_secs(DEFAULT_IBB_ACK_TIMEOUT_SECS),
            bytestream_connect_timeout: Duration::from_secs(DEFAULT_BYTESTREAM_CONNECT_TIMEOUT_SECS),
            bytestream_chunk_size: DEFAULT_BYTESTREAM_CHUNK_SIZE,
            file_transfer_proxies: Vec::new(),
            client_name: APP_NAME.to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            client_os: std::env::consts::OS.to_string(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(secs) = env_number::<u64>("PARLEY_IQ_TIMEOUT_SECS") {
            config.iq_timeout = Duration::from_secs(secs);
        }

        if let Some(ms) = env_number::<u64>("PARLEY_TIMEOUT_CHECK_MS") {
            if ms > 0 {
                config.timeout_check_interval = Duration::from_millis(ms);
            }
        }

        if let Some(n) = env_number::<usize>("PARLEY_EVENT_BUFFER") {
            if n > 0 {
                config.event_buffer = n;
            }
        }

        if let Some(n) = env_number::<usize>("PARLEY_IBB_BLOCK_SIZE") {
            if n > 0 {
                config.ibb_block_size = n;
            }
        }

        if let Some(ms) = env_number::<u64>("PARLEY_IBB_SEND_INTERVAL_MS") {
            config.ibb_send_interval = Duration::from_millis(ms);
        }

        if let Some(secs) = env_number::<u64>("PARLEY_IBB_ACK_TIMEOUT_SECS") {
            config.ibb_ack_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = env_number::<u64>("PARLEY_BYTESTREAM_CONNECT_TIMEOUT_SECS") {
            config.bytestream_connect_timeout = Duration::from_secs(secs);
        }

        if let Some(n) = env_number::<usize>("PARLEY_BYTESTREAM_CHUNK_SIZE") {
            if n > 0 {
                config.bytestream_chunk_size = n;
            }
        }

        if let Ok(val) = std::env::var("PARLEY_FILE_TRANSFER_PROXIES") {
            config.file_transfer_proxies = parse_proxies(&val);
        }

        if let Ok(name) = std::env::var("PARLEY_CLIENT_NAME") {
            config.client_name = name;
        }
        if let Ok(version) = std::env::var("PARLEY_CLIENT_VERSION") {
            config.client_version = version;
        }
        if let Ok(os) = std::env::var("PARLEY_CLIENT_OS") {
            config.client_os = os;
        }

        config
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let val = std::env::var(key).ok()?;
    match val.trim().parse::<T>() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %val, "Invalid number, using default");
            None
        }
    }
}

fn parse_proxies(val: &str) -> Vec<Jid> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| match Jid::parse(s) {
            Ok(jid) => Some(jid),
            Err(e) => {
                tracing::warn!(value = s, error = %e, "Ignoring invalid file transfer proxy");
                None
            }
        })
        .collect()
}

/// The persisted account record. Where and how it is stored is up to the
/// caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Account {
    /// Bare address of the account.
    pub account: String,
    #[serde(default)]
    pub instance_tag: u32,
    /// Opaque settings owned by other layers.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Account {
    pub fn new(account: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            ..Default::default()
        }
    }
}
