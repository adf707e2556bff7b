use std::net::SocketAddr;

use anyhow::Context;

use crate::porthole::net;

pub const DEFAULT_LOCAL_PORT: u16 = 3000;
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:0";

const ENV_BIND: &str = "PORTHOLE_BIND";
const ENV_LOG_LEVEL: &str = "PORTHOLE_LOG_LEVEL";
const ENV_LOG_FORMAT: &str = "PORTHOLE_LOG_FORMAT";
const ENV_LOG_OUTPUT: &str = "PORTHOLE_LOG_OUTPUT";
const ENV_LOG_SOURCE: &str = "PORTHOLE_LOG_SOURCE";

#[derive(Debug, Clone)]
pub struct Config {
    pub local_port: u16,
    pub bind_addr: SocketAddr,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

/// Builds the runtime config from the positional port argument and `PORTHOLE_*` env vars.
pub fn load(local_port_arg: Option<&str>) -> anyhow::Result<Config> {
    load_from(local_port_arg, |key| std::env::var(key).ok())
}

fn load_from(
    local_port_arg: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Config> {
    let local_port = parse_local_port(local_port_arg);

    let bind_raw = lookup(ENV_BIND)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
    let bind_addr: SocketAddr = net::normalize_bind_addr(&bind_raw)
        .parse()
        .with_context(|| format!("config: invalid {ENV_BIND}: {bind_raw}"))?;

    let mut logging = LoggingConfig::default();
    if let Some(v) = lookup(ENV_LOG_LEVEL) {
        logging.level = v;
    }
    if let Some(v) = lookup(ENV_LOG_FORMAT) {
        let v = v.trim().to_ascii_lowercase();
        match v.as_str() {
            "text" | "json" => logging.format = v,
            other => {
                anyhow::bail!("config: {ENV_LOG_FORMAT} must be text or json (got {other:?})")
            }
        }
    }
    if let Some(v) = lookup(ENV_LOG_OUTPUT) {
        if !v.trim().is_empty() {
            logging.output = v;
        }
    }
    if let Some(v) = lookup(ENV_LOG_SOURCE) {
        logging.add_source = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
    }

    Ok(Config {
        local_port,
        bind_addr,
        logging,
    })
}

/// Parses the local port argument. Anything missing or unusable silently yields the default.
pub fn parse_local_port(arg: Option<&str>) -> u16 {
    arg.and_then(|s| s.trim().parse::<u16>().ok())
        .filter(|p| *p != 0)
        .unwrap_or(DEFAULT_LOCAL_PORT)
}
