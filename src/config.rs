//! Runtime configuration, read from the environment (and a `.env` file if
//! there is one).
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 2525;
pub const DEFAULT_HOSTNAME: &str = "localhost";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// `SMTP_ADDRESS`, all interfaces by default
    pub address: IpAddr,
    /// `SMTP_PORT`
    pub port: u16,
    /// `SMTP_PROCESSES`: 1 runs in this process, 0 or less forks one worker
    /// per processor, more forks exactly that many
    pub processes: i64,
    /// `SMTP_HOSTNAME`, announced to clients
    pub hostname: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            processes: 1,
            hostname: DEFAULT_HOSTNAME.to_owned(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Config> {
        // A missing .env file is fine
        let _ = dotenv::dotenv();
        Config::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key/value source; unset keys keep their
    /// defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        Ok(Config {
            address: parse_var(&lookup, "SMTP_ADDRESS")?
                .unwrap_or(defaults.address),
            port: parse_var(&lookup, "SMTP_PORT")?.unwrap_or(defaults.port),
            processes: parse_var(&lookup, "SMTP_PROCESSES")?
                .unwrap_or(defaults.processes),
            hostname: lookup("SMTP_HOSTNAME")
                .filter(|h| !h.trim().is_empty())
                .unwrap_or(defaults.hostname),
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}={:?}: {}", key, raw, e))),
    }
}
