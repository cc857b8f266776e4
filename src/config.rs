use std::{net::SocketAddr, path::PathBuf, str::FromStr};

use crate::{eligibility::MissingFieldPolicy, Error};

pub const DEFAULT_BIND: &str = "0.0.0.0:9443";
pub const DEFAULT_TLS_CERT: &str = "/etc/webhook/certs/tls.crt";
pub const DEFAULT_TLS_KEY: &str = "/etc/webhook/certs/tls.key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: SocketAddr,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,
    pub missing_fields: MissingFieldPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source. Unset and empty
    /// values both fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let var = |key: &str, default: &str| {
            lookup(key)
                .filter(|x| !x.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let bind = var("ADMISSION_BIND", DEFAULT_BIND);
        let bind: SocketAddr = bind
            .parse()
            .map_err(|e| Error::ConfigError(format!("invalid ADMISSION_BIND ({bind}): {e}")))?;
        // the API server is pointed at this port out-of-band
        if bind.port() == 0 {
            return Err(Error::ConfigError(format!(
                "ADMISSION_BIND ({bind}) must name a fixed port"
            )));
        }

        let missing_fields = var("INJECTOR_MISSING_FIELDS", "allow");
        let missing_fields = MissingFieldPolicy::from_str(&missing_fields)?;

        Ok(Config {
            bind,
            tls_cert: var("ADMISSION_TLS_CERT", DEFAULT_TLS_CERT).into(),
            tls_key: var("ADMISSION_TLS_KEY", DEFAULT_TLS_KEY).into(),
            missing_fields,
        })
    }
}
