#![warn(clippy::dbg_macro, clippy::todo)]

mod config;
mod eligibility;
mod patch;
mod pod;
mod review;
mod webhook;

use std::sync::Arc;

use log::{error, info};

use config::Config;
use eligibility::Evaluator;
use patch::{PatchDocument, ProxyBlueprint};
use webhook::{Injector, TlsMaterial};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    ConfigError(String),
    #[error("Invalid TLS material: {0}")]
    TlsError(String),
    #[error("Invalid proxy blueprint: {0}")]
    BlueprintError(String),
    #[error("Failed to serialize patch: {0}")]
    PatchError(#[from] serde_json::Error),
    #[error("Invalid admission request: {0}")]
    InvalidRequest(String),
    #[error("Failed to start listener: {0}")]
    ListenError(String),
}

#[tokio::main]
async fn main() {
    env_logger::Builder::new()
        .parse_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    let config = match Config::from_env() {
        Ok(x) => x,
        Err(e) => {
            error!("failed to load configuration: {e:?}");
            std::process::exit(1);
        }
    };

    let patch = match PatchDocument::build(&ProxyBlueprint::default()) {
        Ok(x) => x,
        Err(e) => {
            error!("failed to build proxy patch: {e:?}");
            std::process::exit(1);
        }
    };
    info!(
        "proxy patch {} ready, missing-field policy {:?}",
        patch.version(),
        config.missing_fields
    );

    let tls = match TlsMaterial::load(&config.tls_cert, &config.tls_key).await {
        Ok(x) => x,
        Err(e) => {
            error!("failed to load webhook TLS cert: {e:?}");
            std::process::exit(1);
        }
    };

    let injector = Arc::new(Injector::new(
        Evaluator::new(config.missing_fields),
        patch,
    ));
    if let Err(e) = webhook::run_webhook(&config, tls, injector).await {
        error!("webhook failed to run: {e:?}");
        std::process::exit(1);
    }
}
