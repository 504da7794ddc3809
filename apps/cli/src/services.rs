//! Builds service handles from the `[service]` config table.

use anyhow::{Context, Result, anyhow};
use distill_abstraction::{ServiceProvider, Tokenizer};
use distill_models::{ServiceFactory, ServiceKind, ServiceSettings};
use distill_training::DistillConfig;
use std::str::FromStr;
use std::sync::Arc;

pub struct Services {
    pub provider: Arc<dyn ServiceProvider>,
    pub tokenizer: Arc<dyn Tokenizer>,
}

fn settings(config: &DistillConfig) -> Result<ServiceSettings> {
    let service = &config.service;
    let kind = ServiceKind::from_str(&service.kind)
        .map_err(|()| {
            anyhow!("unknown service.kind '{}' (expected remote or mock)", service.kind)
        })?;

    Ok(ServiceSettings {
        kind,
        base_url: service.base_url.clone(),
        api_key: None,
        api_key_env: service.api_key_env.clone(),
        poll_interval: service.poll_interval(),
        request_timeout: service.request_timeout(),
        tokenizer_path: service.tokenizer_path.clone(),
    })
}

/// Fails before any work starts when the service is misconfigured or the key is missing.
pub fn connect(config: &DistillConfig) -> Result<Services> {
    config.validate_service()?;
    let settings = settings(config)?;
    let provider =
        ServiceFactory::create(&settings).context("Failed to create training service client")?;
    let tokenizer = ServiceFactory::tokenizer(&settings).context("Failed to load tokenizer")?;
    Ok(Services { provider, tokenizer })
}
