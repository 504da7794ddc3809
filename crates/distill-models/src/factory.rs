//! Service factory for creating service handles from configuration.
//!
//! This module picks a service implementation by kind and resolves the
//! credential it needs, failing before any work starts when one is missing.

use crate::remote::{RemoteServiceClient, DEFAULT_API_KEY_ENV};
use crate::tokenizer::{ByteTokenizer, HfTokenizer};
use crate::MockProvider;
use distill_abstraction::{ServiceError, ServiceProvider, Tokenizer};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Service kind enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Hosted training service over HTTP.
    #[default]
    Remote,
    /// In-process mock for dry runs and tests.
    Mock,
}

impl FromStr for ServiceKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "remote" | "http" => Ok(Self::Remote),
            "mock" => Ok(Self::Mock),
            _ => Err(()),
        }
    }
}

/// Service connection settings.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Which implementation to create.
    pub kind: ServiceKind,
    /// Base URL of the remote service (required for `Remote`).
    pub base_url: Option<String>,
    /// Explicit API key; falls back to `api_key_env` when absent.
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Poll interval for pending requests.
    pub poll_interval: Duration,
    /// Total time allowed for one pending request.
    pub request_timeout: Duration,
    /// Path to a `tokenizer.json` (required for `Remote`).
    pub tokenizer_path: Option<PathBuf>,
}

impl ServiceSettings {
    /// Creates settings of the given kind with defaults for everything else.
    #[must_use]
    pub fn new(kind: ServiceKind) -> Self {
        Self {
            kind,
            base_url: None,
            api_key: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            poll_interval: Duration::from_millis(250),
            request_timeout: Duration::from_secs(600),
            tokenizer_path: None,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = Some(base_url);
        self
    }

    #[must_use]
    pub fn with_api_key(mut self, api_key: String) -> Self {
        self.api_key = Some(api_key);
        self
    }
}

/// Factory for creating service instances.
pub struct ServiceFactory;

impl ServiceFactory {
    /// Creates a service provider from the given settings.
    ///
    /// # Errors
    /// Returns `ServiceError::ConfigError` if a remote service lacks a base URL or API key.
    pub fn create(settings: &ServiceSettings) -> Result<Arc<dyn ServiceProvider>, ServiceError> {
        debug!(kind = ?settings.kind, base_url = ?settings.base_url, "Creating service provider");

        match settings.kind {
            ServiceKind::Mock => Ok(Arc::new(MockProvider::new())),
            ServiceKind::Remote => {
                let base_url = settings.base_url.clone().ok_or_else(|| {
                    error!("Remote service selected without a base_url");
                    ServiceError::ConfigError(
                        "service.base_url is required for the remote service".to_string(),
                    )
                })?;

                let client = match &settings.api_key {
                    Some(key) => RemoteServiceClient::with_api_key(base_url, key.clone()),
                    None => RemoteServiceClient::from_env(base_url, &settings.api_key_env)?,
                };

                Ok(Arc::new(
                    client
                        .with_poll_interval(settings.poll_interval)
                        .with_request_timeout(settings.request_timeout),
                ))
            }
        }
    }

    /// Creates the tokenizer matching the settings.
    ///
    /// A `tokenizer.json` path always wins. Without one, the mock service uses
    /// a byte tokenizer and the remote service is a configuration error.
    pub fn tokenizer(settings: &ServiceSettings) -> Result<Arc<dyn Tokenizer>, ServiceError> {
        match (&settings.tokenizer_path, settings.kind) {
            (Some(path), _) => Ok(Arc::new(HfTokenizer::from_file(path)?)),
            (None, ServiceKind::Mock) => Ok(Arc::new(ByteTokenizer)),
            (None, ServiceKind::Remote) => Err(ServiceError::ConfigError(
                "service.tokenizer_path is required for the remote service".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_kind_from_str() {
        assert_eq!(ServiceKind::from_str("mock"), Ok(ServiceKind::Mock));
        assert_eq!(ServiceKind::from_str("REMOTE"), Ok(ServiceKind::Remote));
        assert!(ServiceKind::from_str("grpc").is_err());
    }

    #[test]
    fn test_remote_requires_base_url() {
        let settings = ServiceSettings::new(ServiceKind::Remote).with_api_key("k".into());
        let err = ServiceFactory::create(&settings).err().unwrap();
        assert!(matches!(err, ServiceError::ConfigError(_)));
    }

    #[test]
    fn test_remote_requires_api_key() {
        let mut settings =
            ServiceSettings::new(ServiceKind::Remote).with_base_url("http://localhost:1".into());
        settings.api_key_env = "DISTILL_TEST_NEVER_SET".to_string();
        let err = ServiceFactory::create(&settings).err().unwrap();
        assert!(matches!(err, ServiceError::ConfigError(_)));
    }

    #[test]
    fn test_mock_needs_no_credentials() {
        let settings = ServiceSettings::new(ServiceKind::Mock);
        assert!(ServiceFactory::create(&settings).is_ok());
        assert!(ServiceFactory::tokenizer(&settings).is_ok());
    }

    #[test]
    fn test_remote_tokenizer_requires_path() {
        let settings = ServiceSettings::new(ServiceKind::Remote);
        assert!(ServiceFactory::tokenizer(&settings).is_err());
    }
}
