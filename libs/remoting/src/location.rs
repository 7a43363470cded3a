//! Location service client interface and a configuration-backed implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

use crate::endpoint::{parse_endpoint_list, EndpointDescriptor};
use crate::reference::{Identity, Reference};
use crate::{RemotingError, Result};
use remoting_config::LocatorSettings;

/// Failures reported by a location service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocatorError {
    /// The key is unknown; permanent
    #[error("not registered")]
    NotRegistered,

    /// The service could not answer; the caller may retry
    #[error("location service unreachable: {message}")]
    Unreachable { message: String },
}

impl LocatorError {
    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::Unreachable {
            message: message.into(),
        }
    }
}

/// Naming service that maps adapter ids and well-known identities to locations
#[async_trait]
pub trait LocationService: Send + Sync + 'static {
    async fn find_adapter_endpoints(
        &self,
        adapter_id: &str,
    ) -> std::result::Result<Vec<EndpointDescriptor>, LocatorError>;

    /// Returns a direct or adapter-indirect reference for the object
    async fn find_object_by_id(&self, identity: &Identity) -> std::result::Result<Reference, LocatorError>;
}

/// In-memory location service, typically built from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticLocator {
    adapters: HashMap<String, Vec<EndpointDescriptor>>,
    objects: HashMap<Identity, Reference>,
}

impl StaticLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adapter(mut self, adapter_id: impl Into<String>, endpoints: Vec<EndpointDescriptor>) -> Self {
        self.adapters.insert(adapter_id.into(), endpoints);
        self
    }

    pub fn with_object(mut self, identity: Identity, reference: Reference) -> Self {
        self.objects.insert(identity, reference);
        self
    }

    /// Build the tables from stringified endpoints and proxies
    pub fn from_settings(settings: &LocatorSettings) -> Result<Self> {
        let mut locator = Self::new();

        for (adapter_id, endpoints) in &settings.adapters {
            let mut parsed = Vec::with_capacity(endpoints.len());
            for endpoint in endpoints {
                parsed.extend(parse_endpoint_list(endpoint).map_err(|e| {
                    RemotingError::configuration(
                        format!("adapter '{}': {}", adapter_id, e),
                        Some("locator.adapters"),
                    )
                })?);
            }
            locator.adapters.insert(adapter_id.clone(), parsed);
        }

        for (identity, proxy) in &settings.objects {
            let identity: Identity = identity.parse()?;
            let reference: Reference = proxy.parse().map_err(|e| {
                RemotingError::configuration(
                    format!("object '{}': {}", identity, e),
                    Some("locator.objects"),
                )
            })?;
            locator.objects.insert(identity, reference);
        }

        debug!(
            adapters = locator.adapters.len(),
            objects = locator.objects.len(),
            "Static locator tables built"
        );
        Ok(locator)
    }
}

#[async_trait]
impl LocationService for StaticLocator {
    async fn find_adapter_endpoints(
        &self,
        adapter_id: &str,
    ) -> std::result::Result<Vec<EndpointDescriptor>, LocatorError> {
        self.adapters
            .get(adapter_id)
            .cloned()
            .ok_or(LocatorError::NotRegistered)
    }

    async fn find_object_by_id(&self, identity: &Identity) -> std::result::Result<Reference, LocatorError> {
        self.objects.get(identity).cloned().ok_or(LocatorError::NotRegistered)
    }
}
