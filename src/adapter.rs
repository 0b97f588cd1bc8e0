//! Collector registry adapter
//!
//! The reconciler only knows how to create a collector for a target and how to
//! switch it on and off in the shared metrics registry. Everything behind that
//! (scraping, rendering samples) lives in the adapter implementation.

use crate::target::Target;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid target address \"{address}\": {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("failed to build metric descriptors: {0}")]
    Descriptor(#[source] prometheus::Error),
    #[error("failed to register collector: {0}")]
    Registration(#[source] prometheus::Error),
}

/// Capability to instantiate collectors and (de)register them
pub trait RegistryAdapter: Send + Sync {
    /// Live collector owned by one active entry
    type Handle: Send;

    /// Create a collector for `target` without activating it
    fn instantiate(&self, target: &Target) -> Result<Self::Handle, AdapterError>;

    /// Make the collector visible to scrapes
    fn register(&self, handle: &Self::Handle) -> Result<(), AdapterError>;

    /// Remove the collector from the registry. Failures are logged, not returned.
    fn deregister(&self, handle: &Self::Handle);
}

/// Check that `address` looks like `host:port` with a numeric port
pub fn validate_address(address: &str) -> Result<(), AdapterError> {
    let invalid = |reason: &str| AdapterError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    port.parse::<u16>().map_err(|_| invalid("port is not a number"))?;

    Ok(())
}
