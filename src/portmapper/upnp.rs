//! UPnP internet gateway discovery.

use std::time::Duration;

use igd::aio as aigd;
use tracing::debug;

pub(crate) use aigd::Gateway;

/// Searches for a UPnP internet gateway device (a router) via SSDP.
///
/// Returns the gateway if one answered within `timeout`.
pub(crate) async fn probe_available(timeout: Duration) -> Option<Gateway> {
    match aigd::search_gateway(igd::SearchOptions {
        timeout: Some(timeout),
        ..Default::default()
    })
    .await
    {
        Ok(gateway) => Some(gateway),
        Err(err) => {
            debug!("upnp probe failed: {err}");
            None
        }
    }
}

/// Searches for a UPnP gateway without a search deadline.
///
/// Used by the background prober to acquire a gateway handle once, which the cycles then
/// reuse for liveness checks.
pub(crate) async fn get_gateway() -> Result<Gateway, igd::SearchError> {
    aigd::search_gateway(igd::SearchOptions {
        timeout: None,
        ..Default::default()
    })
    .await
}
