// ── Request/response transport boundary ──
//
// The only I/O primitive the core depends on. Implementations own bus
// addressing and framing; they see opaque message bytes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::endpoint::EndpointAddress;
use crate::error::Error;

/// Sends one request to an endpoint and waits for its response.
///
/// Implementations must resolve within `timeout` (returning
/// [`Error::Timeout`]) and must not reorder responses for one endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_request(
        &self,
        endpoint: EndpointAddress,
        request: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, Error>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send_request(
        &self,
        endpoint: EndpointAddress,
        request: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, Error> {
        (**self).send_request(endpoint, request, timeout).await
    }
}
