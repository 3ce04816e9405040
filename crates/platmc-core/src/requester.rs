// ── Request/response exchange ──
//
// Wraps the transport with per-endpoint ordering: at most one request
// is outstanding per endpoint, and instance ids rotate per endpoint.
// Responses are matched against their request before anyone sees them.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use platmc_proto::{EndpointAddress, InstanceId, Request, Response, Transport};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::RetryPolicy;
use crate::error::CoreError;

/// Slack on top of the transport's own timeout before we give up on it.
const TIMEOUT_GRACE: Duration = Duration::from_millis(50);

pub(crate) struct Requester {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    /// Per-endpoint lock holding the next instance id.
    endpoints: DashMap<EndpointAddress, Arc<Mutex<InstanceId>>>,
}

impl Requester {
    pub(crate) fn new(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            endpoints: DashMap::new(),
        }
    }

    /// One exchange. A non-success completion code becomes
    /// [`CoreError::ProtocolRejection`].
    pub(crate) async fn send(
        &self,
        endpoint: EndpointAddress,
        request: Request,
    ) -> Result<Response, CoreError> {
        let slot = Arc::clone(
            self.endpoints
                .entry(endpoint)
                .or_insert_with(|| Arc::new(Mutex::new(InstanceId::default())))
                .value(),
        );
        let mut next_id = slot.lock().await;

        let request = request.with_instance_id(*next_id);
        *next_id = next_id.next();
        trace!(
            %endpoint,
            command = request.command,
            instance_id = request.instance_id.get(),
            "sending request"
        );

        let raw = match tokio::time::timeout(
            self.timeout + TIMEOUT_GRACE,
            self.transport
                .send_request(endpoint, request.encode(), self.timeout),
        )
        .await
        {
            Ok(result) => result.map_err(|e| CoreError::transport(endpoint, e))?,
            Err(_) => {
                return Err(CoreError::TransportTimeout {
                    endpoint,
                    timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        };
        drop(next_id);

        let response = Response::decode(raw).map_err(|e| CoreError::malformed(endpoint, &e))?;
        if !response.answers(&request) {
            return Err(CoreError::MalformedResponse {
                endpoint,
                reason: format!(
                    "response (type {}, command {:#04x}, instance {}) does not match request",
                    response.pldm_type,
                    response.command,
                    response.instance_id.get()
                ),
            });
        }
        if !response.completion_code.is_success() {
            return Err(CoreError::ProtocolRejection {
                endpoint,
                command: request.command,
                code: response.completion_code,
            });
        }
        Ok(response)
    }

    /// [`send`](Self::send) with bounded retries on retryable errors.
    /// `cancel` is honoured before each attempt and during backoff.
    pub(crate) async fn send_with_retry(
        &self,
        endpoint: EndpointAddress,
        request: &Request,
        attempts: u32,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Response, CoreError> {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled { endpoint });
            }
            // An exchange already on the wire runs to completion.
            match self.send(endpoint, request.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = policy.delay(attempt);
                    debug!(
                        %endpoint,
                        command = request.command,
                        attempt = attempt + 1,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "retrying request"
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(CoreError::Cancelled { endpoint }),
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop per-endpoint state after the endpoint goes away.
    pub(crate) fn forget(&self, endpoint: EndpointAddress) {
        self.endpoints.remove(&endpoint);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use platmc_proto::commands::base;
    use platmc_proto::{CompletionCode, PldmType};
    use std::sync::Mutex as StdMutex;

    /// Answers every request with a fixed completion code and records
    /// the instance ids it saw.
    struct Echo {
        code: CompletionCode,
        seen: StdMutex<Vec<u8>>,
        wrong_command: bool,
    }

    impl Echo {
        fn new(code: CompletionCode) -> Self {
            Self {
                code,
                seen: StdMutex::new(Vec::new()),
                wrong_command: false,
            }
        }
    }

    #[async_trait]
    impl Transport for Echo {
        async fn send_request(
            &self,
            _endpoint: EndpointAddress,
            request: Bytes,
            _timeout: Duration,
        ) -> Result<Bytes, platmc_proto::Error> {
            let mut request = Request::decode(request)?;
            self.seen.lock().unwrap().push(request.instance_id.get());
            if self.wrong_command {
                request.command ^= 0xff;
            }
            let payload = base::encode_get_tid_response(3);
            Ok(Response::to(&request, self.code, payload).encode())
        }
    }

    const EP: EndpointAddress = EndpointAddress::new(0, 8);

    #[tokio::test]
    async fn instance_ids_rotate_per_endpoint() {
        let echo = Arc::new(Echo::new(CompletionCode::SUCCESS));
        let requester = Requester::new(echo.clone(), Duration::from_millis(100));
        for _ in 0..3 {
            requester.send(EP, base::get_tid_request()).await.unwrap();
        }
        assert_eq!(*echo.seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn error_completion_code_is_a_rejection() {
        let requester = Requester::new(
            Arc::new(Echo::new(CompletionCode::ERROR_UNSUPPORTED_CMD)),
            Duration::from_millis(100),
        );
        let err = requester.send(EP, base::get_tid_request()).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::ProtocolRejection {
                code: CompletionCode::ERROR_UNSUPPORTED_CMD,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn mismatched_response_is_malformed() {
        let mut echo = Echo::new(CompletionCode::SUCCESS);
        echo.wrong_command = true;
        let requester = Requester::new(Arc::new(echo), Duration::from_millis(100));
        let err = requester.send(EP, base::get_tid_request()).await.unwrap_err();
        assert!(matches!(err, CoreError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn rejections_are_not_retried() {
        let echo = Arc::new(Echo::new(CompletionCode::ERROR));
        let requester = Requester::new(echo.clone(), Duration::from_millis(100));
        let request = Request::new(PldmType::BASE, base::GET_TID, Bytes::new());
        let err = requester
            .send_with_retry(EP, &request, 3, &RetryPolicy::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ProtocolRejection { .. }));
        assert_eq!(echo.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let requester = Requester::new(
            Arc::new(Echo::new(CompletionCode::SUCCESS)),
            Duration::from_millis(100),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = requester
            .send_with_retry(EP, &base::get_tid_request(), 3, &RetryPolicy::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled { .. }));
    }
}
