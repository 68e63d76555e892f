//! RPC client for the daemon socket.
//!
//! Speaks minimal HTTP/1.1 over a `UnixStream` directly instead of pulling
//! in an HTTP client stack: one request per connection, `Connection:
//! close`, body delimited by EOF. Two hard limits protect the caller from
//! a wedged or misbehaving daemon: a clamped per-request timeout and a
//! cumulative cap on response bytes.
//!
//! Every request is preceded by the same socket-permission check the
//! daemon applies to itself; a world-readable socket is refused, not
//! reported.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use corral_core::channel::{assert_safe_socket_path, ChannelError};
use corral_core::protocol::{
    CancelResponse, EnqueueRequest, EnqueueResponse, ErrorBody, HealthResponse, ListJobsResponse,
    ShowJobResponse,
};
use corral_core::{JobKind, JobStatus};

/// Timeout applied when the caller does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Lower clamp for the request timeout.
pub const MIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper clamp for the request timeout.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(120);

/// Default cumulative cap on response bytes (1 MiB).
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 1 << 20;

/// Errors raised by [`QueueClient`] requests.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The socket failed the trust-boundary check.
    #[error("unsafe socket: {0}")]
    Unsafe(#[from] ChannelError),

    /// Nothing is listening at the socket path.
    #[error("daemon not running at {path} (is corral-daemon started?)")]
    DaemonNotRunning {
        /// The socket path probed.
        path: PathBuf,
    },

    /// Transport failure mid-request.
    #[error("I/O error talking to daemon: {0}")]
    Io(#[from] io::Error),

    /// The daemon did not answer within the timeout.
    #[error("daemon did not answer within {:?}", .timeout)]
    Timeout {
        /// The effective (clamped) timeout.
        timeout: Duration,
    },

    /// The daemon sent more than the configured response cap.
    #[error("response exceeded {max} bytes (received at least {received})")]
    ResponseTooLarge {
        /// Bytes received before giving up.
        received: usize,
        /// The configured cap.
        max: usize,
    },

    /// The response was not parseable HTTP/1.1 with a JSON body.
    #[error("malformed response from daemon: {0}")]
    MalformedResponse(String),

    /// The body decoded as JSON but not as the expected type.
    #[error("failed to decode daemon response: {0}")]
    Decode(#[from] serde_json::Error),

    /// The daemon answered with a non-2xx status and an error body.
    #[error("daemon error {status} [{code}]: {message}")]
    Daemon {
        /// HTTP status code.
        status: u16,
        /// Stable machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
    },
}

/// Filters for [`QueueClient::list`].
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    /// Only jobs enqueued by this principal.
    pub requester: Option<String>,
    /// Only jobs in one of these statuses (empty = all).
    pub statuses: Vec<JobStatus>,
    /// Only jobs of one of these kinds (empty = all).
    pub kinds: Vec<JobKind>,
    /// Row cap; the daemon applies its own default and maximum.
    pub limit: Option<u32>,
}

/// Client for the daemon's Unix socket API.
#[derive(Debug, Clone)]
pub struct QueueClient {
    socket_path: PathBuf,
    timeout: Duration,
    max_response_bytes: usize,
}

impl QueueClient {
    /// Creates a client for the daemon at `socket_path`.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }

    /// Sets the per-request timeout, clamped to `[1s, 120s]`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.clamp(MIN_TIMEOUT, MAX_TIMEOUT);
        self
    }

    /// Sets the cumulative response-size cap in bytes.
    #[must_use]
    pub fn with_max_response_bytes(mut self, max: usize) -> Self {
        self.max_response_bytes = max;
        self
    }

    /// `GET /healthz`.
    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        self.request("GET", "/healthz", None).await
    }

    /// `POST /v1/jobs/enqueue`.
    pub async fn enqueue(&self, req: &EnqueueRequest) -> Result<EnqueueResponse, ClientError> {
        let body = serde_json::to_string(req)?;
        self.request("POST", "/v1/jobs/enqueue", Some(body)).await
    }

    /// `GET /v1/jobs` with query filters.
    pub async fn list(&self, query: &ListQuery) -> Result<ListJobsResponse, ClientError> {
        let mut params = Vec::new();
        if let Some(requester) = &query.requester {
            params.push(format!(
                "requester={}",
                utf8_percent_encode(requester, NON_ALPHANUMERIC)
            ));
        }
        if !query.statuses.is_empty() {
            let statuses: Vec<&str> = query.statuses.iter().map(|s| s.as_str()).collect();
            params.push(format!("status={}", statuses.join("%2C")));
        }
        if !query.kinds.is_empty() {
            let kinds: Vec<String> = query
                .kinds
                .iter()
                .map(|k| utf8_percent_encode(k.as_str(), NON_ALPHANUMERIC).to_string())
                .collect();
            params.push(format!("kind={}", kinds.join("%2C")));
        }
        if let Some(limit) = query.limit {
            params.push(format!("limit={limit}"));
        }
        let target = if params.is_empty() {
            "/v1/jobs".to_string()
        } else {
            format!("/v1/jobs?{}", params.join("&"))
        };
        self.request("GET", &target, None).await
    }

    /// `GET /v1/jobs/{jobId}`.
    pub async fn show(&self, job_id: &str) -> Result<ShowJobResponse, ClientError> {
        let target = format!("/v1/jobs/{}", utf8_percent_encode(job_id, NON_ALPHANUMERIC));
        self.request("GET", &target, None).await
    }

    /// `POST /v1/jobs/{jobId}/cancel`.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelResponse, ClientError> {
        let target = format!(
            "/v1/jobs/{}/cancel",
            utf8_percent_encode(job_id, NON_ALPHANUMERIC)
        );
        self.request("POST", &target, Some("{}".to_string())).await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        target: &str,
        body: Option<String>,
    ) -> Result<T, ClientError> {
        self.preflight()?;
        debug!(method, target, "daemon request");

        let raw = tokio::time::timeout(self.timeout, self.exchange(method, target, body))
            .await
            .map_err(|_| ClientError::Timeout {
                timeout: self.timeout,
            })??;
        self.parse(&raw)
    }

    fn preflight(&self) -> Result<(), ClientError> {
        match assert_safe_socket_path(&self.socket_path) {
            Ok(()) => Ok(()),
            // A missing endpoint means no daemon, not an unsafe one.
            Err(ChannelError::Io { source, .. })
                if source.kind() == io::ErrorKind::NotFound =>
            {
                Err(ClientError::DaemonNotRunning {
                    path: self.socket_path.clone(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn exchange(
        &self,
        method: &str,
        target: &str,
        body: Option<String>,
    ) -> Result<Vec<u8>, ClientError> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|err| {
            if err.kind() == io::ErrorKind::ConnectionRefused
                || err.kind() == io::ErrorKind::NotFound
            {
                ClientError::DaemonNotRunning {
                    path: self.socket_path.clone(),
                }
            } else {
                ClientError::Io(err)
            }
        })?;

        let body = body.unwrap_or_default();
        let request = format!(
            "{method} {target} HTTP/1.1\r\nHost: corral\r\nConnection: close\r\n\
             Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await?;

        let mut response = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            if response.len() + n > self.max_response_bytes {
                return Err(ClientError::ResponseTooLarge {
                    received: response.len() + n,
                    max: self.max_response_bytes,
                });
            }
            response.extend_from_slice(&chunk[..n]);
        }
        Ok(response)
    }

    fn parse<T: DeserializeOwned>(&self, raw: &[u8]) -> Result<T, ClientError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| ClientError::MalformedResponse("response is not UTF-8".to_string()))?;
        let (head, body) = text.split_once("\r\n\r\n").ok_or_else(|| {
            ClientError::MalformedResponse("missing header/body separator".to_string())
        })?;
        let status: u16 = head
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                ClientError::MalformedResponse("unparseable status line".to_string())
            })?;

        if (200..300).contains(&status) {
            return Ok(serde_json::from_str(body)?);
        }
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(err) => Err(ClientError::Daemon {
                status,
                code: err.error.code,
                message: err.error.message,
            }),
            Err(_) => Err(ClientError::MalformedResponse(format!(
                "status {status} without an error body"
            ))),
        }
    }
}
