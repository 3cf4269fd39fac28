// Transport collaborator
// Moves a fully prepared request over the wire and hands back the raw response

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use std::time::Duration;

/// Request as handed to the transport, credential already attached
#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    /// Absolute URL, or a path resolved against the transport's base URL
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Per-request timeout, independent of any in-flight refresh
    pub timeout: Option<Duration>,
}

/// Raw response from the transport
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// 401 is the only status this layer interprets
    pub fn is_authorization_expired(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    /// Body as lossy UTF-8 text
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Category of a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    ConnectionFailed,
    InvalidUrl,
    Request,
    Body,
    Decode,
    Unknown,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::ConnectionFailed => "connection_failed",
            TransportErrorKind::InvalidUrl => "invalid_url",
            TransportErrorKind::Request => "request_error",
            TransportErrorKind::Body => "body_error",
            TransportErrorKind::Decode => "decode_error",
            TransportErrorKind::Unknown => "unknown",
        };
        f.write_str(kind)
    }
}

/// Transport failure (no response was obtained)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            TransportErrorKind::Timeout
        } else if e.is_connect() {
            TransportErrorKind::ConnectionFailed
        } else if e.is_builder() {
            TransportErrorKind::InvalidUrl
        } else if e.is_request() {
            TransportErrorKind::Request
        } else if e.is_body() {
            TransportErrorKind::Body
        } else if e.is_decode() {
            TransportErrorKind::Decode
        } else {
            TransportErrorKind::Unknown
        };
        TransportError::new(kind, e.to_string())
    }
}

/// Outbound HTTP seam
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        request: TransportRequest,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

/// `reqwest` backed transport with connection pooling
pub struct ReqwestTransport {
    client: Client,
    base_url: Option<Url>,
}

impl ReqwestTransport {
    /// Create a transport with its own pooled client
    pub fn new(
        base_url: Option<Url>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: Option<Url>) -> Self {
        Self { client, base_url }
    }

    /// Resolve a target against the base URL unless it is already absolute
    pub fn resolve(&self, target: &str) -> std::result::Result<Url, TransportError> {
        match Url::parse(target) {
            Ok(url) => Ok(url),
            Err(url::ParseError::RelativeUrlWithoutBase) => match self.base_url {
                Some(ref base) => base.join(target).map_err(|e| {
                    TransportError::new(TransportErrorKind::InvalidUrl, e.to_string())
                }),
                None => Err(TransportError::new(
                    TransportErrorKind::InvalidUrl,
                    format!("relative target without base URL: {}", target),
                )),
            },
            Err(e) => Err(TransportError::new(
                TransportErrorKind::InvalidUrl,
                e.to_string(),
            )),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(
        &self,
        request: TransportRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        let url = self.resolve(&request.url)?;

        tracing::debug!(method = %request.method, url = %url, "Sending HTTP request");

        let mut builder = self
            .client
            .request(request.method, url.clone())
            .headers(request.headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| {
            let err = TransportError::from(e);
            tracing::warn!(error_kind = %err.kind, error = %err.message, url = %url, "HTTP request error");
            err
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(TransportError::from)?;

        tracing::debug!(status = %status, url = %url, "Received HTTP response");

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
