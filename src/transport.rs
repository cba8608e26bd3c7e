// src/transport.rs

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;

const USER_AGENT: &str = concat!("trafficflow/", env!("CARGO_PKG_VERSION"));

/// Connection, timeout, DNS, or body-read failure below the HTTP status level.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0}")]
    Request(#[from] reqwest::Error),
    #[error("{0}")]
    Other(String),
}

/// Response body as a stream of arbitrarily sized pieces.
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

pub struct TransportResponse {
    pub status: u16,
    pub body: BodyStream,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issues one GET and hands back the status and the unread body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, timeout: Duration) -> Result<TransportResponse, TransportError>;
}

/// `Transport` backed by a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str, timeout: Duration) -> Result<TransportResponse, TransportError> {
        let resp = self.client.get(url).timeout(timeout).send().await?;
        let status = resp.status().as_u16();
        let body = resp
            .bytes_stream()
            .map(|piece| piece.map_err(TransportError::from))
            .boxed();
        Ok(TransportResponse { status, body })
    }
}
