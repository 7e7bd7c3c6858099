//! HTTP transport seam
//!
//! The engine only needs "GET with headers, return status, headers and
//! body". Connection handling, TLS and redirects belong to the transport.

use crate::error::TransferError;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use resumable_types::TransferSettings;
use std::future::Future;
use std::time::Duration;

/// A fully buffered HTTP response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Performs a single GET request
pub trait HttpTransport: Send + Sync {
    fn get(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> impl Future<Output = Result<HttpResponse, TransferError>> + Send;
}

/// Production transport backed by `reqwest`
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Build a client with the timeouts and user agent from `settings`
    pub fn new(settings: &TransferSettings) -> Result<Self, TransferError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.as_str())
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;

        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str, headers: &HeaderMap) -> Result<HttpResponse, TransferError> {
        let response = self.client.get(url).headers(headers.clone()).send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
