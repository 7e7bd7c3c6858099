//! Scripted transport for unit tests

use crate::engine::transport::{HttpResponse, HttpTransport};
use crate::error::TransferError;
use bytes::Bytes;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, ETAG, RANGE};
use reqwest::StatusCode;
use std::collections::VecDeque;

/// Replays a fixed list of responses and records every request
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<HttpResponse, TransferError>>>,
    requests: Mutex<Vec<HeaderMap>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Result<HttpResponse, TransferError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<HeaderMap> {
        self.requests.lock().clone()
    }

    pub fn requested_ranges(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .filter_map(|h| h.get(RANGE).and_then(|v| v.to_str().ok()).map(str::to_string))
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().len()
    }
}

impl HttpTransport for ScriptedTransport {
    async fn get(&self, _url: &str, headers: &HeaderMap) -> Result<HttpResponse, TransferError> {
        self.requests.lock().push(headers.clone());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| panic!("no scripted response left for {:?}", headers.get(RANGE)))
    }
}

/// 206 response for the inclusive window `start..=end` of a `size` byte resource
pub fn partial(body: &[u8], start: u64, end: u64, size: u64, etag: &str) -> HttpResponse {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
    headers.insert(
        CONTENT_RANGE,
        HeaderValue::from_str(&format!("bytes {}-{}/{}", start, end, size)).unwrap(),
    );
    headers.insert(ETAG, HeaderValue::from_str(etag).unwrap());
    HttpResponse {
        status: StatusCode::PARTIAL_CONTENT,
        headers,
        body: Bytes::copy_from_slice(body),
    }
}

/// 200 response carrying the whole resource, as sent by servers ignoring `Range`
pub fn full(body: &[u8]) -> HttpResponse {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
    HttpResponse {
        status: StatusCode::OK,
        headers,
        body: Bytes::copy_from_slice(body),
    }
}

/// Empty-bodied response with the given status
pub fn status(code: u16) -> HttpResponse {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
    HttpResponse {
        status: StatusCode::from_u16(code).unwrap(),
        headers,
        body: Bytes::new(),
    }
}

/// Serve the inclusive window of `data` named by the request's `Range` header
pub fn window_of(data: &[u8], start: u64, len: u64, etag: &str) -> HttpResponse {
    let end = (start + len).min(data.len() as u64) - 1;
    partial(
        &data[start as usize..=end as usize],
        start,
        end,
        data.len() as u64,
        etag,
    )
}
