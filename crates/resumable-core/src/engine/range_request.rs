//! Range request executor - one GET for one byte window
//!
//! Sends the request, classifies the response and records the outcome in
//! the progress store. The returned state is the classifier's verdict.

use crate::engine::classifier::classify;
use crate::engine::transport::HttpTransport;
use crate::error::TransferError;
use crate::storage::{ProgressStore, ReceivedWindow};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use resumable_types::{ByteRange, TransferEvent, TransferState};
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Executes range requests over a transport
pub struct RangeRequestExecutor<'a, T> {
    transport: &'a T,
    event_tx: &'a broadcast::Sender<TransferEvent>,
}

impl<'a, T: HttpTransport> RangeRequestExecutor<'a, T> {
    pub fn new(transport: &'a T, event_tx: &'a broadcast::Sender<TransferEvent>) -> Self {
        Self {
            transport,
            event_tx,
        }
    }

    /// Fetch `range` of `url` and persist what the response tells us
    pub async fn execute<S: ProgressStore>(
        &self,
        url: &str,
        headers: &HeaderMap,
        range: ByteRange,
        store: &S,
    ) -> Result<TransferState, TransferError> {
        let range_header = range.header_value();
        debug!("Requesting Range: {}", range_header);

        let mut request_headers = headers.clone();
        request_headers.insert(
            RANGE,
            HeaderValue::from_str(&range_header)
                .map_err(|_| TransferError::InvalidHeader(range_header.clone()))?,
        );

        let response = self.transport.get(url, &request_headers).await?;

        if response.status == StatusCode::RANGE_NOT_SATISFIABLE {
            let detail = response
                .headers
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .unwrap_or(range_header);
            return Err(TransferError::RangeNotSatisfiable(detail));
        }
        if !response.status.is_success() {
            return Err(TransferError::ServerError {
                status: response.status.as_u16(),
                message: format!("GET {} with range {} failed", url, range),
            });
        }

        let stored = store.record().await?;
        let verdict = classify(&response.headers, &stored)?;
        debug!("Response for {} classified as {}", range, verdict.next_state);

        let content_range = verdict.content_range;
        let received = content_range.and_then(|cr| cr.range);
        if !verdict.whole_body {
            if let Some(received) = received {
                if received.start != range.start {
                    return Err(TransferError::UnexpectedRange {
                        requested: range,
                        received,
                    });
                }
            }
        }

        // A whole-resource body replaces anything accumulated for earlier windows
        let replaces_payload = verdict.whole_body && range.start > 0;
        if replaces_payload {
            info!(
                "Server returned the whole resource for range {}, discarding partial payload",
                range
            );
        }

        let total_size = content_range.and_then(|cr| cr.size);
        let confirmed = received.filter(|_| verdict.next_state != TransferState::Start);
        let bytes = response.body.len() as u64;

        store
            .commit_window(ReceivedWindow {
                identity: verdict.identity,
                total_size,
                range: confirmed,
                replaces_payload,
                body: response.body,
            })
            .await?;

        let _ = self.event_tx.send(TransferEvent::ChunkReceived {
            range: confirmed,
            total_size,
            bytes,
        });

        Ok(verdict.next_state)
    }
}
