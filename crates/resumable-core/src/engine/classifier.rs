//! Response classification
//!
//! Maps the headers of a range response, together with what is stored for
//! the transfer, to the next transfer state. The HTTP status is handled by
//! the executor before classification. Pure: no I/O and no store access.

use crate::engine::content_range::ContentRange;
use crate::error::TransferError;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_RANGE, ETAG};
use resumable_types::{ProgressRecord, TransferState};
use tracing::debug;

/// Verdict for a single response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub next_state: TransferState,
    /// Identity to persist, `None` clears it
    pub identity: Option<String>,
    /// Usable content range to persist, if any
    pub content_range: Option<ContentRange>,
    /// The body is the entire resource rather than a window of it
    pub whole_body: bool,
}

impl Classification {
    fn complete(
        identity: Option<String>,
        content_range: Option<ContentRange>,
        whole_body: bool,
    ) -> Self {
        Self {
            next_state: TransferState::Complete,
            identity,
            content_range,
            whole_body,
        }
    }

    fn restart(identity: String) -> Self {
        Self {
            next_state: TransferState::Start,
            identity: Some(identity),
            content_range: None,
            whole_body: false,
        }
    }
}

/// Classify a response against the stored identity and size
pub fn classify(
    headers: &HeaderMap,
    stored: &ProgressRecord,
) -> Result<Classification, TransferError> {
    if headers.is_empty() {
        debug!("Response has no headers, nothing more to do");
        return Ok(Classification::complete(None, None, false));
    }

    let content_length =
        header_str(headers, CONTENT_LENGTH).and_then(|v| v.trim().parse::<u64>().ok());
    let content_range = match header_str(headers, CONTENT_RANGE) {
        Some(raw) => {
            debug!("content-range: {}", raw);
            let parsed = ContentRange::parse(raw)?;
            if !parsed.is_satisfied() {
                return Err(TransferError::RangeNotSatisfiable(raw.to_string()));
            }
            if !parsed.is_size_known() {
                return Err(TransferError::UnknownSize(raw.to_string()));
            }
            Some(parsed)
        }
        None => None,
    };
    let effective_size = content_range.and_then(|cr| cr.size).or(content_length);
    let identity = header_str(headers, ETAG).map(str::to_string);

    debug!(
        "content-length: {:?}, effective size: {:?}",
        content_length, effective_size
    );

    // Range support is decided by the presence of Content-Range: without it
    // the server ignored the range and sent the whole representation.
    let Some(content_range) = content_range else {
        debug!("No content-range, response carries the whole resource");
        return Ok(Classification::complete(identity, None, true));
    };

    if content_range.covers_whole() {
        debug!("Content range covers the whole resource of {:?} bytes", effective_size);
        return Ok(Classification::complete(identity, Some(content_range), true));
    }

    let Some(current) = identity else {
        return Err(TransferError::MissingIdentity);
    };

    if let Some(previous) = stored.identity.as_deref() {
        if previous != current {
            debug!("Identity changed from {} to {}, restarting", previous, current);
            return Ok(Classification::restart(current));
        }
        // The size of one representation never changes
        if let (Some(known), Some(reported)) = (stored.total_size, content_range.size) {
            if known != reported {
                debug!(
                    "Size of {} changed from {} to {} bytes, restarting",
                    current, known, reported
                );
                return Ok(Classification::restart(current));
            }
        }
    }

    let finished = match (content_range.range, effective_size) {
        (Some(range), Some(size)) => range.next_start() == size,
        _ => false,
    };

    Ok(Classification {
        next_state: if finished {
            TransferState::Complete
        } else {
            TransferState::InProgress
        },
        identity: Some(current),
        content_range: Some(content_range),
        whole_body: false,
    })
}

fn header_str(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
