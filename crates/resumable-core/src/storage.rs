//! Progress store contract and the in-memory reference store
//!
//! A store owns everything a transfer knows about itself: the logical
//! state, the resource identity, the learned size, the last confirmed
//! range and the payload received so far. The engine re-reads the store on
//! every step, so any backend with the semantics below makes a transfer
//! resumable across process restarts.

use crate::error::TransferError;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use resumable_types::{ByteRange, ProgressRecord, TransferState};
use std::collections::HashMap;
use std::future::Future;

/// Keys recognized by every store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    State,
    Identity,
    Size,
    Range,
}

/// A value stored under a [`StoreKey`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreValue {
    State(TransferState),
    Identity(String),
    Size(u64),
    Range(ByteRange),
}

impl StoreValue {
    /// The key this value belongs under
    pub fn key(&self) -> StoreKey {
        match self {
            StoreValue::State(_) => StoreKey::State,
            StoreValue::Identity(_) => StoreKey::Identity,
            StoreValue::Size(_) => StoreKey::Size,
            StoreValue::Range(_) => StoreKey::Range,
        }
    }
}

/// Reject a value written under the wrong key
pub fn check_key(key: StoreKey, value: &StoreValue) -> Result<(), TransferError> {
    if value.key() == key {
        Ok(())
    } else {
        Err(TransferError::Store(format!(
            "value {:?} cannot be stored under {:?}",
            value, key
        )))
    }
}

fn mismatch(key: StoreKey, value: StoreValue) -> TransferError {
    TransferError::Store(format!("unexpected value {:?} under {:?}", value, key))
}

/// Everything learned from one successful range response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedWindow {
    /// Entity tag to keep, `None` removes the stored one
    pub identity: Option<String>,
    pub total_size: Option<u64>,
    /// Confirmed range, `None` when the body is not a window of the resource
    pub range: Option<ByteRange>,
    /// The body is the whole resource and replaces the accumulator
    pub replaces_payload: bool,
    pub body: Bytes,
}

/// Persistence contract for transfer progress.
///
/// Implementations must keep the accumulator in append order and must wipe
/// both keys and accumulator on [`ProgressStore::clear`]. A single instance
/// is never shared by concurrent transfers.
pub trait ProgressStore: Send + Sync {
    fn get(
        &self,
        key: StoreKey,
    ) -> impl Future<Output = Result<Option<StoreValue>, TransferError>> + Send;

    fn set(
        &self,
        key: StoreKey,
        value: StoreValue,
    ) -> impl Future<Output = Result<(), TransferError>> + Send;

    fn remove(&self, key: StoreKey) -> impl Future<Output = Result<(), TransferError>> + Send;

    /// Wipe all keyed state and the accumulator
    fn clear(&self) -> impl Future<Output = Result<(), TransferError>> + Send;

    fn append(&self, chunk: Bytes) -> impl Future<Output = Result<(), TransferError>> + Send;

    /// Concatenate the accumulator in append order
    fn assemble(&self) -> impl Future<Output = Result<Bytes, TransferError>> + Send;

    /// Record a received window together with its body.
    ///
    /// The body is appended before any key changes, so a failed append
    /// leaves the previous range in place and the window is fetched again.
    /// Stores that can write both in one transaction should override this.
    fn commit_window(
        &self,
        window: ReceivedWindow,
    ) -> impl Future<Output = Result<(), TransferError>> + Send {
        async move {
            if window.replaces_payload {
                self.clear().await?;
            }
            self.append(window.body).await?;

            match window.identity {
                Some(tag) => self.set(StoreKey::Identity, StoreValue::Identity(tag)).await?,
                None => self.remove(StoreKey::Identity).await?,
            }
            if let Some(size) = window.total_size {
                self.set(StoreKey::Size, StoreValue::Size(size)).await?;
            }
            if let Some(range) = window.range {
                self.set(StoreKey::Range, StoreValue::Range(range)).await?;
            }
            Ok(())
        }
    }

    /// Persisted state, `Start` when nothing was stored yet
    fn state(&self) -> impl Future<Output = Result<TransferState, TransferError>> + Send {
        async move {
            match self.get(StoreKey::State).await? {
                None => Ok(TransferState::Start),
                Some(StoreValue::State(state)) => Ok(state),
                Some(other) => Err(mismatch(StoreKey::State, other)),
            }
        }
    }

    fn set_state(
        &self,
        state: TransferState,
    ) -> impl Future<Output = Result<(), TransferError>> + Send {
        self.set(StoreKey::State, StoreValue::State(state))
    }

    fn identity(&self) -> impl Future<Output = Result<Option<String>, TransferError>> + Send {
        async move {
            match self.get(StoreKey::Identity).await? {
                None => Ok(None),
                Some(StoreValue::Identity(tag)) => Ok(Some(tag)),
                Some(other) => Err(mismatch(StoreKey::Identity, other)),
            }
        }
    }

    fn total_size(&self) -> impl Future<Output = Result<Option<u64>, TransferError>> + Send {
        async move {
            match self.get(StoreKey::Size).await? {
                None => Ok(None),
                Some(StoreValue::Size(size)) => Ok(Some(size)),
                Some(other) => Err(mismatch(StoreKey::Size, other)),
            }
        }
    }

    fn last_range(&self) -> impl Future<Output = Result<Option<ByteRange>, TransferError>> + Send {
        async move {
            match self.get(StoreKey::Range).await? {
                None => Ok(None),
                Some(StoreValue::Range(range)) => Ok(Some(range)),
                Some(other) => Err(mismatch(StoreKey::Range, other)),
            }
        }
    }

    /// Snapshot of identity, size and range
    fn record(&self) -> impl Future<Output = Result<ProgressRecord, TransferError>> + Send {
        async move {
            Ok(ProgressRecord {
                identity: self.identity().await?,
                total_size: self.total_size().await?,
                last_range: self.last_range().await?,
            })
        }
    }
}

/// Reference store keeping everything in process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    values: HashMap<StoreKey, StoreValue>,
    chunks: Vec<Bytes>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks appended since the last clear
    pub fn chunk_count(&self) -> usize {
        self.inner.lock().chunks.len()
    }
}

impl ProgressStore for MemoryStore {
    async fn get(&self, key: StoreKey) -> Result<Option<StoreValue>, TransferError> {
        Ok(self.inner.lock().values.get(&key).cloned())
    }

    async fn set(&self, key: StoreKey, value: StoreValue) -> Result<(), TransferError> {
        check_key(key, &value)?;
        self.inner.lock().values.insert(key, value);
        Ok(())
    }

    async fn remove(&self, key: StoreKey) -> Result<(), TransferError> {
        self.inner.lock().values.remove(&key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), TransferError> {
        let mut inner = self.inner.lock();
        inner.values.clear();
        inner.chunks.clear();
        Ok(())
    }

    async fn append(&self, chunk: Bytes) -> Result<(), TransferError> {
        self.inner.lock().chunks.push(chunk);
        Ok(())
    }

    async fn commit_window(&self, window: ReceivedWindow) -> Result<(), TransferError> {
        let mut inner = self.inner.lock();
        if window.replaces_payload {
            inner.values.clear();
            inner.chunks.clear();
        }
        inner.chunks.push(window.body);

        match window.identity {
            Some(tag) => {
                inner.values.insert(StoreKey::Identity, StoreValue::Identity(tag));
            }
            None => {
                inner.values.remove(&StoreKey::Identity);
            }
        }
        if let Some(size) = window.total_size {
            inner.values.insert(StoreKey::Size, StoreValue::Size(size));
        }
        if let Some(range) = window.range {
            inner.values.insert(StoreKey::Range, StoreValue::Range(range));
        }
        Ok(())
    }

    async fn assemble(&self) -> Result<Bytes, TransferError> {
        let inner = self.inner.lock();
        let total = inner.chunks.iter().map(|c| c.len()).sum();
        let mut payload = BytesMut::with_capacity(total);
        for chunk in &inner.chunks {
            payload.extend_from_slice(chunk);
        }
        Ok(payload.freeze())
    }
}
