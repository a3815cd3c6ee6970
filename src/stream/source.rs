use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use std::fmt;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error::{RelayError, Result};

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Handle to an inbound byte stream that can be read at most once.
///
/// Clones share the same identity and the same underlying stream; whoever
/// reads first takes the stream and every other holder finds it locked.
#[derive(Clone)]
pub struct DeltaSource {
    id: Uuid,
    inner: Arc<Mutex<Option<ByteStream>>>,
}

impl DeltaSource {
    pub fn new<S, E>(stream: S) -> Self
    where
        S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
        E: fmt::Display,
    {
        let stream = stream
            .map(|chunk| chunk.map_err(|e| RelayError::stream(e.to_string())))
            .boxed();
        Self {
            id: Uuid::now_v7(),
            inner: Arc::new(Mutex::new(Some(stream))),
        }
    }

    /// Wrap the body of an HTTP response.
    pub fn from_response(response: reqwest::Response) -> Self {
        Self::new(response.bytes_stream())
    }

    /// A source that yields `data` as a single chunk.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let chunk: std::result::Result<Bytes, RelayError> = Ok(data.into());
        Self::new(futures::stream::iter(vec![chunk]))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().map(|s| s.is_none()).unwrap_or(true)
    }

    /// Take the stream for reading. Returns `None` once anyone has taken it.
    pub(crate) fn lock(&self) -> Option<ByteStream> {
        self.inner.lock().ok().and_then(|mut s| s.take())
    }
}

impl fmt::Debug for DeltaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaSource")
            .field("id", &self.id)
            .field("locked", &self.is_locked())
            .finish()
    }
}
