use std::pin::Pin;

use futures::{Stream, StreamExt};
use snafu::ensure;
use tokio_util::sync::CancellationToken;

use super::decoder::Utf8ChunkDecoder;
use super::error::{AbortedSnafu, TransportResult};

pub type ByteStream = Pin<Box<dyn Stream<Item = TransportResult<Vec<u8>>> + Send>>;

/// Pull-based reader over one response body.
///
/// Each [`TransportReader::next_chunk`] call is a suspension point. Once the
/// cancellation token fires, pending and future reads fail with
/// [`TransportError::Aborted`](super::TransportError::Aborted).
pub struct TransportReader {
    body: ByteStream,
    decoder: Utf8ChunkDecoder,
    cancel: CancellationToken,
    finished: bool,
}

impl TransportReader {
    pub fn new(body: ByteStream, cancel: CancellationToken) -> Self {
        Self {
            body,
            decoder: Utf8ChunkDecoder::new(),
            cancel,
            finished: false,
        }
    }

    pub fn from_stream<S>(stream: S, cancel: CancellationToken) -> Self
    where
        S: Stream<Item = TransportResult<Vec<u8>>> + Send + 'static,
    {
        Self::new(Box::pin(stream), cancel)
    }

    /// Reader over an already-closed body. Used when the server answers with no payload.
    pub fn empty(cancel: CancellationToken) -> Self {
        Self::from_stream(futures::stream::empty(), cancel)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns the next non-empty decoded fragment, `Ok(None)` at end of data.
    pub async fn next_chunk(&mut self) -> TransportResult<Option<String>> {
        loop {
            ensure!(
                !self.cancel.is_cancelled(),
                AbortedSnafu {
                    stage: "read-chunk-cancelled",
                }
            );

            if self.finished {
                return Ok(None);
            }

            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return AbortedSnafu {
                        stage: "read-chunk-in-flight",
                    }
                    .fail();
                }
                next = self.body.next() => next,
            };

            match next {
                Some(Ok(bytes)) => {
                    let text = self.decoder.decode(&bytes);
                    if !text.is_empty() {
                        return Ok(Some(text));
                    }
                }
                Some(Err(error)) => {
                    self.finished = true;
                    return Err(error);
                }
                None => {
                    self.finished = true;
                    let tail = self.decoder.finish();
                    return Ok((!tail.is_empty()).then_some(tail));
                }
            }
        }
    }

    /// Drains the remaining body into one string. Stops early on cancellation or error.
    pub async fn read_to_string(&mut self) -> TransportResult<String> {
        let mut text = String::new();
        while let Some(chunk) = self.next_chunk().await? {
            text.push_str(&chunk);
        }
        Ok(text)
    }
}

impl std::fmt::Debug for TransportReader {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TransportReader")
            .field("pending_bytes", &self.decoder.pending_len())
            .field("cancelled", &self.cancel.is_cancelled())
            .field("finished", &self.finished)
            .finish()
    }
}
