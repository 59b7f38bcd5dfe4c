//! Pull-based payload streaming over a data-stream connection
//!
//! Recording and audio senders produce chunked payloads; the driver here
//! pulls `{data, is_last}` items from the producer and ships each as an
//! event. Closing the source early is an explicit, defined operation —
//! the driver calls [`PayloadSource::close`] whenever it stops before
//! exhaustion, so producers can release encoder resources.

use async_trait::async_trait;
use tracing::debug;

use super::HdsError;
use super::connection::DataStreamHandle;
use super::parser::{DataStreamDict, DataStreamValue};

/// One pulled chunk
#[derive(Debug, Clone)]
pub struct PayloadChunk {
    /// Chunk bytes
    pub data: Vec<u8>,
    /// Whether this is the final chunk of the stream
    pub is_last: bool,
}

/// A producer of payload chunks, driven by the sender
#[async_trait]
pub trait PayloadSource: Send {
    /// Pull the next chunk; `None` means the producer is exhausted
    async fn next_chunk(&mut self) -> Option<PayloadChunk>;

    /// Release resources when the consumer stops early
    async fn close(&mut self) {}
}

/// Drive `source` to completion over `handle`, sending one event per
/// chunk on `(protocol, topic)` with the message shape
/// `{streamId, data, endOfStream}`.
///
/// Returns the number of chunks sent. If the connection drops mid-stream
/// the source is closed and the error propagated.
///
/// # Errors
///
/// Returns [`HdsError::ConnectionClosed`] if the connection goes away
/// before the stream completes.
pub async fn send_payload_stream(
    handle: &DataStreamHandle,
    protocol: &str,
    topic: &str,
    stream_id: i64,
    source: &mut dyn PayloadSource,
) -> Result<usize, HdsError> {
    let mut sent = 0usize;

    loop {
        let Some(chunk) = source.next_chunk().await else {
            // Exhausted without an is_last marker: the producer was
            // cancelled from its own side; nothing more to send.
            debug!(stream_id, sent, "payload source exhausted");
            return Ok(sent);
        };

        let is_last = chunk.is_last;
        let mut message = DataStreamDict::new();
        message.insert("streamId".to_string(), stream_id.into());
        message.insert("data".to_string(), DataStreamValue::Data(chunk.data));
        message.insert("endOfStream".to_string(), is_last.into());

        if let Err(err) = handle.send_event(protocol, topic, message) {
            source.close().await;
            return Err(err);
        }
        sent += 1;

        if is_last {
            debug!(stream_id, sent, "payload stream complete");
            return Ok(sent);
        }
    }
}
