//! Per-peer reader and writer tasks.
//!
//! Each accepted stream is split in two. The reader decodes newline
//! delimited frames and forwards them to the controller tagged with the
//! peer identity. The writer drains the peer's outgoing queue.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()` in production code
//! - Socket errors end the connection and are logged, never propagated

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use circus_protocol::MAX_MESSAGE_SIZE;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{ClientIdentity, Incoming, PeerMap};

/// Write timeout for a single frame (10 seconds)
pub(super) const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Initial read buffer capacity
const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Item queued for a peer's writer task.
#[derive(Debug)]
pub(super) enum Outgoing {
    Frame(Bytes),
    /// Acknowledged once every frame queued before it has been written
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Registers a peer and spawns its reader and writer tasks.
pub(super) fn spawn<S>(
    stream: S,
    identity: ClientIdentity,
    peers: Arc<Mutex<PeerMap>>,
    incoming: mpsc::UnboundedSender<Incoming>,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();

    let key = identity.detached();
    peers
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(key.clone(), tx);
    debug!(peer = %key, "Peer connected");

    tokio::spawn(read_loop(reader, key.leased(&peers), incoming, cancel.clone()));
    tokio::spawn(write_loop(writer, key, rx, cancel));
}

/// Reads frames until EOF, an I/O error or socket shutdown.
///
/// The reader's leased identity is dropped on exit. The peer stays
/// registered while frames it sent are still being handled, and the writer
/// only stops once its queue is closed.
async fn read_loop<R>(
    mut reader: R,
    identity: ClientIdentity,
    incoming: mpsc::UnboundedSender<Incoming>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut codec = AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_MESSAGE_SIZE);
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_CAPACITY);
    let mut eof = false;

    loop {
        let decoded = if eof {
            codec.decode_eof(&mut buffer)
        } else {
            codec.decode(&mut buffer)
        };

        match decoded {
            Ok(Some(frame)) => {
                trace!(peer = %identity, len = frame.len(), "Frame received");
                let message = Incoming {
                    identity: identity.clone(),
                    payload: frame,
                };
                if incoming.send(message).is_err() {
                    debug!(peer = %identity, "Router receiver dropped");
                    break;
                }
                continue;
            }
            Ok(None) if eof => break,
            Ok(None) => {}
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                // The codec skips to the next delimiter on its own
                warn!(peer = %identity, max = MAX_MESSAGE_SIZE, "Frame too large, discarded");
                continue;
            }
            Err(AnyDelimiterCodecError::Io(e)) => {
                debug!(peer = %identity, error = %e, "Frame decoding failed");
                break;
            }
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            result = reader.read_buf(&mut buffer) => match result {
                Ok(0) => eof = true,
                Ok(_) => {}
                Err(e) => {
                    debug!(peer = %identity, error = %e, "Read failed");
                    break;
                }
            },
        }
    }

    debug!(peer = %identity, "Peer reader finished");
}

/// Writes queued frames, newline terminated, until the queue closes.
async fn write_loop<W>(
    mut writer: W,
    identity: ClientIdentity,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let item = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            item = queue.recv() => match item {
                Some(item) => item,
                None => break,
            },
        };

        match item {
            Outgoing::Frame(frame) => {
                let write = async {
                    writer.write_all(&frame).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await?;
                    Ok::<(), std::io::Error>(())
                };
                match timeout(WRITE_TIMEOUT, write).await {
                    Ok(Ok(())) => trace!(peer = %identity, len = frame.len(), "Frame sent"),
                    Ok(Err(e)) => {
                        debug!(peer = %identity, error = %e, "Write failed");
                        break;
                    }
                    Err(_) => {
                        warn!(peer = %identity, "Write timed out");
                        break;
                    }
                }
            }
            Outgoing::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }

    let _ = writer.shutdown().await;
}
