//! Outbound frame queue shared by everything that writes to one connection.
//!
//! Payloads go through a bounded channel. A close request bypasses it: it is
//! recorded in a shared slot and wakes the receiver directly, so asking for a
//! close never waits on a full queue.

use std::sync::Arc;

use duplex_core::{CloseCode, EncodeError, Message, MessageCodec};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A frame handed to the transport's write task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// An encoded message.
    Payload(Vec<u8>),
    /// Close the connection with a status code and reason.
    Close {
        /// Close status code.
        code: CloseCode,
        /// Human-readable reason.
        reason: String,
    },
}

/// Failure to queue an outbound frame.
#[derive(Debug, Error)]
pub enum TransmitError {
    /// The message could not be encoded.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// The write task is gone or the connection is closing.
    #[error("connection closed")]
    Closed,
    /// The close code is reserved for local reporting.
    #[error("close code {0} cannot be sent")]
    ReservedCode(CloseCode),
}

#[derive(Default)]
struct CloseSignal {
    requested: Mutex<Option<(CloseCode, String)>>,
    fired: CancellationToken,
}

/// Sending half of a connection's outbound queue.
#[derive(Clone)]
pub struct FrameSender {
    frames: mpsc::Sender<Outbound>,
    close: Arc<CloseSignal>,
}

/// Receiving half of a connection's outbound queue, owned by the write task.
pub struct FrameReceiver {
    frames: mpsc::Receiver<Outbound>,
    close: Arc<CloseSignal>,
    done: bool,
}

/// Create an outbound queue holding up to `capacity` payloads.
pub fn channel(capacity: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let close = Arc::new(CloseSignal::default());
    (
        FrameSender {
            frames: tx,
            close: Arc::clone(&close),
        },
        FrameReceiver {
            frames: rx,
            close,
            done: false,
        },
    )
}

impl FrameReceiver {
    /// Next frame to write.
    ///
    /// Once a close is requested, payloads already queued are drained and the
    /// close frame follows; after that the receiver yields `None`.
    pub async fn recv(&mut self) -> Option<Outbound> {
        if self.done {
            return None;
        }
        let queued = tokio::select! {
            biased;
            () = self.close.fired.cancelled() => None,
            frame = self.frames.recv() => Some(frame),
        };
        match queued {
            Some(frame) => frame,
            None => self.after_close(),
        }
    }

    /// Non-blocking [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<Outbound> {
        if self.done {
            return None;
        }
        if self.close.fired.is_cancelled() {
            return self.after_close();
        }
        self.frames.try_recv().ok()
    }

    fn after_close(&mut self) -> Option<Outbound> {
        if let Ok(frame) = self.frames.try_recv() {
            return Some(frame);
        }
        self.done = true;
        self.frames.close();
        self.close
            .requested
            .lock()
            .take()
            .map(|(code, reason)| Outbound::Close { code, reason })
    }
}

/// Encodes messages and queues them on a connection's outbound channel.
#[derive(Clone)]
pub struct Transmitter {
    sender: FrameSender,
    codec: Arc<dyn MessageCodec>,
}

impl Transmitter {
    /// Create a transmitter over an outbound queue.
    pub fn new(sender: FrameSender, codec: Arc<dyn MessageCodec>) -> Self {
        Self { sender, codec }
    }

    /// Encode and queue a message. Waits while the queue is full.
    pub async fn send_message(&self, message: &Message) -> Result<(), TransmitError> {
        if self.is_closing() {
            return Err(TransmitError::Closed);
        }
        let bytes = self.codec.encode(message)?;
        self.sender
            .frames
            .send(Outbound::Payload(bytes))
            .await
            .map_err(|_| TransmitError::Closed)
    }

    /// Ask the write task to close the connection. Never waits.
    ///
    /// The reason is truncated to fit a close frame. Only the first request
    /// takes effect; later ones succeed without changing it.
    pub fn close(&self, code: CloseCode, reason: &str) -> Result<(), TransmitError> {
        if !code.is_sendable() {
            return Err(TransmitError::ReservedCode(code));
        }
        if self.sender.frames.is_closed() {
            return Err(TransmitError::Closed);
        }
        let mut requested = self.sender.close.requested.lock();
        if requested.is_none() && !self.sender.close.fired.is_cancelled() {
            *requested = Some((code, CloseCode::truncate_reason(reason).to_owned()));
            self.sender.close.fired.cancel();
        }
        Ok(())
    }

    /// Whether a close has been requested.
    pub fn is_closing(&self) -> bool {
        self.sender.close.fired.is_cancelled()
    }

    /// Whether the write task has stopped accepting frames.
    pub fn is_closed(&self) -> bool {
        self.sender.frames.is_closed()
    }
}
