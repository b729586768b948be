//! One subscriber connection of a [`Broad`] hub.
//!
//! A [`BroadClient`] owns the sending half of a bounded channel; the
//! receiving half is a [`ClientStream`] that becomes the HTTP response body.
//! Dropping the body (the browser went away) cancels the client's signal,
//! and the signal is what removes the client from its registry.

use bytes::Bytes;
use futures_util::Stream;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::AbortHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use crate::broad::{Broad, BroadInner};
use crate::error::AfrError;

pub type ClientId = u64;

/// Messages a client may fall behind by before deliveries to it fail.
pub(crate) const SINK_CAPACITY: usize = 16;

/// Delivery behavior of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    /// Gets exactly one message as the whole response body, then closes.
    OneShot,
    /// Gets every message as an event-stream event; stays open.
    Stream,
}

pub struct BroadClient {
    id: ClientId,
    kind: ClientKind,
    sink: Mutex<Option<mpsc::Sender<Bytes>>>,
    signal: CancellationToken,
    listener: Mutex<Option<AbortHandle>>,
    delivered: AtomicBool,
    deinited: AtomicBool,
    owner: Weak<BroadInner>,
}

impl BroadClient {
    /// Creates a client and registers it with `broad`.
    ///
    /// Fails with [`AfrError::Cancelled`] if `signal` has already fired.
    /// Cancelling `signal` later deinitializes the client exactly once.
    pub fn new(
        broad: &Broad,
        kind: ClientKind,
        signal: CancellationToken,
    ) -> Result<(Arc<BroadClient>, ClientStream), AfrError> {
        if signal.is_cancelled() {
            return Err(AfrError::Cancelled);
        }

        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        let client = Arc::new(BroadClient {
            id: broad.next_id(),
            kind,
            sink: Mutex::new(Some(tx)),
            signal: signal.clone(),
            listener: Mutex::new(None),
            delivered: AtomicBool::new(false),
            deinited: AtomicBool::new(false),
            owner: broad.downgrade(),
        });
        broad.add(Arc::clone(&client))?;

        let weak = Arc::downgrade(&client);
        let cancelled = signal.clone();
        let listener = tokio::spawn(async move {
            cancelled.cancelled().await;
            if let Some(client) = weak.upgrade() {
                debug!(client = client.id, "Client signal cancelled");
                client.deinit();
            }
        });
        *lock(&client.listener) = Some(listener.abort_handle());

        let stream = ClientStream {
            rx,
            _guard: signal.drop_guard(),
        };
        Ok((client, stream))
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.sink).is_none()
    }

    pub(crate) fn owned_by(&self, owner: &Weak<BroadInner>) -> bool {
        self.owner.ptr_eq(owner)
    }

    /// Writes raw bytes to the transport without waiting. A sink with no
    /// room left means the peer stopped reading, and the write fails.
    pub fn write(&self, chunk: Bytes) -> Result<(), AfrError> {
        if self.signal.is_cancelled() {
            return Err(AfrError::ClientClosed);
        }
        let guard = lock(&self.sink);
        let sink = guard.as_ref().ok_or(AfrError::ClientClosed)?;
        sink.try_send(chunk).map_err(|err| match err {
            TrySendError::Full(_) => AfrError::ClientStalled(SINK_CAPACITY),
            TrySendError::Closed(_) => AfrError::ClientClosed,
        })
    }

    /// Delivers one serialized message according to the client kind.
    /// A one-shot client deinitializes right after its single delivery.
    pub fn write_message(&self, json: &Bytes) -> Result<(), AfrError> {
        match self.kind {
            ClientKind::Stream => self.write(json.clone()),
            ClientKind::OneShot => {
                if self.delivered.swap(true, Ordering::AcqRel) {
                    return Err(AfrError::ClientClosed);
                }
                let written = self.write(json.clone());
                self.deinit();
                written
            }
        }
    }

    /// Detaches the cancellation listener, leaves the registry and closes
    /// the sink. Only the first call has any effect.
    pub fn deinit(&self) {
        if self.deinited.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(listener) = lock(&self.listener).take() {
            listener.abort();
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.forget(self.id);
        }
        if self.close_sink() {
            debug!(client = self.id, "Client closed");
        }
    }

    /// True only for the call that actually closed the sink.
    fn close_sink(&self) -> bool {
        lock(&self.sink).take().is_some()
    }
}

impl std::fmt::Debug for BroadClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadClient")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Response body of a client. Ends when the client closes its sink;
/// dropping it cancels the client's signal.
pub struct ClientStream {
    rx: mpsc::Receiver<Bytes>,
    _guard: DropGuard,
}

impl std::fmt::Debug for ClientStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStream").finish_non_exhaustive()
    }
}

impl ClientStream {
    /// Makes further writes fail without cancelling the signal, the way a
    /// broken connection looks before the server notices it is gone.
    #[cfg(test)]
    pub(crate) fn sever(&mut self) {
        self.rx.close();
    }
}

impl Stream for ClientStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|chunk| chunk.map(Ok))
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn already_cancelled_signal_fails_fast() {
        let broad = Broad::default();
        let signal = CancellationToken::new();
        signal.cancel();

        let err = BroadClient::new(&broad, ClientKind::Stream, signal).unwrap_err();
        assert!(matches!(err, AfrError::Cancelled));
        assert!(broad.is_empty());
    }

    #[tokio::test]
    async fn one_shot_delivers_exactly_once() {
        let broad = Broad::default();
        let (client, mut stream) =
            BroadClient::new(&broad, ClientKind::OneShot, CancellationToken::new()).unwrap();

        let json = Bytes::from_static(br#"{"type":"change"}"#);
        client.write_message(&json).unwrap();
        assert!(client.write_message(&json).is_err());
        assert!(client.is_closed());

        assert_eq!(stream.next().await.unwrap().unwrap(), json);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn deinit_is_idempotent() {
        let broad = Broad::default();
        let (client, _stream) =
            BroadClient::new(&broad, ClientKind::Stream, CancellationToken::new()).unwrap();

        client.deinit();
        client.deinit();
        assert!(client.is_closed());
        assert!(broad.is_empty());
        assert!(client.write(Bytes::from_static(b"x")).is_err());
    }

    #[tokio::test]
    async fn reader_that_falls_behind_fails_the_write() {
        let broad = Broad::default();
        let (client, mut stream) =
            BroadClient::new(&broad, ClientKind::Stream, CancellationToken::new()).unwrap();

        let json = Bytes::from_static(br#"{"type":"change"}"#);
        for _ in 0..SINK_CAPACITY {
            client.write_message(&json).unwrap();
        }
        assert!(matches!(
            client.write_message(&json),
            Err(AfrError::ClientStalled(SINK_CAPACITY))
        ));

        // Draining makes room again.
        assert_eq!(stream.next().await.unwrap().unwrap(), json);
        assert!(client.write_message(&json).is_ok());
    }
}
