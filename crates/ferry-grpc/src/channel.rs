//! Ordered message channels used by the streaming sessions.
//!
//! The three stream shapes are built from two halves:
//!
//! - [`Inbound`] reads messages until an explicit end of stream
//! - [`Outbound`] sends messages until closed, backed by a bounded `mpsc`
//!
//! A send stream is an `Outbound` whose receiver is handed to tonic as the
//! response body. A receive stream is an `Inbound` over the request body. A
//! duplex stream is one of each, driven by independent tasks. On the calling
//! side, [`ClientStreamCall`] pairs an `Outbound` with the in-flight call so
//! closing the requests yields the single response.

use std::future::Future;
use std::pin::Pin;

use ferry::{TransferError, TransferResult};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::{Response, Status};

use crate::status::{from_request_status, from_status};

/// Boxed response stream handed back to tonic.
pub type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

/// Receiving half of a stream.
pub struct Inbound<S> {
    stream: S,
    ended: bool,
    received: u64,
}

impl<S> std::fmt::Debug for Inbound<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound")
            .field("ended", &self.ended)
            .field("received", &self.received)
            .finish_non_exhaustive()
    }
}

impl<S, T> Inbound<S>
where
    S: Stream<Item = Result<T, Status>> + Unpin,
{
    /// Wrap a message stream, e.g. a `tonic::Streaming` request body.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            ended: false,
            received: 0,
        }
    }

    /// Wait for the next message.
    ///
    /// Returns `Ok(None)` once the peer has ended the stream, and keeps
    /// returning it afterwards. A transport failure is terminal; see
    /// [`from_request_status`] for how it is classified.
    pub async fn receive(&mut self) -> TransferResult<Option<T>> {
        if self.ended {
            return Ok(None);
        }
        match self.stream.next().await {
            Some(Ok(msg)) => {
                self.received += 1;
                Ok(Some(msg))
            }
            Some(Err(status)) => {
                self.ended = true;
                Err(from_request_status(status))
            }
            None => {
                self.ended = true;
                Ok(None)
            }
        }
    }

    /// Messages received so far.
    pub fn received(&self) -> u64 {
        self.received
    }
}

/// Sending half of a stream.
///
/// Dropping every clone closes the stream; the peer then observes end of
/// stream after draining what was already sent.
pub struct Outbound<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for Outbound<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Outbound<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("closed", &self.tx.is_closed())
            .finish_non_exhaustive()
    }
}

/// Create a bounded outbound stream.
pub fn outbound<T>(capacity: usize) -> (Outbound<T>, ReceiverStream<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Outbound { tx }, ReceiverStream::new(rx))
}

impl<T> Outbound<T> {
    /// Enqueue a message, waiting for buffer space.
    ///
    /// Fails with [`TransferError::ChannelClosed`] once the receiving side is
    /// gone.
    pub async fn send(&self, item: T) -> TransferResult<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| TransferError::ChannelClosed)
    }

    /// Whether the receiving side has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Close this handle. The stream ends once every clone is closed.
    pub fn close(self) {}
}

/// Outbound half of a server response stream.
pub type ResponseSink<T> = Outbound<Result<T, Status>>;

impl<T> Outbound<Result<T, Status>> {
    /// Send a successful message.
    pub async fn emit(&self, msg: T) -> TransferResult<()> {
        self.send(Ok(msg)).await
    }

    /// Terminate the stream with an error status.
    ///
    /// Best effort: if the peer is already gone there is nobody to tell.
    pub async fn abort(&self, status: Status) {
        if self.send(Err(status)).await.is_err() {
            tracing::debug!("peer gone before error status could be delivered");
        }
    }
}

/// A client-streaming call in flight.
///
/// Requests go out through [`send`](Self::send); the call's single response
/// is only available after [`close_and_await_result`](Self::close_and_await_result)
/// has ended the request stream.
pub struct ClientStreamCall<Req, Resp> {
    requests: Outbound<Req>,
    response: JoinHandle<Result<Response<Resp>, Status>>,
}

impl<Req, Resp> std::fmt::Debug for ClientStreamCall<Req, Resp> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStreamCall")
            .field("requests", &self.requests)
            .finish_non_exhaustive()
    }
}

impl<Req, Resp> ClientStreamCall<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Start `call` with a fresh request stream of the given capacity.
    pub fn start<F, Fut>(capacity: usize, call: F) -> Self
    where
        F: FnOnce(ReceiverStream<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Resp>, Status>> + Send + 'static,
    {
        let (requests, stream) = outbound(capacity);
        let response = tokio::spawn(call(stream));
        Self { requests, response }
    }

    /// Send the next request message.
    pub async fn send(&self, msg: Req) -> TransferResult<()> {
        self.requests.send(msg).await
    }

    /// End the request stream and wait for the peer's response.
    pub async fn close_and_await_result(self) -> TransferResult<Resp> {
        let Self { requests, response } = self;
        requests.close();
        let result = response
            .await
            .map_err(|e| TransferError::Internal(format!("call task failed: {e}")))?;
        result.map(Response::into_inner).map_err(from_status)
    }
}
