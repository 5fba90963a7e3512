//! Caller-side handles for in-flight requests.
//!
//! A [`ResponseStream`] yields every message routed to one message ID in
//! arrival order and ends after the terminal response. [`PendingResponse`]
//! wraps a stream for operations that complete with a single message.

use std::sync::Arc;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::OwnedRwLockReadGuard;
use tokio::time::Instant;
use tracing::trace;

use crate::error::{LdapError, Result};
use crate::protocol::dispatcher::{Dispatcher, ResponseReceiver};
use crate::protocol::message::LdapMessage;

/// Outcome of a non-blocking check for the next fragment
#[derive(Debug)]
pub enum FragmentPoll {
    /// A message or failure is available
    Ready(Result<LdapMessage>),
    /// Nothing has arrived yet
    Pending,
    /// The terminal response was already delivered
    Finished,
}

/// Ordered responses for one message ID.
///
/// While the stream is live it holds a shared permit on the connection, so
/// binds, StartTLS and unbind wait until it finishes or is dropped. Dropping
/// an unfinished stream forgets the request locally; late responses are
/// discarded. Use [`Connection::abandon`](crate::service::Connection::abandon)
/// to also tell the server.
pub struct ResponseStream {
    message_id: i32,
    receiver: ResponseReceiver,
    dispatcher: Arc<Dispatcher>,
    deadline: Option<Instant>,
    finished: bool,
    permit: Option<OwnedRwLockReadGuard<()>>,
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("message_id", &self.message_id)
            .field("deadline", &self.deadline)
            .field("finished", &self.finished)
            .finish()
    }
}

impl ResponseStream {
    pub(crate) fn new(
        message_id: i32,
        receiver: ResponseReceiver,
        dispatcher: Arc<Dispatcher>,
        deadline: Option<Instant>,
        permit: Option<OwnedRwLockReadGuard<()>>,
    ) -> Self {
        Self {
            message_id,
            receiver,
            dispatcher,
            deadline,
            finished: false,
            permit,
        }
    }

    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Wait for the next message.
    ///
    /// Returns `None` once the terminal response (or a failure) has been
    /// yielded. A missed deadline yields [`LdapError::Timeout`].
    pub async fn next(&mut self) -> Option<Result<LdapMessage>> {
        if self.finished {
            return None;
        }

        let received = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                Ok(received) => received,
                Err(_) => return Some(self.time_out()),
            },
            None => self.receiver.recv().await,
        };
        Some(self.accept(received))
    }

    /// Check for the next message without waiting
    pub fn try_next(&mut self) -> FragmentPoll {
        if self.finished {
            return FragmentPoll::Finished;
        }

        match self.receiver.try_recv() {
            Ok(item) => FragmentPoll::Ready(self.accept(Some(item))),
            Err(TryRecvError::Disconnected) => FragmentPoll::Ready(self.accept(None)),
            Err(TryRecvError::Empty) => match self.deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    FragmentPoll::Ready(self.time_out())
                }
                _ => FragmentPoll::Pending,
            },
        }
    }

    /// Skip fragments and return the terminal response
    pub async fn terminal(&mut self) -> Result<LdapMessage> {
        while let Some(item) = self.next().await {
            let msg = item?;
            if !msg.op.is_fragment() {
                return Ok(msg);
            }
            trace!(
                message_id = self.message_id,
                op = msg.op.name(),
                "Skipping fragment while waiting for terminal response"
            );
        }
        Err(LdapError::ConnectionClosed)
    }

    /// Every remaining message, ending with the terminal response
    pub async fn collect(mut self) -> Result<Vec<LdapMessage>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }

    fn accept(&mut self, received: Option<Result<LdapMessage>>) -> Result<LdapMessage> {
        match received {
            Some(Ok(msg)) => {
                if !msg.op.is_fragment() {
                    self.finish();
                }
                Ok(msg)
            }
            Some(Err(e)) => {
                self.finish();
                Err(e)
            }
            // Sink dropped without a terminal response
            None => {
                self.finish();
                Err(LdapError::ConnectionClosed)
            }
        }
    }

    fn time_out(&mut self) -> Result<LdapMessage> {
        // The sweeper may already have failed the entry; either way it is gone
        let _ = self.dispatcher.expire(self.message_id);
        self.finish();
        Err(LdapError::Timeout)
    }

    fn finish(&mut self) {
        self.finished = true;
        self.permit = None;
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if !self.finished {
            self.dispatcher.release(self.message_id);
        }
    }
}

/// Handle for a request sent with [`Connection::begin`](crate::service::Connection::begin).
///
/// The request is already on the wire; the response is collected later with
/// [`wait`](Self::wait) or checked with [`try_result`](Self::try_result).
#[derive(Debug)]
pub struct PendingResponse {
    stream: ResponseStream,
}

impl PendingResponse {
    pub(crate) fn new(stream: ResponseStream) -> Self {
        Self { stream }
    }

    pub fn message_id(&self) -> i32 {
        self.stream.message_id()
    }

    /// Wait for the terminal response
    pub async fn wait(mut self) -> Result<LdapMessage> {
        self.stream.terminal().await
    }

    /// The terminal response if it has arrived; fragments are skipped
    pub fn try_result(&mut self) -> Option<Result<LdapMessage>> {
        loop {
            match self.stream.try_next() {
                FragmentPoll::Ready(Ok(msg)) if msg.op.is_fragment() => continue,
                FragmentPoll::Ready(result) => return Some(result),
                FragmentPoll::Pending => return None,
                FragmentPoll::Finished => return Some(Err(LdapError::ConnectionClosed)),
            }
        }
    }

    /// Convert into the underlying stream to observe fragments
    pub fn into_stream(self) -> ResponseStream {
        self.stream
    }
}
