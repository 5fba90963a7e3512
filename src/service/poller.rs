//! Fan-out of a long-lived streaming operation (persistent search, sync
//! repl and similar) to any number of listeners.
//!
//! The polling loop runs only while at least one [`Subscription`] exists: it
//! starts when the first listener subscribes and stops when the last one is
//! dropped. Between checks it sleeps for the configured poll interval.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{constants, LdapError, Result};
use crate::protocol::message::LdapMessage;
use crate::service::response::{FragmentPoll, ResponseStream};

/// One event delivered to every subscriber
#[derive(Debug, Clone)]
pub enum PollEvent {
    /// A fragment (entry, reference or intermediate response)
    Entry(LdapMessage),
    /// The terminal response; no further events follow
    Done(LdapMessage),
    /// The operation failed; no further events follow
    Error(Arc<LdapError>),
}

impl PollEvent {
    /// `Done` and `Error` end the stream
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollEvent::Entry(_))
    }
}

#[derive(Default)]
struct LoopControl {
    subscribers: usize,
    cancel: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

struct PollerShared {
    stream: Arc<AsyncMutex<ResponseStream>>,
    interval: Duration,
    control: Mutex<LoopControl>,
    starts: AtomicUsize,
    /// Set once the terminal event has been broadcast
    terminated: AtomicBool,
}

impl PollerShared {
    fn unsubscribe(&self) {
        let Ok(mut control) = self.control.lock() else {
            return;
        };
        control.subscribers = control.subscribers.saturating_sub(1);
        if control.subscribers == 0 {
            if let Some(cancel) = control.cancel.take() {
                cancel.cancel();
                debug!("Last subscriber left; polling stopped");
            }
            control.handle = None;
        }
    }
}

/// Polls one response stream and broadcasts what arrives.
///
/// Only the poller and its running loop hold the broadcast sender, so
/// dropping the poller ends every subscription.
pub struct EventPoller {
    shared: Arc<PollerShared>,
    events: broadcast::Sender<PollEvent>,
}

impl std::fmt::Debug for EventPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPoller")
            .field("subscribers", &self.subscriber_count())
            .field("running", &self.is_running())
            .finish()
    }
}

impl EventPoller {
    pub fn new(stream: ResponseStream, interval: Duration, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            shared: Arc::new(PollerShared {
                stream: Arc::new(AsyncMutex::new(stream)),
                interval: interval.max(Duration::from_millis(1)),
                control: Mutex::new(LoopControl::default()),
                starts: AtomicUsize::new(0),
                terminated: AtomicBool::new(false),
            }),
            events,
        }
    }

    /// Register a listener, starting the polling loop if it is the first.
    ///
    /// A listener registered after the terminal event receives nothing.
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self) -> Result<Subscription> {
        let mut control = self
            .shared
            .control
            .lock()
            .map_err(|_| LdapError::Custom(constants::ERR_STATE_LOCK.to_string()))?;

        // Receiver first so the new listener sees the loop's first event
        let receiver = self.events.subscribe();
        let finished = self.shared.terminated.load(Ordering::SeqCst);
        control.subscribers += 1;

        if control.subscribers == 1 && !finished {
            let cancel = CancellationToken::new();
            control.handle = Some(tokio::spawn(poll_loop(
                Arc::clone(&self.shared),
                self.events.clone(),
                cancel.clone(),
            )));
            control.cancel = Some(cancel);
            let starts = self.shared.starts.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(starts, "First subscriber; polling started");
        }

        Ok(Subscription {
            receiver,
            poller: Arc::clone(&self.shared),
            finished,
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared
            .control
            .lock()
            .map(|c| c.subscribers)
            .unwrap_or(0)
    }

    /// Whether the polling loop is currently running
    pub fn is_running(&self) -> bool {
        self.shared
            .control
            .lock()
            .map(|c| c.handle.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }

    /// How many times the polling loop has been started
    pub fn start_count(&self) -> usize {
        self.shared.starts.load(Ordering::Relaxed)
    }

    /// Message ID of the polled operation
    pub async fn message_id(&self) -> i32 {
        self.shared.stream.lock().await.message_id()
    }
}

impl Drop for EventPoller {
    fn drop(&mut self) {
        if let Ok(mut control) = self.shared.control.lock() {
            if let Some(cancel) = control.cancel.take() {
                cancel.cancel();
            }
        }
    }
}

/// A registered listener; dropping it unsubscribes
pub struct Subscription {
    receiver: broadcast::Receiver<PollEvent>,
    /// Keeps the subscriber count; holds no sender
    poller: Arc<PollerShared>,
    finished: bool,
}

impl Subscription {
    /// Next event, or `None` after the terminal event or once the poller is gone.
    ///
    /// A listener that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<PollEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(self.observe(event)),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Subscriber lagged; events dropped");
                }
                Err(RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<PollEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(self.observe(event)),
                Err(TryRecvError::Lagged(missed)) => {
                    warn!(missed, "Subscriber lagged; events dropped");
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Whether this listener has seen the last event it will get
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn observe(&mut self, event: PollEvent) -> PollEvent {
        if event.is_terminal() {
            self.finished = true;
        }
        event
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.poller.unsubscribe();
    }
}

async fn poll_loop(
    shared: Arc<PollerShared>,
    events: broadcast::Sender<PollEvent>,
    cancel: CancellationToken,
) {
    loop {
        {
            let mut stream = shared.stream.lock().await;
            loop {
                let event = match stream.try_next() {
                    FragmentPoll::Ready(Ok(msg)) if msg.op.is_fragment() => PollEvent::Entry(msg),
                    FragmentPoll::Ready(Ok(msg)) => PollEvent::Done(msg),
                    FragmentPoll::Ready(Err(e)) => PollEvent::Error(Arc::new(e)),
                    FragmentPoll::Pending => break,
                    FragmentPoll::Finished => {
                        shared.terminated.store(true, Ordering::SeqCst);
                        debug!(message_id = stream.message_id(), "Polled operation finished");
                        return;
                    }
                };
                if event.is_terminal() {
                    shared.terminated.store(true, Ordering::SeqCst);
                }
                // No receivers is not an error
                let _ = events.send(event);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(shared.interval) => {}
        }
    }
}
