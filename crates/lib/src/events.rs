//! Event-channel listener: broadcast subscription with a bounded poll loop.
//!
//! The gateway publishes uncorrelated notifications on a separate endpoint.
//! One listener owns one subscription link and fans decoded events out to any
//! number of subscribers, in arrival order. Stopping is cooperative: the loop
//! re-checks its flag after every bounded receive, so `stop()` is observed
//! within at most one poll interval.

use crate::config::Config;
use crate::error::Result;
use crate::protocol::{self, Decoded, GatewayEvent};
use crate::transport::{self, MessageLink};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Fan-out buffer per subscriber; a slow subscriber lags rather than
/// blocking the poll loop.
const SUBSCRIBER_BUFFER: usize = 64;

/// Listener state as observed through [`ListenerHandle::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerStatus {
    Running,
    /// Terminal. `error` is set when a hard link failure ended the loop.
    Stopped { error: Option<String> },
}

/// Outcome of one poll-loop iteration.
enum Poll {
    Delivered(GatewayEvent),
    Idle,
    Fatal(String),
}

/// A not-yet-started subscription to the gateway's event channel.
///
/// `start` consumes the listener; once the returned handle stops, the stream
/// is over for good and a new listener must be constructed to subscribe
/// again.
pub struct EventListener {
    endpoint: String,
    poll_interval: Duration,
}

impl EventListener {
    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.event_endpoint, config.event_poll())
    }

    pub fn new(endpoint: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            poll_interval,
        }
    }

    /// Open the subscription link and start the poll loop.
    ///
    /// `filter` is an event-kind prefix; the empty filter receives every
    /// event. A dial failure is returned directly and nothing is spawned.
    pub async fn start(self, filter: &str) -> Result<ListenerHandle> {
        let link = transport::connect(&self.endpoint).await?;
        let (events_tx, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        let (status_tx, status_rx) = watch::channel(ListenerStatus::Running);
        let running = Arc::new(AtomicBool::new(true));
        let delivered = Arc::new(AtomicU64::new(0));

        log::info!(
            "event listener started on {} (filter {:?})",
            self.endpoint,
            filter
        );
        let poll_loop = PollLoop {
            link: Box::new(link),
            filter: filter.to_string(),
            poll_interval: self.poll_interval,
            running: running.clone(),
            delivered: delivered.clone(),
            events_tx: events_tx.clone(),
            status_tx,
        };
        let task = tokio::spawn(poll_loop.run());

        Ok(ListenerHandle {
            running,
            delivered,
            events_tx,
            status_rx,
            task,
        })
    }
}

struct PollLoop {
    link: Box<dyn MessageLink>,
    filter: String,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    delivered: Arc<AtomicU64>,
    events_tx: broadcast::Sender<GatewayEvent>,
    status_tx: watch::Sender<ListenerStatus>,
}

impl PollLoop {
    async fn run(mut self) {
        let mut error = None;
        while self.running.load(Ordering::SeqCst) {
            match self.poll_once().await {
                Poll::Delivered(event) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    // No subscriber right now is fine; the next one catches
                    // the events from its subscribe() onwards.
                    let _ = self.events_tx.send(event);
                }
                Poll::Idle => {}
                Poll::Fatal(reason) => {
                    log::warn!("event link failed, stopping listener: {}", reason);
                    error = Some(reason);
                    break;
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        let _ = self.status_tx.send(ListenerStatus::Stopped { error });
        log::info!("event poll loop stopped");
    }

    /// One bounded receive: an event to deliver, an idle tick, or a fatal
    /// link failure. Undecodable and filtered-out frames are idle ticks; a
    /// single bad frame never ends the stream.
    async fn poll_once(&mut self) -> Poll {
        match tokio::time::timeout(self.poll_interval, self.link.recv()).await {
            Err(_elapsed) => Poll::Idle,
            Ok(Err(error)) => Poll::Fatal(error.to_string()),
            Ok(Ok(frame)) => match protocol::decode(&frame, |_| false) {
                Ok(Decoded::Event(event)) if event.kind.starts_with(&self.filter) => {
                    Poll::Delivered(event)
                }
                Ok(Decoded::Event(event)) => {
                    log::debug!("event {} filtered out", event.kind);
                    Poll::Idle
                }
                // The always-false pending predicate never yields a response.
                Ok(Decoded::Response(_)) => Poll::Idle,
                Err(error) => {
                    log::warn!("skipping undecodable event: {}", error);
                    Poll::Idle
                }
            },
        }
    }
}

/// Running listener: subscribe, observe status, stop.
pub struct ListenerHandle {
    running: Arc<AtomicBool>,
    delivered: Arc<AtomicU64>,
    events_tx: broadcast::Sender<GatewayEvent>,
    status_rx: watch::Receiver<ListenerStatus>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// New subscription receiving every event delivered from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events_tx.subscribe()
    }

    /// Request loop exit; observed within at most one poll interval.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Watch for the terminal status (and its error, if any). A fatal link
    /// failure appears here exactly once; the listener never reconnects.
    pub fn status(&self) -> watch::Receiver<ListenerStatus> {
        self.status_rx.clone()
    }

    /// Events delivered to subscribers since start.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Wait for the poll loop to finish (after `stop` or a fatal error).
    pub async fn join(self) {
        let _ = self.task.await;
    }
}
