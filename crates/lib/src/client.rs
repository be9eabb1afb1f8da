//! Command-channel client: strict request-reply with correlated transactions.

use crate::config::Config;
use crate::error::{ClientError, Result};
use crate::protocol::{self, Decoded, GatewayRequest, GatewayResponse};
use crate::transaction::{TransactionRegistry, WaitHandle};
use crate::transport::{self, MessageLink};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Client for the gateway's request-reply management channel.
///
/// The link enforces strict alternation (one outstanding exchange at a time),
/// so `send` holds an exclusive section around the whole write-then-await
/// round trip: a second caller's request is not written until the first's
/// round trip completes. This serialization is the backpressure point the
/// channel discipline requires.
pub struct GatewayClient {
    link: Mutex<Box<dyn MessageLink>>,
    registry: TransactionRegistry,
    /// Instance discriminator baked into every transaction id, so two clients
    /// sharing a connection cannot collide even with interleaved counters.
    instance: String,
    counter: AtomicU64,
    timeout: Duration,
}

impl GatewayClient {
    /// Dial the management endpoint from config.
    pub async fn connect(config: &Config) -> Result<Self> {
        let link = transport::connect(&config.command_endpoint).await?;
        Ok(Self::over(link, config.command_timeout()))
    }

    /// Dial the admin/monitor endpoint from config.
    pub async fn connect_admin(config: &Config) -> Result<Self> {
        let link = transport::connect(&config.admin_endpoint).await?;
        Ok(Self::over(link, config.command_timeout()))
    }

    /// Wrap an already-established link (tests inject in-memory links here).
    pub fn over(link: impl MessageLink + 'static, timeout: Duration) -> Self {
        let instance = uuid::Uuid::new_v4().simple().to_string();
        Self {
            link: Mutex::new(Box::new(link)),
            registry: TransactionRegistry::new(),
            instance: instance[..8].to_string(),
            counter: AtomicU64::new(1),
            timeout,
        }
    }

    fn next_transaction_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.instance, n)
    }

    /// Issue one request with the configured timeout.
    pub async fn send(&self, method: &str, payload: Map<String, Value>) -> Result<GatewayResponse> {
        self.send_with_timeout(method, payload, self.timeout).await
    }

    /// Issue one request and wait for its correlated reply.
    ///
    /// Consumes exactly one round-trip slot on the shared link. The reply is
    /// returned whatever its status; only transport-level failures, protocol
    /// violations, and deadline expiry are error cases. A write failure
    /// unregisters the transaction, so a failed call leaves no residue.
    pub async fn send_with_timeout(
        &self,
        method: &str,
        payload: Map<String, Value>,
        timeout: Duration,
    ) -> Result<GatewayResponse> {
        let mut link = self.link.lock().await;

        let id = self.next_transaction_id();
        let request = GatewayRequest::new(method, &id, payload);
        let frame = protocol::encode(&request)?;
        let mut handle = self.registry.register(&id, timeout)?;
        if let Err(e) = link.send(&frame).await {
            self.registry.abandon(&id);
            return Err(ClientError::Connection(format!("writing request: {e}")));
        }
        log::debug!("sent {} (transaction {})", method, id);
        self.drive(&mut **link, &mut handle).await
    }

    /// Pump the read side until `handle` resolves, its deadline passes, or
    /// the link fails. Replies for other pending transactions resolve their
    /// own slots; uncorrelated frames are discarded with a log line.
    async fn drive(
        &self,
        link: &mut dyn MessageLink,
        handle: &mut WaitHandle,
    ) -> Result<GatewayResponse> {
        loop {
            if let Some(response) = handle.try_resolved() {
                return Ok(response);
            }
            let remaining = handle.deadline().saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.registry.await_resolution(handle).await;
            }
            match tokio::time::timeout(remaining, link.recv()).await {
                Err(_elapsed) => return self.registry.await_resolution(handle).await,
                Ok(Ok(frame)) => {
                    match protocol::decode(&frame, |id| self.registry.is_pending(id)) {
                        Ok(Decoded::Response(response)) => self.registry.resolve(response),
                        Ok(Decoded::Event(event)) => {
                            log::debug!(
                                "discarding uncorrelated {} frame on the command channel",
                                event.kind
                            );
                        }
                        Err(error) => {
                            self.registry.abandon(handle.id());
                            return Err(error);
                        }
                    }
                }
                Ok(Err(error)) => {
                    self.registry.abandon(handle.id());
                    return Err(ClientError::Connection(format!("reading reply: {error}")));
                }
            }
        }
    }

    /// Fetch the gateway's build and capability summary via `info`.
    pub async fn server_info(&self) -> Result<Map<String, Value>> {
        self.send("info", Map::new()).await?.into_payload()
    }

    /// Allocate a session via `create` and return its id.
    pub async fn create_session(&self) -> Result<u64> {
        let payload = self.send("create", Map::new()).await?.into_payload()?;
        payload
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| ClientError::Protocol("create reply without a session id".to_string()))
    }

    /// Tear down a session via `destroy`.
    pub async fn destroy_session(&self, session_id: u64) -> Result<()> {
        let mut payload = Map::new();
        payload.insert("session_id".to_string(), Value::from(session_id));
        self.send("destroy", payload).await?.into_payload()?;
        Ok(())
    }

    /// Refresh a session's liveness timer via `keepalive`; the gateway acks.
    pub async fn keepalive(&self, session_id: u64) -> Result<()> {
        let mut payload = Map::new();
        payload.insert("session_id".to_string(), Value::from(session_id));
        self.send("keepalive", payload).await?.into_payload()?;
        Ok(())
    }
}
