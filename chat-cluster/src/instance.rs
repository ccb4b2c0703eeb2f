// ABOUTME: A running chat instance: one dispatch loop owning all per-instance state,
// ABOUTME: fed by client sessions, the shared bus and the heartbeat timer

use arc_swap::ArcSwap;
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::InstanceConfig;
use crate::heartbeat::{Backoff, HeartbeatMonitor};
use crate::metrics::METRICS;
use crate::protocol::{ChatMessage, ClientEvent, OutgoingMessage, PresenceNotice, ServerEvent};
use crate::registry::{ConnectionHandle, ConnectionId};
use crate::router::{Inbound, Router};
use crate::session::{Negotiation, SessionLifecycle};
use crate::store::BusStream;
use crate::{Error, Keyspace, PresenceStore, SharedStore};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Snapshot of an instance's health, refreshed after every dispatched event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub instance_id: String,
    /// The last store operation failed and no heartbeat has succeeded since.
    pub degraded: bool,
    pub live_sessions: usize,
    pub pending_connections: usize,
    pub last_error: Option<String>,
}

enum InstanceEvent {
    Connect(ConnectionHandle),
    SetUsername {
        connection_id: ConnectionId,
        username: String,
    },
    SendMessage {
        connection_id: ConnectionId,
        message: OutgoingMessage,
    },
    Disconnect {
        connection_id: ConnectionId,
    },
    HeartbeatTick,
    PresenceChanged(PresenceNotice),
    ChatReceived(ChatMessage),
}

/// One chat server process's view of the cluster.
///
/// All mutable state (pending and live sessions, the local registry, the
/// heartbeat backoff) lives inside a single dispatch task. Client commands,
/// bus deliveries and heartbeat ticks are queued to it and handled one at a
/// time, so none of that state needs a lock.
pub struct ChatInstance {
    instance_id: String,
    commands: mpsc::UnboundedSender<InstanceEvent>,
    status: Arc<ArcSwap<InstanceStatus>>,
    cancel_token: CancellationToken,
    client_queue_capacity: usize,
    tasks: Mutex<Tasks>,
}

struct Tasks {
    dispatch: Option<JoinHandle<Result<(), Error>>>,
    bus: Option<JoinHandle<()>>,
}

impl ChatInstance {
    /// Join the cluster: write the first heartbeat, subscribe to the bus and
    /// start the dispatch loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the store cannot
    /// be reached for the first heartbeat or the subscription.
    pub async fn start(store: Arc<dyn SharedStore>, config: InstanceConfig) -> Result<Self, Error> {
        config.validate()?;
        let keys = Keyspace::new(config.key_prefix.clone());
        let instance_id = config.instance_id.clone();

        let monitor = HeartbeatMonitor::new(
            store.clone(),
            keys.clone(),
            instance_id.clone(),
            config.heartbeat_interval,
            config.heartbeat_threshold,
        );
        monitor.beat().await?;

        let router = Router::new(store.clone(), keys.clone(), instance_id.clone());
        let subscription = store.subscribe(&router.channels()).await?;

        let status = Arc::new(ArcSwap::from_pointee(InstanceStatus {
            instance_id: instance_id.clone(),
            degraded: false,
            live_sessions: 0,
            pending_connections: 0,
            last_error: None,
        }));
        let cancel_token = CancellationToken::new();
        let (commands, events) = mpsc::unbounded_channel();

        let bus_handle = Self::spawn_bus_task(
            store.clone(),
            router.clone(),
            subscription,
            commands.clone(),
            cancel_token.clone(),
        );

        let dispatcher = Dispatcher {
            sessions: SessionLifecycle::new(PresenceStore::new(store, keys), instance_id.clone()),
            router,
            monitor,
            backoff: Backoff::default(),
            status: status.clone(),
            last_error: None,
        };
        let dispatch_handle = tokio::spawn(dispatcher.run(events, cancel_token.clone()));

        tracing::info!(
            %instance_id,
            prefix = %config.key_prefix,
            heartbeat_ms = config.heartbeat_interval.as_millis() as u64,
            threshold_ms = config.heartbeat_threshold.as_millis() as u64,
            "Chat instance started"
        );

        Ok(Self {
            instance_id,
            commands,
            status,
            cancel_token,
            client_queue_capacity: config.client_queue_capacity,
            tasks: Mutex::new(Tasks {
                dispatch: Some(dispatch_handle),
                bus: Some(bus_handle),
            }),
        })
    }

    fn spawn_bus_task(
        store: Arc<dyn SharedStore>,
        router: Router,
        subscription: BusStream,
        commands: mpsc::UnboundedSender<InstanceEvent>,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut stream = Some(subscription);
            loop {
                if cancel_token.is_cancelled() {
                    break;
                }

                let current = match stream.take() {
                    Some(s) => s,
                    None => match store.subscribe(&router.channels()).await {
                        Ok(s) => {
                            tracing::info!("Resubscribed to the message bus");
                            // Roster changes published while we were away are lost
                            let _ = commands.send(InstanceEvent::PresenceChanged(PresenceNotice {
                                instance_id: String::new(),
                            }));
                            s
                        }
                        Err(e) => {
                            tracing::error!("Failed to subscribe to the message bus: {}", e);
                            tokio::select! {
                                _ = cancel_token.cancelled() => break,
                                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                            }
                        }
                    },
                };

                match Self::run_bus_loop(current, &router, &commands, &cancel_token).await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::warn!("Bus listener error, resubscribing: {}", e);
                        tokio::select! {
                            _ = cancel_token.cancelled() => break,
                            _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
                        }
                    }
                }
            }
            tracing::debug!("Bus task shutting down");
        })
    }

    async fn run_bus_loop(
        mut stream: BusStream,
        router: &Router,
        commands: &mpsc::UnboundedSender<InstanceEvent>,
        cancel_token: &CancellationToken,
    ) -> Result<(), Error> {
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => return Ok(()),
                msg = stream.next() => {
                    let Some(msg) = msg else {
                        return Err(Error::Connection("bus stream ended".to_string()));
                    };
                    let event = match router.decode(&msg) {
                        Ok(Inbound::Chat(chat)) => InstanceEvent::ChatReceived(chat),
                        Ok(Inbound::PresenceChanged(notice)) => InstanceEvent::PresenceChanged(notice),
                        Err(e) => {
                            METRICS.inc_malformed();
                            tracing::warn!(channel = %msg.channel, "Dropping bus message: {}", e);
                            continue;
                        }
                    };
                    if commands.send(event).is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Latest health snapshot. Lock-free.
    pub fn status(&self) -> Arc<InstanceStatus> {
        self.status.load_full()
    }

    /// Attach a new client. It immediately receives `requestUsername`.
    pub fn connect(&self) -> Result<ClientSession, Error> {
        let (handle, events) = ConnectionHandle::channel(self.client_queue_capacity);
        let connection_id = handle.id();
        self.commands
            .send(InstanceEvent::Connect(handle))
            .map_err(|_| Error::Shutdown)?;
        Ok(ClientSession {
            connection_id,
            events,
            commands: self.commands.clone(),
        })
    }

    /// Run a heartbeat pass now instead of waiting for the timer.
    pub fn trigger_heartbeat(&self) -> Result<(), Error> {
        self.commands
            .send(InstanceEvent::HeartbeatTick)
            .map_err(|_| Error::Shutdown)
    }

    /// Stop immediately without releasing anything, as a crashed process would.
    ///
    /// The heartbeat record and presence entries stay behind until a peer
    /// notices the stale heartbeat and evicts them.
    pub async fn abort(&self) {
        let mut tasks = self.tasks.lock().await;
        if let Some(handle) = tasks.dispatch.take() {
            handle.abort();
        }
        if let Some(handle) = tasks.bus.take() {
            handle.abort();
        }
        tracing::warn!(instance_id = %self.instance_id, "Chat instance aborted");
    }

    /// Graceful shutdown: release every local username, withdraw the
    /// heartbeat and tell peers to refresh their rosters.
    ///
    /// Safe to call more than once; later calls return immediately.
    ///
    /// # Errors
    ///
    /// Returns the first store error hit while releasing; the instance is
    /// stopped either way.
    pub async fn shutdown(&self) -> Result<(), Error> {
        // Cancel first so no heartbeat re-announces us after the withdrawal
        self.cancel_token.cancel();

        let mut tasks = self.tasks.lock().await;
        if let Some(handle) = tasks.bus.take() {
            let _ = handle.await;
        }
        let Some(handle) = tasks.dispatch.take() else {
            return Ok(());
        };
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Dispatch task failed: {}", e);
                Ok(())
            }
        };

        tracing::info!(instance_id = %self.instance_id, "Chat instance stopped");
        result
    }
}

impl Drop for ChatInstance {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

struct Dispatcher {
    sessions: SessionLifecycle,
    router: Router,
    monitor: HeartbeatMonitor,
    backoff: Backoff,
    status: Arc<ArcSwap<InstanceStatus>>,
    last_error: Option<String>,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<InstanceEvent>,
        cancel_token: CancellationToken,
    ) -> Result<(), Error> {
        let mut heartbeat = tokio::time::interval(self.monitor.period());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first beat already happened in start()
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    tracing::debug!("Dispatch loop shutting down");
                    break;
                }
                _ = heartbeat.tick() => self.handle(InstanceEvent::HeartbeatTick).await,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
            self.publish_status();
        }

        self.shutdown().await
    }

    async fn handle(&mut self, event: InstanceEvent) {
        match event {
            InstanceEvent::Connect(handle) => self.sessions.open(handle),

            InstanceEvent::SetUsername {
                connection_id,
                username,
            } => match self.sessions.negotiate(connection_id, &username).await {
                Ok(Negotiation::Accepted) => self.roster_changed().await,
                Ok(outcome) => {
                    tracing::debug!(%connection_id, %username, ?outcome, "Username not accepted")
                }
                Err(e) => self.store_failed(e),
            },

            InstanceEvent::SendMessage {
                connection_id,
                message,
            } => {
                let Some(sender) = self.sessions.username_of(connection_id) else {
                    METRICS.inc_malformed();
                    tracing::warn!(%connection_id, "Message from a connection without a username");
                    return;
                };
                let chat = match message.into_chat(sender) {
                    Ok(chat) => chat,
                    Err(e) => {
                        METRICS.inc_malformed();
                        tracing::warn!(%connection_id, "Dropping client message: {}", e);
                        return;
                    }
                };
                if let Err(e) = self.router.route(self.sessions.registry(), &chat).await {
                    self.store_failed(e);
                }
            }

            InstanceEvent::Disconnect { connection_id } => {
                match self.sessions.close(connection_id).await {
                    Ok(Some(_)) => self.roster_changed().await,
                    Ok(None) => {}
                    Err(e) => self.store_failed(e),
                }
            }

            InstanceEvent::HeartbeatTick => self.heartbeat().await,

            InstanceEvent::PresenceChanged(notice) => {
                tracing::trace!(from = %notice.instance_id, "Presence changed");
                if let Err(e) = self.router.refresh_roster(self.sessions.registry()).await {
                    self.store_failed(e);
                }
            }

            InstanceEvent::ChatReceived(chat) => {
                self.router.deliver(self.sessions.registry(), &chat);
            }
        }
    }

    async fn heartbeat(&mut self) {
        let now = Instant::now();
        if !self.backoff.ready(now) {
            return;
        }
        match self.heartbeat_pass().await {
            Ok(()) => {
                if self.backoff.consecutive_failures() > 0 {
                    tracing::info!(
                        failures = self.backoff.consecutive_failures(),
                        "Store reachable again"
                    );
                }
                self.backoff.record_success();
                self.last_error = None;
            }
            Err(e) => {
                let delay = self.backoff.record_failure(now);
                tracing::error!(
                    failures = self.backoff.consecutive_failures(),
                    backoff_ms = delay.as_millis() as u64,
                    "Heartbeat failed: {}, backing off",
                    e
                );
                self.store_failed(e);
            }
        }
    }

    async fn heartbeat_pass(&mut self) -> Result<(), Error> {
        let evicted = self.monitor.beat().await?;
        let mut changed = false;
        if evicted {
            let lost = self.sessions.reclaim().await?;
            if !lost.is_empty() {
                tracing::warn!(users = ?lost, "Usernames taken over while this instance was evicted");
            }
            changed = true;
        }
        if self.sessions.flush_releases().await? {
            changed = true;
        }
        if !self.monitor.scan_and_evict().await?.is_empty() {
            changed = true;
        }
        if changed {
            self.roster_changed().await;
        }
        Ok(())
    }

    /// Tell every instance to refresh its roster; refresh locally if the bus is down.
    async fn roster_changed(&mut self) {
        if let Err(e) = self.router.announce_presence().await {
            self.store_failed(e);
            if let Err(e) = self.router.refresh_roster(self.sessions.registry()).await {
                tracing::debug!("Local roster refresh failed: {}", e);
            }
        }
    }

    fn store_failed(&mut self, e: Error) {
        if e.is_store_unavailable() {
            METRICS.inc_store_error();
        }
        tracing::warn!(instance_id = %self.monitor.instance_id(), "Store operation failed: {}", e);
        self.last_error = Some(e.to_string());
    }

    fn publish_status(&self) {
        let current = self.status.load();
        let degraded = self.last_error.is_some();
        if current.degraded == degraded
            && current.live_sessions == self.sessions.live_count()
            && current.pending_connections == self.sessions.pending_count()
            && current.last_error == self.last_error
        {
            return;
        }
        if degraded != current.degraded {
            if degraded {
                tracing::warn!(instance_id = %current.instance_id, "Instance degraded");
            } else {
                tracing::info!(instance_id = %current.instance_id, "Instance recovered");
            }
        }
        self.status.store(Arc::new(InstanceStatus {
            instance_id: current.instance_id.clone(),
            degraded,
            live_sessions: self.sessions.live_count(),
            pending_connections: self.sessions.pending_count(),
            last_error: self.last_error.clone(),
        }));
    }

    async fn shutdown(&mut self) -> Result<(), Error> {
        let released = self.sessions.shutdown().await;
        let withdrawn = self.monitor.withdraw().await;
        if let Err(e) = self.router.announce_presence().await {
            tracing::warn!("Failed to announce departure: {}", e);
        }
        let released = released?;
        withdrawn?;
        tracing::debug!(released, "Dispatch loop released its sessions");
        Ok(())
    }
}

/// A client attachment, handed to the transport.
///
/// Commands go to the owning instance's dispatch loop; server events come
/// back through [`recv`](Self::recv). Dropping the session disconnects it.
pub struct ClientSession {
    connection_id: ConnectionId,
    events: mpsc::Receiver<ServerEvent>,
    commands: mpsc::UnboundedSender<InstanceEvent>,
}

impl ClientSession {
    pub fn id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn send(&self, event: ClientEvent) -> Result<(), Error> {
        let command = match event {
            ClientEvent::SetUsername(username) => InstanceEvent::SetUsername {
                connection_id: self.connection_id,
                username,
            },
            ClientEvent::SendMessage(message) => InstanceEvent::SendMessage {
                connection_id: self.connection_id,
                message,
            },
        };
        self.commands.send(command).map_err(|_| Error::Shutdown)
    }

    pub fn set_username(&self, username: impl Into<String>) -> Result<(), Error> {
        self.send(ClientEvent::SetUsername(username.into()))
    }

    pub fn send_message(
        &self,
        message: impl Into<String>,
        to_server: impl Into<String>,
    ) -> Result<(), Error> {
        self.send(ClientEvent::SendMessage(OutgoingMessage::new(message, to_server)))
    }

    /// Next event for this client. `None` once the instance dropped the
    /// connection (eviction or shutdown).
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerEvent> {
        self.events.try_recv().ok()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        let _ = self.commands.send(InstanceEvent::Disconnect {
            connection_id: self.connection_id,
        });
    }
}
