//! Tool-server manager: the keyed table of live servers and their
//! supervision glue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mcp::{ServerConfig, ServerEvent, ServerId, ServerState, ToolServer};
use serde::Serialize;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::events::{Event, EventBus};

/// Snapshot of one server for listings and status.
#[derive(Debug, Clone, Serialize)]
pub struct ServerView {
    pub id: ServerId,
    pub name: String,
    pub command: String,
    pub state: ServerState,
    pub started_at: DateTime<Utc>,
    pub ready_at: Option<DateTime<Utc>>,
    pub tools: Vec<String>,
    pub restart_count: u32,
    pub stderr_tail: Vec<String>,
}

/// Owns every live [`ToolServer`], serializes stop per id, and forwards
/// lifecycle events to the bus. Server ids are process-generated and never
/// reused; `server_gone` is broadcast exactly once per server.
pub struct ServerManager {
    servers: Arc<DashMap<ServerId, Arc<ToolServer>>>,
    stop_locks: DashMap<ServerId, Arc<Mutex<()>>>,
    bus: EventBus,
    stop_grace: Duration,
}

impl ServerManager {
    pub fn new(bus: EventBus, stop_grace: Duration) -> Arc<Self> {
        Arc::new(Self {
            servers: Arc::new(DashMap::new()),
            stop_locks: DashMap::new(),
            bus,
            stop_grace,
        })
    }

    /// Spawn and register a server. Returns once the handshake finished and
    /// the server is visible to `get`/`list`.
    pub async fn start_server(&self, config: ServerConfig) -> Result<ServerId> {
        let server = ToolServer::start(config).await?;
        let id = server.id();
        let events = server.subscribe();
        self.servers.insert(id, server.clone());

        self.bus.publish(Event::ServerStarted {
            server_id: id,
            name: server.name().to_string(),
        });
        match server.state() {
            ServerState::Ready => self.bus.publish(Event::ServerReady { server_id: id }),
            ServerState::Degraded => self.bus.publish(Event::ServerDegraded { server_id: id }),
            _ => {}
        }

        tokio::spawn(forward_events(
            id,
            events,
            self.servers.clone(),
            self.bus.clone(),
        ));
        info!(%id, name = server.name(), "server registered");
        Ok(id)
    }

    /// Stop a server and remove it. Stops for the same id are serialized;
    /// a second call observes `ServerNotFound`.
    pub async fn stop_server(&self, id: &ServerId) -> Result<()> {
        let gate = {
            let entry = self
                .stop_locks
                .entry(*id)
                .or_insert_with(|| Arc::new(Mutex::new(())));
            entry.value().clone()
        };
        let _held = gate.lock().await;

        let server = self
            .servers
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(Error::ServerNotFound(*id))?;
        server.stop(self.stop_grace).await;

        if self.servers.remove(id).is_some() {
            self.bus.publish(Event::ServerGone { server_id: *id });
        }
        self.stop_locks.remove(id);
        Ok(())
    }

    /// Stop every server, concurrently.
    pub async fn stop_all(&self) {
        let ids: Vec<ServerId> = self.servers.iter().map(|e| *e.key()).collect();
        let stops = ids.iter().map(|id| self.stop_server(id));
        for outcome in futures::future::join_all(stops).await {
            if let Err(e) = outcome {
                warn!("stop during shutdown: {e}");
            }
        }
    }

    pub fn get(&self, id: &ServerId) -> Option<Arc<ToolServer>> {
        self.servers.get(id).map(|e| e.value().clone())
    }

    /// Live servers, unordered.
    pub fn servers(&self) -> Vec<Arc<ToolServer>> {
        self.servers.iter().map(|e| e.value().clone()).collect()
    }

    /// Lock-light snapshot for listings.
    pub fn list(&self) -> Vec<ServerView> {
        let mut views: Vec<ServerView> = self
            .servers
            .iter()
            .map(|e| view_of(e.value()))
            .collect();
        views.sort_by_key(|v| v.started_at);
        views
    }
}

fn view_of(server: &Arc<ToolServer>) -> ServerView {
    ServerView {
        id: server.id(),
        name: server.name().to_string(),
        command: server.config().command.clone(),
        state: server.state(),
        started_at: server.started_at(),
        ready_at: server.ready_at(),
        tools: server.tools().into_iter().map(|t| t.name).collect(),
        restart_count: server.restart_count(),
        stderr_tail: server.stderr_tail(),
    }
}

/// Forward one server's lifecycle events to the bus; on terminal stop,
/// remove the entry and broadcast `server_gone` (once).
async fn forward_events(
    id: ServerId,
    mut events: broadcast::Receiver<ServerEvent>,
    servers: Arc<DashMap<ServerId, Arc<ToolServer>>>,
    bus: EventBus,
) {
    loop {
        match events.recv().await {
            Ok(ServerEvent::Ready) => bus.publish(Event::ServerReady { server_id: id }),
            Ok(ServerEvent::Degraded) => bus.publish(Event::ServerDegraded { server_id: id }),
            Ok(ServerEvent::Restarting { attempt }) => bus.publish(Event::ServerRestarting {
                server_id: id,
                attempt,
            }),
            Ok(ServerEvent::RestartExhausted) => {
                bus.publish(Event::ServerRestartExhausted { server_id: id })
            }
            Ok(ServerEvent::Stopped) => {
                bus.publish(Event::ServerStopped { server_id: id });
                if servers.remove(&id).is_some() {
                    bus.publish(Event::ServerGone { server_id: id });
                }
                break;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(%id, skipped, "lagged on server events");
            }
            Err(broadcast::error::RecvError::Closed) => {
                if servers.remove(&id).is_some() {
                    bus.publish(Event::ServerGone { server_id: id });
                }
                break;
            }
        }
    }
}
