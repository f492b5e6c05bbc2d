//! Capability registry and router.
//!
//! Maps capability names to (server, tool) pairs and dispatches
//! invocations. Bind and unbind are totally ordered per capability name;
//! an invocation pins the target server with an `Arc` so it cannot race
//! with removal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use mcp::{ServerId, ServerState, ToolServer};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crate::manager::ServerManager;

/// One registry entry. A capability is bound to exactly one server at a
/// time; rebinding replaces atomically.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityBinding {
    pub capability: String,
    pub server_id: ServerId,
    pub tool: String,
    pub acquired_at: DateTime<Utc>,
}

pub struct CapabilityRegistry {
    bindings: RwLock<HashMap<String, CapabilityBinding>>,
    manager: Arc<ServerManager>,
    bus: EventBus,
}

impl CapabilityRegistry {
    pub fn new(manager: Arc<ServerManager>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            bindings: RwLock::new(HashMap::new()),
            manager,
            bus,
        })
    }

    /// Start the background task that drops a server's bindings when the
    /// manager broadcasts `server_gone`.
    pub fn spawn_pruner(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let mut events = registry.bus.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = recv_skipping_lag(&mut events).await {
                if let Event::ServerGone { server_id } = event {
                    registry.prune_server(server_id);
                }
            }
        });
    }

    /// Bind a capability to a (server, tool) pair, replacing any prior
    /// binding for the same name. Fails if the server is unknown or
    /// stopped.
    pub fn bind(&self, capability: &str, server_id: ServerId, tool: &str) -> Result<()> {
        let server = self
            .manager
            .get(&server_id)
            .ok_or(Error::ServerNotFound(server_id))?;
        if server.state() == ServerState::Stopped {
            return Err(Error::ServerNotFound(server_id));
        }

        let binding = CapabilityBinding {
            capability: capability.to_string(),
            server_id,
            tool: tool.to_string(),
            acquired_at: Utc::now(),
        };
        self.bindings
            .write()
            .insert(capability.to_string(), binding);
        info!(capability, %server_id, tool, "capability bound");
        self.bus.publish(Event::CapabilityBound {
            capability: capability.to_string(),
            server_id,
            tool: tool.to_string(),
        });
        Ok(())
    }

    pub fn unbind(&self, capability: &str) -> bool {
        let removed = self.bindings.write().remove(capability).is_some();
        if removed {
            self.bus.publish(Event::CapabilityUnbound {
                capability: capability.to_string(),
            });
        }
        removed
    }

    /// Resolve a capability to its binding. A binding whose server is gone
    /// or stopped is pruned on sight and reported as not bound.
    pub fn resolve(&self, capability: &str) -> Result<CapabilityBinding> {
        self.resolve_live(capability).map(|(binding, _)| binding)
    }

    pub fn list(&self) -> Vec<CapabilityBinding> {
        let mut bindings: Vec<CapabilityBinding> =
            self.bindings.read().values().cloned().collect();
        bindings.sort_by(|a, b| a.capability.cmp(&b.capability));
        bindings
    }

    /// Resolve then dispatch. The server reference is held across the call,
    /// so a concurrent unbind or `server_gone` cannot redirect or orphan an
    /// in-flight invocation.
    pub async fn invoke(&self, capability: &str, args: Value, timeout: Duration) -> Result<Value> {
        let (binding, server) = self.resolve_live(capability)?;
        debug!(capability, tool = %binding.tool, server = %binding.server_id, "routing invocation");
        server
            .invoke(&binding.tool, args, timeout)
            .await
            .map_err(Error::Mcp)
    }

    /// Re-bind by convention: every declared tool `T` on a live server `S`
    /// becomes capability `T → (S, T)`; when two servers declare the same
    /// tool the earliest-started wins. Bindings whose names are not tool
    /// names (descriptor kinds) are left untouched. Returns the number of
    /// convention bindings written.
    pub fn refresh(&self) -> usize {
        let mut servers = self.manager.servers();
        servers.retain(|s| matches!(s.state(), ServerState::Ready | ServerState::Degraded));
        servers.sort_by_key(|s| s.started_at());

        let mut desired: HashMap<String, (ServerId, String)> = HashMap::new();
        for server in &servers {
            for tool in server.tools() {
                desired
                    .entry(tool.name.clone())
                    .or_insert((server.id(), tool.name));
            }
        }

        let mut announcements = Vec::with_capacity(desired.len());
        {
            let mut bindings = self.bindings.write();
            for (capability, (server_id, tool)) in desired {
                announcements.push(Event::CapabilityBound {
                    capability: capability.clone(),
                    server_id,
                    tool: tool.clone(),
                });
                bindings.insert(
                    capability.clone(),
                    CapabilityBinding {
                        capability,
                        server_id,
                        tool,
                        acquired_at: Utc::now(),
                    },
                );
            }
        }
        let count = announcements.len();
        for event in announcements {
            self.bus.publish(event);
        }
        info!(count, "capability refresh complete");
        count
    }

    /// Drop every binding that references `server_id`.
    pub fn prune_server(&self, server_id: ServerId) {
        let removed: Vec<String> = {
            let mut bindings = self.bindings.write();
            let names: Vec<String> = bindings
                .iter()
                .filter(|(_, b)| b.server_id == server_id)
                .map(|(name, _)| name.clone())
                .collect();
            for name in &names {
                bindings.remove(name);
            }
            names
        };
        for capability in removed {
            info!(capability, %server_id, "binding dropped with server");
            self.bus.publish(Event::CapabilityUnbound { capability });
        }
    }

    fn resolve_live(&self, capability: &str) -> Result<(CapabilityBinding, Arc<ToolServer>)> {
        let binding = self
            .bindings
            .read()
            .get(capability)
            .cloned()
            .ok_or_else(|| Error::NotBound(capability.to_string()))?;

        match self.manager.get(&binding.server_id) {
            Some(server) if server.state() != ServerState::Stopped => Ok((binding, server)),
            _ => {
                self.remove_if_still(&binding);
                Err(Error::NotBound(capability.to_string()))
            }
        }
    }

    /// Remove the binding only if it still points at the same server, so a
    /// concurrent rebind is not clobbered.
    fn remove_if_still(&self, stale: &CapabilityBinding) {
        let removed = {
            let mut bindings = self.bindings.write();
            match bindings.get(&stale.capability) {
                Some(current) if current.server_id == stale.server_id => {
                    bindings.remove(&stale.capability);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.bus.publish(Event::CapabilityUnbound {
                capability: stale.capability.clone(),
            });
        }
    }
}

async fn recv_skipping_lag(
    events: &mut tokio::sync::broadcast::Receiver<Event>,
) -> std::result::Result<Event, ()> {
    loop {
        match events.recv().await {
            Ok(event) => return Ok(event),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Err(()),
        }
    }
}
