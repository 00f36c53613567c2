use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::bus::BusClient;
use crate::cache::ResourceCache;
use crate::client::{ClientEventSink, Connection};

/// Tunables for the gateway core.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Timeout applied to every backend request (get, access, query).
    pub request_timeout: Duration,
    /// Maximum number of subscriptions (direct plus indirect) a single
    /// connection may hold.
    pub subscription_limit: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(3),
            subscription_limit: 1024,
        }
    }
}

/// The gateway core: owns the resource cache, wires it to the bus, and hands
/// out client connections. Construct one per process and keep it alive for
/// the gateway's lifetime; the network listeners feed it connections and
/// consume their event sinks.
pub struct Gateway {
    cache: ResourceCache,
    config: GatewayConfig,
    connections: Mutex<Vec<Weak<ConnectionSlot>>>,
}

struct ConnectionSlot {
    connection: Connection,
}

impl Gateway {
    pub fn new(bus: Arc<dyn BusClient>) -> Self {
        Self::with_config(bus, GatewayConfig::default())
    }

    pub fn with_config(bus: Arc<dyn BusClient>, config: GatewayConfig) -> Self {
        let cache = ResourceCache::new(bus, config.request_timeout);
        Self {
            cache,
            config,
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// Registers a client connection. `cid` identifies the connection in
    /// access requests; `sink` receives every client-bound event.
    pub fn connection(&self, cid: impl Into<String>, sink: ClientEventSink) -> ConnectionGuard {
        let connection = Connection::new(
            self.cache.clone(),
            cid.into(),
            sink,
            self.config.subscription_limit,
        );
        let slot = Arc::new(ConnectionSlot {
            connection: connection.clone(),
        });
        let mut connections = self.connections.lock().unwrap();
        connections.retain(|slot| slot.upgrade().is_some());
        connections.push(Arc::downgrade(&slot));
        ConnectionGuard { slot }
    }

    /// Disposes every connection still alive. Late bus callbacks find the
    /// disposed state and no-op.
    pub fn dispose(&self) {
        let connections = {
            let mut slots = self.connections.lock().unwrap();
            slots.drain(..).filter_map(|slot| slot.upgrade()).collect::<Vec<_>>()
        };
        for slot in connections {
            slot.connection.dispose();
        }
    }
}

/// Owner of one registered connection. Dropping the guard disposes the
/// connection, mirroring a client disconnect.
pub struct ConnectionGuard {
    slot: Arc<ConnectionSlot>,
}

impl ConnectionGuard {
    pub fn connection(&self) -> &Connection {
        &self.slot.connection
    }
}

impl std::ops::Deref for ConnectionGuard {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.slot.connection
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.slot.connection.dispose();
    }
}
