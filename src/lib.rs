//! Core of a realtime API gateway bridging stateful client connections to
//! backend services over a pub/sub message bus.
//!
//! Clients subscribe to addressable resources (models and collections),
//! receive an initial snapshot, and then a stream of fine-grained change
//! events for as long as the subscription is held. Services publish
//! authoritative state; the gateway caches it, coalesces redundant backend
//! work across clients, enforces per-client access control, and re-derives
//! query-view deltas on behalf of services that cannot enumerate their
//! subscribers.
//!
//! The network listeners (WebSocket, HTTP), configuration loading and
//! logging setup live outside this crate: the core consumes a
//! [`bus::BusClient`] and feeds client events to a
//! [`client::ClientEventSink`].

pub mod bus;
pub mod cache;
pub mod client;
pub mod codec;
pub mod error;
pub mod gateway;
pub mod rid;
pub mod runtime;
pub mod value;

pub use bus::{BusClient, InMemoryBus};
pub use cache::{AccessDecision, CallAccess, ResourceCache, ResourceEvent, ResourceHandle};
pub use client::{ClientEvent, ClientEventSink, Connection, ResourceSet};
pub use error::{Error, ErrorCode, Result};
pub use gateway::{ConnectionGuard, Gateway, GatewayConfig};
pub use rid::Rid;
pub use value::{Collection, Model, ResourceData, Value};
