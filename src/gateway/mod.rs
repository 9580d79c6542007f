//! Shared gateway machinery: the per-gateway node registry and the single
//! websocket link every gateway keeps open to the broker's `/gw` endpoint.
//!
//! Each protocol gateway (CoAP, MQTT, WebSocket-node) owns one
//! [`registry::NodeRegistry`] and drives [`broker_link::run`] in its own
//! task; the registry's outbound channel is this task's only way to reach
//! the broker.

pub mod broker_link;
pub mod coap;
pub mod mqtt;
pub mod registry;
pub mod ws;

pub use registry::NodeRegistry;
