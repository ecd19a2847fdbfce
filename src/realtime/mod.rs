/**
 * Realtime Delivery
 *
 * Websocket protocol, per-connection bus bridge, the per-worker
 * manager, and the connection state machine.
 */

pub mod broker;
pub mod connection;
pub mod manager;
pub mod protocol;

pub use connection::ws_handler;
pub use manager::RealtimeManager;
