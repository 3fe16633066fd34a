// Controller module — the transport-agnostic façade

pub mod connection;
pub mod message;

pub use connection::ConnectionController;
pub use message::{ControllerError, InboundMessage, MessageController, PendingRequest};
