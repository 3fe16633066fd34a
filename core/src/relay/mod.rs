// Relay module — node selection and the per-node sync session

pub mod api;
pub mod selector;
pub mod sync;

pub use selector::{select_node, RelayNodeSelector, SelectorError};
pub use sync::{
    reduce, RelayEvent, RelayRoom, RelaySyncConfig, RelaySyncEngine, RoomState, SyncAction,
    SyncError, SyncState,
};

/// Base URL for a relay node address
pub fn base_url(node: &str) -> String {
    if node.starts_with("http://") || node.starts_with("https://") {
        node.trim_end_matches('/').to_string()
    } else {
        format!("https://{node}")
    }
}
