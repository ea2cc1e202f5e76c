//! Collaborator trait definitions
//!
//! The bridge talks to the embedded runtime and to the UI/auth layer only
//! through these interfaces.

use crate::protocol::AuthEnvelope;

/// The poll-driven game runtime on the other side of the bridge
pub trait Runtime {
    /// Whether the runtime's server ingestion entry points exist yet
    fn ingestion_ready(&self) -> bool;

    /// Hand one discovered server to the runtime. `info` is only valid for
    /// the duration of the call.
    fn inject_server(&mut self, host: &str, port: u16, info: &[u8]);

    /// Run a runtime console command (e.g. `sortservers`)
    fn execute(&mut self, command: &str);
}

/// Receives the envelopes the bridge does not queue for the runtime
pub trait SessionObserver: Send {
    /// The cluster attached us to a game server
    fn on_server_connected(&mut self, _server: &str, _internal: bool, _owned: bool) {}

    /// Authentication result, forwarded untouched
    fn on_auth(&mut self, _envelope: &AuthEnvelope) {}

    /// Chat line from the cluster
    fn on_chat(&mut self, _message: &str) {}
}

/// Observer that only records what it sees in the log
#[derive(Debug, Default)]
pub struct LogObserver;

impl SessionObserver for LogObserver {
    fn on_server_connected(&mut self, server: &str, internal: bool, owned: bool) {
        tracing::info!(server, internal, owned, "Attached to game server");
    }

    fn on_auth(&mut self, envelope: &AuthEnvelope) {
        tracing::info!("Authentication message: {:?}", envelope.op);
    }

    fn on_chat(&mut self, message: &str) {
        tracing::info!("[chat] {}", message);
    }
}
