//! Command correlator
//!
//! Commands are fire-and-forget envelopes carrying a small random id. The
//! cluster answers out of band with a `ServerResponse` naming the same id,
//! which resolves the caller's [`CommandHandle`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::protocol::{Envelope, COMMAND_ID_SPACE};

/// Why a command did not produce a payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Command failed: {0}")]
    Failed(String),

    #[error("Connection closed before the command was answered")]
    ConnectionClosed,

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
}

/// Correlator errors
#[derive(Error, Debug)]
pub enum CorrelatorError {
    #[error("All {0} command ids are outstanding")]
    Exhausted(usize),
}

pub type CommandResult = Result<String, CommandError>;

/// Source of candidate command ids
pub trait IdSource: Send {
    /// Draw an id uniformly from `[0, bound)`
    fn draw(&mut self, bound: u16) -> u16;
}

/// Default id source backed by the OS-seeded standard RNG
pub struct RandomIds {
    rng: StdRng,
}

impl RandomIds {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_os_rng(),
        }
    }
}

impl Default for RandomIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for RandomIds {
    fn draw(&mut self, bound: u16) -> u16 {
        self.rng.random_range(0..bound)
    }
}

/// Deferred result of an issued command.
///
/// Resolves once the matching response arrives. If the bridge is dropped
/// first, resolves to [`CommandError::ConnectionClosed`].
#[derive(Debug)]
pub struct CommandHandle {
    id: u16,
    rx: oneshot::Receiver<CommandResult>,
}

impl CommandHandle {
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Wait for the response with a deadline.
    ///
    /// A timeout does not release the id; the entry stays outstanding until
    /// a response arrives or the bridge goes away.
    pub async fn wait_timeout(self, deadline: Duration) -> CommandResult {
        match tokio::time::timeout(deadline, self).await {
            Ok(result) => result,
            Err(_) => Err(CommandError::Timeout(deadline)),
        }
    }

    /// Non-blocking check for a result
    #[cfg(test)]
    pub fn try_result(&mut self) -> Option<CommandResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(CommandError::ConnectionClosed)),
        }
    }
}

impl Future for CommandHandle {
    type Output = CommandResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(CommandError::ConnectionClosed)))
    }
}

/// What happened to a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Fulfilled,
    Rejected,
    /// No outstanding command has this id
    Unmatched,
}

/// Tracks in-flight commands by id
pub struct CommandCorrelator {
    pending: HashMap<u16, oneshot::Sender<CommandResult>>,
    ids: Box<dyn IdSource>,
}

impl CommandCorrelator {
    pub fn new() -> Self {
        Self::with_id_source(Box::new(RandomIds::new()))
    }

    pub fn with_id_source(ids: Box<dyn IdSource>) -> Self {
        Self {
            pending: HashMap::new(),
            ids,
        }
    }

    /// Register a new command and build the envelope that carries it.
    ///
    /// Redraws until the id is not outstanding.
    pub fn issue(&mut self, text: &str) -> Result<(CommandHandle, Envelope), CorrelatorError> {
        if self.pending.len() >= COMMAND_ID_SPACE as usize {
            return Err(CorrelatorError::Exhausted(self.pending.len()));
        }

        let mut id = self.ids.draw(COMMAND_ID_SPACE);
        while self.pending.contains_key(&id) {
            id = self.ids.draw(COMMAND_ID_SPACE);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        tracing::debug!(id, "Issued command: {}", text);

        let envelope = Envelope::Command {
            text: text.to_string(),
            id,
        };
        Ok((CommandHandle { id, rx }, envelope))
    }

    /// Settle the command named by a `ServerResponse`
    pub fn resolve(&mut self, id: u16, payload: String, success: bool) -> Resolution {
        let Some(tx) = self.pending.remove(&id) else {
            tracing::debug!(id, "Ignoring response for unknown command");
            return Resolution::Unmatched;
        };

        let (result, resolution) = if success {
            (Ok(payload), Resolution::Fulfilled)
        } else {
            (Err(CommandError::Failed(payload)), Resolution::Rejected)
        };

        // The caller may have dropped its handle; the id is released either way
        let _ = tx.send(result);
        resolution
    }

    /// Drop a command that never made it onto the wire
    pub fn forget(&mut self, id: u16) {
        self.pending.remove(&id);
    }

    #[cfg(test)]
    pub fn is_outstanding(&self, id: u16) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

impl Default for CommandCorrelator {
    fn default() -> Self {
        Self::new()
    }
}
