//! Batch injector
//!
//! Pushes discovered servers into the runtime's own ingestion entry point.
//! Each entry gets its own transient buffer, separate from the poll scratch
//! buffer. Batches that arrive before the runtime can ingest them are cached
//! and replayed once.

use super::traits::Runtime;
use crate::protocol::ServerEntry;

/// Runtime command that re-sorts the server browser after a batch
pub const SORT_COMMAND: &str = "sortservers";

/// Outcome of an injection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Injection {
    Delivered(usize),
    Cached(usize),
}

#[derive(Debug, Default)]
pub struct BatchInjector {
    cached: Option<Vec<ServerEntry>>,
}

impl BatchInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a batch now, or cache it until the runtime is ready.
    ///
    /// A newer batch replaces an older cached one. A cached batch still
    /// waiting when the runtime turns ready goes in first.
    pub fn inject<R: Runtime + ?Sized>(&mut self, runtime: &mut R, entries: Vec<ServerEntry>) -> Injection {
        if !runtime.ingestion_ready() {
            let count = entries.len();
            if self.cached.replace(entries).is_some() {
                tracing::debug!("Replacing cached server batch");
            }
            tracing::debug!("Runtime not ready, caching {} servers", count);
            return Injection::Cached(count);
        }

        self.replay(runtime);
        Injection::Delivered(deliver(runtime, &entries))
    }

    /// Replay the cached batch if the runtime can take it now
    pub fn replay<R: Runtime + ?Sized>(&mut self, runtime: &mut R) -> Option<usize> {
        if !runtime.ingestion_ready() {
            return None;
        }
        let entries = self.cached.take()?;
        tracing::debug!("Replaying {} cached servers", entries.len());
        Some(deliver(runtime, &entries))
    }

    #[cfg(test)]
    pub fn has_cached(&self) -> bool {
        self.cached.is_some()
    }
}

fn deliver<R: Runtime + ?Sized>(runtime: &mut R, entries: &[ServerEntry]) -> usize {
    for entry in entries {
        let buffer: Box<[u8]> = entry.info.as_slice().into();
        runtime.inject_server(&entry.host, entry.port, &buffer);
        drop(buffer);
    }
    runtime.execute(SORT_COMMAND);
    entries.len()
}
