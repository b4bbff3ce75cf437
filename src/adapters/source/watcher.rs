use crate::domain::events::SourceEvent;
use crate::error::{AgentError, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use std::path::Path;
use tokio::sync::mpsc;

/// Bridges OS file-system notifications into the watcher's event channel.
///
/// Keeps the platform watcher alive for as long as the subscription exists;
/// dropping the handle stops delivery.
#[derive(Debug)]
pub struct FsEventSource {
    guard: notify::RecommendedWatcher,
    events: mpsc::UnboundedReceiver<SourceEvent>,
}

impl FsEventSource {
    /// Splits into the platform watcher guard (keep it alive for the life
    /// of the subscription) and the event receiver.
    #[must_use]
    pub fn into_parts(self) -> (notify::RecommendedWatcher, mpsc::UnboundedReceiver<SourceEvent>) {
        (self.guard, self.events)
    }

    /// Subscribes to changes under `root`.
    ///
    /// # Errors
    /// Returns an error if the platform watcher cannot be installed.
    pub fn subscribe(root: &Path) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!(error = %e, "File-system watcher error");
                    return;
                }
            };
            for mapped in map_event(&event) {
                // Receiver dropped means the watcher is shutting down.
                let _ = tx.send(mapped);
            }
        })
        .map_err(|e| AgentError::Provider(format!("Failed to create file-system watcher: {e}")))?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| AgentError::Provider(format!("Failed to watch {}: {e}", root.display())))?;

        Ok(Self { guard: watcher, events: rx })
    }
}

/// Collapses a platform notification into the watcher's event vocabulary.
fn map_event(event: &notify::Event) -> Vec<SourceEvent> {
    match &event.kind {
        EventKind::Create(_) => event.paths.iter().cloned().map(SourceEvent::Appeared).collect(),
        EventKind::Remove(_) => event.paths.iter().cloned().map(SourceEvent::Deleted).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            vec![SourceEvent::Moved { from: event.paths[0].clone(), to: event.paths[1].clone() }]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            event.paths.iter().cloned().map(SourceEvent::Deleted).collect()
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            event.paths.iter().cloned().map(SourceEvent::Appeared).collect()
        }
        EventKind::Modify(_) => event.paths.iter().cloned().map(SourceEvent::Changed).collect(),
        _ => Vec::new(),
    }
}
