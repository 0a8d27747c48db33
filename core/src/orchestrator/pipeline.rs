//! Clipboard events in, generations out, one at a time.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;

use super::GenerationOrchestrator;
use crate::clipboard::ClipboardChangeEvent;
use crate::events::MonitorEvent;

/// Drive `orchestrator` from monitor events until `cancel` fires or the
/// monitor bus closes. Changes that queued up while a generation ran are
/// coalesced to the most recent one. Returns the number of changes handled.
pub async fn run(
    mut events: broadcast::Receiver<MonitorEvent>,
    orchestrator: Arc<GenerationOrchestrator>,
    cancel: CancellationToken,
) -> usize {
    let mut handled = 0;
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => received,
        };
        let change = match received {
            Ok(MonitorEvent::ClipboardChanged(change)) => change,
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                log::warn!("pipeline lagged behind by {skipped} monitor events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let latest = drain_latest(&mut events, change);

        let generation = orchestrator.handle_clipboard_change(&latest);
        tokio::pin!(generation);
        let finished = tokio::select! {
            outcome = &mut generation => Some(outcome),
            _ = cancel.cancelled() => None,
        };
        let outcome = match finished {
            Some(outcome) => outcome,
            None => {
                orchestrator.cancel();
                generation.await
            }
        };
        handled += 1;
        if let Err(err) = outcome {
            log::debug!("clipboard generation ended with {}", err.code());
        }
        if cancel.is_cancelled() {
            break;
        }
    }
    handled
}

fn drain_latest(
    events: &mut broadcast::Receiver<MonitorEvent>,
    mut latest: ClipboardChangeEvent,
) -> ClipboardChangeEvent {
    loop {
        match events.try_recv() {
            Ok(MonitorEvent::ClipboardChanged(change)) => latest = change,
            Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return latest,
        }
    }
}
