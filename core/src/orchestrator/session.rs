//! Single-flight guard for generations.

use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::errors::GenerationError;

#[derive(Debug)]
struct ActiveGeneration {
    request_id: String,
    cancel: CancellationToken,
}

/// At most one generation runs per session; a second one is refused.
#[derive(Debug, Default)]
pub struct GenerationSession {
    active: Mutex<Option<ActiveGeneration>>,
}

/// Releases the session slot on drop.
#[derive(Debug)]
pub struct SessionGuard<'a> {
    session: &'a GenerationSession,
    cancel: CancellationToken,
}

impl SessionGuard<'_> {
    /// Cancelled by [`GenerationSession::cancel`] or the parent token.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.session.slot().take();
    }
}

impl GenerationSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<ActiveGeneration>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the slot for `request_id`, or fail with [`GenerationError::Busy`].
    pub fn begin(
        &self,
        request_id: &str,
        parent: &CancellationToken,
    ) -> Result<SessionGuard<'_>, GenerationError> {
        let mut slot = self.slot();
        if slot.is_some() {
            return Err(GenerationError::Busy);
        }
        let cancel = parent.child_token();
        *slot = Some(ActiveGeneration {
            request_id: request_id.to_string(),
            cancel: cancel.clone(),
        });
        Ok(SessionGuard {
            session: self,
            cancel,
        })
    }

    /// Cancel the running generation. False when nothing was running.
    pub fn cancel(&self) -> bool {
        match self.slot().as_ref() {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_request(&self) -> Option<String> {
        self.slot().as_ref().map(|active| active.request_id.clone())
    }
}
