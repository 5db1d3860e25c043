//! Silent session restore.
//!
//! Runs at startup and whenever the application regains focus (the
//! user may have just approved something on their phone). Restore
//! never prompts and never reports failure; it is a convenience, not a
//! user action. An explicit disconnect always wins over it.

use crate::machine::ConnectionState;
use crate::manager::{ConnectionManager, Origin};

#[derive(Debug, Clone)]
pub struct SessionRestorer {
    manager: ConnectionManager,
}

impl SessionRestorer {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Try to bring back the previous connection. Returns whether a
    /// connection is held afterwards.
    pub async fn restore(&self) -> bool {
        let persisted = self.manager.persisted();
        if persisted.explicitly_disconnected {
            tracing::debug!("restore skipped: user disconnected");
            return false;
        }
        let Some(record) = persisted.session else {
            tracing::debug!("restore skipped: no previous session");
            return false;
        };

        if self.manager.provider().is_some() {
            let state = self.manager.health_check().await;
            return matches!(
                state,
                ConnectionState::Connected | ConnectionState::Degraded
            );
        }

        tracing::info!(
            session = %record.session_id,
            provenance = %record.provenance,
            "restoring session"
        );
        match self.manager.attempt(Origin::Restore).await {
            Ok(provenance) => {
                tracing::info!(%provenance, "session restored");
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "restore failed");
                false
            }
        }
    }

    /// Focus came back to the application.
    pub async fn on_focus_regained(&self) -> bool {
        tracing::debug!("focus regained");
        self.restore().await
    }
}
