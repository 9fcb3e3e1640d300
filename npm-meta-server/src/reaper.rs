//! Background orphan sweep
//!
//! Runs `Reconciler::reap_orphans` on a fixed interval using service
//! credentials, since no user session is guaranteed to exist.

use npm_meta_lib::{CredentialRelay, MetaError, Reconciler, Result, RuleId, Session};
use std::sync::Arc;
use std::time::Duration;

/// NPM credentials the sweep logs in with
#[derive(Clone)]
pub struct ServiceCredentials {
    pub identity: String,
    pub secret: String,
}

pub struct Reaper {
    reconciler: Arc<Reconciler>,
    relay: Arc<CredentialRelay>,
    credentials: ServiceCredentials,
    session: Option<Session>,
}

impl Reaper {
    pub fn new(
        reconciler: Arc<Reconciler>,
        relay: Arc<CredentialRelay>,
        credentials: ServiceCredentials,
    ) -> Self {
        Self {
            reconciler,
            relay,
            credentials,
            session: None,
        }
    }

    async fn session(&mut self) -> Result<Session> {
        if let Some(session) = &self.session {
            return Ok(session.clone());
        }
        let session = self
            .relay
            .login(&self.credentials.identity, &self.credentials.secret)
            .await?;
        self.session = Some(session.clone());
        Ok(session)
    }

    /// Run one sweep. An expired upstream token triggers one fresh login.
    pub async fn sweep(&mut self) -> Result<Vec<RuleId>> {
        let session = self.session().await?;
        match self.reconciler.reap_orphans(&session).await {
            Err(MetaError::AuthenticationFailed(_)) => {
                tracing::debug!("Service session rejected upstream, logging in again");
                self.session = None;
                let session = self.session().await?;
                self.reconciler.reap_orphans(&session).await
            }
            other => other,
        }
    }
}

/// Spawn the periodic sweep. The first run happens one interval after start.
///
/// A zero interval disables the sweep.
pub fn spawn_reaper(mut reaper: Reaper, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if every.is_zero() {
            tracing::warn!("Orphan sweep interval is zero; background sweep disabled");
            return;
        }
        let start = tokio::time::Instant::now() + every;
        let mut interval = tokio::time::interval_at(start, every);

        loop {
            interval.tick().await;

            match reaper.sweep().await {
                Ok(removed) if removed.is_empty() => tracing::debug!("Orphan sweep found nothing to reap"),
                Ok(removed) => tracing::info!(count = removed.len(), "Orphan sweep finished"),
                Err(e) => tracing::warn!(error = %e, "Orphan sweep failed"),
            }
        }
    })
}
