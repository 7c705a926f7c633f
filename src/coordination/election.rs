use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::coordination::CoordinationError;

/// Where a [`Candidate`] currently is in its election cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPhase {
    Idle,
    Electing,
    Leading,
}

/// Held while a participant leads an election.
#[async_trait]
pub trait Leadership: Send {
    /// Completes once leadership is gone (session expiry, revocation).
    async fn lost(&mut self);

    /// Gives leadership up so the next candidate can take over.
    async fn resign(self: Box<Self>);
}

#[async_trait]
pub trait LeaderElection: Send + Sync {
    /// Blocks until `participant` holds `election`.
    async fn campaign(
        &self,
        election: &str,
        participant: &str,
    ) -> Result<Box<dyn Leadership>, CoordinationError>;
}

/// One participant in a named election.
///
/// [`Candidate::run_as_leader`] drives a single Idle -> Electing -> Leading ->
/// Idle cycle; callers loop over it to re-enter the election.
pub struct Candidate {
    provider: Arc<dyn LeaderElection>,
    election: String,
    participant: String,
    phase: watch::Sender<ElectionPhase>,
}

impl Candidate {
    pub fn new(
        provider: Arc<dyn LeaderElection>,
        election: impl Into<String>,
        participant: impl Into<String>,
    ) -> Self {
        let (phase, _) = watch::channel(ElectionPhase::Idle);
        Self {
            provider,
            election: election.into(),
            participant: participant.into(),
            phase,
        }
    }

    pub fn election(&self) -> &str {
        &self.election
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    pub fn phase(&self) -> ElectionPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ElectionPhase> {
        self.phase.subscribe()
    }

    /// Campaigns, then runs `on_elected` for as long as leadership lasts.
    ///
    /// Returns when `on_elected` completes, leadership is lost, or `shutdown`
    /// fires. `on_elected` is abandoned in the last two cases. Leadership is
    /// always resigned before returning.
    pub async fn run_as_leader<F>(
        &self,
        on_elected: F,
        shutdown: &CancellationToken,
    ) -> Result<(), CoordinationError>
    where
        F: Future<Output = ()> + Send,
    {
        self.phase.send_replace(ElectionPhase::Electing);
        tracing::debug!(election = %self.election, participant = %self.participant, "Campaigning");

        let campaign = tokio::select! {
            result = self.provider.campaign(&self.election, &self.participant) => result,
            _ = shutdown.cancelled() => {
                self.phase.send_replace(ElectionPhase::Idle);
                return Ok(());
            }
        };
        let mut leadership = match campaign {
            Ok(leadership) => leadership,
            Err(e) => {
                self.phase.send_replace(ElectionPhase::Idle);
                return Err(e);
            }
        };

        self.phase.send_replace(ElectionPhase::Leading);
        tracing::info!(election = %self.election, participant = %self.participant, "Elected leader");

        tokio::select! {
            _ = on_elected => {
                tracing::info!(election = %self.election, "Leader work finished");
            }
            _ = leadership.lost() => {
                tracing::warn!(election = %self.election, participant = %self.participant, "Leadership lost");
            }
            _ = shutdown.cancelled() => {
                tracing::info!(election = %self.election, "Stepping down for shutdown");
            }
        }

        leadership.resign().await;
        self.phase.send_replace(ElectionPhase::Idle);
        Ok(())
    }
}
