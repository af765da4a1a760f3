use crate::auth::AuthSession;
use crate::error::RefreshError;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Remote operation that trades the ambient session credential for a new
/// access token.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self) -> Result<String, RefreshError>;
}

type Waiter = oneshot::Sender<Result<String, RefreshError>>;

#[derive(Default)]
struct RefreshState {
    in_flight: bool,
    // Non-empty only while `in_flight` is set.
    waiters: Vec<Waiter>,
}

/// Single-flight coordination of token refreshes.
///
/// Every caller that arrives while a refresh is running joins it instead of
/// starting another. The remote call runs on its own task, so a caller that
/// stops waiting does not cancel the episode for everyone else.
#[derive(Clone)]
pub struct RefreshCoordinator {
    session: AuthSession,
    refresher: Arc<dyn TokenRefresher>,
    state: Arc<Mutex<RefreshState>>,
}

impl RefreshCoordinator {
    pub fn new(session: AuthSession, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            session,
            refresher,
            state: Arc::new(Mutex::new(RefreshState::default())),
        }
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    pub fn is_refreshing(&self) -> bool {
        self.state.lock().in_flight
    }

    /// Number of callers parked on the current episode.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Obtain a fresh token, joining the in-flight refresh if there is one.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn request_refresh(&self) -> Result<String, RefreshError> {
        let (tx, rx) = oneshot::channel();
        let leader_epoch = {
            let mut state = self.state.lock();
            state.waiters.push(tx);
            if state.in_flight {
                debug!(waiters = state.waiters.len(), "joining in-flight refresh");
                None
            } else {
                state.in_flight = true;
                // Pinned here, before the task runs, so a clear in between counts.
                Some(self.session.epoch())
            }
        };

        if let Some(epoch) = leader_epoch {
            let coordinator = self.clone();
            tokio::spawn(async move { coordinator.run_episode(epoch).await });
        }

        rx.await.unwrap_or(Err(RefreshError::Abandoned))
    }

    async fn run_episode(&self, epoch: u64) {
        info!("refreshing access token");

        let attempt = AssertUnwindSafe(self.refresher.refresh())
            .catch_unwind()
            .await;
        let outcome = match attempt {
            Ok(Ok(token)) => self.session.commit_refresh(token, epoch),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(RefreshError::Abandoned),
        };

        if let Err(err) = &outcome {
            let cleared = self.session.clear_if_epoch(epoch);
            warn!(%err, cleared, "token refresh failed");
        }

        let waiters = {
            let mut state = self.state.lock();
            state.in_flight = false;
            std::mem::take(&mut state.waiters)
        };
        info!(
            waiters = waiters.len(),
            success = outcome.is_ok(),
            "refresh settled"
        );
        for waiter in waiters {
            // A waiter whose caller went away has nothing to receive.
            let _ = waiter.send(outcome.clone());
        }
    }
}
