use crate::error::RefreshError;
use crate::refresh::RefreshCoordinator;
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Identity returned by `GET /auth/me`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserIdentity {
    #[serde(deserialize_with = "id_from_string_or_number")]
    pub id: String,
    pub username: String,
}

fn id_from_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(text) => text,
        RawId::Number(number) => number.to_string(),
    })
}

/// Snapshot of the authenticated session.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    pub token: Option<String>,
    pub user: Option<UserIdentity>,
    /// Bumped by every login and every clear. A refresh that started under an
    /// older epoch must not write its token.
    pub epoch: u64,
}

struct SessionInner {
    state: RwLock<AuthState>,
    initialized: OnceCell<()>,
}

/// Holds the current access token and user identity.
///
/// Only login, refresh settlement and logout write the token; everything else
/// reads it.
#[derive(Clone)]
pub struct AuthSession {
    inner: Arc<SessionInner>,
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthSession {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SessionInner {
                state: RwLock::new(AuthState::default()),
                initialized: OnceCell::new(),
            }),
        }
    }

    pub fn snapshot(&self) -> AuthState {
        self.inner.state.read().clone()
    }

    pub fn token(&self) -> Option<String> {
        self.inner.state.read().token.clone()
    }

    pub fn user(&self) -> Option<UserIdentity> {
        self.inner.state.read().user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.read().token.is_some()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.state.read().epoch
    }

    /// Install a token obtained from login. Replaces any previous token and
    /// supersedes refreshes already in flight.
    pub fn set_token(&self, token: impl Into<String>) {
        let mut state = self.inner.state.write();
        state.token = Some(token.into());
        state.epoch += 1;
        debug!(epoch = state.epoch, "session token replaced");
    }

    pub fn set_user(&self, user: UserIdentity) {
        self.inner.state.write().user = Some(user);
    }

    /// Drop token and user. Independent of any refresh in flight.
    pub fn clear(&self) {
        let mut state = self.inner.state.write();
        state.token = None;
        state.user = None;
        state.epoch += 1;
        debug!(epoch = state.epoch, "session cleared");
    }

    /// Clear only if nothing wrote the session since `epoch` was observed.
    pub(crate) fn clear_if_epoch(&self, epoch: u64) -> bool {
        let mut state = self.inner.state.write();
        if state.epoch != epoch {
            return false;
        }
        state.token = None;
        state.user = None;
        state.epoch += 1;
        true
    }

    /// Store a refreshed token if the session is still the one the refresh
    /// started from. Otherwise keep whatever login installed meanwhile, or
    /// report that the session ended.
    pub(crate) fn commit_refresh(&self, token: String, epoch: u64) -> Result<String, RefreshError> {
        let mut state = self.inner.state.write();
        if state.epoch == epoch {
            state.token = Some(token.clone());
            return Ok(token);
        }
        debug!(
            started = epoch,
            current = state.epoch,
            "discarding refresh result for superseded session"
        );
        state.token.clone().ok_or(RefreshError::SessionEnded)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.initialized()
    }

    /// Attempt one silent refresh per session lifetime. Failures leave the
    /// session unauthenticated; either way the session counts as initialized.
    /// Returns whether a token is held afterwards.
    pub async fn initialize(&self, coordinator: &RefreshCoordinator) -> bool {
        self.inner
            .initialized
            .get_or_init(|| async {
                match coordinator.request_refresh().await {
                    Ok(_) => info!("restored session via silent refresh"),
                    Err(err) => info!(%err, "no session to restore"),
                }
            })
            .await;
        self.is_authenticated()
    }
}
