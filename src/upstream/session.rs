use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{Authenticator, Result, Session};

/// SessionManager owns the provider session. All callers share one manager
/// and only the manager writes the session.
pub struct SessionManager<A> {
    auth: A,
    session: Mutex<Option<Session>>,
}

impl<A: Authenticator + Send + Sync> SessionManager<A> {
    pub fn new(auth: A) -> Self {
        Self {
            auth,
            session: Mutex::new(None),
        }
    }

    pub fn authenticator(&self) -> &A {
        &self.auth
    }

    /// Returns the current session, logging in when there is none yet.
    pub async fn session(&self) -> Result<Session> {
        let mut current = self.session.lock().await;

        match &*current {
            Some(session) => Ok(session.clone()),
            None => {
                let session = self.auth.login().await?;
                *current = Some(session.clone());
                Ok(session)
            }
        }
    }

    /// Replaces the access token of the held session. A rejected refresh
    /// falls back to a full login.
    pub async fn refresh(&self) -> Result<Session> {
        let mut current = self.session.lock().await;

        let session = match &*current {
            Some(session) => match self.auth.refresh(session).await {
                Ok(refreshed) => refreshed,
                Err(err) => {
                    warn!(%err, "refresh rejected, logging in again");
                    self.auth.login().await?
                }
            },
            None => self.auth.login().await?,
        };

        info!("session renewed");
        *current = Some(session.clone());

        Ok(session)
    }
}
