//! HTTP state store
//!
//! Protocol, relative to the base address:
//! - `GET <address>/<key>` returns the state object (404: no state yet)
//! - `POST <address>/<key>` replaces it
//! - `POST <address>/<key>/lock` creates the lock record (409 or 423: held)
//! - `DELETE <address>/<key>/lock?id=<lock id>` releases it
//! - `GET <address>/<key>/lock` returns the current holder (404: unlocked)

use super::{DeploymentState, LockInfo, StateBackend, StateId};
use crate::error::StateError;

/// State store behind an HTTP service
pub struct HttpBackend {
    agent: ureq::Agent,
    address: String,
}

impl HttpBackend {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
            address: address.into().trim_end_matches('/').to_string(),
        }
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    fn state_url(&self, id: &StateId) -> String {
        format!("{}/{id}", self.address)
    }

    fn lock_url(&self, id: &StateId) -> String {
        format!("{}/{id}/lock", self.address)
    }
}

impl StateBackend for HttpBackend {
    fn read(&self, id: &StateId) -> Result<Option<DeploymentState>, StateError> {
        match self.agent.get(&self.state_url(id)).call() {
            Ok(mut response) => Ok(Some(response.body_mut().read_json()?)),
            Err(ureq::Error::StatusCode(404)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, id: &StateId, state: &DeploymentState) -> Result<(), StateError> {
        self.agent.post(&self.state_url(id)).send_json(state)?;
        Ok(())
    }

    fn lock(&self, id: &StateId, info: &LockInfo) -> Result<(), StateError> {
        match self.agent.post(&self.lock_url(id)).send_json(info) {
            Ok(_) => Ok(()),
            Err(ureq::Error::StatusCode(code @ (409 | 423))) => {
                let holder = self
                    .lock_info(id)
                    .ok()
                    .flatten()
                    .map_or_else(|| format!("another client (HTTP {code})"), |i| i.to_string());
                Err(StateError::Locked {
                    id: id.to_string(),
                    holder,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn unlock(&self, id: &StateId, lock_id: &str) -> Result<(), StateError> {
        match self
            .agent
            .delete(&self.lock_url(id))
            .query("id", lock_id)
            .call()
        {
            Ok(_) | Err(ureq::Error::StatusCode(404)) => Ok(()),
            Err(ureq::Error::StatusCode(409)) => {
                let actual = self
                    .lock_info(id)?
                    .map_or_else(|| "unknown".to_string(), |i| i.id);
                Err(StateError::LockMismatch {
                    id: id.to_string(),
                    expected: lock_id.to_string(),
                    actual,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn lock_info(&self, id: &StateId) -> Result<Option<LockInfo>, StateError> {
        match self.agent.get(&self.lock_url(id)).call() {
            Ok(mut response) => Ok(Some(response.body_mut().read_json()?)),
            Err(ureq::Error::StatusCode(404)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let backend = HttpBackend::new("https://state.example.com/v1/");
        let id = StateId::new("webapp/prod").unwrap();

        assert_eq!(backend.address(), "https://state.example.com/v1");
        assert_eq!(backend.state_url(&id), "https://state.example.com/v1/webapp/prod");
        assert_eq!(backend.lock_url(&id), "https://state.example.com/v1/webapp/prod/lock");
    }
}
