use std::cell::RefCell;
use std::rc::Rc;

use supaclient::{RemoteDataService, Row};

use crate::SyncError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthStatus {
    Loading,
    Authenticated,
    Unauthenticated,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
    pub id: String,
}

/// Who is signed in. Consulted before every write and whenever favourites are synced.
pub trait SessionProvider {
    fn current_user(&self) -> Option<User>;
    fn status(&self) -> AuthStatus;
}

/// Sign-in by bare username: the name becomes the user id and is registered in `users`.
pub struct UsernameSession<R> {
    remote: Rc<R>,
    state: RefCell<(AuthStatus, Option<User>)>,
}

impl<R: RemoteDataService> UsernameSession<R> {
    pub fn new(remote: Rc<R>) -> Self {
        Self {
            remote,
            state: RefCell::new((AuthStatus::Unauthenticated, None)),
        }
    }

    pub async fn sign_in(&self, username: &str) -> Result<User, SyncError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(SyncError::Validation("username must not be empty".into()));
        }

        let previous = self.state.replace((AuthStatus::Loading, None));
        let mut row = Row::new();
        row.insert("id".into(), username.into());
        let registered = self.remote.upsert("users", vec![row]).await;
        match registered {
            Ok(_) => {
                let user = User {
                    id: username.to_string(),
                };
                log::info!("Signed in as {}", user.id);
                *self.state.borrow_mut() = (AuthStatus::Authenticated, Some(user.clone()));
                Ok(user)
            }
            Err(e) => {
                log::warn!("Sign-in for {username} failed: {e}");
                *self.state.borrow_mut() = previous;
                Err(e.into())
            }
        }
    }

    pub fn sign_out(&self) {
        if let (_, Some(user)) = self.state.replace((AuthStatus::Unauthenticated, None)) {
            log::info!("Signed out {}", user.id);
        }
    }
}

impl<R> SessionProvider for UsernameSession<R> {
    fn current_user(&self) -> Option<User> {
        self.state.borrow().1.clone()
    }

    fn status(&self) -> AuthStatus {
        self.state.borrow().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use supaclient::memory::MemoryBackend;

    #[test]
    fn test_sign_in_registers_trimmed_username() {
        let backend = Rc::new(MemoryBackend::new());
        let session = UsernameSession::new(backend.clone());

        let user = block_on(session.sign_in("  nino ")).unwrap();
        assert_eq!(user.id, "nino");
        assert_eq!(session.status(), AuthStatus::Authenticated);
        assert_eq!(backend.rows("users")[0]["id"], "nino");

        block_on(session.sign_in("nino")).unwrap();
        assert_eq!(backend.rows("users").len(), 1);

        session.sign_out();
        assert_eq!(session.current_user(), None);
        assert_eq!(session.status(), AuthStatus::Unauthenticated);
    }

    #[test]
    fn test_empty_username_is_rejected_locally() {
        let backend = Rc::new(MemoryBackend::new());
        let session = UsernameSession::new(backend.clone());
        let err = block_on(session.sign_in("   ")).unwrap_err();
        assert!(err.is_precondition());
        assert!(backend.calls().is_empty());
    }
}
