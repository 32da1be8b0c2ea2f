//! Authentication capability consumed by the sync engine and remotes.
//!
//! Token acquisition happens elsewhere; this only answers whether we have
//! credentials and what header carries them.

use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser {
    pub id: String,
    pub email: String,
}

pub trait AuthProvider: Send + Sync {
    fn is_authenticated(&self) -> bool;

    /// Value for the `Authorization` header, e.g. `Bearer <token>`
    fn get_auth_header(&self) -> Option<String>;

    fn get_current_user(&self) -> Option<CurrentUser>;
}

/// Bearer token held in memory. The token can be swapped or cleared at
/// runtime (sign-in, sign-out, refresh).
#[derive(Default)]
pub struct StaticTokenAuth {
    token: RwLock<Option<String>>,
    user: RwLock<Option<CurrentUser>>,
}

impl StaticTokenAuth {
    pub fn new(token: Option<String>, user: Option<CurrentUser>) -> Self {
        Self {
            token: RwLock::new(token),
            user: RwLock::new(user),
        }
    }

    /// Provider that always reports unauthenticated.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token;
    }

    pub fn set_user(&self, user: Option<CurrentUser>) {
        *self.user.write().unwrap_or_else(|e| e.into_inner()) = user;
    }
}

impl AuthProvider for StaticTokenAuth {
    fn is_authenticated(&self) -> bool {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_deref()
            .is_some_and(|t| !t.is_empty())
    }

    fn get_auth_header(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|t| !t.is_empty())
            .map(|t| format!("Bearer {}", t))
    }

    fn get_current_user(&self) -> Option<CurrentUser> {
        self.user.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_auth_header() {
        let auth = StaticTokenAuth::new(Some("abc".into()), None);
        assert!(auth.is_authenticated());
        assert_eq!(auth.get_auth_header().as_deref(), Some("Bearer abc"));

        auth.set_token(None);
        assert!(!auth.is_authenticated());
        assert_eq!(auth.get_auth_header(), None);
    }

    #[test]
    fn test_empty_token_is_unauthenticated() {
        let auth = StaticTokenAuth::new(Some(String::new()), None);
        assert!(!auth.is_authenticated());
        assert!(StaticTokenAuth::anonymous().get_current_user().is_none());
    }
}
