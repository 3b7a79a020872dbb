//! Client authentication
//!
//! The server consults an [`Authenticator`] with the parsed
//! [`ClientHello`]; the answer is a plain yes/no so that a rejected peer
//! learns nothing about which check failed.

use crate::protocol::ClientHello;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Separator between login and password in the credential blob
pub const CREDENTIAL_SEPARATOR: char = ':';

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    /// Server side: the hello carried credentials no user matches
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Client side: the server answered with a rejection
    #[error("Handshake rejected by server")]
    Rejected,
}

/// Decides whether a client may establish a tunnel.
///
/// Implementations are shared by every connection task and must be
/// thread-safe.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `true` when the hello's credentials are acceptable
    async fn authenticate(&self, hello: &ClientHello) -> bool;
}

#[async_trait]
impl<A: Authenticator + ?Sized> Authenticator for Arc<A> {
    #[inline]
    async fn authenticate(&self, hello: &ClientHello) -> bool {
        (**self).authenticate(hello).await
    }
}

#[async_trait]
impl<A: Authenticator + ?Sized> Authenticator for Box<A> {
    #[inline]
    async fn authenticate(&self, hello: &ClientHello) -> bool {
        (**self).authenticate(hello).await
    }
}

/// Build the credential blob `login:password`
pub fn credentials_blob(login: &str, password: &str) -> Vec<u8> {
    format!("{}{}{}", login, CREDENTIAL_SEPARATOR, password).into_bytes()
}

/// Fixed login → password table
#[derive(Clone, Default)]
pub struct StaticAuth {
    users: HashMap<String, String>,
}

impl StaticAuth {
    /// Create from a login → password map
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    /// Create from `(login, password)` pairs
    pub fn from_pairs<I, L, P>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (L, P)>,
        L: Into<String>,
        P: Into<String>,
    {
        Self {
            users: pairs
                .into_iter()
                .map(|(l, p)| (l.into(), p.into()))
                .collect(),
        }
    }

    /// Number of known users
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether no user is configured
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Check a `login:password` blob. The split happens at the first
    /// separator, so passwords may themselves contain `:`.
    pub fn check(&self, auth_data: &[u8]) -> bool {
        let Ok(text) = std::str::from_utf8(auth_data) else {
            return false;
        };
        let Some((login, password)) = text.split_once(CREDENTIAL_SEPARATOR) else {
            return false;
        };

        match self.users.get(login) {
            Some(expected) => expected.as_bytes() == password.as_bytes(),
            None => false,
        }
    }
}

#[async_trait]
impl Authenticator for StaticAuth {
    async fn authenticate(&self, hello: &ClientHello) -> bool {
        self.check(&hello.auth_data)
    }
}

impl std::fmt::Debug for StaticAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticAuth")
            .field("users", &self.users.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(auth: &[u8]) -> ClientHello {
        ClientHello {
            auth_data: auth.to_vec(),
            proposed_layers: vec![1],
            bootstrap_layer: 0,
        }
    }

    fn auth() -> StaticAuth {
        StaticAuth::from_pairs([("alice", "a:b"), ("bob", "hunter2")])
    }

    #[tokio::test]
    async fn test_accepts_known_user() {
        let auth = auth();
        assert!(auth.authenticate(&hello(b"bob:hunter2")).await);
        // Password with a colon: split on the first one only
        assert!(auth.authenticate(&hello(b"alice:a:b")).await);
    }

    #[tokio::test]
    async fn test_rejects_bad_credentials() {
        let auth = auth();
        assert!(!auth.authenticate(&hello(b"")).await);
        assert!(!auth.authenticate(&hello(b"bob")).await);
        assert!(!auth.authenticate(&hello(b"bob:wrong")).await);
        assert!(!auth.authenticate(&hello(b"carol:hunter2")).await);
        assert!(!auth.authenticate(&hello(b"alice:a")).await);
        assert!(!auth.authenticate(&hello(&[0xff, b':', 0xfe])).await);
    }

    #[tokio::test]
    async fn test_shared_authenticator() {
        let shared: Arc<dyn Authenticator> = Arc::new(auth());
        assert!(shared.authenticate(&hello(b"bob:hunter2")).await);
    }

    #[test]
    fn test_credentials_blob() {
        assert_eq!(credentials_blob("alice", "a:b"), b"alice:a:b");
        assert_eq!(auth().len(), 2);
    }
}
