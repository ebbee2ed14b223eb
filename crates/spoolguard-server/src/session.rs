//! In-memory session tracking.
//!
//! Sessions are the local representation of "authenticated platform
//! identity".  They are opaque random tokens handed out as cookies after a
//! successful OIDC code exchange; the identity payload lives server-side
//! only.  Kiosk cookies are tracked separately and carry no identity.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::http::HeaderMap;
use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Cookie names.
pub const SESSION_COOKIE: &str = "sg_session";
pub const KIOSK_COOKIE: &str = "sg_kiosk";

/// An authenticated platform identity.
#[derive(Debug, Clone, Serialize)]
pub struct SessionUser {
    pub username: String,
    pub email: String,
    pub name: String,
    pub groups: Vec<String>,
    /// Opaque token forwarded to the identity provider's end-session
    /// endpoint on federated logout.
    #[serde(skip)]
    pub id_token: Option<String>,
}

/// Server-side session registry.
#[derive(Clone, Default)]
pub struct SessionStore {
    users: Arc<Mutex<HashMap<Uuid, SessionUser>>>,
    kiosks: Arc<Mutex<HashSet<Uuid>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session and return its cookie token.
    pub async fn create(&self, user: SessionUser) -> Uuid {
        let token = Uuid::new_v4();
        self.users.lock().await.insert(token, user);
        token
    }

    pub async fn get(&self, token: Uuid) -> Option<SessionUser> {
        self.users.lock().await.get(&token).cloned()
    }

    /// Remove a session, returning the identity for federated logout.
    pub async fn remove(&self, token: Uuid) -> Option<SessionUser> {
        self.users.lock().await.remove(&token)
    }

    /// Create a kiosk session (no identity attached).
    pub async fn create_kiosk(&self) -> Uuid {
        let token = Uuid::new_v4();
        self.kiosks.lock().await.insert(token);
        token
    }

    pub async fn is_kiosk(&self, token: Uuid) -> bool {
        self.kiosks.lock().await.contains(&token)
    }
}

/// Pull a named cookie out of the request headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<Uuid> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        if k == name {
            Uuid::parse_str(v.trim()).ok()
        } else {
            None
        }
    })
}

/// Build a `Set-Cookie` value for a session token.
pub fn set_cookie(name: &str, token: Uuid) -> String {
    format!("{name}={token}; Path=/; HttpOnly; SameSite=Lax")
}

/// Build a `Set-Cookie` value that clears the named cookie.
pub fn clear_cookie(name: &str) -> String {
    format!("{name}=; Path=/; HttpOnly; Max-Age=0")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::COOKIE;

    fn user() -> SessionUser {
        SessionUser {
            username: "alice".into(),
            email: "alice@example.com".into(),
            name: "Alice".into(),
            groups: vec!["staff".into()],
            id_token: None,
        }
    }

    #[tokio::test]
    async fn session_round_trip() {
        let store = SessionStore::new();
        let token = store.create(user()).await;

        assert_eq!(store.get(token).await.unwrap().username, "alice");
        assert_eq!(store.remove(token).await.unwrap().username, "alice");
        assert!(store.get(token).await.is_none());
    }

    #[tokio::test]
    async fn kiosk_sessions_are_separate() {
        let store = SessionStore::new();
        let kiosk = store.create_kiosk().await;

        assert!(store.is_kiosk(kiosk).await);
        assert!(store.get(kiosk).await.is_none());
        assert!(!store.is_kiosk(Uuid::new_v4()).await);
    }

    #[test]
    fn cookie_parsing() {
        let mut headers = HeaderMap::new();
        let token = Uuid::new_v4();
        headers.insert(
            COOKIE,
            format!("other=1; sg_session={token}; theme=dark").parse().unwrap(),
        );

        assert_eq!(cookie_value(&headers, SESSION_COOKIE), Some(token));
        assert_eq!(cookie_value(&headers, KIOSK_COOKIE), None);

        headers.insert(COOKIE, "sg_session=not-a-uuid".parse().unwrap());
        assert_eq!(cookie_value(&headers, SESSION_COOKIE), None);
    }
}
