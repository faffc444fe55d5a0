//! Server-side login sessions keyed by a random cookie value

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

pub const SESSION_COOKIE: &str = "burrow_session";

#[derive(Debug, Clone)]
struct Session {
    username: String,
    last_seen: Instant,
}

/// Session table with idle expiry
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<DashMap<String, Session>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Open a session for `username` and return its id
    pub fn create(&self, username: &str) -> String {
        self.purge_expired();
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.sessions.insert(
            id.clone(),
            Session {
                username: username.to_string(),
                last_seen: Instant::now(),
            },
        );
        id
    }

    /// Username behind a live session; refreshes its idle timer
    pub fn validate(&self, id: &str) -> Option<String> {
        {
            let mut session = self.sessions.get_mut(id)?;
            if session.last_seen.elapsed() <= self.ttl {
                session.last_seen = Instant::now();
                return Some(session.username.clone());
            }
        }

        self.sessions.remove(id);
        None
    }

    pub fn remove(&self, id: &str) -> bool {
        self.sessions.remove(id).is_some()
    }

    /// Drop every session of `username` except `keep`
    pub fn invalidate_user(&self, username: &str, keep: Option<&str>) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|id, session| session.username != username || Some(id.as_str()) == keep);
        before - self.sessions.len()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.sessions.len()
    }

    fn purge_expired(&self) {
        let ttl = self.ttl;
        self.sessions
            .retain(|_, session| session.last_seen.elapsed() <= ttl);
    }
}

/// Value of the session cookie in a `Cookie` header, if present
pub fn session_from_cookie_header(header: &str) -> Option<&str> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE && !value.is_empty()).then_some(value)
    })
}

/// `Set-Cookie` value for a session id
pub fn session_cookie(id: &str, ttl: Duration, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE,
        id,
        ttl.as_secs()
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// `Set-Cookie` value that clears the session cookie
pub fn clear_session_cookie(secure: bool) -> String {
    let mut cookie = format!(
        "{}=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0",
        SESSION_COOKIE
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}
