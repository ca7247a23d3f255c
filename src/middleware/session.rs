//! Cookie-keyed in-memory sessions.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::Error;
use crate::handler::BoxFuture;
use crate::pipeline::{Interceptor, Next};
use crate::request::Request;
use crate::response::Response;

/// Per-client key/value store, shared between requests carrying the same cookie.
#[derive(Clone)]
pub struct Session {
    id: Arc<str>,
    data: Arc<DashMap<String, Value>>,
}

impl Session {
    fn new(id: String) -> Self {
        Self { id: id.into(), data: Arc::new(DashMap::new()) }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.data.get(key).map(|v| v.value().clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.data.insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.data.remove(key).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("entries", &self.data.len())
            .finish()
    }
}

/// New sessions stored between sweeps of idle ones.
const SWEEP_EVERY: usize = 256;

struct Stored {
    session: Session,
    last_seen: Instant,
}

/// Attaches a [`Session`] to every request.
///
/// A request without a known session cookie gets a fresh session and a
/// `Set-Cookie` header carrying its id. The session is only kept once the
/// request has written something to it, and a kept session is dropped after
/// `idle_timeout` without requests.
pub struct Sessions {
    cookie_name: String,
    idle_timeout: Duration,
    store: DashMap<String, Stored>,
    created: AtomicUsize,
}

impl Default for Sessions {
    fn default() -> Self {
        Self::new("neon_session")
    }
}

impl Sessions {
    pub fn new(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
            idle_timeout: Duration::from_secs(1800),
            store: DashMap::new(),
            created: AtomicUsize::new(0),
        }
    }

    /// How long a session survives without requests. Default 30 minutes.
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn existing(&self, req: &Request, now: Instant) -> Option<Session> {
        let id = cookie(req.header("cookie")?, &self.cookie_name)?;
        let mut stored = self.store.get_mut(id)?;
        if now.duration_since(stored.last_seen) >= self.idle_timeout {
            drop(stored);
            self.store.remove(id);
            return None;
        }
        stored.last_seen = now;
        Some(stored.session.clone())
    }

    fn keep(&self, session: Session, now: Instant) {
        if self.created.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == 0 {
            self.sweep(now);
        }
        self.store
            .insert(session.id().to_owned(), Stored { session, last_seen: now });
    }

    /// Drops sessions idle for `idle_timeout` or longer.
    fn sweep(&self, now: Instant) {
        let before = self.store.len();
        self.store
            .retain(|_, stored| now.duration_since(stored.last_seen) < self.idle_timeout);
        debug!(expired = before.saturating_sub(self.store.len()), "idle sessions swept");
    }
}

/// Value of cookie `name` in a `Cookie` header.
fn cookie<'h>(header: &'h str, name: &str) -> Option<&'h str> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
}

impl Interceptor for Sessions {
    fn intercept<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<(), Error>> {
        let now = Instant::now();
        if let Some(session) = self.existing(req, now) {
            req.set_session(session);
            return next.run(req, res);
        }

        let session = Session::new(Uuid::new_v4().to_string());
        res.set_header(
            "set-cookie",
            &format!("{}={}; HttpOnly; Secure; Path=/", self.cookie_name, session.id()),
        );
        req.set_session(session.clone());
        Box::pin(async move {
            let outcome = next.run(req, res).await;
            if !session.is_empty() {
                debug!(session = session.id(), "session created");
                self.keep(session, now);
            }
            outcome
        })
    }

    fn name(&self) -> &'static str {
        "sessions"
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::method::Method;
    use crate::pipeline::Pipeline;

    /// Counts visits in the session.
    struct Visits;

    impl Interceptor for Visits {
        fn intercept<'a>(
            &'a self,
            req: &'a mut Request,
            res: &'a mut Response,
            _next: Next<'a>,
        ) -> BoxFuture<'a, Result<(), Error>> {
            let session = req.session().unwrap();
            let visits = session.get("visits").and_then(|v| v.as_u64()).unwrap_or(0) + 1;
            session.insert("visits", json!(visits));
            res.send(visits.to_string());
            Box::pin(async { Ok(()) })
        }
    }

    #[test]
    fn cookie_header_parsing() {
        assert_eq!(cookie("a=1; neon_session=xyz; b=2", "neon_session"), Some("xyz"));
        assert_eq!(cookie("neon_session_old=1", "neon_session"), None);
        assert_eq!(cookie("", "neon_session"), None);
    }

    #[tokio::test]
    async fn new_clients_get_a_cookie_and_returning_clients_keep_state() {
        let pipeline = Pipeline::new().with(Sessions::default()).with(Visits);

        let mut req = Request::new(Method::Get, "/");
        let mut res = Response::new();
        pipeline.dispatch(&mut req, &mut res).await;
        let set_cookie = res.header("set-cookie").unwrap().to_owned();
        assert!(set_cookie.starts_with("neon_session="));
        assert!(set_cookie.ends_with("; HttpOnly; Secure; Path=/"));
        assert_eq!(res.body(), b"1");

        let pair = set_cookie.split(';').next().unwrap();
        let mut req = Request::new(Method::Get, "/").with_header("cookie", pair);
        let mut res = Response::new();
        pipeline.dispatch(&mut req, &mut res).await;
        assert_eq!(res.header("set-cookie"), None);
        assert_eq!(res.body(), b"2");
    }

    /// Answers without touching the session.
    struct Stateless;

    impl Interceptor for Stateless {
        fn intercept<'a>(
            &'a self,
            _req: &'a mut Request,
            res: &'a mut Response,
            _next: Next<'a>,
        ) -> BoxFuture<'a, Result<(), Error>> {
            res.send("ok");
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn untouched_sessions_are_not_stored() {
        let sessions = Arc::new(Sessions::default());
        let pipeline = Pipeline::new().with(Arc::clone(&sessions)).with(Stateless);

        for _ in 0..10_000 {
            let mut req = Request::new(Method::Get, "/");
            let mut res = Response::new();
            pipeline.dispatch(&mut req, &mut res).await;
            assert!(res.header("set-cookie").is_some());
        }
        assert!(sessions.is_empty());
    }

    #[test]
    fn idle_sessions_expire_and_are_swept() {
        let sessions = Sessions::default().with_idle_timeout(Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..100 {
            let session = Session::new(Uuid::new_v4().to_string());
            session.insert("visits", json!(1));
            sessions.keep(session, start);
        }
        assert_eq!(sessions.len(), 100);

        let kept = Session::new("kept".to_owned());
        sessions.keep(kept, start + Duration::from_secs(30));
        sessions.sweep(start + Duration::from_secs(61));
        assert_eq!(sessions.len(), 1);

        let req = Request::new(Method::Get, "/").with_header("cookie", "neon_session=kept");
        assert!(sessions.existing(&req, start + Duration::from_secs(89)).is_some());
        assert!(sessions.existing(&req, start + Duration::from_secs(150)).is_none());
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn unknown_session_ids_are_replaced() {
        let pipeline = Pipeline::new().with(Sessions::new("sid")).with(Visits);
        let mut req = Request::new(Method::Get, "/").with_header("cookie", "sid=forged");
        let mut res = Response::new();
        pipeline.dispatch(&mut req, &mut res).await;
        assert!(!res.header("set-cookie").unwrap().contains("forged"));
    }
}
