//! Cookie-carried sessions: a signed session id identifies a bag of `serde_json`
//! values stored server-side behind a pluggable [`SessionStore`], defaulting to an
//! in-memory one.
//!
//! Not grounded on a single teacher file (the teacher repo has no session
//! middleware); the cookie plumbing reuses [`crate::context::response::OutgoingCookie`]
//! and [`crate::context::request::parse_cookie_header`] already built for the rest of
//! this crate, and the id is HMAC-SHA256 signed the way a JWT or a signed cookie
//! typically is, verified with [`crate::primitives::constant_time::constant_time_eq`]
//! so a forged signature can't be distinguished from a valid one by timing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use lru::LruCache;
use sha2::Sha256;
use tokio::sync::Mutex as AsyncMutex;

use crate::context::response::OutgoingCookie;
use crate::context::Context;
use crate::error::Error;
use crate::middleware::{mw, BoxFuture, Middleware};
use crate::primitives::constant_time::constant_time_eq;
use crate::router::Next;

type HmacSha256 = Hmac<Sha256>;

/// The bag of values a session carries, looked up and mutated through
/// [`Context::get_state`]/[`Context::set_state`] under the `"session"` key once this
/// middleware has run.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub id: String,
    values: HashMap<String, serde_json::Value>,
    dirty: bool,
}

impl Session {
    fn new(id: String) -> Self {
        Session {
            id,
            values: HashMap::new(),
            dirty: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.values.insert(key.into(), value);
        self.dirty = true;
    }

    pub fn remove(&mut self, key: &str) {
        if self.values.remove(key).is_some() {
            self.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Backing storage for session data, behind a trait object returning boxed futures —
/// the same hand-rolled async-trait-object shape [`crate::middleware::Middleware`]
/// uses, so an application can swap in Redis, a database, or anything else shaped
/// like a key-value store without this crate depending on the `async-trait` macro for
/// a single trait.
pub trait SessionStore: Send + Sync + 'static {
    fn load(&self, id: &str) -> BoxFuture<'_, Option<HashMap<String, serde_json::Value>>>;
    fn save(&self, id: &str, values: HashMap<String, serde_json::Value>) -> BoxFuture<'_, ()>;
    fn remove(&self, id: &str) -> BoxFuture<'_, ()>;
}

/// The default, process-local [`SessionStore`]. Sessions do not survive a restart and
/// are not shared across instances; applications needing either should provide their
/// own [`SessionStore`] impl.
#[derive(Default)]
pub struct InMemorySessionStore {
    inner: AsyncMutex<HashMap<String, HashMap<String, serde_json::Value>>>,
}

impl SessionStore for InMemorySessionStore {
    fn load(&self, id: &str) -> BoxFuture<'_, Option<HashMap<String, serde_json::Value>>> {
        let id = id.to_string();
        Box::pin(async move { self.inner.lock().await.get(&id).cloned() })
    }

    fn save(&self, id: &str, values: HashMap<String, serde_json::Value>) -> BoxFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            self.inner.lock().await.insert(id, values);
        })
    }

    fn remove(&self, id: &str) -> BoxFuture<'_, ()> {
        let id = id.to_string();
        Box::pin(async move {
            self.inner.lock().await.remove(&id);
        })
    }
}

/// Tuning knobs for the session middleware.
pub struct SessionConfig {
    /// Signing key for the session id cookie. Required: a missing or empty secret
    /// would make every session id forgeable, so there is no "insecure default" here.
    pub secret: Vec<u8>,
    pub cookie_name: String,
    pub store: Arc<dyn SessionStore>,
    /// Maximum number of distinct session ids tracked by the concurrent-save
    /// coordinator at once (see [`SaveCoordinator`]).
    pub capacity: usize,
}

impl SessionConfig {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        SessionConfig {
            secret: secret.into(),
            cookie_name: "expresso.sid".to_string(),
            store: Arc::new(InMemorySessionStore::default()),
            capacity: 10_000,
        }
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    pub fn cookie_name(mut self, name: impl Into<String>) -> Self {
        self.cookie_name = name.into();
        self
    }
}

/// Per-session-id state backing the "at most one save in flight" guarantee: while
/// `saving` is set, a competing save doesn't call the store a second time — it
/// overwrites `pending` with its own values and lets the in-flight save's owner pick
/// them up in a follow-up round once it finishes, per spec §4.8 ("pending writes
/// during a save are coalesced into a follow-up save after the in-flight one
/// completes"). `saving` and `pending` live behind one lock so the decision to
/// become the saver (or queue behind one) and the decision to release the slot are
/// never split across two separately-locked steps — otherwise a write that lands in
/// the gap between "the saver found nothing pending" and "the saver released the
/// slot" would be queued with nobody left to flush it.
struct SlotState {
    saving: bool,
    pending: Option<HashMap<String, serde_json::Value>>,
}

struct SaveSlot {
    state: Mutex<SlotState>,
}

impl SaveSlot {
    fn new() -> Self {
        SaveSlot {
            state: Mutex::new(SlotState { saving: false, pending: None }),
        }
    }
}

/// LRU-bounded registry of [`SaveSlot`]s, one per session id currently mid-save.
/// Bounded the same way [`crate::middleware::rate_limit`]'s bucket map and
/// [`crate::middleware::cache`]'s entry map are: an `lru::LruCache` behind a
/// `std::sync::Mutex`, so a churn of short-lived session ids can't grow this map
/// without bound.
struct SaveCoordinator {
    slots: Mutex<LruCache<String, Arc<SaveSlot>>>,
}

impl SaveCoordinator {
    fn new(capacity: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(capacity.max(1)).unwrap();
        SaveCoordinator {
            slots: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn slot_for(&self, id: &str) -> Arc<SaveSlot> {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.get(id) {
            return slot.clone();
        }
        let slot = Arc::new(SaveSlot::new());
        slots.put(id.to_string(), slot.clone());
        slot
    }
}

/// Saves `values` for `id` through `store`, coalescing with any save already in
/// flight for the same id instead of running a second concurrent `store.save`.
///
/// If no save for `id` is in progress, this call becomes the saver: it writes
/// `values`, then checks whether a competing call queued a newer set of values
/// while it was writing, and if so writes those too before releasing the slot —
/// looping until nothing was queued behind it. If a save is already in progress,
/// this call only replaces `pending` with its own `values` and returns immediately;
/// the in-flight saver is guaranteed to observe and flush it before it releases the
/// slot.
async fn save_coalesced(
    coordinator: &SaveCoordinator,
    store: &Arc<dyn SessionStore>,
    id: &str,
    values: HashMap<String, serde_json::Value>,
) {
    let slot = coordinator.slot_for(id);

    let mut current = {
        let mut state = slot.state.lock().unwrap();
        if state.saving {
            state.pending = Some(values);
            return;
        }
        state.saving = true;
        values
    };

    loop {
        store.save(id, current.clone()).await;
        let mut state = slot.state.lock().unwrap();
        match state.pending.take() {
            Some(queued) => current = queued,
            None => {
                state.saving = false;
                break;
            }
        }
    }
}

fn sign(secret: &[u8], id: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(id.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

fn verify(secret: &[u8], id: &str, signature: &str) -> bool {
    let expected = sign(secret, id);
    constant_time_eq(expected.as_bytes(), signature.as_bytes())
}

/// Splits a cookie value shaped `<id>.<signature>` and verifies the signature,
/// returning the bare id on success.
fn parse_signed_id(secret: &[u8], cookie_value: &str) -> Option<String> {
    let (id, signature) = cookie_value.rsplit_once('.')?;
    if verify(secret, id, signature) {
        Some(id.to_string())
    } else {
        None
    }
}

fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Builds the session middleware. Loads (or starts) a [`Session`] before `next` runs,
/// hands it to downstream middleware/handlers via `ctx.get_state::<Session>("session")`
/// / `ctx.set_state("session", ...)`, and flushes it back to the store and the
/// client's cookie afterward if it was marked dirty.
pub fn session(config: SessionConfig) -> impl Middleware {
    let secret = config.secret;
    let cookie_name = config.cookie_name;
    let store = config.store;
    let coordinator = Arc::new(SaveCoordinator::new(config.capacity));

    mw(move |ctx: &mut Context, next: Next| {
        let secret = secret.clone();
        let cookie_name = cookie_name.clone();
        let store = store.clone();
        let coordinator = coordinator.clone();
        async move {
            let existing_id = ctx
                .cookie(&cookie_name)
                .and_then(|value| parse_signed_id(&secret, value));

            let (id, is_new) = match existing_id {
                Some(id) => (id, false),
                None => (new_session_id(), true),
            };

            let loaded = if is_new {
                HashMap::new()
            } else {
                store.load(&id).await.unwrap_or_default()
            };

            let mut session = Session::new(id.clone());
            session.values = loaded;
            ctx.set_state("session", session);

            next.run(ctx).await?;

            let session = ctx
                .get_state::<Session>("session")
                .cloned()
                .unwrap_or_else(|| Session::new(id.clone()));

            if is_new || session.is_dirty() {
                save_coalesced(&coordinator, &store, &id, session.values.clone()).await;
                let signature = sign(&secret, &id);
                let mut cookie = OutgoingCookie::new(cookie_name.clone(), format!("{id}.{signature}"));
                cookie.secure = ctx.is_secure();
                ctx.set_cookie(cookie);
            }

            Ok(())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::handler;
    use crate::router::Router;
    use std::sync::Arc as StdArc;

    fn build_router(secret: &str) -> StdArc<Router> {
        let cache = crate::primitives::regex_cache::RegexCache::new(4);
        let mut router = Router::new();
        router.use_mw(StdArc::new(session(SessionConfig::new(secret.as_bytes().to_vec()))));
        router
            .get(
                &cache,
                "/visit",
                vec![StdArc::new(handler(|ctx: &mut Context| async move {
                    let count = ctx
                        .get_state::<Session>("session")
                        .and_then(|s| s.get("visits"))
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0);
                    let session = ctx.get_state::<Session>("session").cloned().unwrap();
                    let mut session = session;
                    session.set("visits", serde_json::json!(count + 1));
                    ctx.set_state("session", session);
                    ctx.text(format!("{}", count + 1))?;
                    Ok(())
                })) as _],
            )
            .unwrap();
        StdArc::new(router)
    }

    #[tokio::test]
    async fn first_request_issues_a_signed_session_cookie() {
        let router = build_router("test-secret");
        let mut ctx = Context::new();
        ctx.request.path = "/visit".to_string();
        Router::dispatch_from(&router, 0, http::Method::GET, &mut ctx, Next::terminal())
            .await
            .unwrap();

        assert_eq!(ctx.response.body_debug(), "1");
        assert_eq!(ctx.response.cookies.len(), 1);
        assert!(ctx.response.cookies[0].value.contains('.'));
    }

    #[tokio::test]
    async fn returning_cookie_reuses_the_same_session() {
        let router = build_router("test-secret");

        let mut first = Context::new();
        first.request.path = "/visit".to_string();
        Router::dispatch_from(&router, 0, http::Method::GET, &mut first, Next::terminal())
            .await
            .unwrap();
        let cookie_value = first.response.cookies[0].value.clone();

        let mut second = Context::new();
        second.request.path = "/visit".to_string();
        second
            .request
            .cookies
            .insert("expresso.sid".to_string(), cookie_value);
        Router::dispatch_from(&router, 0, http::Method::GET, &mut second, Next::terminal())
            .await
            .unwrap();

        assert_eq!(second.response.body_debug(), "2");
    }

    #[tokio::test]
    async fn forged_cookie_is_rejected_and_a_new_session_starts() {
        let router = build_router("test-secret");
        let mut ctx = Context::new();
        ctx.request.path = "/visit".to_string();
        ctx.request
            .cookies
            .insert("expresso.sid".to_string(), "attacker-chosen-id.bad-signature".to_string());
        Router::dispatch_from(&router, 0, http::Method::GET, &mut ctx, Next::terminal())
            .await
            .unwrap();
        assert_eq!(ctx.response.body_debug(), "1");
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let secret = b"k".to_vec();
        let sig = sign(&secret, "abc");
        assert!(verify(&secret, "abc", &sig));
        assert!(!verify(&secret, "abc", "garbage"));
    }

    /// A [`SessionStore`] whose `save` blocks on a signal before writing, so a test
    /// can hold one save open while a second call for the same id races in behind
    /// it.
    #[derive(Default)]
    struct BlockingStore {
        saves: AsyncMutex<Vec<HashMap<String, serde_json::Value>>>,
        release: tokio::sync::Notify,
        hold: std::sync::atomic::AtomicBool,
    }

    impl SessionStore for BlockingStore {
        fn load(&self, _id: &str) -> BoxFuture<'_, Option<HashMap<String, serde_json::Value>>> {
            Box::pin(async { None })
        }

        fn save(&self, _id: &str, values: HashMap<String, serde_json::Value>) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                if self.hold.load(std::sync::atomic::Ordering::Acquire) {
                    self.release.notified().await;
                }
                self.saves.lock().await.push(values);
            })
        }

        fn remove(&self, _id: &str) -> BoxFuture<'_, ()> {
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn concurrent_saves_for_the_same_id_coalesce_into_one_follow_up() {
        let store = Arc::new(BlockingStore::default());
        store.hold.store(true, std::sync::atomic::Ordering::Release);
        let coordinator = SaveCoordinator::new(10);

        let store_dyn: Arc<dyn SessionStore> = store.clone();
        let first = save_coalesced(
            &coordinator,
            &store_dyn,
            "shared-id",
            HashMap::from([("v".to_string(), serde_json::json!(1))]),
        );
        tokio::pin!(first);

        // Drive the first save until it's parked waiting on `release`, i.e. it has
        // already become the saver and called into the (blocked) store.
        tokio::select! {
            _ = &mut first => panic!("first save should not have completed yet"),
            _ = tokio::time::sleep(std::time::Duration::from_millis(20)) => {}
        }

        // A second save for the same id arrives while the first is still in
        // flight: it must not call the store a second time concurrently, only
        // queue itself as the follow-up round.
        save_coalesced(
            &coordinator,
            &store_dyn,
            "shared-id",
            HashMap::from([("v".to_string(), serde_json::json!(2))]),
        )
        .await;
        assert_eq!(store.saves.lock().await.len(), 0);

        // Release the first save; it should write its own values, notice the
        // coalesced follow-up, and write those too before returning.
        store.hold.store(false, std::sync::atomic::Ordering::Release);
        store.release.notify_waiters();
        first.await;

        let saves = store.saves.lock().await;
        assert_eq!(saves.len(), 2);
        assert_eq!(saves[0].get("v"), Some(&serde_json::json!(1)));
        assert_eq!(saves[1].get("v"), Some(&serde_json::json!(2)));
    }
}
