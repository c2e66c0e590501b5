//! Live transcoding sessions, keyed by what they produce.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::TranscodeError;
use crate::session::TranscodingSession;

/// Lifecycle hooks the registry needs from a session.
#[async_trait::async_trait]
pub trait ManagedSession: Send + Sync + 'static {
    /// Release the session's process and files. Must be idempotent.
    async fn destroy(&self);

    /// Record a use of the session.
    fn touch(&self);

    /// Time since the session was last used.
    fn idle_for(&self) -> Duration;
}

/// Decides which sessions a reap pass removes.
pub trait ReapPolicy<S>: Send + Sync {
    fn should_reap(&self, key: &SessionKey, session: &S) -> bool;
}

/// Reap sessions nobody has touched for the given duration.
#[derive(Debug, Clone, Copy)]
pub struct IdleTimeout(pub Duration);

impl<S: ManagedSession> ReapPolicy<S> for IdleTimeout {
    fn should_reap(&self, _key: &SessionKey, session: &S) -> bool {
        session.idle_for() >= self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub file: PathBuf,
    pub representation_id: String,
    pub start_index: u32,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}@{}",
            self.file.display(),
            self.representation_id,
            self.start_index
        )
    }
}

/// Cap on live sessions. When full, the idlest session is evicted to make
/// room, but only once it has been idle for `evict_idle_after`.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimit {
    pub max: usize,
    pub evict_idle_after: Duration,
}

/// Owns every live session. Lookup and creation happen under one lock, so a
/// key is constructed at most once no matter how many requests race for it.
pub struct SessionRegistry<S = TranscodingSession> {
    sessions: Mutex<HashMap<SessionKey, Arc<S>>>,
    limit: Option<SessionLimit>,
}

impl<S> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            limit: None,
        }
    }
}

impl<S: ManagedSession> SessionRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: SessionLimit) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            limit: Some(SessionLimit {
                max: limit.max.max(1),
                ..limit
            }),
        }
    }

    /// Return the session for `key`, building it with `create` if absent.
    ///
    /// The flag is `true` for the one caller whose `create` ran; that caller
    /// is responsible for starting the session after this returns.
    pub async fn get_or_create<F>(
        &self,
        key: SessionKey,
        create: F,
    ) -> Result<(Arc<S>, bool), TranscodeError>
    where
        F: FnOnce() -> Result<S, TranscodeError>,
    {
        let (created, evicted) = {
            let mut sessions = self.sessions.lock().await;
            if let Some(existing) = sessions.get(&key) {
                existing.touch();
                return Ok((existing.clone(), false));
            }
            let evicted = self.make_room(&mut sessions)?;
            let created = create().map(Arc::new);
            if let Ok(session) = &created {
                sessions.insert(key.clone(), session.clone());
                info!(key = %key, total = sessions.len(), "registered transcoding session");
            }
            (created, evicted)
        };

        if let Some((old_key, old)) = evicted {
            old.destroy().await;
            info!(key = %old_key, "evicted idle transcoding session to make room");
        }
        created.map(|session| (session, true))
    }

    /// Remove the idlest session if the registry is full. Fails when every
    /// session is still in use.
    fn make_room(
        &self,
        sessions: &mut HashMap<SessionKey, Arc<S>>,
    ) -> Result<Option<(SessionKey, Arc<S>)>, TranscodeError> {
        let Some(limit) = self.limit else {
            return Ok(None);
        };
        if sessions.len() < limit.max {
            return Ok(None);
        }
        let idlest = sessions
            .iter()
            .map(|(k, s)| (k.clone(), s.idle_for()))
            .max_by_key(|(_, idle)| *idle);
        match idlest {
            Some((k, idle)) if idle >= limit.evict_idle_after => {
                Ok(sessions.remove(&k).map(|s| (k, s)))
            }
            _ => {
                warn!(max = limit.max, "transcoding session limit reached");
                Err(TranscodeError::SessionLimit(limit.max))
            }
        }
    }

    /// The most recently used session matching `filter`.
    pub async fn most_recent(
        &self,
        filter: impl Fn(&SessionKey) -> bool,
    ) -> Option<(SessionKey, Arc<S>)> {
        self.sessions
            .lock()
            .await
            .iter()
            .filter(|(k, _)| filter(k))
            .min_by_key(|(_, s)| s.idle_for())
            .map(|(k, s)| (k.clone(), s.clone()))
    }

    pub async fn get(&self, key: &SessionKey) -> Option<Arc<S>> {
        self.sessions.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn keys(&self) -> Vec<SessionKey> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Unregister and destroy one session. Returns whether it existed.
    pub async fn remove_and_destroy(&self, key: &SessionKey) -> bool {
        let removed = self.sessions.lock().await.remove(key);
        match removed {
            Some(session) => {
                session.destroy().await;
                true
            }
            None => false,
        }
    }

    /// Unregister and destroy `session` if it is still the one stored under
    /// `key`. A replacement registered meanwhile is left alone.
    pub async fn evict(&self, key: &SessionKey, session: &Arc<S>) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get(key) {
                Some(current) if Arc::ptr_eq(current, session) => sessions.remove(key),
                _ => None,
            }
        };
        match removed {
            Some(session) => {
                session.destroy().await;
                true
            }
            None => false,
        }
    }

    /// Destroy every session; used on shutdown.
    pub async fn destroy_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        let count = drained.len();
        for (_, session) in drained {
            session.destroy().await;
        }
        if count > 0 {
            info!(count, "destroyed all transcoding sessions");
        }
        count
    }

    /// Remove the sessions `policy` selects and destroy them outside the lock.
    pub async fn reap(&self, policy: &dyn ReapPolicy<S>) -> usize {
        let reaped: Vec<(SessionKey, Arc<S>)> = {
            let mut sessions = self.sessions.lock().await;
            let keys: Vec<SessionKey> = sessions
                .iter()
                .filter(|(k, s)| policy.should_reap(k, s))
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| sessions.remove(&k).map(|s| (k, s)))
                .collect()
        };

        for (key, session) in &reaped {
            session.destroy().await;
            info!(key = %key, "reaped idle transcoding session");
        }
        reaped.len()
    }

    /// Run `policy` every `every` until the returned task is aborted.
    pub fn spawn_reaper<P>(self: &Arc<Self>, policy: P, every: Duration) -> JoinHandle<()>
    where
        P: ReapPolicy<S> + 'static,
    {
        let registry = Arc::clone(self);
        let every = every.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tick.tick().await;
                let reaped = registry.reap(&policy).await;
                if reaped > 0 {
                    let remaining = registry.len().await;
                    info!(reaped, remaining, "idle sessions reaped");
                }
            }
        })
    }
}
