use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reelcast_transcoder::registry::{SessionLimit, SessionRegistry};
use reelcast_transcoder::timeline::MediaTimeline;
use reelcast_transcoder::{TranscodeError, TranscoderConfig};
use tokio::sync::Mutex;

use crate::catalog::MediaCatalog;

/// Timelines kept before the least recently used one is dropped.
pub const DEFAULT_TIMELINE_CAPACITY: usize = 64;

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<TranscoderConfig>,
    pub catalog: Arc<dyn MediaCatalog>,
    pub sessions: Arc<SessionRegistry>,
    pub timelines: Arc<TimelineCache>,
}

impl AppState {
    pub fn new(config: TranscoderConfig, catalog: Arc<dyn MediaCatalog>) -> Self {
        // A session nobody has asked for within the steady wait is not being
        // played, so it may make room for a new one.
        let limit = SessionLimit {
            max: config.max_sessions,
            evict_idle_after: config.timeouts.steady,
        };
        Self {
            config: Arc::new(config),
            catalog,
            sessions: Arc::new(SessionRegistry::with_limit(limit)),
            timelines: Arc::new(TimelineCache::new(DEFAULT_TIMELINE_CAPACITY)),
        }
    }
}

/// Planned timelines by file, so segment requests can be resolved without
/// probing the file again. Bounded; the least recently used entry goes first.
pub struct TimelineCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    clock: u64,
    entries: HashMap<PathBuf, (u64, Arc<MediaTimeline>)>,
}

impl TimelineCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Probe and plan `path`, replacing any cached timeline.
    pub async fn refresh(
        &self,
        config: &TranscoderConfig,
        path: &Path,
    ) -> Result<Arc<MediaTimeline>, TranscodeError> {
        let timeline = Arc::new(MediaTimeline::load(config, path).await?);
        self.insert(path, timeline.clone()).await;
        Ok(timeline)
    }

    /// Cached timeline for `path`, probing on a miss.
    pub async fn get_or_load(
        &self,
        config: &TranscoderConfig,
        path: &Path,
    ) -> Result<Arc<MediaTimeline>, TranscodeError> {
        if let Some(hit) = self.get(path).await {
            return Ok(hit);
        }
        self.refresh(config, path).await
    }

    pub async fn get(&self, path: &Path) -> Option<Arc<MediaTimeline>> {
        let mut inner = self.inner.lock().await;
        inner.clock += 1;
        let now = inner.clock;
        inner.entries.get_mut(path).map(|(used, timeline)| {
            *used = now;
            timeline.clone()
        })
    }

    pub async fn insert(&self, path: &Path, timeline: Arc<MediaTimeline>) {
        let mut inner = self.inner.lock().await;
        inner.clock += 1;
        let now = inner.clock;
        inner.entries.insert(path.to_path_buf(), (now, timeline));
        while inner.entries.len() > self.capacity {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, (used, _))| *used)
                .map(|(p, _)| p.clone());
            match oldest {
                Some(p) => {
                    inner.entries.remove(&p);
                }
                None => break,
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn timeline(name: &str) -> Arc<MediaTimeline> {
        Arc::new(MediaTimeline {
            path: PathBuf::from(name),
            duration: Duration::from_secs(1),
            tracks: Vec::new(),
        })
    }

    #[tokio::test]
    async fn cache_evicts_least_recently_used() {
        let cache = TimelineCache::new(2);
        cache.insert(Path::new("/a"), timeline("/a")).await;
        cache.insert(Path::new("/b"), timeline("/b")).await;
        assert!(cache.get(Path::new("/a")).await.is_some());

        cache.insert(Path::new("/c"), timeline("/c")).await;
        assert_eq!(cache.len().await, 2);
        assert!(cache.get(Path::new("/a")).await.is_some());
        assert!(cache.get(Path::new("/b")).await.is_none());
        assert!(cache.get(Path::new("/c")).await.is_some());
    }

    #[tokio::test]
    async fn reinserting_replaces_without_growing() {
        let cache = TimelineCache::new(2);
        cache.insert(Path::new("/a"), timeline("/a")).await;
        cache.insert(Path::new("/a"), timeline("/a2")).await;
        assert_eq!(cache.len().await, 1);
        let hit = cache.get(Path::new("/a")).await.unwrap();
        assert_eq!(hit.path, PathBuf::from("/a2"));
    }
}
