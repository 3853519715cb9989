//! Multi-backend pin reconciliation.
//!
//! A single task owns the row table and periodically mirrors every
//! configured backend's pin listing into it, emitting row-level change
//! events over a bounded channel. The presentation layer drains that
//! channel on its own schedule and is the only thing allowed to mutate
//! visible state - the fetch loop never touches it.
//!
//! Cycles are driven by a coalescing trigger: a timer tick and any number
//! of manual pokes collapse into at most one pending run, so fetch passes
//! never overlap.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ipfs::NodeClient;
use crate::pup::{ContentId, PinTarget};
use crate::thumbnail;

/// Thumbnail bytes by content id, written by fetch tasks and read by the
/// HTTP-serving path.
pub type ThumbnailCache = Arc<RwLock<HashMap<ContentId, Bytes>>>;

pub const THUMBNAIL_MAX_WIDTH: u32 = 100;
pub const THUMBNAIL_MAX_HEIGHT: u32 = 100;

/// One row-level change for the presentation layer: set column `column`
/// of the row for `hash` to `pinned`, creating the row (with `filename`)
/// if it does not exist yet.
#[derive(Debug, Clone)]
pub struct RowChange {
    pub hash: ContentId,
    pub filename: String,
    pub column: usize,
    pub pinned: bool,
}

/// Coalescing handle for requesting a reconciliation cycle. Multiple
/// pending fires collapse into one.
#[derive(Clone)]
pub struct Trigger(mpsc::Sender<()>);

impl Trigger {
    pub fn fire(&self) {
        // A full buffer means a run is already pending; dropping the poke
        // is exactly the coalescing we want.
        let _ = self.0.try_send(());
    }
}

/// Create a trigger and the receiver the run loop waits on.
pub fn trigger_channel() -> (Trigger, mpsc::Receiver<()>) {
    let (tx, rx) = mpsc::channel(1);
    (Trigger(tx), rx)
}

/// Fire `trigger` every `interval` from a background task.
pub fn spawn_ticker(trigger: Trigger, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        // The immediate first tick is redundant with the startup fire.
        tick.tick().await;
        loop {
            tick.tick().await;
            trigger.fire();
        }
    })
}

#[derive(Debug, Clone)]
pub struct HerdConfig {
    /// Per-backend budget for one listing call.
    pub fetch_timeout: Duration,
    /// Pause between the two sweeps of a cycle.
    pub sweep_pause: Duration,
    /// Drop rows no backend lists anymore (explicit policy; the default
    /// keeps rows forever, preserving dashboard history).
    pub evict_unlisted: bool,
}

impl Default for HerdConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(10),
            sweep_pause: Duration::from_secs(2),
            evict_unlisted: false,
        }
    }
}

struct Row {
    filename: String,
    pinned: Vec<bool>,
}

/// The reconciliation loop. Owns the row table exclusively; communicates
/// outward only through the change-event channel and the thumbnail cache.
pub struct Herd {
    targets: Vec<PinTarget>,
    node: Arc<dyn NodeClient>,
    changes: mpsc::Sender<RowChange>,
    thumbs: ThumbnailCache,
    config: HerdConfig,
    rows: HashMap<ContentId, Row>,
}

impl Herd {
    pub fn new(
        targets: Vec<PinTarget>,
        node: Arc<dyn NodeClient>,
        changes: mpsc::Sender<RowChange>,
        thumbs: ThumbnailCache,
        config: HerdConfig,
    ) -> Self {
        Self {
            targets,
            node,
            changes,
            thumbs,
            config,
            rows: HashMap::new(),
        }
    }

    /// Run reconciliation cycles until the trigger channel closes.
    pub async fn run(mut self, mut trigger: mpsc::Receiver<()>) {
        info!(backends = self.targets.len(), "reconciliation loop started");
        while trigger.recv().await.is_some() {
            // Two sweeps per cycle: remote pin state often settles between
            // the first and second pass shortly after a manual action.
            for pass in 0..2 {
                if pass > 0 {
                    tokio::time::sleep(self.config.sweep_pause).await;
                }
                self.sweep().await;
            }
            if self.config.evict_unlisted {
                self.evict();
            }
        }
        info!("reconciliation loop shutting down (trigger channel closed)");
    }

    /// Spawn the loop as a background task.
    pub fn spawn(self, trigger: mpsc::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(trigger))
    }

    /// One pass over every backend: fetch its listing, diff against the
    /// row table, emit changes. A failing backend is skipped for this
    /// cycle only; it degrades to stale columns, never halts the loop.
    async fn sweep(&mut self) {
        for target in &self.targets {
            let listing = tokio::time::timeout(self.config.fetch_timeout, target.backend.fetch(&[]))
                .await;
            let listing = match listing {
                Ok(Ok(listing)) => listing,
                Ok(Err(error)) => {
                    warn!(backend = %target.name, %error, "fetch failed; skipping this cycle");
                    continue;
                }
                Err(_) => {
                    warn!(backend = %target.name, "fetch timed out; skipping this cycle");
                    continue;
                }
            };
            debug!(backend = %target.name, count = listing.len(), "fetched pin listing");

            let fetched: HashSet<&ContentId> = listing.iter().map(|n| &n.hash).collect();

            // Known rows this backend stopped listing.
            for (hash, row) in &mut self.rows {
                if row.pinned[target.index] && !fetched.contains(hash) {
                    row.pinned[target.index] = false;
                    let change = RowChange {
                        hash: hash.clone(),
                        filename: row.filename.clone(),
                        column: target.index,
                        pinned: false,
                    };
                    if self.changes.send(change).await.is_err() {
                        return;
                    }
                }
            }

            // Listed hashes: create rows on first sighting, set the column.
            for named in &listing {
                let columns = self.targets.len();
                let is_new = !self.rows.contains_key(&named.hash);
                let row = self.rows.entry(named.hash.clone()).or_insert_with(|| Row {
                    filename: named.name.clone().unwrap_or_default(),
                    pinned: vec![false; columns],
                });
                if is_new {
                    spawn_thumbnail_fetch(self.node.clone(), self.thumbs.clone(), &named.hash);
                }
                if !row.pinned[target.index] {
                    row.pinned[target.index] = true;
                    let change = RowChange {
                        hash: named.hash.clone(),
                        filename: row.filename.clone(),
                        column: target.index,
                        pinned: true,
                    };
                    if self.changes.send(change).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Drop rows whose every column is false. Only the internal table is
    /// touched; a re-listed hash comes back as a fresh row.
    fn evict(&mut self) {
        let before = self.rows.len();
        self.rows.retain(|_, row| row.pinned.iter().any(|p| *p));
        let dropped = before - self.rows.len();
        if dropped > 0 {
            debug!(dropped, "evicted unlisted rows");
        }
    }
}

/// Fetch and shrink a thumbnail for a newly sighted row, exactly once.
/// Failures leave the row thumbnail-less; there is no automatic retry.
fn spawn_thumbnail_fetch(node: Arc<dyn NodeClient>, thumbs: ThumbnailCache, hash: &ContentId) {
    let hash = hash.clone();
    tokio::spawn(async move {
        if thumbs.read().await.contains_key(&hash) {
            return;
        }
        let content = match node.cat(&hash).await {
            Ok(content) => content,
            Err(error) => {
                warn!(%hash, %error, "could not fetch content for thumbnail");
                return;
            }
        };
        match thumbnail::shrink(&content, THUMBNAIL_MAX_WIDTH, THUMBNAIL_MAX_HEIGHT) {
            Ok(thumb) => {
                thumbs.write().await.insert(hash.clone(), thumb);
                debug!(%hash, "thumbnail ready");
            }
            Err(error) => debug!(%hash, %error, "content is not a thumbnailable image"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use anyhow::anyhow;
    use async_trait::async_trait;

    use crate::pup::{BackendError, NamedHash, Pup};

    struct NullNode;

    #[async_trait]
    impl NodeClient for NullNode {
        async fn add_and_pin(&self, _content: Bytes, _name: &str) -> anyhow::Result<ContentId> {
            Err(anyhow!("unsupported"))
        }

        async fn provide(&self, _cid: &ContentId) -> anyhow::Result<()> {
            Ok(())
        }

        async fn cat(&self, _cid: &ContentId) -> anyhow::Result<Bytes> {
            Err(anyhow!("no content"))
        }
    }

    /// Backend whose listing (or failure) can be swapped between cycles.
    struct ScriptedPup {
        listing: Mutex<Result<Vec<NamedHash>, ()>>,
        fetches: Mutex<u32>,
    }

    impl ScriptedPup {
        fn listing(hashes: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                listing: Mutex::new(Ok(hashes.iter().map(|h| NamedHash::bare(*h)).collect())),
                fetches: Mutex::new(0),
            })
        }

        fn set(&self, hashes: &[&str]) {
            *self.listing.lock().unwrap() =
                Ok(hashes.iter().map(|h| NamedHash::bare(*h)).collect());
        }

        fn set_failing(&self) {
            *self.listing.lock().unwrap() = Err(());
        }

        fn fetch_count(&self) -> u32 {
            *self.fetches.lock().unwrap()
        }
    }

    #[async_trait]
    impl Pup for ScriptedPup {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn fetch(&self, _filter: &[ContentId]) -> Result<Vec<NamedHash>, BackendError> {
            *self.fetches.lock().unwrap() += 1;
            self.listing
                .lock()
                .unwrap()
                .clone()
                .map_err(|_| BackendError::Status {
                    backend: "scripted",
                    op: "fetch",
                    status: reqwest::StatusCode::BAD_GATEWAY,
                })
        }

        async fn pin(&self, _hash: &ContentId) -> Result<(), BackendError> {
            Ok(())
        }

        async fn unpin(&self, _hash: &ContentId) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn target(index: usize, backend: Arc<ScriptedPup>) -> PinTarget {
        PinTarget {
            index,
            name: format!("backend-{index}"),
            backend,
        }
    }

    fn fast_config() -> HerdConfig {
        HerdConfig {
            fetch_timeout: Duration::from_millis(500),
            sweep_pause: Duration::from_millis(1),
            evict_unlisted: false,
        }
    }

    fn herd_with(
        targets: Vec<PinTarget>,
        config: HerdConfig,
    ) -> (Herd, mpsc::Receiver<RowChange>) {
        let (tx, rx) = mpsc::channel(100);
        let herd = Herd::new(
            targets,
            Arc::new(NullNode),
            tx,
            Arc::new(RwLock::new(HashMap::new())),
            config,
        );
        (herd, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<RowChange>) -> Vec<RowChange> {
        let mut out = Vec::new();
        while let Ok(change) = rx.try_recv() {
            out.push(change);
        }
        out
    }

    #[tokio::test]
    async fn first_sighting_creates_row_with_only_that_column_set() {
        let a = ScriptedPup::listing(&["QmX"]);
        let b = ScriptedPup::listing(&[]);
        let (mut herd, mut rx) = herd_with(
            vec![target(0, a), target(1, b.clone())],
            fast_config(),
        );

        herd.sweep().await;
        let changes = drain(&mut rx);

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].hash, ContentId::from("QmX"));
        assert_eq!(changes[0].column, 0);
        assert!(changes[0].pinned);

        let row = &herd.rows[&ContentId::from("QmX")];
        assert_eq!(row.pinned, vec![true, false]);
    }

    #[tokio::test]
    async fn unlisting_toggles_the_column_off_next_cycle() {
        let a = ScriptedPup::listing(&["QmX"]);
        let (mut herd, mut rx) = herd_with(vec![target(0, a.clone())], fast_config());

        herd.sweep().await;
        drain(&mut rx);

        a.set(&[]);
        herd.sweep().await;
        let changes = drain(&mut rx);

        assert_eq!(changes.len(), 1);
        assert!(!changes[0].pinned);
        assert_eq!(changes[0].column, 0);
        assert_eq!(herd.rows[&ContentId::from("QmX")].pinned, vec![false]);
    }

    #[tokio::test]
    async fn steady_state_emits_no_redundant_changes() {
        let a = ScriptedPup::listing(&["QmX", "QmY"]);
        let (mut herd, mut rx) = herd_with(vec![target(0, a)], fast_config());

        herd.sweep().await;
        drain(&mut rx);

        herd.sweep().await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn one_backend_failure_degrades_only_that_backend() {
        let a = ScriptedPup::listing(&["QmA"]);
        let b = ScriptedPup::listing(&["QmB"]);
        let (mut herd, mut rx) = herd_with(
            vec![target(0, a.clone()), target(1, b.clone())],
            fast_config(),
        );

        herd.sweep().await;
        drain(&mut rx);

        // Backend A starts failing; its column must go stale, not false.
        a.set_failing();
        b.set(&["QmB", "QmC"]);
        herd.sweep().await;
        let changes = drain(&mut rx);

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].hash, ContentId::from("QmC"));
        assert_eq!(herd.rows[&ContentId::from("QmA")].pinned[0], true);

        // Recovery on the following cycle, no operator intervention.
        a.set(&["QmA"]);
        herd.sweep().await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(herd.rows[&ContentId::from("QmA")].pinned[0], true);
    }

    #[tokio::test]
    async fn rows_are_kept_by_default_when_fully_unlisted() {
        let a = ScriptedPup::listing(&["QmX"]);
        let (mut herd, mut rx) = herd_with(vec![target(0, a.clone())], fast_config());

        herd.sweep().await;
        a.set(&[]);
        herd.sweep().await;
        drain(&mut rx);

        // evict_unlisted is false, so run() never calls evict(); the row
        // survives with its column toggled off.
        assert_eq!(herd.rows[&ContentId::from("QmX")].pinned, vec![false]);
    }

    #[tokio::test]
    async fn eviction_policy_drops_fully_unlisted_rows() {
        let a = ScriptedPup::listing(&["QmX"]);
        let config = HerdConfig {
            evict_unlisted: true,
            ..fast_config()
        };
        let (mut herd, mut rx) = herd_with(vec![target(0, a.clone())], config);

        herd.sweep().await;
        drain(&mut rx);
        a.set(&[]);
        herd.sweep().await;
        herd.evict();
        drain(&mut rx);

        assert!(herd.rows.is_empty());

        // A re-listed hash comes back as a brand new row.
        a.set(&["QmX"]);
        herd.sweep().await;
        let changes = drain(&mut rx);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].pinned);
    }

    #[tokio::test]
    async fn triggers_coalesce_to_one_pending_run() {
        let (trigger, mut rx) = trigger_channel();
        for _ in 0..5 {
            trigger.fire();
        }
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_loop_executes_two_sweeps_per_trigger_and_stops_on_close() {
        let a = ScriptedPup::listing(&["QmX"]);
        let (herd, mut changes) = herd_with(vec![target(0, a.clone())], fast_config());
        let (trigger, trigger_rx) = trigger_channel();

        let handle = herd.spawn(trigger_rx);
        trigger.fire();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.fetch_count(), 2);
        assert_eq!(drain(&mut changes).len(), 1);

        drop(trigger);
        handle.await.unwrap();
    }
}
