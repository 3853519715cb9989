//! The durable publish pipeline.
//!
//! Publishing one blob means: add it to the storage network (pinning it
//! locally), keep re-announcing it so peers can find it, submit a pin
//! request to a remote backend, and poll until the backend confirms the
//! pin. Success is only reported once the content is both locally
//! announced and remotely pinned.
//!
//! The announce loop and the confirmation poll are spawned tasks tied to
//! the returned [`PublishHandle`]; dropping the handle aborts both, so no
//! background task outlives its pipeline on any exit path.
//!
//! [`Publisher::publish_all`] fans the pipeline out over a batch of files,
//! publishes a manifest page referencing them in input order, and resolves
//! to a shortened manifest URL only once every pin in the batch is
//! confirmed.

pub mod manifest;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::try_join_all;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ipfs::NodeClient;
use crate::pup::{BackendError, ContentId, Pup};
use crate::shorten::Shortener;

/// Timing knobs for one publish run.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// First wait between pin-status polls; doubles on every attempt.
    pub initial_interval: Duration,
    /// Cap on the poll backoff.
    pub max_interval: Duration,
    /// Overall limit on waiting for pin confirmation.
    pub deadline: Duration,
    /// Pause between re-announcements of the content.
    pub announce_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(15),
            deadline: Duration::from_secs(300),
            announce_interval: Duration::from_secs(30),
        }
    }
}

/// A publish pipeline failure, carrying the identity of what failed.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("adding {name:?} to the network: {cause}")]
    Add { name: String, cause: anyhow::Error },

    #[error("submitting pin for {cid}: {source}")]
    Pin {
        cid: ContentId,
        #[source]
        source: BackendError,
    },

    #[error("{backend}: pin of {cid} not confirmed within {deadline:?}")]
    Deadline {
        backend: &'static str,
        cid: ContentId,
        deadline: Duration,
    },

    #[error("shortening manifest URL: {cause}")]
    Shorten { cause: anyhow::Error },

    #[error("pin confirmation task for {cid} failed: {reason}")]
    Confirm { cid: ContentId, reason: String },
}

/// Publishes content through a storage node and confirms remote pins.
pub struct Publisher {
    node: Arc<dyn NodeClient>,
    poll: PollConfig,
}

/// An in-flight publish: the content id is already assigned, the announce
/// loop is running, the pin request has been accepted, and confirmation is
/// pending. Dropping the handle cancels both background tasks.
pub struct PublishHandle {
    cid: ContentId,
    tasks: TaskGuard,
}

struct TaskGuard {
    confirm: JoinHandle<Result<(), PublishError>>,
    announce: JoinHandle<()>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.confirm.abort();
        self.announce.abort();
    }
}

impl PublishHandle {
    pub fn cid(&self) -> &ContentId {
        &self.cid
    }

    /// Wait for the backend to confirm the pin. Consumes the handle; the
    /// announce loop stops when this returns, on success or failure alike.
    pub async fn confirmed(mut self) -> Result<ContentId, PublishError> {
        match (&mut self.tasks.confirm).await {
            Ok(result) => result.map(|()| self.cid.clone()),
            Err(join_error) => Err(PublishError::Confirm {
                cid: self.cid.clone(),
                reason: join_error.to_string(),
            }),
        }
    }
}

impl Publisher {
    pub fn new(node: Arc<dyn NodeClient>, poll: PollConfig) -> Self {
        Self { node, poll }
    }

    /// Publish one blob end to end: add, announce, pin, confirm.
    pub async fn publish(
        &self,
        content: Bytes,
        name: &str,
        backend: Arc<dyn Pup>,
    ) -> Result<ContentId, PublishError> {
        self.start_publish(content, name, backend)
            .await?
            .confirmed()
            .await
    }

    /// Run the pipeline up to pin submission, leaving confirmation pending
    /// on the returned handle. The add step either completes or fails
    /// immediately; pin submission failure is fatal and cancels the
    /// already-running announce loop.
    pub async fn start_publish(
        &self,
        content: Bytes,
        name: &str,
        backend: Arc<dyn Pup>,
    ) -> Result<PublishHandle, PublishError> {
        let cid = self
            .node
            .add_and_pin(content, name)
            .await
            .map_err(|cause| PublishError::Add {
                name: name.to_string(),
                cause,
            })?;
        info!(%cid, name, "added to network");

        let announce = tokio::spawn(announce_loop(
            self.node.clone(),
            cid.clone(),
            self.poll.announce_interval,
        ));

        if let Err(source) = backend.pin(&cid).await {
            announce.abort();
            return Err(PublishError::Pin { cid, source });
        }
        debug!(%cid, backend = backend.name(), "pin submitted");

        let confirm = tokio::spawn(await_confirmation(backend, cid.clone(), self.poll.clone()));

        Ok(PublishHandle {
            cid,
            tasks: TaskGuard { confirm, announce },
        })
    }

    /// Publish a batch of files plus a manifest page as one logical unit.
    ///
    /// All adds complete (fail-fast) before the manifest is rendered, so
    /// the manifest only ever references assigned content ids. The
    /// shortened manifest URL is derived as soon as the manifest's own add
    /// and pin submission succeed, but the batch does not resolve until
    /// every constituent pin - files and manifest - is confirmed.
    ///
    /// One file's failure aborts the whole batch; already-published files
    /// stay published (no compensating unpin).
    pub async fn publish_all(
        &self,
        files: Vec<(String, Bytes)>,
        backend: Arc<dyn Pup>,
        shortener: &dyn Shortener,
    ) -> Result<String, PublishError> {
        info!(
            count = files.len(),
            backend = backend.name(),
            "publishing batch"
        );

        let handles = try_join_all(files.into_iter().map(|(name, content)| {
            let backend = backend.clone();
            async move { self.start_publish(content, &name, backend).await }
        }))
        .await?;

        let cids: Vec<ContentId> = handles.iter().map(|h| h.cid().clone()).collect();

        let page = manifest::index_html(&cids);
        let manifest_handle = self
            .start_publish(Bytes::from(page), "index.html", backend)
            .await?;
        let url = manifest::gateway_url(manifest_handle.cid());

        let short = shortener
            .shorten(&url)
            .await
            .map_err(|cause| PublishError::Shorten { cause })?;

        try_join_all(
            handles
                .into_iter()
                .chain(std::iter::once(manifest_handle))
                .map(PublishHandle::confirmed),
        )
        .await?;

        info!(manifest = %url, short = %short, "batch published and pinned");
        Ok(short)
    }
}

/// Re-announce `cid` until aborted. Announcing is best-effort: errors are
/// logged and the loop keeps going.
async fn announce_loop(node: Arc<dyn NodeClient>, cid: ContentId, interval: Duration) {
    loop {
        match node.provide(&cid).await {
            Ok(()) => debug!(%cid, "announced to network"),
            Err(error) => warn!(%cid, %error, "announce failed; will retry"),
        }
        tokio::time::sleep(interval).await;
    }
}

/// Poll the backend until it reports the pin, backing off exponentially.
/// Transient poll errors are logged and retried; only the deadline ends
/// the loop unsuccessfully.
async fn await_confirmation(
    backend: Arc<dyn Pup>,
    cid: ContentId,
    poll: PollConfig,
) -> Result<(), PublishError> {
    let name = backend.name();
    let wait = async {
        let mut interval = poll.initial_interval;
        loop {
            match backend.is_pinned(&cid).await {
                Ok(true) => {
                    info!(%cid, backend = name, "pin confirmed");
                    return;
                }
                Ok(false) => debug!(%cid, backend = name, "pin not confirmed yet"),
                Err(error) => {
                    warn!(%cid, backend = name, %error, "pin status check failed; will retry")
                }
            }
            tokio::time::sleep(interval).await;
            interval = (interval * 2).min(poll.max_interval);
        }
    };

    tokio::time::timeout(poll.deadline, wait)
        .await
        .map_err(|_| PublishError::Deadline {
            backend: name,
            cid,
            deadline: poll.deadline,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::anyhow;
    use async_trait::async_trait;

    use crate::pup::NamedHash;

    /// In-memory stand-in for the storage node. Content ids are derived
    /// from filenames so tests can predict them.
    struct FakeNode {
        added: Mutex<Vec<(String, Bytes)>>,
        provides: AtomicUsize,
        fail_adds_named: Option<String>,
    }

    impl FakeNode {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                added: Mutex::new(Vec::new()),
                provides: AtomicUsize::new(0),
                fail_adds_named: None,
            })
        }

        fn failing_on(name: &str) -> Arc<Self> {
            Arc::new(Self {
                added: Mutex::new(Vec::new()),
                provides: AtomicUsize::new(0),
                fail_adds_named: Some(name.to_string()),
            })
        }

        fn added_names(&self) -> Vec<String> {
            self.added
                .lock()
                .unwrap()
                .iter()
                .map(|(name, _)| name.clone())
                .collect()
        }

        fn content_of(&self, name: &str) -> Option<Bytes> {
            self.added
                .lock()
                .unwrap()
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, c)| c.clone())
        }
    }

    #[async_trait]
    impl NodeClient for FakeNode {
        async fn add_and_pin(&self, content: Bytes, name: &str) -> anyhow::Result<ContentId> {
            if self.fail_adds_named.as_deref() == Some(name) {
                return Err(anyhow!("node rejected {name}"));
            }
            self.added.lock().unwrap().push((name.to_string(), content));
            Ok(ContentId::new(format!("Qm-{name}")))
        }

        async fn provide(&self, _cid: &ContentId) -> anyhow::Result<()> {
            self.provides.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn cat(&self, _cid: &ContentId) -> anyhow::Result<Bytes> {
            Err(anyhow!("not served by the fake node"))
        }
    }

    /// Backend that confirms each pin only after a configurable number of
    /// status polls, optionally failing the first few polls or the pin
    /// submission itself.
    struct SlowPup {
        polls_until_confirm: u32,
        transient_poll_failures: u32,
        fail_pin: bool,
        requested: Mutex<HashSet<ContentId>>,
        polls: Mutex<HashMap<ContentId, u32>>,
    }

    impl SlowPup {
        fn confirming_after(polls: u32) -> Arc<Self> {
            Arc::new(Self {
                polls_until_confirm: polls,
                transient_poll_failures: 0,
                fail_pin: false,
                requested: Mutex::new(HashSet::new()),
                polls: Mutex::new(HashMap::new()),
            })
        }

        fn rejecting_pins() -> Arc<Self> {
            Arc::new(Self {
                polls_until_confirm: 0,
                transient_poll_failures: 0,
                fail_pin: true,
                requested: Mutex::new(HashSet::new()),
                polls: Mutex::new(HashMap::new()),
            })
        }

        fn flaky(transient_failures: u32, polls_until_confirm: u32) -> Arc<Self> {
            Arc::new(Self {
                polls_until_confirm,
                transient_poll_failures: transient_failures,
                fail_pin: false,
                requested: Mutex::new(HashSet::new()),
                polls: Mutex::new(HashMap::new()),
            })
        }

        fn polls_for(&self, cid: &ContentId) -> u32 {
            self.polls.lock().unwrap().get(cid).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Pup for SlowPup {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn fetch(&self, _filter: &[ContentId]) -> Result<Vec<NamedHash>, BackendError> {
            Ok(Vec::new())
        }

        async fn pin(&self, hash: &ContentId) -> Result<(), BackendError> {
            if self.fail_pin {
                return Err(BackendError::Status {
                    backend: "slow",
                    op: "pin",
                    status: reqwest::StatusCode::UNAUTHORIZED,
                });
            }
            self.requested.lock().unwrap().insert(hash.clone());
            Ok(())
        }

        async fn unpin(&self, _hash: &ContentId) -> Result<(), BackendError> {
            Ok(())
        }

        async fn is_pinned(&self, hash: &ContentId) -> Result<bool, BackendError> {
            let count = {
                let mut polls = self.polls.lock().unwrap();
                let entry = polls.entry(hash.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            if count <= self.transient_poll_failures {
                return Err(BackendError::Status {
                    backend: "slow",
                    op: "is_pinned",
                    status: reqwest::StatusCode::TOO_MANY_REQUESTS,
                });
            }
            let requested = self.requested.lock().unwrap().contains(hash);
            Ok(requested && count >= self.polls_until_confirm)
        }
    }

    struct FakeShortener {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Shortener for FakeShortener {
        async fn shorten(&self, url: &str) -> anyhow::Result<String> {
            self.seen.lock().unwrap().push(url.to_string());
            Ok("https://bit.ly/abc123".to_string())
        }
    }

    fn fast_poll() -> PollConfig {
        PollConfig {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            deadline: Duration::from_secs(5),
            announce_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn publish_returns_cid_once_backend_confirms() {
        let node = FakeNode::new();
        let backend = SlowPup::confirming_after(2);
        let publisher = Publisher::new(node.clone(), fast_poll());

        let cid = publisher
            .publish(Bytes::from_static(b"cat photo"), "cat.jpg", backend.clone())
            .await
            .unwrap();

        assert_eq!(cid, ContentId::from("Qm-cat.jpg"));
        assert!(backend.polls_for(&cid) >= 2);
        assert!(node.provides.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn transient_poll_errors_are_retried_not_fatal() {
        let node = FakeNode::new();
        let backend = SlowPup::flaky(2, 3);
        let publisher = Publisher::new(node, fast_poll());

        let cid = publisher
            .publish(Bytes::from_static(b"x"), "x.png", backend)
            .await
            .unwrap();
        assert_eq!(cid, ContentId::from("Qm-x.png"));
    }

    #[tokio::test]
    async fn pin_submission_failure_is_fatal_and_stops_the_announce_loop() {
        let node = FakeNode::new();
        let backend = SlowPup::rejecting_pins();
        let publisher = Publisher::new(node.clone(), fast_poll());

        let err = publisher
            .publish(Bytes::from_static(b"x"), "x.png", backend)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Pin { .. }));

        // Once the error is surfaced, no announce task may remain.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let settled = node.provides.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(node.provides.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn deadline_expiry_fails_publish_and_cancels_background_tasks() {
        let node = FakeNode::new();
        // Never confirms.
        let backend = SlowPup::confirming_after(u32::MAX);
        let poll = PollConfig {
            deadline: Duration::from_millis(50),
            ..fast_poll()
        };
        let publisher = Publisher::new(node.clone(), poll);

        let err = publisher
            .publish(Bytes::from_static(b"x"), "x.png", backend)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Deadline { .. }));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let settled = node.provides.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(node.provides.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn batch_manifest_preserves_input_order_and_waits_for_every_pin() {
        let node = FakeNode::new();
        let backend = SlowPup::confirming_after(2);
        let publisher = Publisher::new(node.clone(), fast_poll());
        let shortener = FakeShortener {
            seen: Mutex::new(Vec::new()),
        };

        let files = vec![
            ("c.jpg".to_string(), Bytes::from_static(b"c")),
            ("a.jpg".to_string(), Bytes::from_static(b"a")),
            ("b.jpg".to_string(), Bytes::from_static(b"b")),
        ];
        let short = publisher
            .publish_all(files, backend.clone(), &shortener)
            .await
            .unwrap();
        assert_eq!(short, "https://bit.ly/abc123");

        // Manifest lists cids in input order, whatever order pins landed.
        let page = String::from_utf8(node.content_of("index.html").unwrap().to_vec()).unwrap();
        let positions: Vec<usize> = ["Qm-c.jpg", "Qm-a.jpg", "Qm-b.jpg"]
            .iter()
            .map(|cid| page.find(cid).unwrap())
            .collect();
        assert!(positions[0] < positions[1] && positions[1] < positions[2]);

        // The shortener saw the manifest's gateway URL.
        assert_eq!(
            shortener.seen.lock().unwrap().as_slice(),
            &["http://ipfs.io/ipfs/Qm-index.html".to_string()]
        );

        // Every constituent pin was confirmed before the batch resolved.
        for name in ["c.jpg", "a.jpg", "b.jpg", "index.html"] {
            let cid = ContentId::new(format!("Qm-{name}"));
            assert!(backend.polls_for(&cid) >= 2, "{name} was not confirmed");
        }
    }

    #[tokio::test]
    async fn batch_fails_fast_when_one_add_fails() {
        let node = FakeNode::failing_on("bad.jpg");
        let backend = SlowPup::confirming_after(1);
        let publisher = Publisher::new(node.clone(), fast_poll());
        let shortener = FakeShortener {
            seen: Mutex::new(Vec::new()),
        };

        let files = vec![
            ("ok.jpg".to_string(), Bytes::from_static(b"ok")),
            ("bad.jpg".to_string(), Bytes::from_static(b"bad")),
        ];
        let err = publisher
            .publish_all(files, backend, &shortener)
            .await
            .unwrap_err();

        match err {
            PublishError::Add { name, .. } => assert_eq!(name, "bad.jpg"),
            other => panic!("expected add failure, got {other}"),
        }
        // No manifest was ever built.
        assert!(!node.added_names().contains(&"index.html".to_string()));
        assert!(shortener.seen.lock().unwrap().is_empty());
    }
}
