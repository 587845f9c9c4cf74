use super::Authorize;
use anyhow::Result;
use parking_lot::RwLock;
use policy_admission_core::{Filter, ResourceCache, Violation};
use policy_admission_k8s::{AdmitObject, ClusterClient};
use sha2::{Digest, Sha256};
use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time;
use tracing::{debug, info, warn};

/// How often the configuration file is checked for changes.
const POLL_INTERVAL: Duration = Duration::from_secs(3);

type Constructor = dyn Fn(&str) -> Result<Arc<dyn Authorize>> + Send + Sync;
type Slot = Arc<RwLock<Arc<dyn Authorize>>>;

/// Wraps an authorizer so edits to its configuration file swap in a
/// freshly built instance without interrupting in-flight reviews.
///
/// The watcher polls the file's content hash; on change it rebuilds the
/// module and replaces the live instance under a write lock. A file
/// that fails to rebuild is logged and the previous instance retained,
/// so readers never observe a half-built authorizer.
pub struct Reloadable {
    current: Slot,
    version: Arc<AtomicU64>,
}

impl Reloadable {
    pub fn spawn(
        inner: Arc<dyn Authorize>,
        path: &str,
        build: impl Fn(&str) -> Result<Arc<dyn Authorize>> + Send + Sync + 'static,
    ) -> Self {
        let current: Slot = Arc::new(RwLock::new(inner));
        let version = Arc::new(AtomicU64::new(0));
        tokio::spawn(watch(
            current.clone(),
            version.clone(),
            path.to_string(),
            Box::new(build),
        ));
        Self { current, version }
    }

    /// Monotonic count of successful swaps.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

#[async_trait::async_trait]
impl Authorize for Reloadable {
    fn name(&self) -> &'static str {
        self.current.read().name()
    }

    fn filter_on(&self) -> Filter {
        self.current.read().filter_on()
    }

    async fn admit(
        &self,
        client: &dyn ClusterClient,
        cache: &ResourceCache,
        object: &AdmitObject,
    ) -> Vec<Violation> {
        // Pin the instance for the whole evaluation; a concurrent swap
        // affects only subsequent reviews.
        let current = self.current.read().clone();
        current.admit(client, cache, object).await
    }
}

async fn watch(current: Slot, version: Arc<AtomicU64>, path: String, build: Box<Constructor>) {
    let mut interval = time::interval(POLL_INTERVAL);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    // The file was readable at construction; seed the hash so startup
    // does not count as a change.
    let mut last = hash_file(&path).ok();

    loop {
        interval.tick().await;

        let digest = match hash_file(&path) {
            Ok(digest) => digest,
            Err(error) => {
                // Tolerate transient disappearance; the last successful
                // parse stays live.
                debug!(%path, %error, "configuration file unreadable");
                continue;
            }
        };
        if last.as_ref() == Some(&digest) {
            continue;
        }

        match build(&path) {
            Ok(swapped) => {
                *current.write() = swapped;
                version.fetch_add(1, Ordering::Release);
                info!(%path, "reloaded authorizer configuration");
            }
            Err(error) => {
                warn!(%path, %error, "unable to reload authorizer configuration, keeping previous policy");
            }
        }
        // A bad file is not retried until its content changes again.
        last = Some(digest);
    }
}

fn hash_file(path: &str) -> io::Result<[u8; 32]> {
    let bytes = std::fs::read(path)?;
    Ok(Sha256::digest(&bytes).into())
}
