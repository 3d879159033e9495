//! List then watch an `ObjectStore`, feeding deltas into an ingest channel.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::{Resource, ResourceExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kbind_core::{Delta, ListScope, ObjectStore, StoreError, WatchEvent};

#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    pub scope: ListScope,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        let max_secs = std::env::var("KBIND_WATCH_BACKOFF_MAX_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(30);
        Self { scope: ListScope::all(), backoff_initial: Duration::from_millis(200), backoff_max: Duration::from_secs(max_secs) }
    }
}

impl ReflectorConfig {
    pub fn scoped(scope: ListScope) -> Self { Self { scope, ..Self::default() } }
}

enum Outcome {
    /// Watch ended normally; resume from the last seen resourceVersion.
    /// `idle` is set when the stream closed without yielding anything.
    Resume { idle: bool },
    /// The resourceVersion is gone; list again.
    Relist,
    Failed(StoreError),
    Stopped,
}

pub fn spawn_reflector<K>(
    kind: &'static str,
    store: Arc<dyn ObjectStore<K>>,
    tx: mpsc::Sender<Delta<K>>,
    cfg: ReflectorConfig,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    tokio::spawn(run_reflector(kind, store, tx, cfg, token))
}

/// Run until the token is cancelled or the ingest side goes away.
pub async fn run_reflector<K>(
    kind: &'static str,
    store: Arc<dyn ObjectStore<K>>,
    tx: mpsc::Sender<Delta<K>>,
    cfg: ReflectorConfig,
    token: CancellationToken,
) where
    K: Resource + Clone + Send + Sync + 'static,
{
    let mut delay = cfg.backoff_initial;
    let mut rv: Option<String> = None;
    loop {
        if token.is_cancelled() {
            break;
        }
        let from = match rv.clone() {
            Some(rv) => rv,
            None => {
                let listed = tokio::select! {
                    res = store.list(&cfg.scope) => res,
                    _ = token.cancelled() => break,
                };
                match listed {
                    Ok(listed) => {
                        info!(kind, count = listed.items.len(), rv = %listed.resource_version, "listed");
                        if tx.send(Delta::Restarted(listed.items)).await.is_err() {
                            break;
                        }
                        delay = cfg.backoff_initial;
                        rv = Some(listed.resource_version.clone());
                        listed.resource_version
                    }
                    Err(e) => {
                        warn!(kind, error = %e, delay_ms = delay.as_millis() as u64, "list failed; backing off");
                        if sleep_or_cancel(delay, &token).await {
                            break;
                        }
                        delay = (delay * 2).min(cfg.backoff_max);
                        continue;
                    }
                }
            }
        };
        match watch_once(kind, store.as_ref(), &cfg.scope, &from, &tx, &token, &mut rv).await {
            Outcome::Resume { idle: false } => {
                debug!(kind, rv = ?rv, "watch ended; resuming");
                delay = cfg.backoff_initial;
            }
            Outcome::Resume { idle: true } => {
                debug!(kind, rv = ?rv, delay_ms = delay.as_millis() as u64, "watch closed without events; resuming after backoff");
                if sleep_or_cancel(delay, &token).await {
                    break;
                }
                delay = (delay * 2).min(cfg.backoff_max);
            }
            Outcome::Relist => {
                info!(kind, "resourceVersion expired; relisting");
                metrics::counter!("reflector_relists_total", 1u64, "kind" => kind);
                rv = None;
            }
            Outcome::Failed(e) => {
                warn!(kind, error = %e, delay_ms = delay.as_millis() as u64, "watch failed; backing off");
                if sleep_or_cancel(delay, &token).await {
                    break;
                }
                delay = (delay * 2).min(cfg.backoff_max);
            }
            Outcome::Stopped => break,
        }
    }
    info!(kind, "reflector stopped");
}

async fn watch_once<K>(
    kind: &'static str,
    store: &dyn ObjectStore<K>,
    scope: &ListScope,
    from: &str,
    tx: &mpsc::Sender<Delta<K>>,
    token: &CancellationToken,
    rv: &mut Option<String>,
) -> Outcome
where
    K: Resource + Clone + Send + Sync + 'static,
{
    let opened = tokio::select! {
        res = store.watch(scope, from) => res,
        _ = token.cancelled() => return Outcome::Stopped,
    };
    let mut stream = match opened {
        Ok(s) => s,
        Err(StoreError::Expired(_)) => return Outcome::Relist,
        Err(e) => return Outcome::Failed(e),
    };
    debug!(kind, rv = %from, "watch opened");
    let mut idle = true;
    loop {
        let next = tokio::select! {
            ev = stream.next() => ev,
            _ = token.cancelled() => return Outcome::Stopped,
        };
        let delta = match next {
            None => return Outcome::Resume { idle },
            Some(Err(StoreError::Expired(_))) => return Outcome::Relist,
            Some(Err(e)) => return Outcome::Failed(e),
            Some(Ok(WatchEvent::Bookmark(b))) => {
                idle = false;
                *rv = Some(b);
                continue;
            }
            Some(Ok(WatchEvent::Added(o))) | Some(Ok(WatchEvent::Modified(o))) => {
                idle = false;
                if let Some(v) = o.resource_version() {
                    *rv = Some(v);
                }
                Delta::Applied(o)
            }
            Some(Ok(WatchEvent::Deleted(o))) => {
                idle = false;
                if let Some(v) = o.resource_version() {
                    *rv = Some(v);
                }
                Delta::Deleted(o)
            }
        };
        if tx.send(delta).await.is_err() {
            return Outcome::Stopped;
        }
    }
}

/// Sleep for `d`; returns true when cancelled first.
async fn sleep_or_cancel(d: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(d) => false,
        _ = token.cancelled() => true,
    }
}
