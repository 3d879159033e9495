//! kbind runtime: level-triggered controllers over a watched cache and a work queue

#![forbid(unsafe_code)]

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use kube::Resource;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use kbind_core::ObjectKey;
use kbind_queue::WorkQueue;
use kbind_store::Cache;

pub mod commit;
pub mod fanout;

pub use commit::{CommitError, Committed, Committer};
pub use fanout::{keys_from_index, EventHandler};

/// Per-iteration context handed to a reconciler.
#[derive(Debug, Clone)]
pub struct Context {
    pub controller: &'static str,
    pub key: String,
    pub token: CancellationToken,
}

/// Drives one object towards its desired state.
///
/// `reconcile` runs independent steps in order and returns every error they
/// produced; the mutated copy is committed regardless. Steps must be idempotent.
#[async_trait::async_trait]
pub trait Reconciler<K>: Send + Sync + 'static {
    async fn reconcile(&self, ctx: &Context, obj: &mut K) -> Vec<anyhow::Error>;

    /// The keyed object no longer exists.
    async fn absent(&self, _ctx: &Context, _key: &ObjectKey) -> anyhow::Result<()> { Ok(()) }
}

fn render(errors: &[anyhow::Error]) -> String {
    errors.iter().map(|e| format!("{:#}", e)).collect::<Vec<_>>().join("; ")
}

/// Every error of one reconcile iteration.
#[derive(Debug, thiserror::Error)]
#[error("{} error(s): {}", .0.len(), render(.0))]
pub struct ReconcileErrors(pub Vec<anyhow::Error>);

fn panic_message(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Worker pool reconciling the keys of one queue against one primary cache.
pub struct Controller<K> {
    name: &'static str,
    queue: WorkQueue,
    cache: Cache<K>,
    reconciler: Arc<dyn Reconciler<K>>,
    committer: Committer<K>,
}

impl<K> Controller<K>
where
    K: Resource + Clone + Serialize + Send + Sync + 'static,
{
    pub fn new(name: &'static str, cache: Cache<K>, reconciler: impl Reconciler<K>, committer: Committer<K>) -> Self {
        Self { name, queue: WorkQueue::new(name), cache, reconciler: Arc::new(reconciler), committer }
    }

    pub fn with_queue(mut self, queue: WorkQueue) -> Self {
        self.queue = queue;
        self
    }

    pub fn name(&self) -> &'static str { self.name }

    pub fn queue(&self) -> &WorkQueue { &self.queue }

    pub fn cache(&self) -> &Cache<K> { &self.cache }

    /// Enqueue primary objects on every change.
    pub fn watch_primary(&self) {
        EventHandler::direct(self.name, self.cache.kind(), self.queue.clone()).subscribe(&self.cache);
    }

    /// Reconcile and commit the object named by `ctx.key`.
    pub async fn process(&self, ctx: &Context) -> Result<(), ReconcileErrors> {
        let key = match ObjectKey::parse(&ctx.key) {
            Ok(k) => k,
            Err(e) => {
                warn!(controller = self.name, key = %ctx.key, error = %e, "dropping malformed key");
                return Ok(());
            }
        };
        let Some(cached) = self.cache.get(&key) else {
            debug!(controller = self.name, key = %key, "object gone");
            return self.reconciler.absent(ctx, &key).await.map_err(|e| ReconcileErrors(vec![e]));
        };
        let mut obj = K::clone(&cached);
        let mut errors = self.reconciler.reconcile(ctx, &mut obj).await;
        if let Err(e) = self.committer.commit(&cached, &obj).await {
            errors.push(e.into());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ReconcileErrors(errors))
        }
    }

    /// Take one key and process it. Returns false once the queue is shut down
    /// or the token is cancelled.
    pub async fn process_next(&self, token: &CancellationToken) -> bool {
        if token.is_cancelled() {
            return false;
        }
        let key = tokio::select! {
            k = self.queue.get() => match k {
                Some(k) => k,
                None => return false,
            },
            _ = token.cancelled() => return false,
        };
        let ctx = Context { controller: self.name, key: key.clone(), token: token.clone() };
        let started = Instant::now();
        let span = info_span!("reconcile", controller = self.name, key = %key);
        let work = AssertUnwindSafe(self.process(&ctx)).catch_unwind().instrument(span);
        let outcome = tokio::select! {
            res = work => res,
            _ = token.cancelled() => {
                self.queue.done(&key);
                return false;
            }
        };
        metrics::histogram!("reconcile_duration_ms", started.elapsed().as_secs_f64() * 1000.0, "controller" => self.name);
        match outcome {
            Ok(Ok(())) => {
                metrics::counter!("reconcile_total", 1u64, "controller" => self.name, "result" => "ok");
                self.queue.forget(&key);
            }
            Ok(Err(errors)) => {
                metrics::counter!("reconcile_total", 1u64, "controller" => self.name, "result" => "error");
                warn!(
                    controller = self.name,
                    key = %key,
                    requeues = self.queue.num_requeues(&key),
                    error = %errors,
                    "reconcile failed; requeueing with backoff"
                );
                self.queue.add_rate_limited(&key);
            }
            Err(panic) => {
                metrics::counter!("reconcile_total", 1u64, "controller" => self.name, "result" => "panic");
                error!(controller = self.name, key = %key, panic = %panic_message(panic.as_ref()), "reconcile panicked; requeueing");
                self.queue.add_rate_limited(&key);
            }
        }
        self.queue.done(&key);
        true
    }

    /// Run `workers` workers until `token` is cancelled.
    pub async fn run(self: Arc<Self>, workers: usize, token: CancellationToken) {
        let workers = workers.max(1);
        info!(controller = self.name, workers, "starting workers");
        let mut set = tokio::task::JoinSet::new();
        for _ in 0..workers {
            let me = Arc::clone(&self);
            let token = token.clone();
            set.spawn(async move { while me.process_next(&token).await {} });
        }
        token.cancelled().await;
        self.queue.shut_down();
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                error!(controller = self.name, error = %e, "worker task failed");
            }
        }
        info!(controller = self.name, "workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_every_step() {
        let errs = ReconcileErrors(vec![anyhow::anyhow!("first"), anyhow::anyhow!("second").context("step two")]);
        assert_eq!(errs.to_string(), "2 error(s): first; step two: second");
    }

    #[test]
    fn panic_payloads_render() {
        let p: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(p.as_ref()), "boom");
        let p: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(p.as_ref()), "bang");
        let p: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(p.as_ref()), "non-string panic payload");
    }
}
