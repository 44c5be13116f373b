use std::sync::Arc;
use std::time::{Duration, Instant};

use karchive_core::{IngestionEnvelope, ResourceView};
use karchive_filters::FilterHandle;
use karchive_kubehub::{ClusterDeleter, ResourceRef};
use karchive_persist::ResourceWriter;
use metrics::{counter, histogram};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct ProcessorConfig {
    /// Bound on the persist phase, measured from when it starts. A write that
    /// already reached the blocking pool still completes after a timeout, so
    /// the row can land even though the event counts as `PersistFailed`.
    pub persist_timeout: Duration,
    /// Bound on the delete phase; a fresh budget independent of persist.
    pub delete_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self { persist_timeout: Duration::from_secs(5), delete_timeout: Duration::from_secs(5) }
    }
}

/// How processing of one event ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Malformed,
    Skipped,
    PersistFailed,
    Archived,
    DeleteFailed,
    ArchivedAndDeleted,
}

/// Runs decode -> filter -> persist -> delete decision -> delete for one event
/// at a time. Holds no per-event state; failures are logged and end the event,
/// nothing is retried.
pub struct EventProcessor {
    filters: FilterHandle,
    writer: Arc<dyn ResourceWriter>,
    deleter: Arc<dyn ClusterDeleter>,
    cfg: ProcessorConfig,
}

impl EventProcessor {
    pub fn new(
        filters: FilterHandle,
        writer: Arc<dyn ResourceWriter>,
        deleter: Arc<dyn ClusterDeleter>,
        cfg: ProcessorConfig,
    ) -> Self {
        Self { filters, writer, deleter, cfg }
    }

    pub async fn process(&self, env: &IngestionEnvelope) -> Outcome {
        counter!("sink_events_total", 1u64);
        let event = env.event_id.as_str();
        debug!(event = %event, "received event");
        let filters = self.filters.current();

        let resource = match ResourceView::decode(env.content_type.as_deref(), &env.payload) {
            Ok(r) => r,
            Err(e) => {
                warn!(event = %event, error = %e, "event is malformed and will not be processed");
                counter!("sink_malformed_total", 1u64);
                return Outcome::Malformed;
            }
        };
        let id = resource.identity();

        if !filters.must_archive(Some(&resource)) {
            debug!(event = %event, uid = %id.uid, gvk = %id.gvk, "object does not need to be archived");
            return Outcome::Skipped;
        }

        let started = Instant::now();
        match timeout(self.cfg.persist_timeout, self.writer.write_resource(&resource, &env.payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(event = %event, uid = %id.uid, error = %e, "failed to archive object");
                counter!("sink_persist_failed_total", 1u64);
                return Outcome::PersistFailed;
            }
            Err(_) => {
                error!(event = %event, uid = %id.uid, timeout = ?self.cfg.persist_timeout, "archiving object timed out");
                counter!("sink_persist_failed_total", 1u64);
                return Outcome::PersistFailed;
            }
        }
        histogram!("sink_persist_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("sink_archived_total", 1u64);
        info!(event = %event, uid = %id.uid, gvk = %id.gvk, ns = %id.namespace, name = %id.name, "object archived");

        if !filters.must_delete(Some(&resource)) {
            debug!(event = %event, uid = %id.uid, "object does not need to be deleted");
            return Outcome::Archived;
        }

        let target = ResourceRef::guess(&id.gvk);
        match timeout(self.cfg.delete_timeout, self.deleter.delete(&target, &id.namespace, &id.name)).await {
            Ok(Ok(())) => {
                counter!("sink_deleted_total", 1u64);
                info!(event = %event, uid = %id.uid, resource = %target.plural, "object deleted from cluster");
                Outcome::ArchivedAndDeleted
            }
            Ok(Err(e)) => {
                warn!(event = %event, uid = %id.uid, error = %e, "could not delete object");
                counter!("sink_delete_failed_total", 1u64);
                Outcome::DeleteFailed
            }
            Err(_) => {
                warn!(event = %event, uid = %id.uid, timeout = ?self.cfg.delete_timeout, "deleting object timed out");
                counter!("sink_delete_failed_total", 1u64);
                Outcome::DeleteFailed
            }
        }
    }
}

/// Spawn `n` workers draining the shared queue. Each event is processed
/// independently; workers stop once every sender is dropped.
pub fn spawn_workers(
    n: usize,
    processor: Arc<EventProcessor>,
    rx: mpsc::Receiver<IngestionEnvelope>,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..n.max(1))
        .map(|worker| {
            let rx = Arc::clone(&rx);
            let processor = Arc::clone(&processor);
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    match next {
                        Some(env) => {
                            processor.process(&env).await;
                        }
                        None => break,
                    }
                }
                debug!(worker, "sink worker stopped");
            })
        })
        .collect()
}
