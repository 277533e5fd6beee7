//! Tracker worker loop.
//!
//! Receives normalized events over a `tokio::mpsc` channel, runs the
//! match/update pipeline per event, and periodically sweeps idle states to
//! `abandoned`. Every failure is logged with its stage and counted; the
//! loop never stops because of a bad event.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use funnelcast_common::cache::{AnalyticsCache, FunnelCache};
use funnelcast_common::db::DbPool;
use funnelcast_common::error::AppError;
use funnelcast_common::event::{EventRecord, validate_event_record};
use funnelcast_common::funnel::UserFunnelState;
use funnelcast_common::tenant::TenantContext;

use crate::funnel_cache::ActiveFunnelCache;
use crate::matcher::find_matching_step;
use crate::metrics::TrackerMetrics;
use crate::processor::plan_transition;
use crate::store;

/// How often idle states are swept to `abandoned`.
const SWEEP_INTERVAL_SECS: u64 = 60;

/// Submission side of the tracker, handed to the ingest surface. Also
/// carries the definition cache so configuration changes can drop stale
/// entries without reaching into the worker.
#[derive(Clone)]
pub struct TrackerHandle {
    sender: mpsc::Sender<EventRecord>,
    funnel_cache: Arc<ActiveFunnelCache>,
}

impl TrackerHandle {
    /// Queues one event. Backpressure surfaces as an error so the ingest
    /// surface can signal overload; the tracker itself never pushes errors
    /// back.
    pub fn submit(&self, event: EventRecord) -> Result<(), AppError> {
        self.sender
            .try_send(event)
            .map_err(|e| AppError::Internal(format!("tracker queue unavailable: {e}")))
    }

    /// Drops cached definitions for a workspace after publish/archive so
    /// the next event sees fresh configuration.
    pub async fn invalidate_definitions(&self, ctx: TenantContext) {
        self.funnel_cache.invalidate(ctx).await;
    }
}

pub struct TrackerWorker {
    pool: DbPool,
    receiver: mpsc::Receiver<EventRecord>,
    funnel_cache: Arc<ActiveFunnelCache>,
    shared_cache: FunnelCache,
    metrics: Arc<TrackerMetrics>,
}

impl TrackerWorker {
    /// Builds the worker plus its submission handle. `cache` is the
    /// process-wide analytics cache, shared with the API so live-metrics
    /// invalidation lands where reads happen.
    pub fn new(
        pool: DbPool,
        cache: Arc<AnalyticsCache>,
        channel_capacity: usize,
        funnel_cache_ttl: Duration,
    ) -> (TrackerHandle, Self, Arc<TrackerMetrics>) {
        let (sender, receiver) = mpsc::channel(channel_capacity);
        let metrics = Arc::new(TrackerMetrics::new());
        let funnel_cache = Arc::new(ActiveFunnelCache::new(funnel_cache_ttl));

        let worker = Self {
            pool,
            receiver,
            funnel_cache: Arc::clone(&funnel_cache),
            shared_cache: FunnelCache::new(cache),
            metrics: Arc::clone(&metrics),
        };

        (TrackerHandle { sender, funnel_cache }, worker, metrics)
    }

    /// Runs until shutdown is signalled or all senders drop. Remaining
    /// queued events are drained before returning.
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) {
        tracing::info!("realtime tracker started");

        let mut sweep = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        sweep.tick().await;

        loop {
            tokio::select! {
                maybe_event = self.receiver.recv() => {
                    match maybe_event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            tracing::info!("all tracker senders dropped");
                            break;
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.run_sweep();
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        tracing::info!("tracker received shutdown signal, draining queue");
                        while let Ok(event) = self.receiver.try_recv() {
                            self.handle_event(event).await;
                        }
                        break;
                    }
                }
            }
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            events_received = snapshot.events_received,
            state_updates = snapshot.state_updates,
            failures = snapshot.failures,
            "realtime tracker shut down"
        );
    }

    async fn handle_event(&self, event: EventRecord) {
        TrackerMetrics::incr(&self.metrics.events_received);

        if let Err(e) = self.process_event(&event).await {
            TrackerMetrics::incr(&self.metrics.failures);
            tracing::error!(
                tenant_id = event.tenant_id,
                workspace_id = event.workspace_id,
                event_name = %event.event_name,
                error = %e,
                "event processing failed"
            );
        }
    }

    async fn process_event(&self, event: &EventRecord) -> Result<(), AppError> {
        if let Err(errors) = validate_event_record(event) {
            return Err(AppError::Validation(errors.join("; ")));
        }

        let ctx = TenantContext::new(event.tenant_id, event.workspace_id);
        let definitions = self.funnel_cache.get_or_load(&self.pool, ctx).await?;

        for definition in definitions.iter() {
            let Some(step) = find_matching_step(definition, event) else {
                continue;
            };
            TrackerMetrics::incr(&self.metrics.events_matched);

            // Cache-first state read; the DB is the source of truth on miss.
            let prior: Option<UserFunnelState> = match self.shared_cache.get_user_state(
                ctx.tenant_id,
                ctx.workspace_id,
                definition.funnel_id,
                &event.anonymous_id,
            ) {
                Some(state) => Some(state),
                None => store::load_user_state(
                    &self.pool,
                    ctx,
                    definition.funnel_id,
                    &event.anonymous_id,
                )?,
            };

            let planned = plan_transition(definition, step, prior.as_ref(), event);

            let persisted =
                store::upsert_user_state(&self.pool, ctx, definition.funnel_id, &planned.upsert)
                    .map_err(|e| {
                        AppError::Internal(format!(
                            "state upsert failed for funnel {}: {e}",
                            definition.funnel_id
                        ))
                    })?;
            TrackerMetrics::incr(&self.metrics.state_updates);

            self.shared_cache.put_user_state(
                ctx.tenant_id,
                ctx.workspace_id,
                definition.funnel_id,
                &event.anonymous_id,
                &persisted,
            );

            if planned.kind.is_significant() {
                self.shared_cache.invalidate_live(
                    ctx.tenant_id,
                    ctx.workspace_id,
                    definition.funnel_id,
                );
                TrackerMetrics::incr(&self.metrics.cache_invalidations);

                tracing::debug!(
                    tenant_id = ctx.tenant_id,
                    workspace_id = ctx.workspace_id,
                    funnel_id = definition.funnel_id,
                    step = step.order_index,
                    kind = ?planned.kind,
                    "funnel state transition"
                );
            }
        }

        Ok(())
    }

    fn run_sweep(&self) {
        match store::sweep_abandoned(&self.pool, chrono::Utc::now()) {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "marked idle funnel states abandoned"),
            Err(e) => {
                TrackerMetrics::incr(&self.metrics.failures);
                tracing::error!(error = %e, "abandonment sweep failed");
            }
        }
    }

}
