//! `TriggerDispatcher` — the single entry point the trigger host (an HTTP
//! server, a cron ticker, an event bus) calls into, and the single owner of
//! the three trigger registries.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::cron::{CronDispatcher, CronPollOutcome};
use crate::event::EventDispatcher;
use crate::sink::FireSink;
use crate::webhook::WebhookDispatcher;
use queue::TokenBucketLimiter;

/// Aggregate counts across all registered triggers, split by type and
/// enabled/disabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerStats {
    pub cron_total: usize,
    pub webhook_total: usize,
    pub event_total: usize,
    pub enabled: usize,
    pub disabled: usize,
}

pub struct TriggerDispatcher {
    pub cron: CronDispatcher,
    pub webhook: WebhookDispatcher,
    pub event: EventDispatcher,
    stop: watch::Sender<bool>,
}

impl TriggerDispatcher {
    pub fn new(webhook_rate_limiter: Option<Arc<TokenBucketLimiter>>) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            cron: CronDispatcher::new(),
            webhook: WebhookDispatcher::new(webhook_rate_limiter),
            event: EventDispatcher::new(),
            stop,
        }
    }

    /// Spawn the cron poll loop (one tick per second) on the current Tokio
    /// runtime. Returns a handle the caller can `.await` during shutdown.
    pub fn spawn_cron_poll_loop(
        self: &Arc<Self>,
        sink: Arc<dyn FireSink>,
    ) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let mut stop_rx = self.stop.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcomes = this.cron.poll_once(Utc::now(), sink.as_ref()).await;
                        for outcome in outcomes {
                            if let CronPollOutcome::FireFailed { trigger_id, reason } = outcome {
                                tracing::error!(%trigger_id, %reason, "cron firing failed");
                            }
                        }
                    }
                    _ = stop_rx.changed() => {
                        info!("cron poll loop stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Signal the cron poll loop (and any other background sweepers built
    /// on the same channel) to stop.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Aggregate counts across the cron, webhook, and event registries.
    pub fn stats(&self) -> TriggerStats {
        let (cron_total, cron_enabled) = self.cron.counts();
        let (webhook_total, webhook_enabled) = self.webhook.counts();
        let (event_total, event_enabled) = self.event.counts();
        let enabled = cron_enabled + webhook_enabled + event_enabled;
        let total = cron_total + webhook_total + event_total;
        TriggerStats {
            cron_total,
            webhook_total,
            event_total,
            enabled,
            disabled: total - enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::FireContext;
    use crate::TriggerError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct CountingSink(AtomicUsize);

    #[async_trait]
    impl FireSink for CountingSink {
        async fn fire(&self, _workflow_name: &str, _ctx: FireContext) -> Result<Uuid, TriggerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Uuid::new_v4())
        }
    }

    #[tokio::test]
    async fn dispatcher_composes_all_three_trigger_kinds() {
        let dispatcher = Arc::new(TriggerDispatcher::new(None));
        let now = Utc::now();
        dispatcher
            .cron
            .register("cron-wf", "* * * * *", 1, vec![], now)
            .unwrap();
        dispatcher.event.subscribe("event-wf", "tick", None, None, vec![]);
        dispatcher.webhook.register(
            "hook-wf",
            "POST",
            "/hook",
            None,
            None,
            None,
            Duration::from_secs(1),
            vec![],
        );

        let sink = CountingSink(AtomicUsize::new(0));
        let outcomes = dispatcher.event.emit_event("tick", None, serde_json::json!({}), &sink).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stats_counts_entries_and_enabled_split_per_kind() {
        let dispatcher = TriggerDispatcher::new(None);
        let now = Utc::now();
        dispatcher
            .cron
            .register("cron-wf", "* * * * *", 1, vec![], now)
            .unwrap();
        let second_cron = dispatcher
            .cron
            .register("cron-wf-2", "0 0 * * 7", 1, vec![], now)
            .unwrap();
        dispatcher.cron.set_enabled(second_cron, false).unwrap();

        dispatcher.event.subscribe("event-wf", "tick", None, None, vec![]);

        dispatcher.webhook.register(
            "hook-wf",
            "POST",
            "/hook",
            None,
            None,
            None,
            Duration::from_secs(1),
            vec![],
        );
        dispatcher.webhook.set_enabled("POST", "/hook", false);

        let stats = dispatcher.stats();
        assert_eq!(stats.cron_total, 2);
        assert_eq!(stats.webhook_total, 1);
        assert_eq!(stats.event_total, 1);
        assert_eq!(stats.enabled, 2);
        assert_eq!(stats.disabled, 2);
    }
}
