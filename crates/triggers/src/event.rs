//! Event triggers: subscribed by `event_type` with an optional `source`
//! filter, dispatched to every matching enabled trigger on `emit_event`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::sink::{FireContext, FireSink, TriggerType};

type Condition = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

pub struct EventTrigger {
    pub id: Uuid,
    pub workflow_name: String,
    pub event_type: String,
    pub source: Option<String>,
    pub condition: Option<Condition>,
    pub tags: Vec<String>,
    enabled: AtomicBool,
    run_count: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFireOutcome {
    Fired { trigger_id: Uuid, run_id: Uuid },
    Skipped { trigger_id: Uuid },
}

/// Registry + dispatch for event-subscribed triggers.
pub struct EventDispatcher {
    entries: DashMap<Uuid, Arc<EventTrigger>>,
    by_type: DashMap<String, Vec<Uuid>>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            by_type: DashMap::new(),
        }
    }

    pub fn subscribe(
        &self,
        workflow_name: impl Into<String>,
        event_type: impl Into<String>,
        source: Option<String>,
        condition: Option<Condition>,
        tags: Vec<String>,
    ) -> Uuid {
        let event_type = event_type.into();
        let id = Uuid::new_v4();
        self.entries.insert(
            id,
            Arc::new(EventTrigger {
                id,
                workflow_name: workflow_name.into(),
                event_type: event_type.clone(),
                source,
                condition,
                tags,
                enabled: AtomicBool::new(true),
                run_count: AtomicU64::new(0),
            }),
        );
        self.by_type.entry(event_type).or_default().push(id);
        id
    }

    pub fn set_enabled(&self, id: Uuid, enabled: bool) {
        if let Some(entry) = self.entries.get(&id) {
            entry.enabled.store(enabled, Ordering::Release);
        }
    }

    /// `(total, enabled)` across every registered event subscriber, for
    /// `TriggerDispatcher::stats`.
    pub fn counts(&self) -> (usize, usize) {
        let total = self.entries.len();
        let enabled = self.entries.iter().filter(|e| e.enabled.load(Ordering::Acquire)).count();
        (total, enabled)
    }

    /// Dispatch `payload` to every enabled, matching subscriber. A
    /// subscriber whose `condition` evaluates false is skipped, not an
    /// error.
    pub async fn emit_event(
        &self,
        event_type: &str,
        source: Option<&str>,
        payload: Value,
        sink: &dyn FireSink,
    ) -> Vec<EventFireOutcome> {
        let Some(ids) = self.by_type.get(event_type).map(|v| v.clone()) else {
            return Vec::new();
        };

        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(trigger) = self.entries.get(&id) else { continue };
            if !trigger.enabled.load(Ordering::Acquire) {
                continue;
            }
            if let (Some(want), Some(got)) = (&trigger.source, source) {
                if want != got {
                    continue;
                }
            }
            if let Some(cond) = &trigger.condition {
                if !cond(&payload) {
                    outcomes.push(EventFireOutcome::Skipped { trigger_id: id });
                    continue;
                }
            }

            let ctx = FireContext {
                trigger_id: id,
                trigger_type: TriggerType::Event,
                payload: payload.clone(),
                tags: trigger.tags.clone(),
                next_fire_at: None,
            };
            if let Ok(run_id) = sink.fire(&trigger.workflow_name, ctx).await {
                trigger.run_count.fetch_add(1, Ordering::AcqRel);
                outcomes.push(EventFireOutcome::Fired { trigger_id: id, run_id });
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TriggerError;
    use async_trait::async_trait;

    struct AlwaysFire;

    #[async_trait]
    impl FireSink for AlwaysFire {
        async fn fire(&self, _workflow_name: &str, _ctx: FireContext) -> Result<Uuid, TriggerError> {
            Ok(Uuid::new_v4())
        }
    }

    #[tokio::test]
    async fn matching_event_type_and_source_fires() {
        let dispatcher = EventDispatcher::new();
        dispatcher.subscribe("wf", "order.created", Some("shop".into()), None, vec![]);

        let outcomes = dispatcher
            .emit_event("order.created", Some("shop"), serde_json::json!({}), &AlwaysFire)
            .await;
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], EventFireOutcome::Fired { .. }));
    }

    #[tokio::test]
    async fn mismatched_source_does_not_fire() {
        let dispatcher = EventDispatcher::new();
        dispatcher.subscribe("wf", "order.created", Some("shop".into()), None, vec![]);

        let outcomes = dispatcher
            .emit_event("order.created", Some("other"), serde_json::json!({}), &AlwaysFire)
            .await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn condition_false_skips_without_error() {
        let dispatcher = EventDispatcher::new();
        dispatcher.subscribe(
            "wf",
            "order.created",
            None,
            Some(Arc::new(|v: &Value| v["amount"].as_i64().unwrap_or(0) > 100)),
            vec![],
        );

        let outcomes = dispatcher
            .emit_event("order.created", None, serde_json::json!({"amount": 5}), &AlwaysFire)
            .await;
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], EventFireOutcome::Skipped { .. }));
    }
}
