//! Per-widget interaction/commit state machine.
//!
//! `Idle -> Interacting -> Committing -> Idle`. The scheduler owns every
//! timer handle and decides when a value may go to the coordinator. It never
//! awaits: callers do the I/O and report back, so every transition is a
//! short critical section on the widget's lane.

use super::SchedulerConfig;
use dashmap::DashMap;
use livecell_base::widget::{WidgetId, WidgetValue};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Interacting,
    Committing,
}

#[derive(Debug, Default)]
struct Lane {
    phase: Phase,
    in_flight: bool,
    /// latest value that arrived while a commit was in flight
    follow_up: Option<WidgetValue>,
    /// latest value seen during the current interaction
    pending: Option<WidgetValue>,
    last_render: Option<Instant>,
    generation: u64,
    fired: u64,
    debounce: Option<JoinHandle<()>>,
}

impl Lane {
    fn cancel_debounce(&mut self) {
        self.generation += 1;
        if let Some(handle) = self.debounce.take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Default)]
pub struct UpdateScheduler {
    config: SchedulerConfig,
    lanes: DashMap<WidgetId, Lane>,
}

impl UpdateScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            lanes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn phase(&self, widget_id: &WidgetId) -> Phase {
        self.lanes
            .get(widget_id)
            .map(|l| l.phase)
            .unwrap_or_default()
    }

    pub fn in_flight(&self, widget_id: &WidgetId) -> bool {
        self.lanes.get(widget_id).map(|l| l.in_flight).unwrap_or(false)
    }

    /// Local input newer than the last commit exists (user still
    /// interacting, or a follow-up is queued).
    pub fn has_pending_local(&self, widget_id: &WidgetId) -> bool {
        self.lanes
            .get(widget_id)
            .map(|l| l.phase == Phase::Interacting || l.follow_up.is_some() || l.debounce.is_some())
            .unwrap_or(false)
    }

    pub fn start_interaction(&self, widget_id: &WidgetId) {
        let mut lane = self.lanes.entry(widget_id.clone()).or_default();
        lane.cancel_debounce();
        lane.phase = Phase::Interacting;
        lane.pending = None;
        lane.last_render = None;
    }

    /// Remember the latest value of the interaction. Returns whether the
    /// throttle window allows rendering it now.
    pub fn record_interaction(&self, widget_id: &WidgetId, value: WidgetValue) -> bool {
        let mut lane = self.lanes.entry(widget_id.clone()).or_default();
        lane.pending = Some(value);
        let now = Instant::now();
        match lane.last_render {
            Some(last) if now.duration_since(last) < self.config.throttle() => false,
            _ => {
                lane.last_render = Some(now);
                true
            }
        }
    }

    /// Leave the interaction; returns the last value seen during it.
    pub fn end_interaction(&self, widget_id: &WidgetId) -> Option<WidgetValue> {
        let mut lane = self.lanes.entry(widget_id.clone()).or_default();
        lane.phase = if lane.in_flight {
            Phase::Committing
        } else {
            Phase::Idle
        };
        lane.last_render = None;
        lane.pending.take()
    }

    /// Supersede any pending debounce timer; the returned generation
    /// identifies the new one.
    pub fn arm_debounce(&self, widget_id: &WidgetId) -> u64 {
        let mut lane = self.lanes.entry(widget_id.clone()).or_default();
        lane.cancel_debounce();
        lane.generation
    }

    /// Keep the timer task of `generation` so it can be cancelled. Dropped
    /// when it already fired or was superseded.
    pub fn set_debounce(&self, widget_id: &WidgetId, generation: u64, handle: JoinHandle<()>) {
        let mut lane = self.lanes.entry(widget_id.clone()).or_default();
        if lane.generation == generation && lane.fired != generation {
            lane.debounce = Some(handle);
        } else if lane.generation != generation {
            handle.abort();
        }
    }

    /// Called by the timer when it elapses. `false` when it was superseded
    /// and must not commit.
    pub fn take_debounce(&self, widget_id: &WidgetId, generation: u64) -> bool {
        match self.lanes.get_mut(widget_id) {
            Some(mut lane) if lane.generation == generation => {
                lane.fired = generation;
                lane.debounce = None;
                true
            }
            _ => false,
        }
    }

    pub fn cancel_debounce(&self, widget_id: &WidgetId) {
        if let Some(mut lane) = self.lanes.get_mut(widget_id) {
            lane.cancel_debounce();
        }
    }

    /// Claim the commit slot. `false` when a commit is already in flight:
    /// the value is queued as the follow-up (replacing an older one).
    pub fn begin_commit(&self, widget_id: &WidgetId, value: WidgetValue) -> bool {
        let mut lane = self.lanes.entry(widget_id.clone()).or_default();
        if lane.in_flight {
            lane.follow_up = Some(value);
            false
        } else {
            lane.in_flight = true;
            if lane.phase != Phase::Interacting {
                lane.phase = Phase::Committing;
            }
            true
        }
    }

    /// After a successful commit: the next value to send, or `None` which
    /// also releases the commit slot.
    pub fn next_follow_up(&self, widget_id: &WidgetId) -> Option<WidgetValue> {
        let mut lane = self.lanes.get_mut(widget_id)?;
        match lane.follow_up.take() {
            Some(v) => Some(v),
            None => {
                lane.in_flight = false;
                if lane.phase == Phase::Committing {
                    lane.phase = Phase::Idle;
                }
                None
            }
        }
    }

    /// Failed commit: release the slot and drop the queued follow-up.
    pub fn abort_commit(&self, widget_id: &WidgetId) -> Option<WidgetValue> {
        let mut lane = self.lanes.get_mut(widget_id)?;
        lane.in_flight = false;
        if lane.phase == Phase::Committing {
            lane.phase = Phase::Idle;
        }
        lane.follow_up.take()
    }

    pub fn forget(&self, widget_id: &WidgetId) {
        if let Some((_, mut lane)) = self.lanes.remove(widget_id) {
            lane.cancel_debounce();
        }
    }

    pub fn clear(&self) {
        for mut lane in self.lanes.iter_mut() {
            lane.cancel_debounce();
        }
        self.lanes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scheduler() -> UpdateScheduler {
        UpdateScheduler::new(SchedulerConfig::default())
    }

    #[test]
    fn test_commits_are_sequential_with_follow_up() {
        let s = scheduler();
        let w = WidgetId::new("w1");
        assert_eq!(s.phase(&w), Phase::Idle);
        assert!(s.begin_commit(&w, 1.0.into()));
        assert_eq!(s.phase(&w), Phase::Committing);
        assert!(!s.begin_commit(&w, 2.0.into()));
        assert!(!s.begin_commit(&w, 3.0.into()));
        // only the latest queued value survives
        assert_eq!(s.next_follow_up(&w), Some(3.0.into()));
        assert!(s.in_flight(&w));
        assert_eq!(s.next_follow_up(&w), None);
        assert!(!s.in_flight(&w));
        assert_eq!(s.phase(&w), Phase::Idle);
    }

    #[test]
    fn test_failed_commit_drops_follow_up() {
        let s = scheduler();
        let w = WidgetId::new("w1");
        assert!(s.begin_commit(&w, 1.0.into()));
        assert!(!s.begin_commit(&w, 2.0.into()));
        assert_eq!(s.abort_commit(&w), Some(2.0.into()));
        assert!(!s.in_flight(&w));
        assert!(s.begin_commit(&w, 4.0.into()));
    }

    #[test]
    fn test_interaction_keeps_phase_through_commit() {
        let s = scheduler();
        let w = WidgetId::new("w1");
        s.start_interaction(&w);
        assert!(s.begin_commit(&w, 1.0.into()));
        assert_eq!(s.phase(&w), Phase::Interacting);
        assert_eq!(s.end_interaction(&w), None);
        assert_eq!(s.phase(&w), Phase::Committing);
        assert_eq!(s.next_follow_up(&w), None);
        assert_eq!(s.phase(&w), Phase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_window() {
        let s = scheduler();
        let w = WidgetId::new("w1");
        s.start_interaction(&w);
        assert!(s.record_interaction(&w, 1.0.into()));
        assert!(!s.record_interaction(&w, 2.0.into()));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(s.record_interaction(&w, 3.0.into()));
        assert!(!s.record_interaction(&w, 4.0.into()));
        // the final sample is never lost to the throttle
        assert_eq!(s.end_interaction(&w), Some(4.0.into()));
    }

    #[tokio::test]
    async fn test_superseded_debounce_does_not_fire() {
        let s = scheduler();
        let w = WidgetId::new("w1");
        let first = s.arm_debounce(&w);
        s.set_debounce(&w, first, tokio::spawn(async {}));
        let second = s.arm_debounce(&w);
        assert!(!s.take_debounce(&w, first));
        s.set_debounce(&w, second, tokio::spawn(std::future::pending()));
        assert!(s.has_pending_local(&w));
        assert!(s.take_debounce(&w, second));
        assert!(!s.has_pending_local(&w));
        s.start_interaction(&w);
        assert!(!s.take_debounce(&w, second));
    }
}
