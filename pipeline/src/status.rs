use crate::model::ServiceStatus;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// One component's mutable observability counters. Never authoritative
/// state — read by status handlers only.
struct ComponentState {
    initialized: AtomicBool,
    refreshing: AtomicBool,
    last_refresh_time: AtomicI64,
    record_count: AtomicI64,
    degraded: AtomicBool,
}

impl Default for ComponentState {
    fn default() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            refreshing: AtomicBool::new(false),
            last_refresh_time: AtomicI64::new(0),
            record_count: AtomicI64::new(0),
            degraded: AtomicBool::new(false),
        }
    }
}

/// Registry of `ServiceStatus` snapshots, one per named component
/// (refresher, store, catalogue). Components register themselves once at
/// startup and update their counters as they run.
#[derive(Default, Clone)]
pub struct StatusReporter {
    components: Arc<Mutex<HashMap<String, Arc<ComponentState>>>>,
}

impl StatusReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, component: impl Into<String>) {
        self.components.lock().unwrap().entry(component.into()).or_default();
    }

    pub fn mark_initialized(&self, component: &str) {
        self.with_component(component, |c| c.initialized.store(true, Ordering::SeqCst));
    }

    pub fn mark_refreshing(&self, component: &str, refreshing: bool) {
        self.with_component(component, |c| c.refreshing.store(refreshing, Ordering::SeqCst));
        if !refreshing {
            self.with_component(component, |c| c.last_refresh_time.store(Utc::now().timestamp(), Ordering::SeqCst));
        }
    }

    pub fn set_record_count(&self, component: &str, count: i64) {
        self.with_component(component, |c| c.record_count.store(count, Ordering::SeqCst));
    }

    pub fn mark_degraded(&self, component: &str, degraded: bool) {
        self.with_component(component, |c| c.degraded.store(degraded, Ordering::SeqCst));
    }

    fn with_component(&self, component: &str, f: impl FnOnce(&ComponentState)) {
        let components = self.components.lock().unwrap();
        if let Some(state) = components.get(component) {
            f(state);
        }
    }

    pub fn snapshot(&self, component: &str) -> Option<ServiceStatus> {
        let components = self.components.lock().unwrap();
        let state = components.get(component)?;
        Some(to_status(component, state))
    }

    pub fn snapshot_all(&self) -> Vec<ServiceStatus> {
        let components = self.components.lock().unwrap();
        components.iter().map(|(name, state)| to_status(name, state)).collect()
    }
}

fn to_status(name: &str, state: &ComponentState) -> ServiceStatus {
    let last = state.last_refresh_time.load(Ordering::SeqCst);
    ServiceStatus {
        component: name.to_string(),
        initialized: state.initialized.load(Ordering::SeqCst),
        refreshing: state.refreshing.load(Ordering::SeqCst),
        last_refresh_time: if last == 0 { None } else { DateTime::from_timestamp(last, 0) },
        record_count: state.record_count.load(Ordering::SeqCst),
        degraded: state.degraded.load(Ordering::SeqCst),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_lifecycle_of_a_component() {
        let reporter = StatusReporter::new();
        reporter.register("ten_minute_refresher");

        assert!(!reporter.snapshot("ten_minute_refresher").unwrap().initialized);

        reporter.mark_initialized("ten_minute_refresher");
        reporter.mark_refreshing("ten_minute_refresher", true);
        reporter.set_record_count("ten_minute_refresher", 42);
        reporter.mark_refreshing("ten_minute_refresher", false);

        let status = reporter.snapshot("ten_minute_refresher").unwrap();
        assert!(status.initialized);
        assert!(!status.refreshing);
        assert_eq!(status.record_count, 42);
        assert!(status.last_refresh_time.is_some());
    }

    #[test]
    fn unknown_component_returns_none() {
        let reporter = StatusReporter::new();
        assert!(reporter.snapshot("nope").is_none());
    }
}
