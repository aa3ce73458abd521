//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - An in-memory origin with scripted changes and failure injection
//! - A recording alerter and a recording action sink
//! - A two-base mapping fixture and engine builder

#![allow(dead_code)]

pub mod mock_origin;

pub use mock_origin::*;

use mirror_sync::origin::BoxFuture;
use mirror_sync::queue::ActionSink;
use mirror_sync::{
    AlertLevel, Alerter, ApplyOutcome, ChangeAction, MappingRegistry, MirrorConfig, MirrorError, MirrorStore,
    MirrorSyncEngine, SchemaReconciler, TableMapping,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const BASE_A: &str = "appA";
pub const BASE_B: &str = "appB";
pub const COURSES: &str = "tblCourses";
pub const STUDENTS: &str = "tblStudents";
pub const EVENTS: &str = "tblEvents";

/// Alerter that keeps every alert for assertions.
#[derive(Debug, Default)]
pub struct RecordingAlerter {
    alerts: Mutex<Vec<(AlertLevel, String)>>,
}

impl RecordingAlerter {
    pub fn all(&self) -> Vec<(AlertLevel, String)> {
        self.alerts.lock().unwrap().clone()
    }

    pub fn count(&self, level: AlertLevel) -> usize {
        self.alerts.lock().unwrap().iter().filter(|(l, _)| *l == level).count()
    }

    pub fn contains(&self, level: AlertLevel, needle: &str) -> bool {
        self.alerts
            .lock()
            .unwrap()
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }
}

impl Alerter for RecordingAlerter {
    fn alert(&self, level: AlertLevel, message: &str) {
        self.alerts.lock().unwrap().push((level, message.to_string()));
    }
}

/// Action sink that records every apply and fails scripted records.
#[derive(Debug, Default)]
pub struct RecordingSink {
    applied: Mutex<Vec<ChangeAction>>,
    attempts: Mutex<Vec<String>>,
    /// Record id to remaining failures.
    failures: Mutex<HashMap<String, usize>>,
}

impl RecordingSink {
    pub fn fail(&self, record_id: &str, times: usize) {
        self.failures.lock().unwrap().insert(record_id.to_string(), times);
    }

    /// Successfully applied actions, in order.
    pub fn applied(&self) -> Vec<ChangeAction> {
        self.applied.lock().unwrap().clone()
    }

    /// Record ids of every attempt, failed ones included.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

impl ActionSink for RecordingSink {
    fn apply<'a>(&'a self, action: &'a ChangeAction) -> BoxFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            self.attempts.lock().unwrap().push(action.record_id.clone());
            if let Some(remaining) = self.failures.lock().unwrap().get_mut(&action.record_id) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(MirrorError::origin("get_record", Some(503), "injected failure"));
                }
            }
            self.applied.lock().unwrap().push(action.clone());
            Ok(if action.is_delete {
                ApplyOutcome::Deleted
            } else {
                ApplyOutcome::Upserted
            })
        })
    }
}

/// Courses and students on base A, events on base B.
pub fn registry() -> MappingRegistry {
    MappingRegistry::new(vec![
        TableMapping::new("courses", BASE_A, COURSES)
            .column("name", "fldCourseName")
            .column("credits", "fldCredits"),
        TableMapping::new("students", BASE_A, STUDENTS).column("name", "fldStudentName"),
        TableMapping::new("events", BASE_B, EVENTS).column("kind", "fldKind"),
    ])
    .unwrap()
}

/// Origin whose schema matches [`registry`].
pub fn origin() -> Arc<InMemoryOrigin> {
    let origin = InMemoryOrigin::new();
    origin.define_table(BASE_A, COURSES, &["fldCourseName", "fldCredits"]);
    origin.define_table(BASE_A, STUDENTS, &["fldStudentName"]);
    origin.define_table(BASE_B, EVENTS, &["fldKind"]);
    Arc::new(origin)
}

pub type TestEngine = MirrorSyncEngine<Arc<InMemoryOrigin>>;

/// Engine over `origin` with an in-memory store and reconciled schema.
///
/// Not started: tests drive `tick()` and `perform_full_sync()` directly.
pub async fn engine_with(
    config: MirrorConfig,
    origin: Arc<InMemoryOrigin>,
) -> (TestEngine, Arc<RecordingAlerter>) {
    let alerter = Arc::new(RecordingAlerter::default());
    let store = MirrorStore::in_memory().await.unwrap();
    let engine = MirrorSyncEngine::with_store(config, registry(), origin, alerter.clone(), store);
    engine.schema_reconciler().ensure_schema_up_to_date().await.unwrap();
    (engine, alerter)
}

pub async fn engine(origin: Arc<InMemoryOrigin>) -> (TestEngine, Arc<RecordingAlerter>) {
    engine_with(MirrorConfig::for_testing(), origin).await
}

/// Mirror column value, `None` when the row or value is missing.
pub async fn mirror_value(engine: &TestEngine, table: &str, record_id: &str, column: &str) -> Option<String> {
    let mapping = engine.registry().by_mirror_table(table).unwrap();
    engine
        .store()
        .fetch_row(mapping, record_id)
        .await
        .unwrap()
        .and_then(|row| row.get(column).cloned().flatten())
}

pub async fn mirror_has_row(engine: &TestEngine, table: &str, record_id: &str) -> bool {
    let mapping = engine.registry().by_mirror_table(table).unwrap();
    engine.store().fetch_row(mapping, record_id).await.unwrap().is_some()
}
