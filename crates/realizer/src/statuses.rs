//! Per-resource status rows, seeded from the previous owner status.

use chrono::{DateTime, Utc};
use carto_core::condition_manager::ConditionManager;
use carto_core::conditions::{self, same_state};
use carto_core::status::{RealizedResource, ResourceStatus};
use carto_core::Condition;

use crate::errors::RealizerError;

#[derive(Debug, Clone)]
struct Row {
    name: String,
    previous: Option<ResourceStatus>,
    current: Option<ResourceStatus>,
    changed_types: Vec<String>,
}

/// Previous and current status of every resource an owner has realized.
///
/// Rows keep first-seen order: previous rows first, new resources appended.
#[derive(Debug, Clone)]
pub struct ResourceStatuses {
    rows: Vec<Row>,
    now: Option<DateTime<Utc>>,
}

impl ResourceStatuses {
    pub fn new(previous: &[ResourceStatus]) -> Self {
        let rows = previous
            .iter()
            .map(|p| Row { name: p.name().to_string(), previous: Some(p.clone()), current: None, changed_types: Vec::new() })
            .collect();
        Self { rows, now: None }
    }

    /// Fix the clock used for condition transition times.
    pub fn with_clock(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    pub fn previous(&self, name: &str) -> Option<&ResourceStatus> {
        self.rows.iter().find(|r| r.name == name).and_then(|r| r.previous.as_ref())
    }

    pub fn current_of(&self, name: &str) -> Option<&ResourceStatus> {
        self.rows.iter().find(|r| r.name == name).and_then(|r| r.current.as_ref())
    }

    /// Record the outcome of realizing one resource.
    ///
    /// `extra` conditions (e.g. `Healthy`) are folded in as positive children
    /// next to `ResourceSubmitted`.
    pub fn add(&mut self, realized: RealizedResource, err: Option<&RealizerError>, extra: Vec<Condition>) {
        let name = realized.name.clone();
        let idx = match self.rows.iter().position(|r| r.name == name) {
            Some(i) => i,
            None => {
                self.rows.push(Row { name: name.clone(), previous: None, current: None, changed_types: Vec::new() });
                self.rows.len() - 1
            }
        };
        let prev_conditions = self.rows[idx].previous.as_ref().map(|p| p.conditions.clone()).unwrap_or_default();

        let mut mgr = match self.now {
            Some(now) => ConditionManager::with_clock(conditions::READY, &prev_conditions, now),
            None => ConditionManager::new(conditions::READY, &prev_conditions),
        };
        mgr.add_positive(match err {
            Some(e) => e.condition(conditions::RESOURCE_SUBMITTED),
            None => conditions::resource_submitted(),
        });
        for c in extra {
            mgr.add_positive(c);
        }
        let (conds, _) = mgr.finalize();

        let row = &mut self.rows[idx];
        row.changed_types = conds
            .iter()
            .filter(|c| match conditions::find(&prev_conditions, &c.type_) {
                Some(p) => !same_state(p, c),
                None => true,
            })
            .map(|c| c.type_.clone())
            .collect();
        row.current = Some(ResourceStatus { realized, conditions: conds });
    }

    /// Whether the current rows differ from the previous ones.
    pub fn is_changed(&self) -> bool {
        self.rows.iter().any(|r| match (&r.previous, &r.current) {
            (Some(p), Some(c)) => !r.changed_types.is_empty() || p.realized != c.realized,
            _ => true,
        })
    }

    /// Rows recorded in this pass; resources that vanished from the blueprint drop out.
    pub fn current(&self) -> Vec<ResourceStatus> {
        self.rows.iter().filter_map(|r| r.current.clone()).collect()
    }

    /// Previous rows with no current counterpart.
    pub fn removed(&self) -> Vec<&ResourceStatus> {
        self.rows.iter().filter(|r| r.current.is_none()).filter_map(|r| r.previous.as_ref()).collect()
    }

    /// Condition types of `name` whose state transitioned in this pass.
    pub fn changed_condition_types(&self, name: &str) -> &[String] {
        self.rows.iter().find(|r| r.name == name).map(|r| r.changed_types.as_slice()).unwrap_or_default()
    }
}
