//! Folds child conditions into one parent condition while keeping transition times stable.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

use crate::conditions::{self, ConditionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// Child `True` is success.
    Positive,
    /// Child `True` is a failure (e.g. a `Failed` condition).
    Negative,
}

pub struct ConditionManager {
    top_level_type: String,
    previous: Vec<Condition>,
    conditions: Vec<Condition>,
    status: ConditionStatus,
    reason: Option<(String, String)>,
    changed: bool,
    now: DateTime<Utc>,
}

impl ConditionManager {
    pub fn new(top_level_type: &str, previous: &[Condition]) -> Self {
        Self::with_clock(top_level_type, previous, Utc::now())
    }

    pub fn with_clock(top_level_type: &str, previous: &[Condition], now: DateTime<Utc>) -> Self {
        Self {
            top_level_type: top_level_type.to_string(),
            previous: previous.to_vec(),
            conditions: Vec::new(),
            status: ConditionStatus::True,
            reason: None,
            changed: false,
            now,
        }
    }

    pub fn add(&mut self, mut condition: Condition, polarity: Polarity) {
        let status = ConditionStatus::of(&condition);
        let violates = matches!(
            (status, polarity),
            (ConditionStatus::False, Polarity::Positive) | (ConditionStatus::True, Polarity::Negative)
        );
        if violates {
            self.status = ConditionStatus::False;
            self.reason = Some((condition.reason.clone(), condition.message.clone()));
        } else if status == ConditionStatus::Unknown && self.status != ConditionStatus::False {
            self.status = ConditionStatus::Unknown;
            self.reason = Some((condition.reason.clone(), condition.message.clone()));
        }

        match self.previous.iter().find(|p| p.type_ == condition.type_) {
            Some(prev) if conditions::same_state(prev, &condition) => {
                condition.last_transition_time = prev.last_transition_time.clone();
            }
            _ => {
                condition.last_transition_time = Time(self.now);
                self.changed = true;
            }
        }
        self.conditions.push(condition);
    }

    pub fn add_positive(&mut self, condition: Condition) {
        self.add(condition, Polarity::Positive)
    }

    pub fn add_negative(&mut self, condition: Condition) {
        self.add(condition, Polarity::Negative)
    }

    pub fn is_successful(&self) -> bool {
        self.status != ConditionStatus::False
    }

    /// Append the parent condition and return every condition plus whether anything transitioned.
    pub fn finalize(mut self) -> (Vec<Condition>, bool) {
        if self.conditions.is_empty() {
            let parent = Condition {
                type_: self.top_level_type.clone(),
                status: ConditionStatus::Unknown.as_str().to_string(),
                reason: conditions::UNKNOWN.to_string(),
                message: String::new(),
                last_transition_time: Time(self.now),
                observed_generation: None,
            };
            return (vec![parent], true);
        }
        let parent = match self.status {
            ConditionStatus::True => conditions::condition(&self.top_level_type, ConditionStatus::True, conditions::READY_REASON, ""),
            status => {
                let (reason, message) = self.reason.clone().unwrap_or_else(|| (conditions::UNKNOWN.to_string(), String::new()));
                conditions::condition(&self.top_level_type, status, &reason, message)
            }
        };
        // parent is computed from children only; adding it must not alter the fold
        let status = self.status;
        self.add_positive(parent);
        self.status = status;
        (self.conditions, self.changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conditions::condition;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
    }

    #[test]
    fn all_positive_children_roll_up_ready() {
        let mut m = ConditionManager::with_clock("Ready", &[], t(100));
        m.add_positive(condition("A", ConditionStatus::True, "Fine", ""));
        m.add_negative(condition("B", ConditionStatus::False, "NotBroken", ""));
        let (conds, changed) = m.finalize();
        assert!(changed);
        let ready = conditions::find(&conds, "Ready").unwrap();
        assert_eq!(ready.status, "True");
        assert_eq!(ready.reason, "Ready");
        assert_eq!(conds.last().unwrap().type_, "Ready");
    }

    #[test]
    fn false_adopts_last_violating_child() {
        let mut m = ConditionManager::with_clock("Ready", &[], t(100));
        m.add_positive(condition("A", ConditionStatus::False, "First", "one"));
        m.add_positive(condition("B", ConditionStatus::Unknown, "Waiting", "w"));
        m.add_negative(condition("C", ConditionStatus::True, "Second", "two"));
        let (conds, _) = m.finalize();
        let ready = conditions::find(&conds, "Ready").unwrap();
        assert_eq!((ready.status.as_str(), ready.reason.as_str(), ready.message.as_str()), ("False", "Second", "two"));
    }

    #[test]
    fn unknown_without_violation() {
        let mut m = ConditionManager::with_clock("Ready", &[], t(100));
        m.add_positive(condition("A", ConditionStatus::True, "Fine", ""));
        m.add_positive(condition("B", ConditionStatus::Unknown, "MissingValueAtPath", "waiting"));
        assert!(m.is_successful());
        let (conds, _) = m.finalize();
        let ready = conditions::find(&conds, "Ready").unwrap();
        assert_eq!((ready.status.as_str(), ready.reason.as_str()), ("Unknown", "MissingValueAtPath"));
    }

    #[test]
    fn no_children_is_unknown_and_changed() {
        let m = ConditionManager::with_clock("Ready", &[], t(100));
        let (conds, changed) = m.finalize();
        assert!(changed);
        assert_eq!(conds.len(), 1);
        assert_eq!((conds[0].status.as_str(), conds[0].reason.as_str()), ("Unknown", "Unknown"));
    }

    #[test]
    fn transition_time_kept_for_unchanged_rows() {
        let mut first = ConditionManager::with_clock("Ready", &[], t(100));
        first.add_positive(condition("A", ConditionStatus::True, "Fine", ""));
        let (prev, _) = first.finalize();

        let mut second = ConditionManager::with_clock("Ready", &prev, t(500));
        second.add_positive(condition("A", ConditionStatus::True, "Fine", ""));
        let (conds, changed) = second.finalize();
        assert!(!changed);
        for c in &conds {
            assert_eq!(c.last_transition_time, Time(t(100)));
        }

        let mut third = ConditionManager::with_clock("Ready", &conds, t(900));
        third.add_positive(condition("A", ConditionStatus::False, "Broken", "x"));
        let (conds, changed) = third.finalize();
        assert!(changed);
        assert_eq!(conditions::find(&conds, "A").unwrap().last_transition_time, Time(t(900)));
        assert_eq!(conditions::find(&conds, "Ready").unwrap().last_transition_time, Time(t(900)));
    }

    #[test]
    fn one_parent_per_finalize() {
        let mut m = ConditionManager::with_clock("Ready", &[], t(1));
        m.add_positive(condition("A", ConditionStatus::True, "Fine", ""));
        let (conds, _) = m.finalize();
        assert_eq!(conds.iter().filter(|c| c.type_ == "Ready").count(), 1);
    }
}
