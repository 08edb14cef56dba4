//! Time-ordered fire queue.
//!
//! Entries are ordered by fire time, ties broken by insertion order. Each
//! job has at most one entry; inserting a job again replaces its entry.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use tracing::warn;

use super::cron::Schedule;
use crate::model::JobId;

type Key = (DateTime<Utc>, u64);

#[derive(Debug, Clone)]
struct Entry {
    key: Key,
    schedule: Schedule,
}

/// A job whose fire time has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Due {
    pub job_id: JobId,
    pub fire_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct FireQueue {
    order: BTreeMap<Key, JobId>,
    entries: HashMap<JobId, Entry>,
    seq: u64,
}

impl FireQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue `job_id` to fire at `fire_at`, replacing any existing entry.
    pub fn insert(&mut self, job_id: JobId, schedule: Schedule, fire_at: DateTime<Utc>) {
        self.remove(job_id);
        self.seq += 1;
        let key = (fire_at, self.seq);
        self.order.insert(key, job_id);
        self.entries.insert(job_id, Entry { key, schedule });
    }

    pub fn remove(&mut self, job_id: JobId) -> bool {
        match self.entries.remove(&job_id) {
            Some(entry) => {
                self.order.remove(&entry.key);
                true
            }
            None => false,
        }
    }

    /// Earliest fire time in the queue.
    pub fn peek(&self) -> Option<DateTime<Utc>> {
        self.order.keys().next().map(|(at, _)| *at)
    }

    /// Remove every entry due at or before `now`, in fire order, and re-arm
    /// each at its schedule's next time after `now`. Missed fires collapse
    /// into the single entry returned here.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<Due> {
        let mut due = Vec::new();
        while let Some((&key, &job_id)) = self.order.first_key_value() {
            if key.0 > now {
                break;
            }
            self.order.remove(&key);
            due.push(Due {
                job_id,
                fire_at: key.0,
            });
        }

        for d in &due {
            let Some(entry) = self.entries.remove(&d.job_id) else {
                continue;
            };
            match entry.schedule.next_after(now) {
                Ok(next) => self.insert(d.job_id, entry.schedule, next),
                Err(e) => warn!(job_id = %d.job_id, error = %e, "Schedule exhausted; job unscheduled"),
            }
        }
        due
    }

    /// Every entry in fire order.
    pub fn snapshot(&self) -> Vec<(JobId, DateTime<Utc>)> {
        self.order.iter().map(|((at, _), id)| (*id, *at)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn t(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn fire_of(q: &FireQueue, job_id: JobId) -> Option<DateTime<Utc>> {
        q.entries.get(&job_id).map(|e| e.key.0)
    }

    fn every_minute() -> Schedule {
        Schedule::parse("* * * * *").unwrap()
    }

    #[test]
    fn test_orders_by_time_then_insertion() {
        let mut q = FireQueue::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let at = t("2025-01-01T00:01:00Z");
        q.insert(a, every_minute(), at + Duration::minutes(1));
        q.insert(b, every_minute(), at);
        q.insert(c, every_minute(), at);

        let ids: Vec<JobId> = q.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![b, c, a]);
        assert_eq!(q.peek(), Some(at));
    }

    #[test]
    fn test_insert_replaces_existing_entry() {
        let mut q = FireQueue::new();
        let id = Uuid::new_v4();
        q.insert(id, every_minute(), t("2025-01-01T00:01:00Z"));
        q.insert(id, every_minute(), t("2025-01-01T00:05:00Z"));
        assert_eq!(q.len(), 1);
        assert_eq!(fire_of(&q, id), Some(t("2025-01-01T00:05:00Z")));
        assert!(q.remove(id));
        assert!(!q.remove(id));
        assert!(q.is_empty());
        assert_eq!(q.peek(), None);
    }

    #[test]
    fn test_pop_due_rearms_after_now() {
        let mut q = FireQueue::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        q.insert(a, every_minute(), t("2025-01-01T00:01:00Z"));
        q.insert(b, every_minute(), t("2025-01-01T00:10:00Z"));

        let due = q.pop_due(t("2025-01-01T00:01:00Z"));
        assert_eq!(
            due,
            vec![Due {
                job_id: a,
                fire_at: t("2025-01-01T00:01:00Z")
            }]
        );
        assert_eq!(fire_of(&q, a), Some(t("2025-01-01T00:02:00Z")));
        assert_eq!(fire_of(&q, b), Some(t("2025-01-01T00:10:00Z")));
    }

    #[test]
    fn test_pop_due_collapses_missed_fires() {
        let mut q = FireQueue::new();
        let id = Uuid::new_v4();
        q.insert(id, every_minute(), t("2025-01-01T00:01:00Z"));

        // An hour late: one fire, then the next minute after now.
        let due = q.pop_due(t("2025-01-01T01:00:30Z"));
        assert_eq!(due.len(), 1);
        assert_eq!(fire_of(&q, id), Some(t("2025-01-01T01:01:00Z")));
        assert!(q.pop_due(t("2025-01-01T01:00:59Z")).is_empty());
    }
}
