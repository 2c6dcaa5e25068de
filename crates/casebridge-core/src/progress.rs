//! Per-entity progress counters for a running import.

use std::collections::BTreeMap;
use tracing::warn;

use crate::models::{EntityKind, EntityProgress};

/// Tracks `{total, created, mapped, skipped}` for each entity type and keeps
/// `created + mapped <= total` true after every update.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    entities: BTreeMap<EntityKind, EntityProgress>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore counters persisted by an earlier status write.
    pub fn from_map(entities: BTreeMap<EntityKind, EntityProgress>) -> Self {
        Self { entities }
    }

    /// Set the planned total for an entity type, resetting its counters.
    pub fn plan(&mut self, kind: EntityKind, total: u64) {
        self.entities.insert(
            kind,
            EntityProgress {
                total,
                ..EntityProgress::default()
            },
        );
    }

    /// Record counters computed elsewhere (the reference resolver reports
    /// whole-type summaries rather than per-row events).
    pub fn set(&mut self, kind: EntityKind, mut progress: EntityProgress) {
        progress.total = progress.total.max(progress.processed());
        self.entities.insert(kind, progress);
    }

    pub fn is_planned(&self, kind: EntityKind) -> bool {
        self.entities.contains_key(&kind)
    }

    pub fn created(&mut self, kind: EntityKind) {
        self.make_room(kind).created += 1;
    }

    pub fn mapped(&mut self, kind: EntityKind) {
        self.make_room(kind).mapped += 1;
    }

    /// A row beyond the plan still counts; the plan grows to cover it.
    fn make_room(&mut self, kind: EntityKind) -> &mut EntityProgress {
        let p = self.entities.entry(kind).or_default();
        if p.processed() >= p.total {
            warn!(entity = %kind, total = p.total, "more rows processed than planned");
            p.total += 1;
        }
        p
    }

    /// A skipped row leaves the plan.
    pub fn skipped(&mut self, kind: EntityKind) {
        let p = self.entities.entry(kind).or_default();
        if p.total > p.processed() {
            p.total -= 1;
        }
        p.skipped += 1;
    }

    pub fn get(&self, kind: EntityKind) -> EntityProgress {
        self.entities.get(&kind).copied().unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<EntityKind, EntityProgress> {
        self.entities.clone()
    }

    pub fn total(&self) -> u64 {
        self.entities.values().map(|p| p.total).sum()
    }

    pub fn processed(&self) -> u64 {
        self.entities.values().map(EntityProgress::processed).sum()
    }

    pub fn skipped_total(&self) -> u64 {
        self.entities.values().map(|p| p.skipped).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_beyond_the_plan_grow_it() {
        let mut t = ProgressTracker::new();
        t.plan(EntityKind::Project, 2);
        t.created(EntityKind::Project);
        t.mapped(EntityKind::Project);
        t.created(EntityKind::Project);
        let p = t.get(EntityKind::Project);
        assert_eq!(p.created, 2);
        assert_eq!(p.mapped, 1);
        assert_eq!(p.total, 3);
        assert!(p.processed() <= p.total);

        assert!(!t.is_planned(EntityKind::Issue));
        t.created(EntityKind::Issue);
        assert_eq!(t.get(EntityKind::Issue).total, 1);
    }

    #[test]
    fn skip_shrinks_plan() {
        let mut t = ProgressTracker::new();
        t.plan(EntityKind::RepositoryCase, 100);
        for i in 0..100 {
            if i % 10 == 0 {
                t.skipped(EntityKind::RepositoryCase);
            } else {
                t.created(EntityKind::RepositoryCase);
            }
        }
        let p = t.get(EntityKind::RepositoryCase);
        assert_eq!(p.total, 90);
        assert_eq!(p.created, 90);
        assert_eq!(p.skipped, 10);
        assert_eq!(t.total(), 90);
        assert_eq!(t.processed(), 90);
        assert_eq!(t.skipped_total(), 10);
    }

    #[test]
    fn processed_is_monotonic() {
        let mut t = ProgressTracker::new();
        t.plan(EntityKind::TestRun, 50);
        let mut last = 0;
        for i in 0..60 {
            match i % 3 {
                0 => t.created(EntityKind::TestRun),
                1 => t.mapped(EntityKind::TestRun),
                _ => t.skipped(EntityKind::TestRun),
            }
            let p = t.get(EntityKind::TestRun);
            assert!(p.processed() >= last);
            assert!(p.processed() <= p.total);
            last = p.processed();
        }
    }
}
