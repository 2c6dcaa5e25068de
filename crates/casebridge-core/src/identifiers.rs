//! Source-id → target-id mapping tables and container canonicalization.
//!
//! [`IdentifierMaps`] holds one table per [`EntityKind`]. It lives for one
//! job run only: on retry it is rebuilt from scratch, because records that
//! already exist in the target are found again by natural key.
//!
//! [`RepositoryCanonicalizer`] picks one representative repository per
//! source project so that cases and folders from duplicate snapshots fold
//! into a single target repository instead of being imported once per copy.

use std::collections::HashMap;
use std::fmt;

use crate::models::EntityKind;

/// Why a single row could not be imported.
///
/// Carries the source id, the offending field and its raw value so the
/// warning that gets logged is enough to diagnose the row.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}={raw}: {reason}")]
pub struct RowIssue {
    pub field: &'static str,
    pub raw: String,
    pub reason: String,
}

impl RowIssue {
    pub fn new(field: &'static str, raw: impl fmt::Display, reason: impl Into<String>) -> Self {
        Self {
            field,
            raw: raw.to_string(),
            reason: reason.into(),
        }
    }

    pub fn unresolved(field: &'static str, kind: EntityKind, source_id: i64) -> Self {
        Self::new(
            field,
            source_id,
            format!("no imported {} with source id {}", kind, source_id),
        )
    }
}

/// Per-entity-type `source id → target id` tables.
#[derive(Debug, Clone, Default)]
pub struct IdentifierMaps {
    maps: HashMap<EntityKind, HashMap<i64, i64>>,
}

impl IdentifierMaps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, kind: EntityKind, source_id: i64, target_id: i64) {
        self.maps.entry(kind).or_default().insert(source_id, target_id);
    }

    pub fn get(&self, kind: EntityKind, source_id: i64) -> Option<i64> {
        self.maps.get(&kind).and_then(|m| m.get(&source_id)).copied()
    }

    pub fn contains(&self, kind: EntityKind, source_id: i64) -> bool {
        self.get(kind, source_id).is_some()
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.maps.get(&kind).map(HashMap::len).unwrap_or(0)
    }

    pub fn is_empty(&self, kind: EntityKind) -> bool {
        self.len(kind) == 0
    }

    /// Resolve a required reference; unresolvable means the row is skipped.
    pub fn require(
        &self,
        kind: EntityKind,
        field: &'static str,
        source_id: i64,
    ) -> Result<i64, RowIssue> {
        self.get(kind, source_id)
            .ok_or_else(|| RowIssue::unresolved(field, kind, source_id))
    }

    /// Resolve an optional reference. An id that cannot be resolved is
    /// dropped rather than failing the row.
    pub fn optional(&self, kind: EntityKind, source_id: Option<i64>) -> Option<i64> {
        source_id.and_then(|id| self.get(kind, id))
    }
}

/// A source repository as seen by the canonicalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerCandidate {
    pub source_id: i64,
    pub project_id: i64,
    pub is_master: bool,
    pub is_snapshot: bool,
}

impl ContainerCandidate {
    /// Lower is better: explicit master, then live (non-snapshot), then the rest.
    fn rank(&self) -> u8 {
        if self.is_master {
            0
        } else if !self.is_snapshot {
            1
        } else {
            2
        }
    }
}

/// Chooses one canonical repository per source project.
///
/// Candidates are fed in encounter order; a later candidate only replaces the
/// current choice when it ranks strictly better, so ties keep the first one.
#[derive(Debug, Default)]
pub struct RepositoryCanonicalizer {
    canonical: HashMap<i64, ContainerCandidate>,
    project_of: HashMap<i64, i64>,
}

impl RepositoryCanonicalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, candidate: ContainerCandidate) {
        self.project_of
            .insert(candidate.source_id, candidate.project_id);
        match self.canonical.get(&candidate.project_id) {
            Some(current) if current.rank() <= candidate.rank() => {}
            _ => {
                self.canonical.insert(candidate.project_id, candidate);
            }
        }
    }

    /// The canonical source repository for any observed repository id.
    /// Unknown ids are returned unchanged.
    pub fn canonical_for(&self, source_repo_id: i64) -> i64 {
        self.project_of
            .get(&source_repo_id)
            .and_then(|project| self.canonical.get(project))
            .map(|c| c.source_id)
            .unwrap_or(source_repo_id)
    }

    pub fn canonical_for_project(&self, source_project_id: i64) -> Option<i64> {
        self.canonical.get(&source_project_id).map(|c| c.source_id)
    }

    pub fn is_canonical(&self, source_repo_id: i64) -> bool {
        self.canonical_for(source_repo_id) == source_repo_id
    }

    /// Number of observed repositories that were folded into another one.
    pub fn duplicate_count(&self) -> usize {
        self.project_of.len() - self.canonical.len()
    }

    pub fn project_count(&self) -> usize {
        self.canonical.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(id: i64, project: i64, master: bool, snapshot: bool) -> ContainerCandidate {
        ContainerCandidate {
            source_id: id,
            project_id: project,
            is_master: master,
            is_snapshot: snapshot,
        }
    }

    #[test]
    fn require_reports_field_and_raw_value() {
        let mut maps = IdentifierMaps::new();
        maps.insert(EntityKind::Project, 1, 100);
        assert_eq!(maps.require(EntityKind::Project, "project_id", 1), Ok(100));
        let issue = maps
            .require(EntityKind::Project, "project_id", 2)
            .unwrap_err();
        assert_eq!(issue.field, "project_id");
        assert_eq!(issue.raw, "2");
        assert_eq!(maps.optional(EntityKind::Project, Some(2)), None);
        assert_eq!(maps.optional(EntityKind::Project, Some(1)), Some(100));
    }

    #[test]
    fn master_flag_wins_regardless_of_order() {
        let mut c = RepositoryCanonicalizer::new();
        c.observe(repo(1, 10, false, false));
        c.observe(repo(2, 10, false, true));
        c.observe(repo(3, 10, true, true));
        assert_eq!(c.canonical_for_project(10), Some(3));
        assert_eq!(c.canonical_for(1), 3);
        assert_eq!(c.canonical_for(2), 3);
    }

    #[test]
    fn non_snapshot_beats_snapshot_then_first_encountered() {
        let mut c = RepositoryCanonicalizer::new();
        c.observe(repo(5, 1, false, true));
        c.observe(repo(6, 1, false, false));
        c.observe(repo(7, 1, false, false));
        assert_eq!(c.canonical_for_project(1), Some(6));

        let mut c = RepositoryCanonicalizer::new();
        c.observe(repo(8, 2, false, true));
        c.observe(repo(9, 2, false, true));
        assert_eq!(c.canonical_for_project(2), Some(8));
    }

    #[test]
    fn exactly_one_canonical_per_project() {
        let mut c = RepositoryCanonicalizer::new();
        let mut id = 0;
        for project in 1..=20_i64 {
            for copy in 0..(project % 4 + 1) {
                id += 1;
                c.observe(repo(id, project, copy == 2, copy % 2 == 1));
            }
        }
        for project in 1..=20_i64 {
            let canonical = c.canonical_for_project(project).unwrap();
            assert!(c.is_canonical(canonical));
        }
        let canonical_total = (1..=id).filter(|r| c.is_canonical(*r)).count();
        assert_eq!(canonical_total, 20);
        assert_eq!(c.duplicate_count(), id as usize - 20);
        assert_eq!(c.canonical_for(9999), 9999);
    }
}
