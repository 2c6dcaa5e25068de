//! Mapping configuration resolver for reference entity types.
//!
//! Users, roles, groups, statuses, workflows, milestone types,
//! configurations and tags are not imported row by row. The operator (or the
//! seeding pass after analysis) decides per source id whether to `create` a
//! new target record or `map` onto an existing one, and the resolver turns
//! those decisions into target ids.
//!
//! Every entity type follows the same steps, implemented once in
//! [`resolve_entity`] over the [`ReferenceEntity`] strategy trait:
//!
//! - `map`: the target must exist; its canonical fields are copied back.
//! - `create`: fields are validated; a natural-key hit turns the decision
//!   into a `map`; otherwise the record is created and its id and server
//!   defaults are written back.
//!
//! All reference types resolve inside one transaction. A configuration
//! error in any of them rolls every type back and leaves the decision table
//! untouched.

use async_trait::async_trait;
use casebridge_core::identifiers::IdentifierMaps;
use casebridge_core::mapping::{
    seed_create, Action, Decision, Decisions, MappingConfiguration, MilestoneTypeFields,
    NameFields, RoleFields, StatusFields, UserFields, WorkflowFields,
};
use casebridge_core::models::{EntityKind, EntityProgress};
use casebridge_core::records::{
    datasets, MilestoneTypeRecord, NamedRecord, StatusRecord, UserRecord, WorkflowRecord,
};
use casebridge_core::staging::{load_all, StagingStore};
use serde::de::DeserializeOwned;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::error::{ImportError, ImportResult};

/// Strategy for one reference entity type.
#[async_trait]
pub trait ReferenceEntity: Send + Sync {
    type Fields: Clone + Send + Sync;

    fn kind(&self) -> EntityKind;

    fn decisions<'a>(&self, config: &'a mut MappingConfiguration)
        -> &'a mut Decisions<Self::Fields>;

    /// Canonical fields of an existing target record.
    async fn find_by_id(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
    ) -> sqlx::Result<Option<Self::Fields>>;

    async fn find_by_natural_key(
        &self,
        conn: &mut SqliteConnection,
        fields: &Self::Fields,
    ) -> sqlx::Result<Option<(i64, Self::Fields)>>;

    /// Reason the fields can't be used to create a record, if any.
    fn validate(&self, fields: &Self::Fields) -> Result<(), String>;

    /// Insert a record and return its id with server defaults filled in.
    async fn create(
        &self,
        conn: &mut SqliteConnection,
        fields: &Self::Fields,
        maps: &IdentifierMaps,
    ) -> sqlx::Result<(i64, Self::Fields)>;
}

/// `{total, created, mapped}` for one entity type.
pub type ResolveSummary = EntityProgress;

/// Resolve every decision of one entity type on an open transaction.
///
/// Decisions and identifier maps are updated in place as records are
/// resolved; callers that must not observe partial results pass copies.
pub async fn resolve_entity<E: ReferenceEntity>(
    conn: &mut SqliteConnection,
    entity: &E,
    config: &mut MappingConfiguration,
    maps: &mut IdentifierMaps,
) -> ImportResult<ResolveSummary> {
    let kind = entity.kind();
    let mut decisions = entity.decisions(config).clone();
    let mut summary = ResolveSummary {
        total: decisions.len() as u64,
        ..Default::default()
    };

    for (key, decision) in decisions.iter_mut() {
        let source_id: i64 = key.parse().map_err(|_| {
            ImportError::config(format!("{}: source id '{}' is not an integer", kind, key))
        })?;

        match decision.action {
            Action::Map => {
                let target = decision.mapped_to.ok_or_else(|| {
                    ImportError::config(format!(
                        "{} {}: action 'map' requires mappedTo",
                        kind, source_id
                    ))
                })?;
                let canonical = entity.find_by_id(conn, target).await?.ok_or_else(|| {
                    ImportError::config(format!(
                        "{} {}: mapped target {} does not exist",
                        kind, source_id, target
                    ))
                })?;
                *decision = Decision::map(target, canonical);
                summary.mapped += 1;
                maps.insert(kind, source_id, target);
            }
            Action::Create => {
                entity.validate(&decision.fields).map_err(|reason| {
                    ImportError::config(format!("{} {}: {}", kind, source_id, reason))
                })?;
                let (target, canonical) =
                    match entity.find_by_natural_key(conn, &decision.fields).await? {
                        Some(existing) => {
                            summary.mapped += 1;
                            existing
                        }
                        None => {
                            summary.created += 1;
                            entity.create(conn, &decision.fields, maps).await?
                        }
                    };
                *decision = Decision::map(target, canonical);
                maps.insert(kind, source_id, target);
            }
        }
    }

    *entity.decisions(config) = decisions;
    info!(entity = %kind, total = summary.total, created = summary.created, mapped = summary.mapped, "reference entities resolved");
    Ok(summary)
}

/// Resolve all reference types in dependency order (roles before users).
///
/// Every type resolves inside one transaction. A configuration error in
/// any type rolls back all of them, and `config` and `maps` are only
/// updated once the transaction commits.
pub async fn resolve_all(
    pool: &SqlitePool,
    config: &mut MappingConfiguration,
    maps: &mut IdentifierMaps,
) -> ImportResult<BTreeMap<EntityKind, ResolveSummary>> {
    let mut staged = config.clone();
    let mut staged_maps = maps.clone();
    let mut tx = pool.begin().await?;
    let c = &mut *tx;
    let (cfg, m) = (&mut staged, &mut staged_maps);

    let mut out = BTreeMap::new();
    out.insert(EntityKind::Role, resolve_entity(c, &Roles, cfg, m).await?);
    out.insert(EntityKind::User, resolve_entity(c, &Users, cfg, m).await?);
    out.insert(EntityKind::Group, resolve_entity(c, &NamedEntity::GROUPS, cfg, m).await?);
    out.insert(EntityKind::Status, resolve_entity(c, &Statuses, cfg, m).await?);
    out.insert(EntityKind::Workflow, resolve_entity(c, &Workflows, cfg, m).await?);
    out.insert(EntityKind::MilestoneType, resolve_entity(c, &MilestoneTypes, cfg, m).await?);
    out.insert(
        EntityKind::Configuration,
        resolve_entity(c, &NamedEntity::CONFIGURATIONS, cfg, m).await?,
    );
    out.insert(EntityKind::Tag, resolve_entity(c, &NamedEntity::TAGS, cfg, m).await?);
    tx.commit().await?;

    *config = staged;
    *maps = staged_maps;
    Ok(out)
}

fn require_name(name: &Option<String>) -> Result<(), String> {
    match name.as_deref().map(str::trim) {
        Some(n) if !n.is_empty() => Ok(()),
        _ => Err("missing required field 'name'".to_string()),
    }
}

fn trimmed(value: &Option<String>) -> String {
    value.as_deref().map(str::trim).unwrap_or_default().to_string()
}

// ── Roles ────────────────────────────────────────────────────────────────

pub struct Roles;

#[async_trait]
impl ReferenceEntity for Roles {
    type Fields = RoleFields;

    fn kind(&self) -> EntityKind {
        EntityKind::Role
    }

    fn decisions<'a>(&self, c: &'a mut MappingConfiguration) -> &'a mut Decisions<RoleFields> {
        &mut c.roles
    }

    async fn find_by_id(&self, conn: &mut SqliteConnection, id: i64) -> sqlx::Result<Option<RoleFields>> {
        let row = sqlx::query("SELECT name, is_default FROM roles WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.map(|r| RoleFields {
            name: Some(r.get("name")),
            is_default: Some(r.get::<i64, _>("is_default") != 0),
        }))
    }

    async fn find_by_natural_key(
        &self,
        conn: &mut SqliteConnection,
        fields: &RoleFields,
    ) -> sqlx::Result<Option<(i64, RoleFields)>> {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM roles WHERE name = ?")
            .bind(trimmed(&fields.name))
            .fetch_optional(&mut *conn)
            .await?;
        match id {
            Some(id) => Ok(self.find_by_id(conn, id).await?.map(|f| (id, f))),
            None => Ok(None),
        }
    }

    fn validate(&self, fields: &RoleFields) -> Result<(), String> {
        require_name(&fields.name)
    }

    async fn create(
        &self,
        conn: &mut SqliteConnection,
        fields: &RoleFields,
        _maps: &IdentifierMaps,
    ) -> sqlx::Result<(i64, RoleFields)> {
        let is_default = fields.is_default.unwrap_or(false);
        let id = sqlx::query("INSERT INTO roles (name, is_default) VALUES (?, ?)")
            .bind(trimmed(&fields.name))
            .bind(is_default)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
        Ok((
            id,
            RoleFields {
                name: Some(trimmed(&fields.name)),
                is_default: Some(is_default),
            },
        ))
    }
}

// ── Users ────────────────────────────────────────────────────────────────

pub struct Users;

impl Users {
    fn email(fields: &UserFields) -> String {
        trimmed(&fields.email).to_lowercase()
    }
}

#[async_trait]
impl ReferenceEntity for Users {
    type Fields = UserFields;

    fn kind(&self) -> EntityKind {
        EntityKind::User
    }

    fn decisions<'a>(&self, c: &'a mut MappingConfiguration) -> &'a mut Decisions<UserFields> {
        &mut c.users
    }

    async fn find_by_id(&self, conn: &mut SqliteConnection, id: i64) -> sqlx::Result<Option<UserFields>> {
        let row = sqlx::query("SELECT name, email, role_id, is_active FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.map(|r| UserFields {
            name: Some(r.get("name")),
            email: Some(r.get("email")),
            role_id: r.get("role_id"),
            source_role_id: None,
            is_active: Some(r.get::<i64, _>("is_active") != 0),
        }))
    }

    async fn find_by_natural_key(
        &self,
        conn: &mut SqliteConnection,
        fields: &UserFields,
    ) -> sqlx::Result<Option<(i64, UserFields)>> {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM users WHERE email = ?")
            .bind(Self::email(fields))
            .fetch_optional(&mut *conn)
            .await?;
        match id {
            Some(id) => Ok(self.find_by_id(conn, id).await?.map(|f| (id, f))),
            None => Ok(None),
        }
    }

    fn validate(&self, fields: &UserFields) -> Result<(), String> {
        let email = Self::email(fields);
        if email.is_empty() {
            return Err("missing required field 'email'".to_string());
        }
        if !email.contains('@') {
            return Err(format!("'{}' is not an email address", email));
        }
        Ok(())
    }

    async fn create(
        &self,
        conn: &mut SqliteConnection,
        fields: &UserFields,
        maps: &IdentifierMaps,
    ) -> sqlx::Result<(i64, UserFields)> {
        let email = Self::email(fields);
        let name = match trimmed(&fields.name) {
            n if n.is_empty() => email.split('@').next().unwrap_or_default().to_string(),
            n => n,
        };
        let role_id = fields
            .role_id
            .or_else(|| maps.optional(EntityKind::Role, fields.source_role_id));
        let is_active = fields.is_active.unwrap_or(true);
        let id = sqlx::query("INSERT INTO users (name, email, role_id, is_active) VALUES (?, ?, ?, ?)")
            .bind(&name)
            .bind(&email)
            .bind(role_id)
            .bind(is_active)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
        Ok((
            id,
            UserFields {
                name: Some(name),
                email: Some(email),
                role_id,
                source_role_id: None,
                is_active: Some(is_active),
            },
        ))
    }
}

// ── Name-only types: groups, configurations, tags ───────────────────────

pub struct NamedEntity {
    kind: EntityKind,
    table: &'static str,
}

impl NamedEntity {
    pub const GROUPS: NamedEntity = NamedEntity {
        kind: EntityKind::Group,
        table: "user_groups",
    };
    pub const CONFIGURATIONS: NamedEntity = NamedEntity {
        kind: EntityKind::Configuration,
        table: "configurations",
    };
    pub const TAGS: NamedEntity = NamedEntity {
        kind: EntityKind::Tag,
        table: "tags",
    };
}

#[async_trait]
impl ReferenceEntity for NamedEntity {
    type Fields = NameFields;

    fn kind(&self) -> EntityKind {
        self.kind
    }

    fn decisions<'a>(&self, c: &'a mut MappingConfiguration) -> &'a mut Decisions<NameFields> {
        match self.kind {
            EntityKind::Group => &mut c.groups,
            EntityKind::Configuration => &mut c.configurations,
            _ => &mut c.tags,
        }
    }

    async fn find_by_id(&self, conn: &mut SqliteConnection, id: i64) -> sqlx::Result<Option<NameFields>> {
        let name: Option<String> = sqlx::query_scalar(&format!("SELECT name FROM {} WHERE id = ?", self.table))
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(name.map(|n| NameFields { name: Some(n) }))
    }

    async fn find_by_natural_key(
        &self,
        conn: &mut SqliteConnection,
        fields: &NameFields,
    ) -> sqlx::Result<Option<(i64, NameFields)>> {
        let row = sqlx::query(&format!("SELECT id, name FROM {} WHERE name = ?", self.table))
            .bind(trimmed(&fields.name))
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.map(|r| (r.get("id"), NameFields { name: Some(r.get("name")) })))
    }

    fn validate(&self, fields: &NameFields) -> Result<(), String> {
        require_name(&fields.name)
    }

    async fn create(
        &self,
        conn: &mut SqliteConnection,
        fields: &NameFields,
        _maps: &IdentifierMaps,
    ) -> sqlx::Result<(i64, NameFields)> {
        let name = trimmed(&fields.name);
        let id = sqlx::query(&format!("INSERT INTO {} (name) VALUES (?)", self.table))
            .bind(&name)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
        Ok((id, NameFields { name: Some(name) }))
    }
}

// ── Statuses ─────────────────────────────────────────────────────────────

pub struct Statuses;

#[async_trait]
impl ReferenceEntity for Statuses {
    type Fields = StatusFields;

    fn kind(&self) -> EntityKind {
        EntityKind::Status
    }

    fn decisions<'a>(&self, c: &'a mut MappingConfiguration) -> &'a mut Decisions<StatusFields> {
        &mut c.statuses
    }

    async fn find_by_id(&self, conn: &mut SqliteConnection, id: i64) -> sqlx::Result<Option<StatusFields>> {
        let row = sqlx::query(
            "SELECT name, system_name, color, is_success, is_failure, is_completed FROM statuses WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.map(|r| StatusFields {
            name: Some(r.get("name")),
            system_name: Some(r.get("system_name")),
            color: Some(r.get("color")),
            is_success: Some(r.get::<i64, _>("is_success") != 0),
            is_failure: Some(r.get::<i64, _>("is_failure") != 0),
            is_completed: Some(r.get::<i64, _>("is_completed") != 0),
        }))
    }

    async fn find_by_natural_key(
        &self,
        conn: &mut SqliteConnection,
        fields: &StatusFields,
    ) -> sqlx::Result<Option<(i64, StatusFields)>> {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM statuses WHERE name = ?")
            .bind(trimmed(&fields.name))
            .fetch_optional(&mut *conn)
            .await?;
        match id {
            Some(id) => Ok(self.find_by_id(conn, id).await?.map(|f| (id, f))),
            None => Ok(None),
        }
    }

    fn validate(&self, fields: &StatusFields) -> Result<(), String> {
        require_name(&fields.name)?;
        if fields.is_success == Some(true) && fields.is_failure == Some(true) {
            return Err("a status can't be both success and failure".to_string());
        }
        Ok(())
    }

    async fn create(
        &self,
        conn: &mut SqliteConnection,
        fields: &StatusFields,
        _maps: &IdentifierMaps,
    ) -> sqlx::Result<(i64, StatusFields)> {
        let name = trimmed(&fields.name);
        let system_name = match trimmed(&fields.system_name) {
            s if s.is_empty() => name.to_lowercase().replace(char::is_whitespace, "_"),
            s => s,
        };
        let id = sqlx::query(
            r#"
            INSERT INTO statuses (name, system_name, color, is_success, is_failure, is_completed)
            VALUES (?, ?, COALESCE(?, '#9e9e9e'), ?, ?, ?)
            "#,
        )
        .bind(&name)
        .bind(&system_name)
        .bind(fields.color.as_deref())
        .bind(fields.is_success.unwrap_or(false))
        .bind(fields.is_failure.unwrap_or(false))
        .bind(fields.is_completed.unwrap_or(false))
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
        let canonical = self.find_by_id(conn, id).await?.unwrap_or_else(|| fields.clone());
        Ok((id, canonical))
    }
}

// ── Workflows ────────────────────────────────────────────────────────────

pub struct Workflows;

const DEFAULT_WORKFLOW_SCOPE: &str = "CASES";

#[async_trait]
impl ReferenceEntity for Workflows {
    type Fields = WorkflowFields;

    fn kind(&self) -> EntityKind {
        EntityKind::Workflow
    }

    fn decisions<'a>(&self, c: &'a mut MappingConfiguration) -> &'a mut Decisions<WorkflowFields> {
        &mut c.workflows
    }

    async fn find_by_id(&self, conn: &mut SqliteConnection, id: i64) -> sqlx::Result<Option<WorkflowFields>> {
        let row = sqlx::query("SELECT name, scope FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.map(|r| WorkflowFields {
            name: Some(r.get("name")),
            scope: Some(r.get("scope")),
        }))
    }

    async fn find_by_natural_key(
        &self,
        conn: &mut SqliteConnection,
        fields: &WorkflowFields,
    ) -> sqlx::Result<Option<(i64, WorkflowFields)>> {
        let scope = fields.scope.as_deref().unwrap_or(DEFAULT_WORKFLOW_SCOPE);
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM workflows WHERE name = ? AND scope = ?")
            .bind(trimmed(&fields.name))
            .bind(scope)
            .fetch_optional(&mut *conn)
            .await?;
        match id {
            Some(id) => Ok(self.find_by_id(conn, id).await?.map(|f| (id, f))),
            None => Ok(None),
        }
    }

    fn validate(&self, fields: &WorkflowFields) -> Result<(), String> {
        require_name(&fields.name)?;
        match fields.scope.as_deref() {
            None | Some("CASES") | Some("RUNS") | Some("SESSIONS") => Ok(()),
            Some(other) => Err(format!(
                "unknown workflow scope '{}', expected CASES, RUNS or SESSIONS",
                other
            )),
        }
    }

    async fn create(
        &self,
        conn: &mut SqliteConnection,
        fields: &WorkflowFields,
        _maps: &IdentifierMaps,
    ) -> sqlx::Result<(i64, WorkflowFields)> {
        let name = trimmed(&fields.name);
        let scope = fields
            .scope
            .clone()
            .unwrap_or_else(|| DEFAULT_WORKFLOW_SCOPE.to_string());
        let id = sqlx::query("INSERT INTO workflows (name, scope) VALUES (?, ?)")
            .bind(&name)
            .bind(&scope)
            .execute(&mut *conn)
            .await?
            .last_insert_rowid();
        Ok((
            id,
            WorkflowFields {
                name: Some(name),
                scope: Some(scope),
            },
        ))
    }
}

// ── Milestone types ──────────────────────────────────────────────────────

pub struct MilestoneTypes;

#[async_trait]
impl ReferenceEntity for MilestoneTypes {
    type Fields = MilestoneTypeFields;

    fn kind(&self) -> EntityKind {
        EntityKind::MilestoneType
    }

    fn decisions<'a>(
        &self,
        c: &'a mut MappingConfiguration,
    ) -> &'a mut Decisions<MilestoneTypeFields> {
        &mut c.milestone_types
    }

    async fn find_by_id(
        &self,
        conn: &mut SqliteConnection,
        id: i64,
    ) -> sqlx::Result<Option<MilestoneTypeFields>> {
        let row = sqlx::query("SELECT name, icon, is_default FROM milestone_types WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.map(|r| MilestoneTypeFields {
            name: Some(r.get("name")),
            icon: Some(r.get("icon")),
            is_default: Some(r.get::<i64, _>("is_default") != 0),
        }))
    }

    async fn find_by_natural_key(
        &self,
        conn: &mut SqliteConnection,
        fields: &MilestoneTypeFields,
    ) -> sqlx::Result<Option<(i64, MilestoneTypeFields)>> {
        let id: Option<i64> = sqlx::query_scalar("SELECT id FROM milestone_types WHERE name = ?")
            .bind(trimmed(&fields.name))
            .fetch_optional(&mut *conn)
            .await?;
        match id {
            Some(id) => Ok(self.find_by_id(conn, id).await?.map(|f| (id, f))),
            None => Ok(None),
        }
    }

    fn validate(&self, fields: &MilestoneTypeFields) -> Result<(), String> {
        require_name(&fields.name)
    }

    async fn create(
        &self,
        conn: &mut SqliteConnection,
        fields: &MilestoneTypeFields,
        _maps: &IdentifierMaps,
    ) -> sqlx::Result<(i64, MilestoneTypeFields)> {
        let id = sqlx::query(
            "INSERT INTO milestone_types (name, icon, is_default) VALUES (?, COALESCE(?, 'milestone'), ?)",
        )
        .bind(trimmed(&fields.name))
        .bind(fields.icon.as_deref())
        .bind(fields.is_default.unwrap_or(false))
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
        let canonical = self.find_by_id(conn, id).await?.unwrap_or_else(|| fields.clone());
        Ok((id, canonical))
    }
}

// ── Seeding ──────────────────────────────────────────────────────────────

/// Rows per page when loading reference datasets for seeding.
const SEED_PAGE: u64 = 1000;

async fn seed_from<R, F>(
    store: &dyn StagingStore,
    job_id: &str,
    dataset: &str,
    decisions: &mut Decisions<F>,
    to_fields: impl Fn(R) -> (i64, F),
) -> ImportResult<u64>
where
    R: DeserializeOwned,
{
    let rows = load_all(store, job_id, dataset, SEED_PAGE)
        .await
        .map_err(ImportError::staging)?;
    let before = decisions.len();
    for row in rows {
        match serde_json::from_value::<R>(row.payload) {
            Ok(record) => {
                let (id, fields) = to_fields(record);
                seed_create(decisions, id, fields);
            }
            Err(e) => {
                warn!(job = job_id, dataset, row = row.row_index, error = %e, "reference row not seeded");
            }
        }
    }
    Ok((decisions.len() - before) as u64)
}

/// Fill in a default `create` decision for every staged reference row the
/// configuration doesn't cover yet. Returns the number of decisions added.
pub async fn seed_mapping(
    store: &dyn StagingStore,
    job_id: &str,
    config: &mut MappingConfiguration,
) -> ImportResult<u64> {
    let mut added = 0;
    added += seed_from(store, job_id, datasets::ROLES, &mut config.roles, |r: NamedRecord| {
        (r.id, RoleFields { name: r.name, is_default: None })
    })
    .await?;
    added += seed_from(store, job_id, datasets::USERS, &mut config.users, |r: UserRecord| {
        (
            r.id,
            UserFields {
                name: r.name,
                email: r.email,
                role_id: None,
                source_role_id: r.role_id,
                is_active: Some(r.is_active),
            },
        )
    })
    .await?;
    added += seed_from(store, job_id, datasets::GROUPS, &mut config.groups, |r: NamedRecord| {
        (r.id, NameFields { name: r.name })
    })
    .await?;
    added += seed_from(store, job_id, datasets::STATUSES, &mut config.statuses, |r: StatusRecord| {
        (
            r.id,
            StatusFields {
                name: r.name,
                system_name: r.system_name,
                color: r.color,
                is_success: Some(r.is_success),
                is_failure: Some(r.is_failure),
                is_completed: Some(r.is_completed),
            },
        )
    })
    .await?;
    added += seed_from(store, job_id, datasets::WORKFLOWS, &mut config.workflows, |r: WorkflowRecord| {
        (r.id, WorkflowFields { name: r.name, scope: r.scope })
    })
    .await?;
    added += seed_from(
        store,
        job_id,
        datasets::MILESTONE_TYPES,
        &mut config.milestone_types,
        |r: MilestoneTypeRecord| {
            (
                r.id,
                MilestoneTypeFields {
                    name: r.name,
                    icon: r.icon,
                    is_default: None,
                },
            )
        },
    )
    .await?;
    added += seed_from(store, job_id, datasets::CONFIGURATIONS, &mut config.configurations, |r: NamedRecord| {
        (r.id, NameFields { name: r.name })
    })
    .await?;
    added += seed_from(store, job_id, datasets::TAGS, &mut config.tags, |r: NamedRecord| {
        (r.id, NameFields { name: r.name })
    })
    .await?;
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        pool
    }

    fn mapping(value: serde_json::Value) -> MappingConfiguration {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn creates_then_maps_on_retry() {
        let pool = pool().await;
        let mut config = mapping(json!({
            "roles": { "1": { "action": "create", "name": "Tester" } },
            "users": {
                "5": { "action": "create", "email": "ada@example.com", "sourceRoleId": 1 }
            }
        }));
        let mut maps = IdentifierMaps::default();
        let summary = resolve_all(&pool, &mut config, &mut maps).await.unwrap();
        assert_eq!(summary[&EntityKind::Role].created, 1);
        assert_eq!(summary[&EntityKind::User].created, 1);

        let role = maps.get(EntityKind::Role, 1).unwrap();
        let user = &config.users["5"];
        assert_eq!(user.action, Action::Map);
        assert_eq!(user.fields.name.as_deref(), Some("ada"));
        assert_eq!(user.fields.role_id, Some(role));

        // A retry with the original create decisions finds the records by
        // natural key instead of creating them again.
        let mut again = mapping(json!({
            "roles": { "1": { "action": "create", "name": "tester" } },
            "users": { "5": { "action": "create", "email": "ADA@example.com" } }
        }));
        let mut maps = IdentifierMaps::default();
        let summary = resolve_all(&pool, &mut again, &mut maps).await.unwrap();
        assert_eq!(summary[&EntityKind::Role].mapped, 1);
        assert_eq!(summary[&EntityKind::User].mapped, 1);
        let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(users, 1);
    }

    #[tokio::test]
    async fn invalid_decisions_are_configuration_errors() {
        let pool = pool().await;
        let mut maps = IdentifierMaps::default();

        let mut bad_email = mapping(json!({
            "users": { "5": { "action": "create", "name": "Ada", "email": "ada" } }
        }));
        let err = resolve_all(&pool, &mut bad_email, &mut maps).await.unwrap_err();
        assert!(matches!(err, ImportError::Configuration(_)));

        let mut both = mapping(json!({
            "statuses": { "1": { "action": "create", "name": "Odd", "isSuccess": true, "isFailure": true } }
        }));
        let err = resolve_all(&pool, &mut both, &mut maps).await.unwrap_err();
        assert!(err.to_string().contains("both success and failure"));

        let mut missing = mapping(json!({
            "tags": { "3": { "action": "map", "mappedTo": 77 } }
        }));
        let err = resolve_all(&pool, &mut missing, &mut maps).await.unwrap_err();
        assert!(err.to_string().contains("mapped target 77 does not exist"));
    }

    #[tokio::test]
    async fn failed_type_rolls_back_every_type() {
        let pool = pool().await;
        let mut config = mapping(json!({
            "roles": { "1": { "action": "create", "name": "Lead" } },
            "users": { "9": { "action": "create", "email": "nope" } }
        }));
        let before = config.clone();
        let mut maps = IdentifierMaps::default();
        let err = resolve_all(&pool, &mut config, &mut maps).await.unwrap_err();
        assert!(matches!(err, ImportError::Configuration(_)));

        assert_eq!(config, before);
        assert_eq!(config.roles["1"].action, Action::Create);
        assert_eq!(maps.get(EntityKind::Role, 1), None);
        let roles: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM roles")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(roles, 0);
    }
}
