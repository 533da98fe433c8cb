use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::{Store, StoreTransaction};
use crate::error::{EngineError, Result};
use crate::models::{
    ContentTypeId, EvaluationTuple, ObjectId, ObjectRole, PermissionAtom, RoleDefinition, TeamAssignment, UserAssignment,
};

/// Postgres-backed [`Store`]. Deliberately written against `sqlx::query`/
/// `query_as` with explicit `.bind()`/`.try_get()` rather than the `query!`
/// macros, which require a live database (or a checked-in `.sqlx` cache) at
/// compile time.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await.map_err(rbac_shared::Error::from)?;
        Ok(Box::new(PgTransaction { tx: Some(tx) }))
    }
}

pub struct PgTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgTransaction {
    fn tx(&mut self) -> &mut Transaction<'static, Postgres> {
        self.tx.as_mut().expect("transaction used after commit/rollback")
    }
}

/// Splits an [`ObjectId`] into the nullable `(int, uuid)` column pair every
/// generic-foreign-key table in this schema uses to stay type-partitioned.
fn object_id_columns(object_id: ObjectId) -> (Option<i64>, Option<Uuid>) {
    match object_id {
        ObjectId::Integer(id) => (Some(id), None),
        ObjectId::Uuid(id) => (None, Some(id)),
    }
}

fn object_id_from_columns(object_id_int: Option<i64>, object_id_uuid: Option<Uuid>) -> Result<ObjectId> {
    match (object_id_int, object_id_uuid) {
        (Some(id), None) => Ok(ObjectId::Integer(id)),
        (None, Some(id)) => Ok(ObjectId::Uuid(id)),
        _ => Err(EngineError::Store(rbac_shared::Error::Internal(
            "row has neither or both of object_id_int/object_id_uuid set".to_string(),
        ))),
    }
}

fn row_to_role_definition(
    id: Uuid,
    name: String,
    description: String,
    managed: bool,
    content_type: Option<i64>,
    permissions: Vec<(String, i64)>,
) -> RoleDefinition {
    RoleDefinition {
        id,
        name,
        description,
        managed,
        content_type: content_type.map(ContentTypeId),
        permissions: permissions
            .into_iter()
            .map(|(codename, ct)| PermissionAtom::new(codename, ContentTypeId(ct)))
            .collect(),
    }
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn commit(mut self: Box<Self>) -> Result<()> {
        let tx = self.tx.take().expect("transaction used after commit/rollback");
        tx.commit().await.map_err(rbac_shared::Error::from)?;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        let tx = self.tx.take().expect("transaction used after commit/rollback");
        tx.rollback().await.map_err(rbac_shared::Error::from)?;
        Ok(())
    }

    async fn find_role_definition_by_permissions(
        &mut self,
        content_type: Option<ContentTypeId>,
        permissions: &BTreeSet<PermissionAtom>,
    ) -> Result<Option<RoleDefinition>> {
        // Candidates are narrowed by content type and exact permission count,
        // then compared in full in Rust since set-equality across a join
        // table is awkward to express portably in one query.
        let rows = sqlx::query(
            "SELECT id, name, description, managed, content_type \
             FROM role_definition WHERE content_type IS NOT DISTINCT FROM $1",
        )
        .bind(content_type.map(|c| c.0))
        .fetch_all(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?;

        for row in rows {
            let id: Uuid = row.try_get("id").map_err(rbac_shared::Error::from)?;
            let perm_rows = sqlx::query(
                "SELECT p.codename, p.content_type FROM role_definition_permissions rdp \
                 JOIN permission p ON p.id = rdp.permission_id WHERE rdp.role_definition_id = $1",
            )
            .bind(id)
            .fetch_all(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;

            let candidate: BTreeSet<PermissionAtom> = perm_rows
                .into_iter()
                .map(|r| {
                    let codename: String = r.try_get("codename").unwrap();
                    let ct: i64 = r.try_get("content_type").unwrap();
                    PermissionAtom::new(codename, ContentTypeId(ct))
                })
                .collect();

            if &candidate == permissions {
                let name: String = row.try_get("name").map_err(rbac_shared::Error::from)?;
                let description: String = row.try_get("description").map_err(rbac_shared::Error::from)?;
                let managed: bool = row.try_get("managed").map_err(rbac_shared::Error::from)?;
                let ct: Option<i64> = row.try_get("content_type").map_err(rbac_shared::Error::from)?;
                return Ok(Some(row_to_role_definition(
                    id,
                    name,
                    description,
                    managed,
                    ct,
                    candidate.into_iter().map(|p| (p.codename, p.content_type.0)).collect(),
                )));
            }
        }
        Ok(None)
    }

    async fn find_role_definition_by_name(&mut self, name: &str) -> Result<Option<RoleDefinition>> {
        let row = sqlx::query("SELECT id FROM role_definition WHERE name = $1")
            .bind(name)
            .fetch_optional(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;
        match row {
            Some(row) => {
                let id: Uuid = row.try_get("id").map_err(rbac_shared::Error::from)?;
                Ok(Some(self.get_role_definition(id).await?))
            }
            None => Ok(None),
        }
    }

    async fn get_role_definition(&mut self, id: Uuid) -> Result<RoleDefinition> {
        let row = sqlx::query("SELECT id, name, description, managed, content_type FROM role_definition WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?
            .ok_or_else(|| EngineError::NotFound(format!("role definition {id}")))?;

        let perm_rows = sqlx::query(
            "SELECT p.codename, p.content_type FROM role_definition_permissions rdp \
             JOIN permission p ON p.id = rdp.permission_id WHERE rdp.role_definition_id = $1",
        )
        .bind(id)
        .fetch_all(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?;

        let permissions = perm_rows
            .into_iter()
            .map(|r| {
                let codename: String = r.try_get("codename").unwrap();
                let ct: i64 = r.try_get("content_type").unwrap();
                (codename, ct)
            })
            .collect();

        Ok(row_to_role_definition(
            id,
            row.try_get("name").map_err(rbac_shared::Error::from)?,
            row.try_get("description").map_err(rbac_shared::Error::from)?,
            row.try_get("managed").map_err(rbac_shared::Error::from)?,
            row.try_get("content_type").map_err(rbac_shared::Error::from)?,
            permissions,
        ))
    }

    async fn insert_role_definition(&mut self, role_definition: RoleDefinition) -> Result<RoleDefinition> {
        sqlx::query("INSERT INTO role_definition (id, name, description, managed, content_type) VALUES ($1, $2, $3, $4, $5)")
            .bind(role_definition.id)
            .bind(&role_definition.name)
            .bind(&role_definition.description)
            .bind(role_definition.managed)
            .bind(role_definition.content_type.map(|c| c.0))
            .execute(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;

        for perm in &role_definition.permissions {
            let permission_id: Uuid = sqlx::query(
                "INSERT INTO permission (codename, content_type) VALUES ($1, $2) \
                 ON CONFLICT (codename, content_type) DO UPDATE SET codename = EXCLUDED.codename \
                 RETURNING id",
            )
            .bind(&perm.codename)
            .bind(perm.content_type.0)
            .fetch_one(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?
            .try_get("id")
            .map_err(rbac_shared::Error::from)?;

            sqlx::query("INSERT INTO role_definition_permissions (role_definition_id, permission_id) VALUES ($1, $2)")
                .bind(role_definition.id)
                .bind(permission_id)
                .execute(&mut **self.tx())
                .await
                .map_err(rbac_shared::Error::from)?;
        }

        Ok(role_definition)
    }

    async fn update_role_definition_permissions(&mut self, id: Uuid, permissions: BTreeSet<PermissionAtom>) -> Result<RoleDefinition> {
        sqlx::query("DELETE FROM role_definition_permissions WHERE role_definition_id = $1")
            .bind(id)
            .execute(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;

        for perm in &permissions {
            let permission_id: Uuid = sqlx::query(
                "INSERT INTO permission (codename, content_type) VALUES ($1, $2) \
                 ON CONFLICT (codename, content_type) DO UPDATE SET codename = EXCLUDED.codename \
                 RETURNING id",
            )
            .bind(&perm.codename)
            .bind(perm.content_type.0)
            .fetch_one(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?
            .try_get("id")
            .map_err(rbac_shared::Error::from)?;

            sqlx::query("INSERT INTO role_definition_permissions (role_definition_id, permission_id) VALUES ($1, $2)")
                .bind(id)
                .bind(permission_id)
                .execute(&mut **self.tx())
                .await
                .map_err(rbac_shared::Error::from)?;
        }

        self.get_role_definition(id).await
    }

    async fn delete_role_definition(&mut self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM role_definition WHERE id = $1")
            .bind(id)
            .execute(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;
        Ok(())
    }

    async fn assignment_count_for_role_definition(&mut self, id: Uuid) -> Result<i64> {
        let row = sqlx::query(
            "SELECT (SELECT count(*) FROM role_user_assignment WHERE role_definition_id = $1) \
             + (SELECT count(*) FROM role_team_assignment WHERE role_definition_id = $1) AS total",
        )
        .bind(id)
        .fetch_one(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?;
        row.try_get::<i64, _>("total").map_err(|e| EngineError::Store(e.into()))
    }

    async fn find_or_create_object_role(
        &mut self,
        role_definition_id: Uuid,
        content_type: ContentTypeId,
        object_id: ObjectId,
    ) -> Result<(ObjectRole, bool)> {
        let (object_id_int, object_id_uuid) = object_id_columns(object_id);

        if let Some(row) = sqlx::query(
            "SELECT id FROM object_role WHERE role_definition_id = $1 AND content_type = $2 \
             AND object_id_int IS NOT DISTINCT FROM $3 AND object_id_uuid IS NOT DISTINCT FROM $4",
        )
        .bind(role_definition_id)
        .bind(content_type.0)
        .bind(object_id_int)
        .bind(object_id_uuid)
        .fetch_optional(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?
        {
            let id: Uuid = row.try_get("id").map_err(rbac_shared::Error::from)?;
            return Ok((self.get_object_role(id).await?, false));
        }

        let id = Uuid::new_v4();
        let insert = sqlx::query(
            "INSERT INTO object_role (id, role_definition_id, content_type, object_id_int, object_id_uuid) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (role_definition_id, content_type, object_id_int, object_id_uuid) DO NOTHING \
             RETURNING id",
        )
        .bind(id)
        .bind(role_definition_id)
        .bind(content_type.0)
        .bind(object_id_int)
        .bind(object_id_uuid)
        .fetch_optional(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?;

        match insert {
            Some(_) => Ok((ObjectRole::new(id, role_definition_id, content_type, object_id), true)),
            // Lost the race against a concurrent transaction (spec §5): the
            // row now exists, fetch it instead of surfacing a conflict.
            None => {
                let existing_id: Uuid = sqlx::query(
                    "SELECT id FROM object_role WHERE role_definition_id = $1 AND content_type = $2 \
                     AND object_id_int IS NOT DISTINCT FROM $3 AND object_id_uuid IS NOT DISTINCT FROM $4",
                )
                .bind(role_definition_id)
                .bind(content_type.0)
                .bind(object_id_int)
                .bind(object_id_uuid)
                .fetch_one(&mut **self.tx())
                .await
                .map_err(rbac_shared::Error::from)?
                .try_get("id")
                .map_err(|e: sqlx::Error| EngineError::Store(e.into()))?;
                Ok((self.get_object_role(existing_id).await?, false))
            }
        }
    }

    async fn find_object_role(
        &mut self,
        role_definition_id: Uuid,
        content_type: ContentTypeId,
        object_id: ObjectId,
    ) -> Result<Option<ObjectRole>> {
        let (object_id_int, object_id_uuid) = object_id_columns(object_id);
        let row = sqlx::query(
            "SELECT id FROM object_role WHERE role_definition_id = $1 AND content_type = $2 \
             AND object_id_int IS NOT DISTINCT FROM $3 AND object_id_uuid IS NOT DISTINCT FROM $4",
        )
        .bind(role_definition_id)
        .bind(content_type.0)
        .bind(object_id_int)
        .bind(object_id_uuid)
        .fetch_optional(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?;
        match row {
            Some(row) => {
                let id: Uuid = row.try_get("id").map_err(rbac_shared::Error::from)?;
                Ok(Some(self.get_object_role(id).await?))
            }
            None => Ok(None),
        }
    }

    async fn get_object_role(&mut self, id: Uuid) -> Result<ObjectRole> {
        let row = sqlx::query("SELECT id, role_definition_id, content_type, object_id_int, object_id_uuid FROM object_role WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?
            .ok_or_else(|| EngineError::NotFound(format!("object role {id}")))?;

        let role_definition_id: Uuid = row.try_get("role_definition_id").map_err(rbac_shared::Error::from)?;
        let content_type: i64 = row.try_get("content_type").map_err(rbac_shared::Error::from)?;
        let object_id_int: Option<i64> = row.try_get("object_id_int").map_err(rbac_shared::Error::from)?;
        let object_id_uuid: Option<Uuid> = row.try_get("object_id_uuid").map_err(rbac_shared::Error::from)?;
        let object_id = object_id_from_columns(object_id_int, object_id_uuid)?;

        let users: Vec<Uuid> = sqlx::query("SELECT user_id FROM object_role_users WHERE object_role_id = $1")
            .bind(id)
            .fetch_all(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?
            .into_iter()
            .map(|r| r.try_get("user_id").unwrap())
            .collect();
        let teams: Vec<Uuid> = sqlx::query("SELECT team_id FROM object_role_teams WHERE object_role_id = $1")
            .bind(id)
            .fetch_all(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?
            .into_iter()
            .map(|r| r.try_get("team_id").unwrap())
            .collect();
        let provides_teams: Vec<Uuid> = sqlx::query("SELECT team_id FROM object_role_provides_teams WHERE object_role_id = $1")
            .bind(id)
            .fetch_all(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?
            .into_iter()
            .map(|r| r.try_get("team_id").unwrap())
            .collect();

        Ok(ObjectRole {
            id,
            role_definition_id,
            content_type: ContentTypeId(content_type),
            object_id,
            users: users.into_iter().collect(),
            teams: teams.into_iter().collect(),
            provides_teams: provides_teams.into_iter().collect(),
        })
    }

    async fn delete_object_role(&mut self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM object_role WHERE id = $1")
            .bind(id)
            .execute(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;
        Ok(())
    }

    async fn object_roles_for_role_definition(&mut self, role_definition_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id FROM object_role WHERE role_definition_id = $1")
            .bind(role_definition_id)
            .fetch_all(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;
        Ok(rows.into_iter().map(|r| r.try_get("id").unwrap()).collect())
    }

    async fn object_roles_with_codename(&mut self, codename: &str) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT DISTINCT orl.id FROM object_role orl \
             JOIN role_definition_permissions rdp ON rdp.role_definition_id = orl.role_definition_id \
             JOIN permission p ON p.id = rdp.permission_id \
             WHERE p.codename = $1",
        )
        .bind(codename)
        .fetch_all(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?;
        Ok(rows.into_iter().map(|r| r.try_get("id").unwrap()).collect())
    }

    async fn object_roles_held_by_team(&mut self, team_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT object_role_id FROM object_role_teams WHERE team_id = $1")
            .bind(team_id)
            .fetch_all(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;
        Ok(rows.into_iter().map(|r| r.try_get("object_role_id").unwrap()).collect())
    }

    async fn set_provides_teams(&mut self, object_role_id: Uuid, teams: HashSet<Uuid>) -> Result<()> {
        sqlx::query("DELETE FROM object_role_provides_teams WHERE object_role_id = $1")
            .bind(object_role_id)
            .execute(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;
        for team_id in teams {
            sqlx::query("INSERT INTO object_role_provides_teams (object_role_id, team_id) VALUES ($1, $2)")
                .bind(object_role_id)
                .bind(team_id)
                .execute(&mut **self.tx())
                .await
                .map_err(rbac_shared::Error::from)?;
        }
        Ok(())
    }

    async fn all_object_role_ids(&mut self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id FROM object_role")
            .fetch_all(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;
        Ok(rows.into_iter().map(|r| r.try_get("id").unwrap()).collect())
    }

    async fn add_user_assignment(
        &mut self,
        object_role_id: Uuid,
        user_id: Uuid,
        role_definition_id: Uuid,
        created_by: Option<Uuid>,
    ) -> Result<(UserAssignment, bool)> {
        let existing = sqlx::query(
            "SELECT id FROM role_user_assignment WHERE object_role_id = $1 AND user_id = $2",
        )
        .bind(object_role_id)
        .bind(user_id)
        .fetch_optional(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?;
        if existing.is_some() {
            let object_role = self.get_object_role(object_role_id).await?;
            return Ok((
                UserAssignment {
                    id: existing.unwrap().try_get("id").unwrap(),
                    role_definition_id,
                    user_id,
                    object_role_id: Some(object_role_id),
                    content_type: Some(object_role.content_type),
                    object_id: Some(object_role.object_id),
                    created_by,
                    created_at: chrono::Utc::now(),
                },
                false,
            ));
        }

        sqlx::query("INSERT INTO object_role_users (object_role_id, user_id) VALUES ($1, $2)")
            .bind(object_role_id)
            .bind(user_id)
            .execute(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;

        let id = Uuid::new_v4();
        let created_at = chrono::Utc::now();
        sqlx::query(
            "INSERT INTO role_user_assignment (id, role_definition_id, user_id, object_role_id, created_by, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(role_definition_id)
        .bind(user_id)
        .bind(object_role_id)
        .bind(created_by)
        .bind(created_at)
        .execute(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?;

        let object_role = self.get_object_role(object_role_id).await?;
        Ok((
            UserAssignment {
                id,
                role_definition_id,
                user_id,
                object_role_id: Some(object_role_id),
                content_type: Some(object_role.content_type),
                object_id: Some(object_role.object_id),
                created_by,
                created_at,
            },
            true,
        ))
    }

    async fn remove_user_assignment(&mut self, object_role_id: Uuid, user_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM role_user_assignment WHERE object_role_id = $1 AND user_id = $2")
            .bind(object_role_id)
            .bind(user_id)
            .execute(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;
        sqlx::query("DELETE FROM object_role_users WHERE object_role_id = $1 AND user_id = $2")
            .bind(object_role_id)
            .bind(user_id)
            .execute(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;
        Ok(())
    }

    async fn add_team_assignment(
        &mut self,
        object_role_id: Uuid,
        team_id: Uuid,
        role_definition_id: Uuid,
        created_by: Option<Uuid>,
    ) -> Result<(TeamAssignment, bool)> {
        let existing = sqlx::query("SELECT id FROM role_team_assignment WHERE object_role_id = $1 AND team_id = $2")
            .bind(object_role_id)
            .bind(team_id)
            .fetch_optional(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;
        if let Some(row) = existing {
            let object_role = self.get_object_role(object_role_id).await?;
            return Ok((
                TeamAssignment {
                    id: row.try_get("id").unwrap(),
                    role_definition_id,
                    team_id,
                    object_role_id: Some(object_role_id),
                    content_type: Some(object_role.content_type),
                    object_id: Some(object_role.object_id),
                    created_by,
                    created_at: chrono::Utc::now(),
                },
                false,
            ));
        }

        sqlx::query("INSERT INTO object_role_teams (object_role_id, team_id) VALUES ($1, $2)")
            .bind(object_role_id)
            .bind(team_id)
            .execute(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;

        let id = Uuid::new_v4();
        let created_at = chrono::Utc::now();
        sqlx::query(
            "INSERT INTO role_team_assignment (id, role_definition_id, team_id, object_role_id, created_by, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(id)
        .bind(role_definition_id)
        .bind(team_id)
        .bind(object_role_id)
        .bind(created_by)
        .bind(created_at)
        .execute(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?;

        let object_role = self.get_object_role(object_role_id).await?;
        Ok((
            TeamAssignment {
                id,
                role_definition_id,
                team_id,
                object_role_id: Some(object_role_id),
                content_type: Some(object_role.content_type),
                object_id: Some(object_role.object_id),
                created_by,
                created_at,
            },
            true,
        ))
    }

    async fn remove_team_assignment(&mut self, object_role_id: Uuid, team_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM role_team_assignment WHERE object_role_id = $1 AND team_id = $2")
            .bind(object_role_id)
            .bind(team_id)
            .execute(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;
        sqlx::query("DELETE FROM object_role_teams WHERE object_role_id = $1 AND team_id = $2")
            .bind(object_role_id)
            .bind(team_id)
            .execute(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;
        Ok(())
    }

    async fn add_global_user_assignment(
        &mut self,
        role_definition_id: Uuid,
        user_id: Uuid,
        created_by: Option<Uuid>,
    ) -> Result<(UserAssignment, bool)> {
        let existing = sqlx::query(
            "SELECT id, created_at FROM role_user_assignment \
             WHERE object_role_id IS NULL AND role_definition_id = $1 AND user_id = $2",
        )
        .bind(role_definition_id)
        .bind(user_id)
        .fetch_optional(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?;
        if let Some(row) = existing {
            return Ok((
                UserAssignment {
                    id: row.try_get("id").unwrap(),
                    role_definition_id,
                    user_id,
                    object_role_id: None,
                    content_type: None,
                    object_id: None,
                    created_by,
                    created_at: row.try_get("created_at").unwrap(),
                },
                false,
            ));
        }

        let id = Uuid::new_v4();
        let created_at = chrono::Utc::now();
        sqlx::query(
            "INSERT INTO role_user_assignment (id, role_definition_id, user_id, object_role_id, created_by, created_at) \
             VALUES ($1, $2, $3, NULL, $4, $5)",
        )
        .bind(id)
        .bind(role_definition_id)
        .bind(user_id)
        .bind(created_by)
        .bind(created_at)
        .execute(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?;

        Ok((
            UserAssignment {
                id,
                role_definition_id,
                user_id,
                object_role_id: None,
                content_type: None,
                object_id: None,
                created_by,
                created_at,
            },
            true,
        ))
    }

    async fn remove_global_user_assignment(&mut self, role_definition_id: Uuid, user_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM role_user_assignment WHERE object_role_id IS NULL AND role_definition_id = $1 AND user_id = $2")
            .bind(role_definition_id)
            .bind(user_id)
            .execute(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;
        Ok(())
    }

    async fn add_global_team_assignment(
        &mut self,
        role_definition_id: Uuid,
        team_id: Uuid,
        created_by: Option<Uuid>,
    ) -> Result<(TeamAssignment, bool)> {
        let existing = sqlx::query(
            "SELECT id, created_at FROM role_team_assignment \
             WHERE object_role_id IS NULL AND role_definition_id = $1 AND team_id = $2",
        )
        .bind(role_definition_id)
        .bind(team_id)
        .fetch_optional(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?;
        if let Some(row) = existing {
            return Ok((
                TeamAssignment {
                    id: row.try_get("id").unwrap(),
                    role_definition_id,
                    team_id,
                    object_role_id: None,
                    content_type: None,
                    object_id: None,
                    created_by,
                    created_at: row.try_get("created_at").unwrap(),
                },
                false,
            ));
        }

        let id = Uuid::new_v4();
        let created_at = chrono::Utc::now();
        sqlx::query(
            "INSERT INTO role_team_assignment (id, role_definition_id, team_id, object_role_id, created_by, created_at) \
             VALUES ($1, $2, $3, NULL, $4, $5)",
        )
        .bind(id)
        .bind(role_definition_id)
        .bind(team_id)
        .bind(created_by)
        .bind(created_at)
        .execute(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?;

        Ok((
            TeamAssignment {
                id,
                role_definition_id,
                team_id,
                object_role_id: None,
                content_type: None,
                object_id: None,
                created_by,
                created_at,
            },
            true,
        ))
    }

    async fn remove_global_team_assignment(&mut self, role_definition_id: Uuid, team_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM role_team_assignment WHERE object_role_id IS NULL AND role_definition_id = $1 AND team_id = $2")
            .bind(role_definition_id)
            .bind(team_id)
            .execute(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;
        Ok(())
    }

    async fn global_role_definition_ids_for_user(&mut self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT role_definition_id FROM role_user_assignment WHERE object_role_id IS NULL AND user_id = $1")
            .bind(user_id)
            .fetch_all(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;
        Ok(rows.into_iter().map(|r| r.try_get("role_definition_id").unwrap()).collect())
    }

    async fn global_role_definition_ids_for_teams(&mut self, team_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT role_definition_id FROM role_team_assignment WHERE object_role_id IS NULL AND team_id = ANY($1)",
        )
        .bind(team_ids)
        .fetch_all(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?;
        Ok(rows.into_iter().map(|r| r.try_get("role_definition_id").unwrap()).collect())
    }

    async fn evaluation_tuples_for_object_role(&mut self, object_role_id: Uuid) -> Result<Vec<EvaluationTuple>> {
        let int_rows = sqlx::query(
            "SELECT content_type, object_id, codename FROM role_evaluation_int WHERE object_role_id = $1",
        )
        .bind(object_role_id)
        .fetch_all(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?;
        let uuid_rows = sqlx::query(
            "SELECT content_type, object_id, codename FROM role_evaluation_uuid WHERE object_role_id = $1",
        )
        .bind(object_role_id)
        .fetch_all(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?;

        let mut tuples = Vec::with_capacity(int_rows.len() + uuid_rows.len());
        for row in int_rows {
            let content_type: i64 = row.try_get("content_type").unwrap();
            let object_id: i64 = row.try_get("object_id").unwrap();
            let codename: String = row.try_get("codename").unwrap();
            tuples.push(EvaluationTuple {
                object_role_id,
                content_type: ContentTypeId(content_type),
                object_id: ObjectId::Integer(object_id),
                codename,
            });
        }
        for row in uuid_rows {
            let content_type: i64 = row.try_get("content_type").unwrap();
            let object_id: Uuid = row.try_get("object_id").unwrap();
            let codename: String = row.try_get("codename").unwrap();
            tuples.push(EvaluationTuple {
                object_role_id,
                content_type: ContentTypeId(content_type),
                object_id: ObjectId::Uuid(object_id),
                codename,
            });
        }
        Ok(tuples)
    }

    async fn apply_evaluation_diff(&mut self, to_add: Vec<EvaluationTuple>, to_delete: Vec<EvaluationTuple>) -> Result<()> {
        for tuple in to_delete {
            match tuple.object_id {
                ObjectId::Integer(id) => {
                    sqlx::query(
                        "DELETE FROM role_evaluation_int WHERE object_role_id = $1 AND content_type = $2 AND object_id = $3 AND codename = $4",
                    )
                    .bind(tuple.object_role_id)
                    .bind(tuple.content_type.0)
                    .bind(id)
                    .bind(&tuple.codename)
                    .execute(&mut **self.tx())
                    .await
                    .map_err(rbac_shared::Error::from)?;
                }
                ObjectId::Uuid(id) => {
                    sqlx::query(
                        "DELETE FROM role_evaluation_uuid WHERE object_role_id = $1 AND content_type = $2 AND object_id = $3 AND codename = $4",
                    )
                    .bind(tuple.object_role_id)
                    .bind(tuple.content_type.0)
                    .bind(id)
                    .bind(&tuple.codename)
                    .execute(&mut **self.tx())
                    .await
                    .map_err(rbac_shared::Error::from)?;
                }
            }
        }
        for tuple in to_add {
            match tuple.object_id {
                ObjectId::Integer(id) => {
                    sqlx::query(
                        "INSERT INTO role_evaluation_int (object_role_id, content_type, object_id, codename) \
                         VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
                    )
                    .bind(tuple.object_role_id)
                    .bind(tuple.content_type.0)
                    .bind(id)
                    .bind(&tuple.codename)
                    .execute(&mut **self.tx())
                    .await
                    .map_err(rbac_shared::Error::from)?;
                }
                ObjectId::Uuid(id) => {
                    sqlx::query(
                        "INSERT INTO role_evaluation_uuid (object_role_id, content_type, object_id, codename) \
                         VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
                    )
                    .bind(tuple.object_role_id)
                    .bind(tuple.content_type.0)
                    .bind(id)
                    .bind(&tuple.codename)
                    .execute(&mut **self.tx())
                    .await
                    .map_err(rbac_shared::Error::from)?;
                }
            }
        }
        Ok(())
    }

    async fn accessible_ids(
        &mut self,
        content_type: ContentTypeId,
        object_role_ids: &[Uuid],
        codename: &str,
    ) -> Result<Vec<ObjectId>> {
        let int_rows = sqlx::query(
            "SELECT DISTINCT object_id FROM role_evaluation_int \
             WHERE content_type = $1 AND codename = $2 AND object_role_id = ANY($3)",
        )
        .bind(content_type.0)
        .bind(codename)
        .bind(object_role_ids)
        .fetch_all(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?;
        let uuid_rows = sqlx::query(
            "SELECT DISTINCT object_id FROM role_evaluation_uuid \
             WHERE content_type = $1 AND codename = $2 AND object_role_id = ANY($3)",
        )
        .bind(content_type.0)
        .bind(codename)
        .bind(object_role_ids)
        .fetch_all(&mut **self.tx())
        .await
        .map_err(rbac_shared::Error::from)?;

        let mut ids: Vec<ObjectId> = int_rows
            .into_iter()
            .map(|r| ObjectId::Integer(r.try_get("object_id").unwrap()))
            .collect();
        ids.extend(uuid_rows.into_iter().map(|r| ObjectId::Uuid(r.try_get("object_id").unwrap())));
        Ok(ids)
    }

    async fn has_tuple(
        &mut self,
        object_role_ids: &[Uuid],
        content_type: ContentTypeId,
        object_id: ObjectId,
        codename: &str,
    ) -> Result<bool> {
        let exists: bool = match object_id {
            ObjectId::Integer(id) => sqlx::query(
                "SELECT EXISTS(SELECT 1 FROM role_evaluation_int \
                 WHERE content_type = $1 AND object_id = $2 AND codename = $3 AND object_role_id = ANY($4)) AS present",
            )
            .bind(content_type.0)
            .bind(id)
            .bind(codename)
            .bind(object_role_ids)
            .fetch_one(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?
            .try_get("present")
            .map_err(|e: sqlx::Error| EngineError::Store(e.into()))?,
            ObjectId::Uuid(id) => sqlx::query(
                "SELECT EXISTS(SELECT 1 FROM role_evaluation_uuid \
                 WHERE content_type = $1 AND object_id = $2 AND codename = $3 AND object_role_id = ANY($4)) AS present",
            )
            .bind(content_type.0)
            .bind(id)
            .bind(codename)
            .bind(object_role_ids)
            .fetch_one(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?
            .try_get("present")
            .map_err(|e: sqlx::Error| EngineError::Store(e.into()))?,
        };
        Ok(exists)
    }

    async fn all_team_ids(&mut self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT id FROM team")
            .fetch_all(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;
        Ok(rows.into_iter().map(|r| r.try_get("id").unwrap()).collect())
    }

    async fn teams_with_parent(&mut self, parent_id: ObjectId) -> Result<Vec<Uuid>> {
        let rows = match parent_id {
            ObjectId::Integer(id) => {
                sqlx::query("SELECT id FROM team WHERE organization_id_int = $1")
                    .bind(id)
                    .fetch_all(&mut **self.tx())
                    .await
            }
            ObjectId::Uuid(id) => {
                sqlx::query("SELECT id FROM team WHERE organization_id_uuid = $1")
                    .bind(id)
                    .fetch_all(&mut **self.tx())
                    .await
            }
        }
        .map_err(rbac_shared::Error::from)?;
        Ok(rows.into_iter().map(|r| r.try_get("id").unwrap()).collect())
    }

    async fn object_role_ids_for_user(&mut self, user_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT object_role_id FROM object_role_users WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;
        Ok(rows.into_iter().map(|r| r.try_get("object_role_id").unwrap()).collect())
    }

    async fn object_role_ids_for_teams(&mut self, team_ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT DISTINCT object_role_id FROM object_role_teams WHERE team_id = ANY($1)")
            .bind(team_ids)
            .fetch_all(&mut **self.tx())
            .await
            .map_err(rbac_shared::Error::from)?;
        Ok(rows.into_iter().map(|r| r.try_get("object_role_id").unwrap()).collect())
    }
}
