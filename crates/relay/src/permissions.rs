// Write authorization for submissions.
//
// RBAC itself lives upstream; this only consults grants. A record grant is
// satisfied by a grant on the record or on its table.

use std::collections::HashSet;
use std::sync::Arc;

use sqlx::PgPool;
use tablesync_common::channel::ResourceType;
use tokio::sync::RwLock;

pub const ACTION_WRITE: &str = "write";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Grant {
    pub user_id: String,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub action: String,
}

impl Grant {
    pub fn write(user_id: &str, resource_type: ResourceType, resource_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            resource_type,
            resource_id: resource_id.to_string(),
            action: ACTION_WRITE.to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryGrants {
    grants: HashSet<Grant>,
}

impl MemoryGrants {
    pub fn grant(&mut self, grant: Grant) {
        self.grants.insert(grant);
    }

    pub fn revoke(&mut self, grant: &Grant) {
        self.grants.remove(grant);
    }
}

#[derive(Clone)]
pub enum PermissionChecker {
    /// Every authenticated user may write. Used without a database.
    AllowAll,
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryGrants>>),
}

impl PermissionChecker {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryGrants::default())))
    }

    pub async fn check(
        &self,
        user_id: &str,
        resource_type: &ResourceType,
        resource_id: &str,
        action: &str,
    ) -> Result<bool, sqlx::Error> {
        let candidates = candidates(resource_type, resource_id);
        match self {
            Self::AllowAll => Ok(true),
            Self::Memory(grants) => {
                let grants = grants.read().await;
                Ok(candidates.iter().any(|(resource_type, resource_id)| {
                    grants.grants.contains(&Grant {
                        user_id: user_id.to_string(),
                        resource_type: resource_type.clone(),
                        resource_id: resource_id.clone(),
                        action: action.to_string(),
                    })
                }))
            }
            Self::Postgres(pool) => {
                for (resource_type, resource_id) in &candidates {
                    let found = sqlx::query_scalar::<_, i32>(
                        r#"
                        SELECT 1
                        FROM resource_grants
                        WHERE user_id = $1 AND resource_type = $2 AND resource_id = $3 AND action = $4
                        LIMIT 1
                        "#,
                    )
                    .bind(user_id)
                    .bind(resource_type.as_str())
                    .bind(resource_id)
                    .bind(action)
                    .fetch_optional(pool)
                    .await?;
                    if found.is_some() {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }
}

fn candidates(resource_type: &ResourceType, resource_id: &str) -> Vec<(ResourceType, String)> {
    let mut out = vec![(resource_type.clone(), resource_id.to_string())];
    if let (ResourceType::Record, Some((table_id, _))) = (resource_type, resource_id.split_once(':')) {
        out.push((ResourceType::Table, table_id.to_string()));
    }
    out
}
