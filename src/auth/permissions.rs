//! Per-document permission resolution.
//!
//! Ownership is checked first and short-circuits; otherwise the most recently
//! updated active share for the (user, document) pair decides. Capability
//! flags come straight from storage and default to `false` when absent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{AccessGrant, Role};
use crate::db::{bool_field, timestamp_field, DbResult, RelationalStore, SelectQuery};

const SHARE_COLUMNS: &str = "user_id,role,can_view,can_comment,can_edit,updated_at";

/// Active collaborator as shown to the document owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collaborator {
    pub user_id: Uuid,
    pub role: Role,
    pub can_view: bool,
    pub can_comment: bool,
    pub can_edit: bool,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Resolves capability sets from ownership and share grants
#[derive(Clone)]
pub struct PermissionResolver {
    store: Arc<dyn RelationalStore>,
}

impl PermissionResolver {
    pub fn new(store: Arc<dyn RelationalStore>) -> Self {
        Self { store }
    }

    /// Grant for `user_id` on `document_id`, or `None` when the user has no
    /// access. Store failures are returned as errors, never as `None`.
    pub async fn resolve(&self, user_id: Uuid, document_id: Uuid) -> DbResult<Option<AccessGrant>> {
        let owned = self
            .store
            .select(
                &SelectQuery::new("documents")
                    .columns("id,updated_at")
                    .eq("id", document_id)
                    .eq("owner_id", user_id)
                    .limit(1),
            )
            .await?;

        if let Some(row) = owned.first() {
            let updated_at = timestamp_field(row, "updated_at").unwrap_or_else(Utc::now);
            return Ok(Some(AccessGrant::owner(updated_at)));
        }

        let shares = self
            .store
            .select(
                &SelectQuery::new("document_shares")
                    .columns(SHARE_COLUMNS)
                    .eq("document_id", document_id)
                    .eq("user_id", user_id)
                    .eq("status", "active")
                    .order("updated_at", true)
                    .limit(1),
            )
            .await?;

        let grant = shares.first().and_then(grant_from_share);
        if grant.is_none() {
            debug!("No grant for user {} on document {}", user_id, document_id);
        }
        Ok(grant)
    }

    /// Owner of a document, `None` if the document does not exist
    pub async fn document_owner(&self, document_id: Uuid) -> DbResult<Option<Uuid>> {
        let rows = self
            .store
            .select(
                &SelectQuery::new("documents")
                    .columns("id,owner_id")
                    .eq("id", document_id)
                    .limit(1),
            )
            .await?;

        Ok(rows
            .first()
            .and_then(|row| row.get("owner_id"))
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok()))
    }

    /// Every active collaborator of a document with profile fields attached
    pub async fn collaborators(&self, document_id: Uuid) -> DbResult<Vec<Collaborator>> {
        let shares = self
            .store
            .select(
                &SelectQuery::new("document_shares")
                    .columns(SHARE_COLUMNS)
                    .eq("document_id", document_id)
                    .eq("status", "active")
                    .order("updated_at", true),
            )
            .await?;

        // Latest share per user wins
        let mut seen = HashSet::new();
        let mut grants = Vec::new();
        for row in &shares {
            let Some(user_id) = row
                .get("user_id")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };
            if !seen.insert(user_id) {
                continue;
            }
            if let Some(grant) = grant_from_share(row) {
                grants.push((user_id, grant));
            }
        }

        if grants.is_empty() {
            return Ok(Vec::new());
        }

        let profiles = self
            .store
            .select(
                &SelectQuery::new("profiles")
                    .columns("id,display_name,email,avatar_url")
                    .in_list("id", grants.iter().map(|(id, _)| *id)),
            )
            .await?;
        let profiles: HashMap<String, &Value> = profiles
            .iter()
            .filter_map(|p| p.get("id").and_then(Value::as_str).map(|id| (id.to_string(), p)))
            .collect();

        let text = |profile: Option<&&Value>, column: &str| {
            profile
                .and_then(|p| p.get(column))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        Ok(grants
            .into_iter()
            .map(|(user_id, grant)| {
                let profile = profiles.get(&user_id.to_string());
                Collaborator {
                    user_id,
                    role: grant.role,
                    can_view: grant.can_view,
                    can_comment: grant.can_comment,
                    can_edit: grant.can_edit,
                    updated_at: grant.updated_at,
                    display_name: text(profile, "display_name"),
                    email: text(profile, "email"),
                    avatar_url: text(profile, "avatar_url"),
                }
            })
            .collect())
    }
}

/// Share rows with an unrecognized role grant nothing
fn grant_from_share(row: &Value) -> Option<AccessGrant> {
    let role = row.get("role").and_then(Value::as_str).and_then(Role::parse)?;
    Some(AccessGrant {
        role,
        can_view: bool_field(row, "can_view"),
        can_comment: bool_field(row, "can_comment"),
        can_edit: bool_field(row, "can_edit"),
        updated_at: timestamp_field(row, "updated_at").unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use proptest::prelude::*;
    use serde_json::json;

    fn resolver(store: &Arc<MemoryStore>) -> PermissionResolver {
        PermissionResolver::new(store.clone())
    }

    fn seed_document(store: &MemoryStore, document: Uuid, owner: Uuid) {
        store.seed(
            "documents",
            vec![json!({
                "id": document.to_string(),
                "owner_id": owner.to_string(),
                "title": "Roadmap",
                "updated_at": "2024-04-01T00:00:00Z",
            })],
        );
    }

    fn share(document: Uuid, user: Uuid, role: &str, status: &str, updated_at: &str) -> Value {
        json!({
            "document_id": document.to_string(),
            "user_id": user.to_string(),
            "role": role,
            "can_view": true,
            "can_comment": role != "viewer",
            "can_edit": role == "editor",
            "status": status,
            "updated_at": updated_at,
        })
    }

    #[tokio::test]
    async fn test_owner_gets_full_grant() {
        let store = Arc::new(MemoryStore::new());
        let (doc, owner) = (Uuid::new_v4(), Uuid::new_v4());
        seed_document(&store, doc, owner);

        let grant = resolver(&store).resolve(owner, doc).await.unwrap().unwrap();
        assert_eq!(grant, AccessGrant::owner("2024-04-01T00:00:00Z".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_latest_active_share_wins() {
        let store = Arc::new(MemoryStore::new());
        let (doc, owner, user) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        seed_document(&store, doc, owner);
        store.seed(
            "document_shares",
            vec![
                share(doc, user, "viewer", "active", "2024-01-01T00:00:00Z"),
                share(doc, user, "editor", "active", "2024-03-01T00:00:00Z"),
                share(doc, user, "viewer", "revoked", "2024-05-01T00:00:00Z"),
            ],
        );

        let grant = resolver(&store).resolve(user, doc).await.unwrap().unwrap();
        assert_eq!(grant.role, Role::Editor);
        assert!(grant.can_edit);
    }

    #[tokio::test]
    async fn test_missing_flags_default_to_false() {
        let store = Arc::new(MemoryStore::new());
        let (doc, user) = (Uuid::new_v4(), Uuid::new_v4());
        store.seed(
            "document_shares",
            vec![json!({
                "document_id": doc.to_string(),
                "user_id": user.to_string(),
                "role": "editor",
                "status": "active",
            })],
        );

        let grant = resolver(&store).resolve(user, doc).await.unwrap().unwrap();
        assert_eq!(grant.role, Role::Editor);
        assert!(!grant.can_view && !grant.can_comment && !grant.can_edit);
    }

    #[tokio::test]
    async fn test_no_share_means_no_access() {
        let store = Arc::new(MemoryStore::new());
        let (doc, owner) = (Uuid::new_v4(), Uuid::new_v4());
        seed_document(&store, doc, owner);
        assert!(resolver(&store).resolve(Uuid::new_v4(), doc).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_role_grants_nothing() {
        let store = Arc::new(MemoryStore::new());
        let (doc, user) = (Uuid::new_v4(), Uuid::new_v4());
        store.seed("document_shares", vec![share(doc, user, "superuser", "active", "2024-01-01T00:00:00Z")]);
        assert!(resolver(&store).resolve(user, doc).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        assert!(resolver(&store).resolve(Uuid::new_v4(), Uuid::new_v4()).await.is_err());
    }

    #[tokio::test]
    async fn test_collaborators_include_profiles() {
        let store = Arc::new(MemoryStore::new());
        let (doc, owner, alice, bob) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        seed_document(&store, doc, owner);
        store.seed(
            "document_shares",
            vec![
                share(doc, alice, "editor", "active", "2024-01-02T00:00:00Z"),
                share(doc, bob, "viewer", "active", "2024-01-03T00:00:00Z"),
                share(Uuid::new_v4(), bob, "editor", "active", "2024-01-04T00:00:00Z"),
            ],
        );
        store.seed(
            "profiles",
            vec![json!({"id": alice.to_string(), "display_name": "Alice", "email": "alice@example.com"})],
        );

        let collaborators = resolver(&store).collaborators(doc).await.unwrap();
        assert_eq!(collaborators.len(), 2);
        assert_eq!(collaborators[0].user_id, bob);
        assert_eq!(collaborators[0].display_name, None);
        assert_eq!(collaborators[1].display_name.as_deref(), Some("Alice"));
        assert_eq!(collaborators[1].role, Role::Editor);
    }

    #[tokio::test]
    async fn test_document_owner_lookup() {
        let store = Arc::new(MemoryStore::new());
        let (doc, owner) = (Uuid::new_v4(), Uuid::new_v4());
        seed_document(&store, doc, owner);
        let resolver = resolver(&store);
        assert_eq!(resolver.document_owner(doc).await.unwrap(), Some(owner));
        assert_eq!(resolver.document_owner(Uuid::new_v4()).await.unwrap(), None);
    }

    proptest! {
        #[test]
        fn prop_owner_wins_over_any_share(role in "(viewer|commentator|editor)", can_edit: bool) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = Arc::new(MemoryStore::new());
                let (doc, owner) = (Uuid::new_v4(), Uuid::new_v4());
                seed_document(&store, doc, owner);
                store.seed(
                    "document_shares",
                    vec![json!({
                        "document_id": doc.to_string(),
                        "user_id": owner.to_string(),
                        "role": role,
                        "can_view": false,
                        "can_edit": can_edit,
                        "status": "active",
                        "updated_at": "2030-01-01T00:00:00Z",
                    })],
                );

                let grant = resolver(&store).resolve(owner, doc).await.unwrap().unwrap();
                assert_eq!(grant.role, Role::Owner);
                assert!(grant.can_view && grant.can_comment && grant.can_edit);
            });
        }
    }
}
