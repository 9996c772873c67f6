//! Category taxonomy: a two-level hierarchy stored as data, not code.
//!
//! New categories and subcategories are rows, so the taxonomy can grow
//! without schema changes. Read paths go through an in-memory name lookup
//! refreshed on an interval or on explicit invalidation.

use crate::db::models::{Category, NewCategory, NewSubcategory, Subcategory};
use crate::db::queries::{CategoryRepo, DbPool, SecretRepo};
use crate::error::AppResult;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of resolving a free-text category name against the taxonomy.
///
/// Tagged, not a bare nullable: callers must handle the unresolved case
/// explicitly instead of silently dropping a secret's categorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CategoryMatch {
    Resolved {
        category_id: i64,
        subcategory_id: Option<i64>,
    },
    Unresolved(String),
}

impl CategoryMatch {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }
}

#[derive(Debug, Clone)]
struct CategoryNode {
    category: Category,
    /// Subcategories keyed by name (unique per parent)
    subcategories: HashMap<String, Subcategory>,
}

/// In-memory taxonomy lookup backed by the category tables.
pub struct TaxonomyRegistry {
    pool: DbPool,
    nodes: DashMap<String, CategoryNode>,
    refresh_interval: Duration,
    last_refresh: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for TaxonomyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaxonomyRegistry")
            .field("categories", &self.nodes.len())
            .finish_non_exhaustive()
    }
}

impl TaxonomyRegistry {
    pub fn new(pool: DbPool, refresh_secs: u64) -> Self {
        Self {
            pool,
            nodes: DashMap::new(),
            refresh_interval: Duration::from_secs(refresh_secs),
            last_refresh: Mutex::new(None),
        }
    }

    /// Reload the lookup from the store.
    pub async fn refresh(&self) -> AppResult<()> {
        let categories = CategoryRepo::list(&self.pool).await?;

        let mut fresh = Vec::with_capacity(categories.len());
        for category in categories {
            let subs = CategoryRepo::list_subcategories(&self.pool, category.id).await?;
            let subcategories = subs.into_iter().map(|s| (s.name.clone(), s)).collect();
            fresh.push((
                category.name.clone(),
                CategoryNode {
                    category,
                    subcategories,
                },
            ));
        }

        self.nodes.clear();
        for (name, node) in fresh {
            self.nodes.insert(name, node);
        }

        *self.refresh_mark() = Some(Instant::now());
        debug!(categories = self.nodes.len(), "taxonomy registry refreshed");
        Ok(())
    }

    /// Drop the cached lookup; the next read refreshes.
    pub fn invalidate(&self) {
        *self.refresh_mark() = None;
    }

    fn refresh_mark(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        // A poisoned mark only means a refresh panicked; the stale timestamp
        // is still usable.
        self.last_refresh
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn ensure_fresh(&self) -> AppResult<()> {
        let stale = match *self.refresh_mark() {
            Some(at) => at.elapsed() > self.refresh_interval,
            None => true,
        };
        if stale {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Resolve a free-text category (and optional subcategory) name.
    ///
    /// Two-pass: exact match against the in-memory lookup first, then a
    /// case-insensitive query against the store. An unmatched name yields
    /// `Unresolved` with a diagnostic; the caller flags the secret as
    /// uncategorized rather than dropping it.
    pub async fn resolve(
        &self,
        category: &str,
        subcategory: Option<&str>,
    ) -> AppResult<CategoryMatch> {
        self.ensure_fresh().await?;

        if let Some(node) = self.nodes.get(category).map(|n| n.value().clone()) {
            let subcategory_id = match subcategory {
                Some(name) => self
                    .resolve_subcategory(&node, name)
                    .await?
                    .map(|sub| sub.id),
                None => None,
            };
            return Ok(CategoryMatch::Resolved {
                category_id: node.category.id,
                subcategory_id,
            });
        }

        let category_row = match CategoryRepo::find_case_insensitive(&self.pool, category).await? {
            Some(row) => row,
            None => {
                warn!(category, "legacy category name did not resolve to a taxonomy node");
                return Ok(CategoryMatch::Unresolved(category.to_string()));
            }
        };

        let subcategory_id = match subcategory {
            Some(name) => self
                .resolve_subcategory_in_store(category_row.id, category, name)
                .await?,
            None => None,
        };

        Ok(CategoryMatch::Resolved {
            category_id: category_row.id,
            subcategory_id,
        })
    }

    async fn resolve_subcategory(
        &self,
        node: &CategoryNode,
        name: &str,
    ) -> AppResult<Option<Subcategory>> {
        if let Some(sub) = node.subcategories.get(name) {
            return Ok(Some(sub.clone()));
        }
        match CategoryRepo::find_subcategory_case_insensitive(&self.pool, node.category.id, name)
            .await?
        {
            Some(sub) => Ok(Some(sub)),
            None => {
                warn!(
                    category = %node.category.name,
                    subcategory = name,
                    "subcategory did not resolve; keeping category-level assignment"
                );
                Ok(None)
            }
        }
    }

    async fn resolve_subcategory_in_store(
        &self,
        category_id: i64,
        category: &str,
        name: &str,
    ) -> AppResult<Option<i64>> {
        let exact = CategoryRepo::get_subcategory(&self.pool, category_id, name).await?;
        let sub = match exact {
            Some(sub) => Some(sub),
            None => {
                CategoryRepo::find_subcategory_case_insensitive(&self.pool, category_id, name)
                    .await?
            }
        };
        if sub.is_none() {
            warn!(
                category,
                subcategory = name,
                "subcategory did not resolve; keeping category-level assignment"
            );
        }
        Ok(sub.map(|s| s.id))
    }

    pub async fn create_category(&self, new: &NewCategory) -> AppResult<Category> {
        let category = CategoryRepo::create_category(&self.pool, new).await?;
        self.invalidate();
        Ok(category)
    }

    pub async fn create_subcategory(
        &self,
        category_name: &str,
        new: &NewSubcategory,
    ) -> AppResult<Subcategory> {
        let category = CategoryRepo::get_by_name(&self.pool, category_name)
            .await?
            .ok_or(crate::error::AppError::NotFound)?;
        let sub = CategoryRepo::create_subcategory(&self.pool, category.id, new).await?;
        self.invalidate();
        Ok(sub)
    }

    pub async fn list_categories(&self) -> AppResult<Vec<Category>> {
        CategoryRepo::list(&self.pool).await
    }

    /// Reassign a secret to a new taxonomy node. Idempotent; an unresolved
    /// target leaves the secret's current assignment untouched and reports
    /// the miss to the caller.
    pub async fn reassign(
        &self,
        secret_key: &str,
        category: &str,
        subcategory: Option<&str>,
    ) -> AppResult<CategoryMatch> {
        let resolved = self.resolve(category, subcategory).await?;

        if let CategoryMatch::Resolved {
            category_id,
            subcategory_id,
        } = resolved
        {
            SecretRepo::set_category(&self.pool, secret_key, Some(category_id), subcategory_id)
                .await?;
        }

        Ok(resolved)
    }

    /// Delete a category. System nodes and nodes referenced by live secrets
    /// are refused at the repo layer.
    pub async fn delete_category(&self, name: &str) -> AppResult<()> {
        CategoryRepo::delete_category(&self.pool, name).await?;
        self.invalidate();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{AccessTier, NewSecret};
    use crate::db::queries::setup_test_db;

    fn new_category(name: &str) -> NewCategory {
        NewCategory {
            name: name.to_string(),
            label_en: name.to_string(),
            label_ar: name.to_string(),
            icon: None,
            color: None,
            sort_order: 0,
            is_system: false,
        }
    }

    fn new_subcategory(name: &str) -> NewSubcategory {
        NewSubcategory {
            name: name.to_string(),
            label_en: name.to_string(),
            label_ar: name.to_string(),
            sort_order: 0,
            is_system: false,
        }
    }

    async fn registry() -> TaxonomyRegistry {
        let pool = setup_test_db().await;
        TaxonomyRegistry::new(pool, 300)
    }

    #[tokio::test]
    async fn test_resolve_exact_match() {
        let reg = registry().await;
        let cat = reg.create_category(&new_category("ai_services")).await.unwrap();

        let m = reg.resolve("ai_services", None).await.unwrap();
        assert_eq!(
            m,
            CategoryMatch::Resolved {
                category_id: cat.id,
                subcategory_id: None
            }
        );
    }

    #[tokio::test]
    async fn test_resolve_case_insensitive_fallback() {
        let reg = registry().await;
        let cat = reg.create_category(&new_category("ai_services")).await.unwrap();

        let m = reg.resolve("AI_Services", None).await.unwrap();
        assert_eq!(
            m,
            CategoryMatch::Resolved {
                category_id: cat.id,
                subcategory_id: None
            }
        );
    }

    #[tokio::test]
    async fn test_resolve_unknown_is_tagged_unresolved() {
        let reg = registry().await;
        reg.create_category(&new_category("ai_services")).await.unwrap();

        let m = reg.resolve("Misc Stuff", None).await.unwrap();
        assert_eq!(m, CategoryMatch::Unresolved("Misc Stuff".to_string()));
    }

    #[tokio::test]
    async fn test_resolve_subcategory_within_parent() {
        let reg = registry().await;
        let cat = reg.create_category(&new_category("ai_services")).await.unwrap();
        let sub = reg
            .create_subcategory("ai_services", &new_subcategory("openai"))
            .await
            .unwrap();

        let m = reg.resolve("ai_services", Some("OpenAI")).await.unwrap();
        assert_eq!(
            m,
            CategoryMatch::Resolved {
                category_id: cat.id,
                subcategory_id: Some(sub.id)
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_subcategory_keeps_category_assignment() {
        let reg = registry().await;
        let cat = reg.create_category(&new_category("ai_services")).await.unwrap();

        let m = reg.resolve("ai_services", Some("nonexistent")).await.unwrap();
        assert_eq!(
            m,
            CategoryMatch::Resolved {
                category_id: cat.id,
                subcategory_id: None
            }
        );
    }

    #[tokio::test]
    async fn test_create_invalidates_registry() {
        let reg = registry().await;
        reg.create_category(&new_category("a")).await.unwrap();
        assert!(reg.resolve("a", None).await.unwrap().is_resolved());

        // Created after the first refresh; must still be visible.
        reg.create_category(&new_category("b")).await.unwrap();
        assert!(reg.resolve("b", None).await.unwrap().is_resolved());
    }

    #[tokio::test]
    async fn test_reassign_is_idempotent() {
        let reg = registry().await;
        let cat = reg.create_category(&new_category("payments")).await.unwrap();

        let new = NewSecret {
            key: "stripe_secret_key".to_string(),
            category_id: None,
            subcategory_id: None,
            display_name: "Stripe".to_string(),
            description: None,
            provider: None,
            access_tier: AccessTier::SuperAdmin,
            is_required: true,
            requires_restart: false,
            environment: "production".to_string(),
        };
        SecretRepo::insert(&reg.pool, &new, "c", "s", "m").await.unwrap();

        for _ in 0..2 {
            let m = reg.reassign("stripe_secret_key", "payments", None).await.unwrap();
            assert!(m.is_resolved());
        }

        let secret = SecretRepo::get_by_key(&reg.pool, "stripe_secret_key")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(secret.category_id, Some(cat.id));
    }

    #[tokio::test]
    async fn test_reassign_unresolved_leaves_secret_untouched() {
        let reg = registry().await;
        let cat = reg.create_category(&new_category("payments")).await.unwrap();

        let new = NewSecret {
            key: "k".to_string(),
            category_id: Some(cat.id),
            subcategory_id: None,
            display_name: "k".to_string(),
            description: None,
            provider: None,
            access_tier: AccessTier::Public,
            is_required: false,
            requires_restart: false,
            environment: "production".to_string(),
        };
        SecretRepo::insert(&reg.pool, &new, "c", "s", "m").await.unwrap();

        let m = reg.reassign("k", "no_such_category", None).await.unwrap();
        assert_eq!(m, CategoryMatch::Unresolved("no_such_category".to_string()));

        let secret = SecretRepo::get_by_key(&reg.pool, "k").await.unwrap().unwrap();
        assert_eq!(secret.category_id, Some(cat.id));
    }
}
