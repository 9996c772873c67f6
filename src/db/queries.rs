use crate::db::models::*;
use crate::error::{AppError, AppResult};
use chrono::Utc;
use sqlx::{Pool, Sqlite, SqliteConnection};
use tracing::info;

pub type DbPool = Pool<Sqlite>;

/// Database operations for secrets
pub struct SecretRepo;

impl SecretRepo {
    /// Get secret by unique key
    pub async fn get_by_key(pool: &DbPool, key: &str) -> AppResult<Option<Secret>> {
        let secret = sqlx::query_as::<_, Secret>("SELECT * FROM secrets WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;

        Ok(secret)
    }

    /// Insert a new secret. The value must already be encrypted.
    pub async fn insert(
        pool: &DbPool,
        new: &NewSecret,
        encrypted_value: &str,
        salt: &str,
        encryption_method: &str,
    ) -> AppResult<Secret> {
        let mut tx = pool.begin().await?;
        Self::insert_tx(&mut *tx, new, encrypted_value, salt, encryption_method).await?;
        tx.commit().await?;

        Self::get_by_key(pool, &new.key)
            .await?
            .ok_or_else(|| AppError::internal("Failed to retrieve created secret"))
    }

    /// Transaction-scoped insert, for callers whose audit row must share fate
    /// with the new secret. Returns the new row id.
    pub async fn insert_tx(
        conn: &mut SqliteConnection,
        new: &NewSecret,
        encrypted_value: &str,
        salt: &str,
        encryption_method: &str,
    ) -> AppResult<i64> {
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO secrets (
                key, category_id, subcategory_id, encrypted_value, salt,
                encryption_method, display_name, description, provider,
                access_tier, is_required, requires_restart, is_active,
                environment, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, true, ?, ?, ?)
            "#,
        )
        .bind(&new.key)
        .bind(new.category_id)
        .bind(new.subcategory_id)
        .bind(encrypted_value)
        .bind(salt)
        .bind(encryption_method)
        .bind(&new.display_name)
        .bind(&new.description)
        .bind(&new.provider)
        .bind(new.access_tier.as_str())
        .bind(new.is_required)
        .bind(new.requires_restart)
        .bind(&new.environment)
        .bind(now)
        .bind(now)
        .execute(conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Update a secret's encrypted value inside an open transaction, so the
    /// change-log write shares its fate.
    pub async fn update_value_tx(
        conn: &mut SqliteConnection,
        secret_id: i64,
        encrypted_value: &str,
        salt: &str,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE secrets SET encrypted_value = ?, salt = ?, updated_at = ? WHERE id = ?",
        )
        .bind(encrypted_value)
        .bind(salt)
        .bind(Utc::now())
        .bind(secret_id)
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Deactivate a secret. Secrets are never hard-deleted, preserving audit
    /// continuity.
    pub async fn deactivate(pool: &DbPool, key: &str) -> AppResult<bool> {
        let result = sqlx::query("UPDATE secrets SET is_active = false, updated_at = ? WHERE key = ?")
            .bind(Utc::now())
            .bind(key)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the outcome of a connectivity/validity test against a secret
    pub async fn record_test(pool: &DbPool, key: &str, status: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE secrets SET last_tested_at = ?, test_status = ?, updated_at = ? WHERE key = ?",
        )
        .bind(Utc::now())
        .bind(status)
        .bind(Utc::now())
        .bind(key)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Move a secret to a different taxonomy node
    pub async fn set_category(
        pool: &DbPool,
        key: &str,
        category_id: Option<i64>,
        subcategory_id: Option<i64>,
    ) -> AppResult<()> {
        sqlx::query(
            "UPDATE secrets SET category_id = ?, subcategory_id = ?, updated_at = ? WHERE key = ?",
        )
        .bind(category_id)
        .bind(subcategory_id)
        .bind(Utc::now())
        .bind(key)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn list_active(pool: &DbPool) -> AppResult<Vec<Secret>> {
        let secrets =
            sqlx::query_as::<_, Secret>("SELECT * FROM secrets WHERE is_active = true ORDER BY key")
                .fetch_all(pool)
                .await?;
        Ok(secrets)
    }

    pub async fn count(pool: &DbPool) -> AppResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM secrets")
            .fetch_one(pool)
            .await?;
        Ok(count)
    }

    /// Secrets left without a resolved taxonomy node (flagged, not dropped)
    pub async fn count_uncategorized(pool: &DbPool) -> AppResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM secrets WHERE category_id IS NULL")
                .fetch_one(pool)
                .await?;
        Ok(count)
    }

    /// Active secrets referencing a taxonomy node
    pub async fn count_referencing(
        pool: &DbPool,
        category_id: i64,
        subcategory_id: Option<i64>,
    ) -> AppResult<i64> {
        let (count,): (i64,) = match subcategory_id {
            Some(sub_id) => {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM secrets WHERE is_active = true AND subcategory_id = ?",
                )
                .bind(sub_id)
                .fetch_one(pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT COUNT(*) FROM secrets WHERE is_active = true AND category_id = ?",
                )
                .bind(category_id)
                .fetch_one(pool)
                .await?
            }
        };
        Ok(count)
    }

    /// Secrets pointing at a category row that no longer exists
    pub async fn count_dangling_taxonomy_refs(pool: &DbPool) -> AppResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM secrets s
            LEFT JOIN categories c ON c.id = s.category_id
            WHERE s.category_id IS NOT NULL AND c.id IS NULL
            "#,
        )
        .fetch_one(pool)
        .await?;
        Ok(count)
    }
}

/// Database operations for the category taxonomy
pub struct CategoryRepo;

impl CategoryRepo {
    pub async fn create_category(pool: &DbPool, new: &NewCategory) -> AppResult<Category> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO categories (name, label_en, label_ar, icon, color, sort_order, is_system, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO NOTHING
            "#,
        )
        .bind(&new.name)
        .bind(&new.label_en)
        .bind(&new.label_ar)
        .bind(&new.icon)
        .bind(&new.color)
        .bind(new.sort_order)
        .bind(new.is_system)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Self::get_by_name(pool, &new.name)
            .await?
            .ok_or_else(|| AppError::internal("Failed to retrieve created category"))
    }

    pub async fn get_by_name(pool: &DbPool, name: &str) -> AppResult<Option<Category>> {
        let category = sqlx::query_as::<_, Category>("SELECT * FROM categories WHERE name = ?")
            .bind(name)
            .fetch_optional(pool)
            .await?;
        Ok(category)
    }

    /// Case-insensitive fallback used by the legacy-name resolver
    pub async fn find_case_insensitive(pool: &DbPool, name: &str) -> AppResult<Option<Category>> {
        let category = sqlx::query_as::<_, Category>(
            "SELECT * FROM categories WHERE name = ? COLLATE NOCASE LIMIT 1",
        )
        .bind(name)
        .fetch_optional(pool)
        .await?;
        Ok(category)
    }

    pub async fn list(pool: &DbPool) -> AppResult<Vec<Category>> {
        let categories =
            sqlx::query_as::<_, Category>("SELECT * FROM categories ORDER BY sort_order, name")
                .fetch_all(pool)
                .await?;
        Ok(categories)
    }

    pub async fn create_subcategory(
        pool: &DbPool,
        category_id: i64,
        new: &NewSubcategory,
    ) -> AppResult<Subcategory> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO subcategories (category_id, name, label_en, label_ar, sort_order, is_system, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(category_id, name) DO NOTHING
            "#,
        )
        .bind(category_id)
        .bind(&new.name)
        .bind(&new.label_en)
        .bind(&new.label_ar)
        .bind(new.sort_order)
        .bind(new.is_system)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Self::get_subcategory(pool, category_id, &new.name)
            .await?
            .ok_or_else(|| AppError::internal("Failed to retrieve created subcategory"))
    }

    pub async fn get_subcategory(
        pool: &DbPool,
        category_id: i64,
        name: &str,
    ) -> AppResult<Option<Subcategory>> {
        let sub = sqlx::query_as::<_, Subcategory>(
            "SELECT * FROM subcategories WHERE category_id = ? AND name = ?",
        )
        .bind(category_id)
        .bind(name)
        .fetch_optional(pool)
        .await?;
        Ok(sub)
    }

    pub async fn find_subcategory_case_insensitive(
        pool: &DbPool,
        category_id: i64,
        name: &str,
    ) -> AppResult<Option<Subcategory>> {
        let sub = sqlx::query_as::<_, Subcategory>(
            "SELECT * FROM subcategories WHERE category_id = ? AND name = ? COLLATE NOCASE LIMIT 1",
        )
        .bind(category_id)
        .bind(name)
        .fetch_optional(pool)
        .await?;
        Ok(sub)
    }

    pub async fn list_subcategories(
        pool: &DbPool,
        category_id: i64,
    ) -> AppResult<Vec<Subcategory>> {
        let subs = sqlx::query_as::<_, Subcategory>(
            "SELECT * FROM subcategories WHERE category_id = ? ORDER BY sort_order, name",
        )
        .bind(category_id)
        .fetch_all(pool)
        .await?;
        Ok(subs)
    }

    /// Delete a category. Refused for system nodes and for nodes still
    /// referenced by a live secret (no orphaning without reassignment).
    pub async fn delete_category(pool: &DbPool, name: &str) -> AppResult<()> {
        let category = Self::get_by_name(pool, name)
            .await?
            .ok_or(AppError::NotFound)?;

        if category.is_system {
            return Err(AppError::validation(format!(
                "category '{}' is a system node and cannot be deleted",
                name
            )));
        }

        let in_use = SecretRepo::count_referencing(pool, category.id, None).await?;
        if in_use > 0 {
            return Err(AppError::validation(format!(
                "category '{}' is referenced by {} live secret(s); reassign them first",
                name, in_use
            )));
        }

        sqlx::query("DELETE FROM subcategories WHERE category_id = ?")
            .bind(category.id)
            .execute(pool)
            .await?;
        sqlx::query("DELETE FROM categories WHERE id = ?")
            .bind(category.id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn count(pool: &DbPool) -> AppResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM categories")
            .fetch_one(pool)
            .await?;
        Ok(count)
    }
}

/// Append-only audit log operations. There is deliberately no update or
/// delete function here; the schema additionally enforces immutability with
/// triggers.
pub struct AuditRepo;

impl AuditRepo {
    pub async fn log_access(
        pool: &DbPool,
        secret_id: i64,
        accessed_by: Option<&str>,
        is_system_access: bool,
        kind: AccessKind,
        reason: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO secret_access_log (secret_id, accessed_by, is_system_access, access_kind, reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(secret_id)
        .bind(accessed_by)
        .bind(is_system_access)
        .bind(kind.as_str())
        .bind(reason)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Transaction-scoped variant, used where the audit row must share fate
    /// with the protected operation.
    pub async fn log_access_tx(
        conn: &mut SqliteConnection,
        secret_id: i64,
        accessed_by: Option<&str>,
        is_system_access: bool,
        kind: AccessKind,
        reason: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO secret_access_log (secret_id, accessed_by, is_system_access, access_kind, reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(secret_id)
        .bind(accessed_by)
        .bind(is_system_access)
        .bind(kind.as_str())
        .bind(reason)
        .bind(Utc::now())
        .execute(conn)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn log_change_tx(
        conn: &mut SqliteConnection,
        secret_id: i64,
        changed_by: &str,
        old_value_hash: Option<&str>,
        new_value_hash: &str,
        reason: &str,
        approval_ref: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO secret_change_log (secret_id, changed_by, old_value_hash, new_value_hash, reason, approval_ref, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(secret_id)
        .bind(changed_by)
        .bind(old_value_hash)
        .bind(new_value_hash)
        .bind(reason)
        .bind(approval_ref)
        .bind(Utc::now())
        .execute(conn)
        .await?;
        Ok(())
    }

    pub async fn list_access(pool: &DbPool, secret_id: i64) -> AppResult<Vec<SecretAccessLog>> {
        let entries = sqlx::query_as::<_, SecretAccessLog>(
            "SELECT * FROM secret_access_log WHERE secret_id = ? ORDER BY id",
        )
        .bind(secret_id)
        .fetch_all(pool)
        .await?;
        Ok(entries)
    }

    pub async fn list_changes(pool: &DbPool, secret_id: i64) -> AppResult<Vec<SecretChangeLog>> {
        let entries = sqlx::query_as::<_, SecretChangeLog>(
            "SELECT * FROM secret_change_log WHERE secret_id = ? ORDER BY id",
        )
        .bind(secret_id)
        .fetch_all(pool)
        .await?;
        Ok(entries)
    }

    /// Record an export action against every secret the export covers.
    /// Secrets that have never been accessed still get an export row, so the
    /// export itself is visible in each secret's trail.
    pub async fn log_export(pool: &DbPool, exported_by: &str) -> AppResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO secret_access_log (secret_id, accessed_by, is_system_access, access_kind, created_at)
            SELECT id, ?, false, 'export', ? FROM secrets
            "#,
        )
        .bind(exported_by)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() as i64)
    }

    /// Redacted export: metadata only, never encrypted values.
    pub async fn export_metadata(pool: &DbPool) -> AppResult<Vec<AuditExportRow>> {
        let rows = sqlx::query_as::<_, AuditExportRow>(
            r#"
            SELECT s.key AS secret_key, l.access_kind, l.accessed_by, l.is_system_access, l.created_at
            FROM secret_access_log l
            JOIN secrets s ON s.id = l.secret_id
            ORDER BY l.id
            "#,
        )
        .fetch_all(pool)
        .await?;
        Ok(rows)
    }
}

/// Database operations for providers and feature assignments
pub struct ProviderRepo;

impl ProviderRepo {
    pub async fn upsert(pool: &DbPool, new: &NewProvider) -> AppResult<Provider> {
        let now = Utc::now();
        let languages = serde_json::to_string(&new.supported_languages)
            .map_err(|e| AppError::internal(e.to_string()))?;
        let features = serde_json::to_string(&new.supported_features)
            .map_err(|e| AppError::internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO providers (key, category, supported_languages, supported_features, rate_limit_per_minute, health_status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'unknown', ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                category = excluded.category,
                supported_languages = excluded.supported_languages,
                supported_features = excluded.supported_features,
                rate_limit_per_minute = excluded.rate_limit_per_minute,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&new.key)
        .bind(&new.category)
        .bind(&languages)
        .bind(&features)
        .bind(new.rate_limit_per_minute)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Self::get_by_key(pool, &new.key)
            .await?
            .ok_or_else(|| AppError::internal("Failed to retrieve created provider"))
    }

    pub async fn get_by_key(pool: &DbPool, key: &str) -> AppResult<Option<Provider>> {
        let provider = sqlx::query_as::<_, Provider>("SELECT * FROM providers WHERE key = ?")
            .bind(key)
            .fetch_optional(pool)
            .await?;
        Ok(provider)
    }

    pub async fn get_by_id(pool: &DbPool, id: i64) -> AppResult<Option<Provider>> {
        let provider = sqlx::query_as::<_, Provider>("SELECT * FROM providers WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await?;
        Ok(provider)
    }

    pub async fn set_health(pool: &DbPool, key: &str, status: &str) -> AppResult<()> {
        sqlx::query("UPDATE providers SET health_status = ?, updated_at = ? WHERE key = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(key)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Insert a feature assignment. Enforces at most one default per
    /// (feature, priority) pair.
    pub async fn insert_assignment(
        pool: &DbPool,
        new: &NewFeatureAssignment,
    ) -> AppResult<FeatureAssignment> {
        let provider = Self::get_by_key(pool, &new.provider_key)
            .await?
            .ok_or_else(|| {
                AppError::validation(format!("unknown provider '{}'", new.provider_key))
            })?;

        if new.is_default {
            let (existing,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM feature_assignments WHERE feature = ? AND priority = ? AND is_default = true",
            )
            .bind(&new.feature)
            .bind(new.priority)
            .fetch_one(pool)
            .await?;
            if existing > 0 {
                return Err(AppError::validation(format!(
                    "feature '{}' already has a default assignment at priority {}",
                    new.feature, new.priority
                )));
            }
        }

        let result = sqlx::query(
            r#"
            INSERT INTO feature_assignments (feature, source_lang, target_lang, provider_id, priority, max_retries, retry_delay_ms, quality_score, is_default, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&new.feature)
        .bind(&new.source_lang)
        .bind(&new.target_lang)
        .bind(provider.id)
        .bind(new.priority)
        .bind(new.max_retries)
        .bind(new.retry_delay_ms)
        .bind(new.quality_score)
        .bind(new.is_default)
        .bind(Utc::now())
        .execute(pool)
        .await?;

        let id = result.last_insert_rowid();
        let assignment =
            sqlx::query_as::<_, FeatureAssignment>("SELECT * FROM feature_assignments WHERE id = ?")
                .bind(id)
                .fetch_one(pool)
                .await?;
        Ok(assignment)
    }

    pub async fn assignments_for_feature(
        pool: &DbPool,
        feature: &str,
    ) -> AppResult<Vec<FeatureAssignment>> {
        let assignments = sqlx::query_as::<_, FeatureAssignment>(
            "SELECT * FROM feature_assignments WHERE feature = ? ORDER BY id",
        )
        .bind(feature)
        .fetch_all(pool)
        .await?;
        Ok(assignments)
    }

    pub async fn count_assignments(pool: &DbPool) -> AppResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feature_assignments")
            .fetch_one(pool)
            .await?;
        Ok(count)
    }

    pub async fn count_providers(pool: &DbPool) -> AppResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM providers")
            .fetch_one(pool)
            .await?;
        Ok(count)
    }

    /// Assignments whose provider row no longer exists (validation check)
    pub async fn count_dangling_assignments(pool: &DbPool) -> AppResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM feature_assignments a
            LEFT JOIN providers p ON p.id = a.provider_id
            WHERE p.id IS NULL
            "#,
        )
        .fetch_one(pool)
        .await?;
        Ok(count)
    }
}

/// Durable step-by-step migration log
pub struct MigrationLogRepo;

impl MigrationLogRepo {
    /// Log a step as started, returning the row id to complete or fail later.
    pub async fn start_step(pool: &DbPool, step: &str) -> AppResult<i64> {
        let result = sqlx::query(
            "INSERT INTO migration_log (step, status, rows_processed, started_at) VALUES (?, 'started', 0, ?)",
        )
        .bind(step)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn complete_step(pool: &DbPool, log_id: i64, rows_processed: i64) -> AppResult<()> {
        sqlx::query(
            "UPDATE migration_log SET status = 'completed', rows_processed = ?, finished_at = ? WHERE id = ?",
        )
        .bind(rows_processed)
        .bind(Utc::now())
        .bind(log_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn fail_step(pool: &DbPool, log_id: i64, error: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE migration_log SET status = 'failed', error = ?, finished_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(log_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Record that a started step detected its work was already done.
    pub async fn mark_skipped(pool: &DbPool, log_id: i64) -> AppResult<()> {
        sqlx::query(
            "UPDATE migration_log SET status = 'skipped', finished_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(log_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Latest status logged for a step, if any.
    pub async fn latest_status(pool: &DbPool, step: &str) -> AppResult<Option<MigrationStepStatus>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM migration_log WHERE step = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(step)
        .fetch_optional(pool)
        .await?;
        Ok(row.and_then(|(s,)| MigrationStepStatus::from_str(&s)))
    }

    pub async fn all(pool: &DbPool) -> AppResult<Vec<MigrationLogEntry>> {
        let entries =
            sqlx::query_as::<_, MigrationLogEntry>("SELECT * FROM migration_log ORDER BY id")
                .fetch_all(pool)
                .await?;
        Ok(entries)
    }
}

/// Read access to the legacy flat configuration table
pub struct LegacyConfigRepo;

impl LegacyConfigRepo {
    pub async fn all(pool: &DbPool) -> AppResult<Vec<LegacyConfigRow>> {
        let rows = sqlx::query_as::<_, LegacyConfigRow>("SELECT * FROM legacy_config ORDER BY id")
            .fetch_all(pool)
            .await?;
        Ok(rows)
    }

    pub async fn count_sensitive(pool: &DbPool) -> AppResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM legacy_config WHERE is_sensitive = true")
                .fetch_one(pool)
                .await?;
        Ok(count)
    }

    /// Seed a legacy row. Used by bootstrap tooling and tests.
    pub async fn insert(
        pool: &DbPool,
        key: &str,
        value: &str,
        category: Option<&str>,
        is_sensitive: bool,
        provider: Option<&str>,
        description: Option<&str>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO legacy_config (key, value, category, is_sensitive, provider, description)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(category)
        .bind(is_sensitive)
        .bind(provider)
        .bind(description)
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
pub async fn setup_test_db() -> DbPool {
    use sqlx::sqlite::SqlitePoolOptions;
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    init_db(&pool).await.expect("Failed to init database");
    pool
}

/// Initialize database schema (idempotent)
pub async fn init_db(pool: &DbPool) -> AppResult<()> {
    info!("Running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT UNIQUE NOT NULL,
            label_en TEXT NOT NULL,
            label_ar TEXT NOT NULL,
            icon TEXT,
            color TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0,
            is_system BOOLEAN NOT NULL DEFAULT false,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subcategories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            category_id INTEGER NOT NULL REFERENCES categories(id),
            name TEXT NOT NULL,
            label_en TEXT NOT NULL,
            label_ar TEXT NOT NULL,
            sort_order INTEGER NOT NULL DEFAULT 0,
            is_system BOOLEAN NOT NULL DEFAULT false,
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL,
            UNIQUE(category_id, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS secrets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT UNIQUE NOT NULL,
            category_id INTEGER REFERENCES categories(id),
            subcategory_id INTEGER REFERENCES subcategories(id),
            encrypted_value TEXT NOT NULL,
            salt TEXT NOT NULL,
            encryption_method TEXT NOT NULL,
            display_name TEXT NOT NULL,
            description TEXT,
            provider TEXT,
            access_tier TEXT NOT NULL CHECK(access_tier IN ('public', 'admin', 'super_admin')),
            is_required BOOLEAN NOT NULL DEFAULT false,
            requires_restart BOOLEAN NOT NULL DEFAULT false,
            last_tested_at DATETIME,
            test_status TEXT,
            is_active BOOLEAN NOT NULL DEFAULT true,
            environment TEXT NOT NULL DEFAULT 'production',
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS secret_access_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            secret_id INTEGER NOT NULL REFERENCES secrets(id),
            accessed_by TEXT,
            is_system_access BOOLEAN NOT NULL DEFAULT false,
            access_kind TEXT NOT NULL CHECK(access_kind IN ('read', 'decrypt', 'export', 'system_read', 'system_decrypt')),
            reason TEXT,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS secret_change_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            secret_id INTEGER NOT NULL REFERENCES secrets(id),
            changed_by TEXT NOT NULL,
            old_value_hash TEXT,
            new_value_hash TEXT NOT NULL,
            reason TEXT NOT NULL,
            approval_ref TEXT,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS providers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT UNIQUE NOT NULL,
            category TEXT NOT NULL,
            supported_languages TEXT NOT NULL DEFAULT '[]',
            supported_features TEXT NOT NULL DEFAULT '[]',
            rate_limit_per_minute INTEGER,
            health_status TEXT NOT NULL DEFAULT 'unknown',
            created_at DATETIME NOT NULL,
            updated_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feature_assignments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            feature TEXT NOT NULL,
            source_lang TEXT,
            target_lang TEXT,
            provider_id INTEGER NOT NULL REFERENCES providers(id),
            priority INTEGER NOT NULL,
            max_retries INTEGER NOT NULL DEFAULT 0,
            retry_delay_ms INTEGER NOT NULL DEFAULT 0,
            quality_score REAL NOT NULL DEFAULT 0.0,
            is_default BOOLEAN NOT NULL DEFAULT false,
            created_at DATETIME NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS migration_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            step TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('started', 'completed', 'failed', 'skipped')),
            rows_processed INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            started_at DATETIME NOT NULL,
            finished_at DATETIME
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS legacy_config (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT UNIQUE NOT NULL,
            value TEXT NOT NULL,
            category TEXT,
            is_sensitive BOOLEAN NOT NULL DEFAULT false,
            provider TEXT,
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_secrets_key ON secrets(key)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_access_log_secret ON secret_access_log(secret_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_change_log_secret ON secret_change_log(secret_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_assignments_feature ON feature_assignments(feature)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_migration_log_step ON migration_log(step)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_assignments_default ON feature_assignments(feature, priority) WHERE is_default = true",
    )
    .execute(pool)
    .await?;

    // Append-only enforcement for audit tables. No code path updates these,
    // and the schema refuses it outright.
    for table in ["secret_access_log", "secret_change_log"] {
        sqlx::query(&format!(
            "CREATE TRIGGER IF NOT EXISTS trg_{table}_no_update BEFORE UPDATE ON {table} BEGIN SELECT RAISE(ABORT, '{table} is append-only'); END",
        ))
        .execute(pool)
        .await?;
        sqlx::query(&format!(
            "CREATE TRIGGER IF NOT EXISTS trg_{table}_no_delete BEFORE DELETE ON {table} BEGIN SELECT RAISE(ABORT, '{table} is append-only'); END",
        ))
        .execute(pool)
        .await?;
    }

    info!("Database migrations complete");
    Ok(())
}
