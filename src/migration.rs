//! Legacy flat-config migration engine.
//!
//! Moves rows out of the old `legacy_config` table into the normalized,
//! encrypted secret store: sensitive values become `super_admin`-tier
//! secrets, plain settings become `public`-tier secrets, and legacy provider
//! names become provider rows with feature assignments. Every step logs
//! `started` before it runs and `completed`/`failed`/`skipped` after, so an
//! interrupted run resumes from the log instead of from in-memory state.

use crate::crypto::{SecretCipher, ENCRYPTION_METHOD};
use crate::db::models::{
    AccessTier, MigrationStepStatus, NewCategory, NewFeatureAssignment, NewProvider, NewSecret,
    NewSubcategory,
};
use crate::db::queries::{
    init_db, CategoryRepo, DbPool, LegacyConfigRepo, MigrationLogRepo, ProviderRepo, SecretRepo,
};
use crate::error::{AppError, AppResult};
use crate::taxonomy::{CategoryMatch, TaxonomyRegistry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Steps in execution order. Each step refuses to run unless every upstream
/// step's latest logged status is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStep {
    VerifySchema,
    MigrateSecrets,
    MigrateProviders,
    MigrateSettings,
    CreateAssignments,
    Validate,
}

impl MigrationStep {
    pub const ALL: [Self; 6] = [
        Self::VerifySchema,
        Self::MigrateSecrets,
        Self::MigrateProviders,
        Self::MigrateSettings,
        Self::CreateAssignments,
        Self::Validate,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::VerifySchema => "verify_schema",
            Self::MigrateSecrets => "migrate_secrets",
            Self::MigrateProviders => "migrate_providers",
            Self::MigrateSettings => "migrate_settings",
            Self::CreateAssignments => "create_assignments",
            Self::Validate => "validate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Complete,
    AlreadyComplete,
    ValidationFailed,
}

/// Built-in taxonomy nodes seeded during schema verification.
const SYSTEM_TAXONOMY: &[(&str, &str, &[&str])] = &[
    ("ai_services", "AI Services", &["openai", "anthropic", "elevenlabs"]),
    ("payments", "Payments", &["stripe"]),
    ("notifications", "Notifications", &["email", "sms"]),
    ("infrastructure", "Infrastructure", &["database", "storage"]),
];

fn default_features(provider_key: &str) -> Vec<String> {
    let features: &[&str] = match provider_key {
        "openai" => &["translate", "llm"],
        "anthropic" => &["llm"],
        "elevenlabs" => &["tts"],
        "google" => &["translate", "tts"],
        _ => &["translate"],
    };
    features.iter().map(|s| s.to_string()).collect()
}

fn display_name_from_key(key: &str) -> String {
    key.split(['_', '.', '-'])
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

pub struct MigrationEngine {
    pool: DbPool,
    cipher: Arc<SecretCipher>,
    taxonomy: TaxonomyRegistry,
    cancelled: Arc<AtomicBool>,
}

impl MigrationEngine {
    pub fn new(pool: DbPool, cipher: Arc<SecretCipher>) -> Self {
        let taxonomy = TaxonomyRegistry::new(pool.clone(), 300);
        Self {
            pool,
            cipher,
            taxonomy,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked between steps. A set flag stops the run before the next
    /// step starts; it never interrupts a step mid-flight.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub async fn run(&self) -> AppResult<MigrationOutcome> {
        let run_id = uuid::Uuid::new_v4();
        info!(%run_id, "migration run starting");

        let previously_validated = matches!(
            MigrationLogRepo::latest_status(&self.pool, MigrationStep::Validate.name()).await?,
            Some(MigrationStepStatus::Completed)
        );

        let mut rows_added: i64 = 0;

        for (idx, step) in MigrationStep::ALL.iter().enumerate() {
            if self.cancelled.load(Ordering::SeqCst) {
                warn!(step = step.name(), "migration cancelled before step");
                return Err(AppError::MigrationBlocked(format!(
                    "cancelled before step '{}'",
                    step.name()
                )));
            }
            self.ensure_upstream_done(idx).await?;

            let was_done = matches!(
                MigrationLogRepo::latest_status(&self.pool, step.name()).await?,
                Some(status) if status.is_done()
            );

            let log_id = MigrationLogRepo::start_step(&self.pool, step.name()).await?;
            info!(step = step.name(), "migration step started");

            let result = match step {
                MigrationStep::VerifySchema => self.verify_schema().await,
                MigrationStep::MigrateSecrets => self.migrate_secrets().await,
                MigrationStep::MigrateProviders => self.migrate_providers().await,
                MigrationStep::MigrateSettings => self.migrate_settings().await,
                MigrationStep::CreateAssignments => self.create_assignments().await,
                MigrationStep::Validate => self.validate().await,
            };

            match result {
                Ok(rows) => {
                    // Validate reports check counts, not new domain rows.
                    if *step != MigrationStep::Validate {
                        rows_added += rows;
                    }
                    if rows == 0 && was_done && *step != MigrationStep::Validate {
                        MigrationLogRepo::mark_skipped(&self.pool, log_id).await?;
                        info!(step = step.name(), "migration step skipped, nothing to do");
                    } else {
                        MigrationLogRepo::complete_step(&self.pool, log_id, rows).await?;
                        info!(step = step.name(), rows, "migration step completed");
                    }
                }
                Err(err) => {
                    MigrationLogRepo::fail_step(&self.pool, log_id, &err.to_string()).await?;
                    error!(step = step.name(), error = %err, "migration step failed");
                    if *step == MigrationStep::Validate {
                        return Ok(MigrationOutcome::ValidationFailed);
                    }
                    return Err(err);
                }
            }
        }

        if previously_validated && rows_added == 0 {
            info!("migration already complete, no new rows");
            Ok(MigrationOutcome::AlreadyComplete)
        } else {
            info!(rows_added, "migration complete");
            Ok(MigrationOutcome::Complete)
        }
    }

    async fn ensure_upstream_done(&self, idx: usize) -> AppResult<()> {
        for upstream in &MigrationStep::ALL[..idx] {
            let done = matches!(
                MigrationLogRepo::latest_status(&self.pool, upstream.name()).await?,
                Some(status) if status.is_done()
            );
            if !done {
                return Err(AppError::MigrationBlocked(format!(
                    "step '{}' has not completed",
                    upstream.name()
                )));
            }
        }
        Ok(())
    }

    /// Ensure the schema exists and the built-in taxonomy is seeded.
    /// Returns the number of taxonomy rows created.
    async fn verify_schema(&self) -> AppResult<i64> {
        init_db(&self.pool).await?;

        let mut created = 0;
        for (sort, (name, label, subs)) in SYSTEM_TAXONOMY.iter().enumerate() {
            let existed = CategoryRepo::get_by_name(&self.pool, name).await?.is_some();
            let category = self
                .taxonomy
                .create_category(&NewCategory {
                    name: name.to_string(),
                    label_en: label.to_string(),
                    label_ar: label.to_string(),
                    icon: None,
                    color: None,
                    sort_order: sort as i64,
                    is_system: true,
                })
                .await?;
            if !existed {
                created += 1;
            }

            for (sub_sort, sub) in subs.iter().enumerate() {
                let sub_existed = CategoryRepo::get_subcategory(&self.pool, category.id, sub)
                    .await?
                    .is_some();
                self.taxonomy
                    .create_subcategory(
                        name,
                        &NewSubcategory {
                            name: sub.to_string(),
                            label_en: display_name_from_key(sub),
                            label_ar: display_name_from_key(sub),
                            sort_order: sub_sort as i64,
                            is_system: true,
                        },
                    )
                    .await?;
                if !sub_existed {
                    created += 1;
                }
            }
        }

        Ok(created)
    }

    /// Move sensitive legacy rows into encrypted super_admin-tier secrets.
    async fn migrate_secrets(&self) -> AppResult<i64> {
        let legacy = LegacyConfigRepo::all(&self.pool).await?;
        let mut migrated = 0;

        for row in legacy.iter().filter(|r| r.is_sensitive) {
            if SecretRepo::get_by_key(&self.pool, &row.key).await?.is_some() {
                continue;
            }
            let (category_id, subcategory_id) =
                self.resolve_legacy_category(&row.key, row.category.as_deref(), row.provider.as_deref())
                    .await?;

            let (ciphertext, salt) = self.cipher.encrypt(&row.value)?;
            let new = NewSecret {
                key: row.key.clone(),
                category_id,
                subcategory_id,
                display_name: display_name_from_key(&row.key),
                description: row.description.clone(),
                provider: row.provider.clone(),
                access_tier: AccessTier::SuperAdmin,
                is_required: true,
                requires_restart: false,
                environment: "production".to_string(),
            };
            SecretRepo::insert(&self.pool, &new, &ciphertext, &salt, ENCRYPTION_METHOD).await?;
            migrated += 1;
        }

        Ok(migrated)
    }

    /// Register a provider row for every distinct legacy provider name.
    async fn migrate_providers(&self) -> AppResult<i64> {
        let legacy = LegacyConfigRepo::all(&self.pool).await?;
        let mut created = 0;

        let mut seen = std::collections::BTreeSet::new();
        for row in &legacy {
            let key = match row.provider.as_deref() {
                Some(p) if !p.is_empty() => p,
                _ => continue,
            };
            if !seen.insert(key.to_string()) {
                continue;
            }
            if ProviderRepo::get_by_key(&self.pool, key).await?.is_some() {
                continue;
            }
            ProviderRepo::upsert(
                &self.pool,
                &NewProvider {
                    key: key.to_string(),
                    category: row.category.clone().unwrap_or_else(|| "ai_services".to_string()),
                    supported_languages: vec!["en".to_string(), "ar".to_string()],
                    supported_features: default_features(key),
                    rate_limit_per_minute: None,
                },
            )
            .await?;
            created += 1;
        }

        Ok(created)
    }

    /// Move non-sensitive legacy rows into public-tier secrets. They go
    /// through the same envelope as sensitive values; only the tier differs.
    async fn migrate_settings(&self) -> AppResult<i64> {
        let legacy = LegacyConfigRepo::all(&self.pool).await?;
        let mut migrated = 0;

        for row in legacy.iter().filter(|r| !r.is_sensitive) {
            if SecretRepo::get_by_key(&self.pool, &row.key).await?.is_some() {
                continue;
            }
            let (category_id, subcategory_id) =
                self.resolve_legacy_category(&row.key, row.category.as_deref(), row.provider.as_deref())
                    .await?;

            let (ciphertext, salt) = self.cipher.encrypt(&row.value)?;
            let new = NewSecret {
                key: row.key.clone(),
                category_id,
                subcategory_id,
                display_name: display_name_from_key(&row.key),
                description: row.description.clone(),
                provider: row.provider.clone(),
                access_tier: AccessTier::Public,
                is_required: false,
                requires_restart: false,
                environment: "production".to_string(),
            };
            SecretRepo::insert(&self.pool, &new, &ciphertext, &salt, ENCRYPTION_METHOD).await?;
            migrated += 1;
        }

        Ok(migrated)
    }

    /// Give every migrated provider an assignment for each feature it
    /// supports. First assignment for a feature becomes the default.
    async fn create_assignments(&self) -> AppResult<i64> {
        let legacy = LegacyConfigRepo::all(&self.pool).await?;
        let mut created = 0;

        let mut seen = std::collections::BTreeSet::new();
        for row in &legacy {
            let key = match row.provider.as_deref() {
                Some(p) if !p.is_empty() => p,
                _ => continue,
            };
            if !seen.insert(key.to_string()) {
                continue;
            }
            let provider = match ProviderRepo::get_by_key(&self.pool, key).await? {
                Some(p) => p,
                None => {
                    warn!(provider = key, "legacy provider missing during assignment creation");
                    continue;
                }
            };

            for feature in provider.features() {
                let existing =
                    ProviderRepo::assignments_for_feature(&self.pool, &feature).await?;
                if existing.iter().any(|a| a.provider_id == provider.id) {
                    continue;
                }
                let priority = existing.iter().map(|a| a.priority).max().unwrap_or(0) + 1;
                ProviderRepo::insert_assignment(
                    &self.pool,
                    &NewFeatureAssignment {
                        feature: feature.clone(),
                        source_lang: None,
                        target_lang: None,
                        provider_key: provider.key.clone(),
                        priority,
                        max_retries: 2,
                        retry_delay_ms: 1000,
                        quality_score: 0.8,
                        is_default: existing.is_empty(),
                    },
                )
                .await?;
                created += 1;
            }
        }

        Ok(created)
    }

    /// Independent counting checks. Any failure leaves the run in `Failed`;
    /// completed steps stay intact and the run is re-invokable.
    async fn validate(&self) -> AppResult<i64> {
        let mut checks = 0;

        let legacy = LegacyConfigRepo::all(&self.pool).await?;
        let mut missing = Vec::new();
        let mut migrated_sensitive: i64 = 0;
        for row in legacy.iter().filter(|r| r.is_sensitive) {
            if SecretRepo::get_by_key(&self.pool, &row.key).await?.is_none() {
                missing.push(row.key.clone());
            } else {
                migrated_sensitive += 1;
            }
        }
        if !missing.is_empty() {
            return Err(AppError::validation(format!(
                "{} sensitive legacy rows have no migrated secret: {}",
                missing.len(),
                missing.join(", ")
            )));
        }
        checks += 1;

        // Count comparison against the store, in case the legacy table moved
        // under us between the snapshot read and now.
        let sensitive_legacy = LegacyConfigRepo::count_sensitive(&self.pool).await?;
        if sensitive_legacy != migrated_sensitive {
            return Err(AppError::validation(format!(
                "sensitive row count mismatch: {sensitive_legacy} legacy rows, {migrated_sensitive} migrated secrets"
            )));
        }
        checks += 1;

        let dangling_refs = SecretRepo::count_dangling_taxonomy_refs(&self.pool).await?;
        if dangling_refs > 0 {
            return Err(AppError::validation(format!(
                "{dangling_refs} secrets reference a missing category"
            )));
        }
        checks += 1;

        let dangling_assignments = ProviderRepo::count_dangling_assignments(&self.pool).await?;
        if dangling_assignments > 0 {
            return Err(AppError::validation(format!(
                "{dangling_assignments} assignments reference a missing provider"
            )));
        }
        checks += 1;

        let uncategorized = SecretRepo::count_uncategorized(&self.pool).await?;
        if uncategorized > 0 {
            // Flagged, not fatal. An operator reassigns these later.
            warn!(uncategorized, "migrated secrets left uncategorized");
        }

        Ok(checks)
    }

    /// Resolve a legacy free-text category (and provider as subcategory hint)
    /// against the taxonomy. An unresolved name flags the secret as
    /// uncategorized instead of dropping it.
    async fn resolve_legacy_category(
        &self,
        key: &str,
        category: Option<&str>,
        provider: Option<&str>,
    ) -> AppResult<(Option<i64>, Option<i64>)> {
        let name = match category {
            Some(c) if !c.is_empty() => c,
            _ => {
                warn!(key, "legacy row has no category, leaving uncategorized");
                return Ok((None, None));
            }
        };

        match self.taxonomy.resolve(name, provider).await? {
            CategoryMatch::Resolved {
                category_id,
                subcategory_id,
            } => Ok((Some(category_id), subcategory_id)),
            CategoryMatch::Unresolved(raw) => {
                warn!(key, category = %raw, "legacy category unresolved, leaving uncategorized");
                Ok((None, None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::queries::{setup_test_db, CategoryRepo};

    fn cipher() -> Arc<SecretCipher> {
        Arc::new(SecretCipher::new("test-master-key").unwrap())
    }

    async fn seed_legacy(pool: &DbPool) {
        LegacyConfigRepo::insert(
            pool,
            "OPENAI_API_KEY",
            "sk-legacy-value",
            Some("ai_services"),
            true,
            Some("openai"),
            Some("OpenAI API key"),
        )
        .await
        .unwrap();
        LegacyConfigRepo::insert(
            pool,
            "site_tagline",
            "Readings every day",
            Some("notifications"),
            false,
            None,
            None,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_full_run_migrates_legacy_rows() {
        let pool = setup_test_db().await;
        seed_legacy(&pool).await;

        let engine = MigrationEngine::new(pool.clone(), cipher());
        let outcome = engine.run().await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Complete);

        let secret = SecretRepo::get_by_key(&pool, "OPENAI_API_KEY")
            .await
            .unwrap()
            .expect("sensitive legacy row should be migrated");
        assert_eq!(secret.tier(), AccessTier::SuperAdmin);

        // Category resolved to ai_services, provider hint to its openai node.
        let ai = CategoryRepo::get_by_name(&pool, "ai_services").await.unwrap().unwrap();
        assert_eq!(secret.category_id, Some(ai.id));
        let openai = CategoryRepo::get_subcategory(&pool, ai.id, "openai")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(secret.subcategory_id, Some(openai.id));

        // A fresh cipher with the same master key recovers the plaintext.
        let decrypted = cipher().decrypt(&secret.encrypted_value, &secret.salt).unwrap();
        assert_eq!(decrypted, "sk-legacy-value");

        let setting = SecretRepo::get_by_key(&pool, "site_tagline")
            .await
            .unwrap()
            .expect("non-sensitive legacy row should be migrated as a setting");
        assert_eq!(setting.tier(), AccessTier::Public);
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let pool = setup_test_db().await;
        seed_legacy(&pool).await;

        let engine = MigrationEngine::new(pool.clone(), cipher());
        assert_eq!(engine.run().await.unwrap(), MigrationOutcome::Complete);

        let secrets_before = SecretRepo::count(&pool).await.unwrap();
        let providers_before = ProviderRepo::count_providers(&pool).await.unwrap();
        let assignments_before = ProviderRepo::count_assignments(&pool).await.unwrap();
        let categories_before = CategoryRepo::count(&pool).await.unwrap();

        assert_eq!(engine.run().await.unwrap(), MigrationOutcome::AlreadyComplete);

        assert_eq!(SecretRepo::count(&pool).await.unwrap(), secrets_before);
        assert_eq!(ProviderRepo::count_providers(&pool).await.unwrap(), providers_before);
        assert_eq!(ProviderRepo::count_assignments(&pool).await.unwrap(), assignments_before);
        assert_eq!(CategoryRepo::count(&pool).await.unwrap(), categories_before);

        // Second run's log rows are all skipped or completed with zero rows.
        let entries = MigrationLogRepo::all(&pool).await.unwrap();
        let second_run = &entries[entries.len() - MigrationStep::ALL.len()..];
        for entry in second_run {
            assert!(
                entry.status == "skipped" || (entry.status == "completed" && entry.rows_processed <= 4),
                "unexpected second-run entry: {entry:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_provider_rows_and_assignments_created() {
        let pool = setup_test_db().await;
        seed_legacy(&pool).await;

        let engine = MigrationEngine::new(pool.clone(), cipher());
        engine.run().await.unwrap();

        let provider = ProviderRepo::get_by_key(&pool, "openai").await.unwrap().unwrap();
        assert!(provider.features().contains(&"translate".to_string()));

        let translate = ProviderRepo::assignments_for_feature(&pool, "translate").await.unwrap();
        assert_eq!(translate.len(), 1);
        assert_eq!(translate[0].provider_id, provider.id);
        assert!(translate[0].is_default);
    }

    #[tokio::test]
    async fn test_case_insensitive_legacy_category_resolves() {
        let pool = setup_test_db().await;
        LegacyConfigRepo::insert(
            &pool,
            "STRIPE_SECRET_KEY",
            "sk_live_x",
            Some("Payments"),
            true,
            Some("stripe"),
            None,
        )
        .await
        .unwrap();

        let engine = MigrationEngine::new(pool.clone(), cipher());
        engine.run().await.unwrap();

        let secret = SecretRepo::get_by_key(&pool, "STRIPE_SECRET_KEY").await.unwrap().unwrap();
        let payments = CategoryRepo::get_by_name(&pool, "payments").await.unwrap().unwrap();
        assert_eq!(secret.category_id, Some(payments.id));
    }

    #[tokio::test]
    async fn test_unresolved_category_flags_not_drops() {
        let pool = setup_test_db().await;
        LegacyConfigRepo::insert(
            &pool,
            "MYSTERY_KEY",
            "v",
            Some("Misc Stuff"),
            true,
            None,
            None,
        )
        .await
        .unwrap();

        let engine = MigrationEngine::new(pool.clone(), cipher());
        let outcome = engine.run().await.unwrap();
        assert_eq!(outcome, MigrationOutcome::Complete);

        let secret = SecretRepo::get_by_key(&pool, "MYSTERY_KEY").await.unwrap().unwrap();
        assert_eq!(secret.category_id, None);
        assert_eq!(SecretRepo::count_uncategorized(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_first_step() {
        let pool = setup_test_db().await;
        seed_legacy(&pool).await;

        let engine = MigrationEngine::new(pool.clone(), cipher());
        engine.cancel_flag().store(true, Ordering::SeqCst);

        let result = engine.run().await;
        assert!(matches!(result, Err(AppError::MigrationBlocked(_))));
        assert_eq!(SecretRepo::count(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_validate_runs_every_check() {
        let pool = setup_test_db().await;
        seed_legacy(&pool).await;

        let engine = MigrationEngine::new(pool.clone(), cipher());
        engine.run().await.unwrap();

        // One sensitive legacy row, one migrated sensitive secret.
        assert_eq!(LegacyConfigRepo::count_sensitive(&pool).await.unwrap(), 1);

        let entries = MigrationLogRepo::all(&pool).await.unwrap();
        let validate = entries
            .iter()
            .rev()
            .find(|e| e.step == MigrationStep::Validate.name())
            .unwrap();
        assert_eq!(validate.status, "completed");
        assert_eq!(validate.rows_processed, 4);
    }

    #[tokio::test]
    async fn test_validation_failure_halts_without_complete() {
        let pool = setup_test_db().await;
        seed_legacy(&pool).await;

        let engine = MigrationEngine::new(pool.clone(), cipher());
        assert_eq!(engine.run().await.unwrap(), MigrationOutcome::Complete);

        // Orphan the assignments by removing their provider row.
        sqlx::query("DELETE FROM providers WHERE key = 'openai'")
            .execute(&pool)
            .await
            .unwrap();

        let outcome = engine.run().await.unwrap();
        assert_eq!(outcome, MigrationOutcome::ValidationFailed);
        assert_eq!(
            MigrationLogRepo::latest_status(&pool, MigrationStep::Validate.name())
                .await
                .unwrap(),
            Some(MigrationStepStatus::Failed)
        );
    }

    #[test]
    fn test_display_name_from_key() {
        assert_eq!(display_name_from_key("OPENAI_API_KEY"), "Openai Api Key");
        assert_eq!(display_name_from_key("site_tagline"), "Site Tagline");
    }
}
