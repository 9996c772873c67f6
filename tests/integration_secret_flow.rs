//! End-to-end flows through the real store: taxonomy, encrypted secrets,
//! tiered access, audit rows, and the legacy migration.
//!
//! Unit tests cover each layer in isolation; this is where the layers are
//! exercised together against one database.

use std::sync::Arc;

use arcanum::access::Principal;
use arcanum::crypto::SecretCipher;
use arcanum::db::models::{AccessTier, NewCategory, NewSecret, NewSubcategory, Role};
use arcanum::db::queries::{
    init_db, AuditRepo, CategoryRepo, LegacyConfigRepo, ProviderRepo, SecretRepo,
};
use arcanum::error::AppError;
use arcanum::migration::{MigrationEngine, MigrationOutcome};
use arcanum::providers;
use arcanum::store::SecretService;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};

async fn mem_pool() -> Pool<Sqlite> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory database");
    init_db(&pool).await.expect("schema init");
    pool
}

fn service(pool: Pool<Sqlite>) -> SecretService {
    let cipher = SecretCipher::new("integration-master-key").unwrap();
    SecretService::with_cache(pool, cipher, 60, 64)
}

fn category(name: &str) -> NewCategory {
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

fn subcategory(name: &str) -> NewSubcategory {
    NewSubcategory {
        name: name.to_string(),
        label_en: name.to_string(),
        label_ar: name.to_string(),
        sort_order: 0,
        is_system: false,
    }
}

#[tokio::test]
async fn stripe_secret_full_lifecycle() {
    let pool = mem_pool().await;
    let svc = service(pool.clone());
    let super_admin = Principal::new("ops-1", Role::SuperAdmin);
    let admin = Principal::new("admin-1", Role::Admin);

    // Taxonomy first: payments -> stripe.
    let payments = CategoryRepo::create_category(&pool, &category("payments"))
        .await
        .unwrap();
    let stripe = CategoryRepo::create_subcategory(&pool, payments.id, &subcategory("stripe"))
        .await
        .unwrap();

    let new = NewSecret {
        key: "stripe_secret_key".to_string(),
        category_id: Some(payments.id),
        subcategory_id: Some(stripe.id),
        display_name: "Stripe Secret Key".to_string(),
        description: Some("Live-mode API key".to_string()),
        provider: Some("stripe".to_string()),
        access_tier: AccessTier::SuperAdmin,
        is_required: true,
        requires_restart: false,
        environment: "production".to_string(),
    };
    let secret = svc
        .create(&new, "sk_live_123", "initial provisioning", &super_admin)
        .await
        .unwrap();

    // Admin sees nothing at super_admin tier.
    let denied = svc.get("stripe_secret_key", &admin).await;
    assert!(matches!(denied, Err(AppError::AccessDenied)));

    // Super admin gets the plaintext back, with a read + decrypt audit pair.
    let before = AuditRepo::list_access(&pool, secret.id).await.unwrap().len();
    let value = svc.get("stripe_secret_key", &super_admin).await.unwrap();
    assert_eq!(value, "sk_live_123");

    let entries = AuditRepo::list_access(&pool, secret.id).await.unwrap();
    assert_eq!(entries.len(), before + 2);
    let kinds: Vec<&str> = entries[before..].iter().map(|e| e.access_kind.as_str()).collect();
    assert_eq!(kinds, vec!["read", "decrypt"]);

    // The denied admin read left no audit rows.
    assert_eq!(before, 0);
}

#[tokio::test]
async fn set_records_change_history_without_plaintext() {
    let pool = mem_pool().await;
    let svc = service(pool.clone());
    let super_admin = Principal::new("ops-1", Role::SuperAdmin);

    let new = NewSecret {
        key: "smtp_password".to_string(),
        category_id: None,
        subcategory_id: None,
        display_name: "SMTP Password".to_string(),
        description: None,
        provider: None,
        access_tier: AccessTier::Admin,
        is_required: true,
        requires_restart: false,
        environment: "production".to_string(),
    };
    let secret = svc.create(&new, "hunter2", "bootstrap", &super_admin).await.unwrap();

    svc.set("smtp_password", "correct-horse", "rotation", &super_admin)
        .await
        .unwrap();

    let changes = AuditRepo::list_changes(&pool, secret.id).await.unwrap();
    assert_eq!(changes.len(), 2);
    assert_eq!(changes[1].reason, "rotation");
    for change in &changes {
        assert_ne!(change.new_value_hash, "hunter2");
        assert_ne!(change.new_value_hash, "correct-horse");
        if let Some(old) = &change.old_value_hash {
            assert_ne!(old, "hunter2");
        }
    }

    // The new value round-trips.
    let value = svc.get("smtp_password", &super_admin).await.unwrap();
    assert_eq!(value, "correct-horse");
}

#[tokio::test]
async fn legacy_openai_key_migrates_and_serves() {
    let pool = mem_pool().await;

    LegacyConfigRepo::insert(
        &pool,
        "OPENAI_API_KEY",
        "sk-legacy",
        Some("ai_services"),
        true,
        Some("openai"),
        Some("OpenAI API key"),
    )
    .await
    .unwrap();

    let cipher = Arc::new(SecretCipher::new("integration-master-key").unwrap());
    let engine = MigrationEngine::new(pool.clone(), Arc::clone(&cipher));
    assert_eq!(engine.run().await.unwrap(), MigrationOutcome::Complete);

    // Exactly one migrated secret row for the sensitive legacy key.
    let secret = SecretRepo::get_by_key(&pool, "OPENAI_API_KEY")
        .await
        .unwrap()
        .expect("migrated secret");
    assert_eq!(secret.tier(), AccessTier::SuperAdmin);

    // Trusted-service path decrypts it and writes system audit rows.
    let svc = service(pool.clone());
    let value = svc.get_system("OPENAI_API_KEY").await.unwrap();
    assert_eq!(value, "sk-legacy");

    let entries = AuditRepo::list_access(&pool, secret.id).await.unwrap();
    let kinds: Vec<&str> = entries.iter().map(|e| e.access_kind.as_str()).collect();
    assert_eq!(kinds, vec!["system_read", "system_decrypt"]);
    assert!(entries.iter().all(|e| e.is_system_access));

    // Second migration run adds nothing.
    let count = SecretRepo::count(&pool).await.unwrap();
    assert_eq!(engine.run().await.unwrap(), MigrationOutcome::AlreadyComplete);
    assert_eq!(SecretRepo::count(&pool).await.unwrap(), count);
}

#[tokio::test]
async fn migrated_providers_resolve_in_priority_order() {
    let pool = mem_pool().await;

    LegacyConfigRepo::insert(
        &pool,
        "OPENAI_API_KEY",
        "sk-a",
        Some("ai_services"),
        true,
        Some("openai"),
        None,
    )
    .await
    .unwrap();
    LegacyConfigRepo::insert(
        &pool,
        "GOOGLE_TRANSLATE_KEY",
        "g-b",
        Some("ai_services"),
        true,
        Some("google"),
        None,
    )
    .await
    .unwrap();

    let cipher = Arc::new(SecretCipher::new("integration-master-key").unwrap());
    let engine = MigrationEngine::new(pool.clone(), cipher);
    engine.run().await.unwrap();

    let candidates = providers::resolve(&pool, "translate", "en", "ar").await.unwrap();
    assert_eq!(candidates.len(), 2);
    // Priority ascending; the first-assigned provider is the default.
    assert!(candidates[0].priority < candidates[1].priority);
    assert!(candidates[0].is_default);
    assert!(!candidates[1].is_default);

    let openai = ProviderRepo::get_by_key(&pool, "openai").await.unwrap().unwrap();
    assert_eq!(candidates[0].provider_id, openai.id);
}
