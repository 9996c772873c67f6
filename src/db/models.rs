use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Access tier gating who may read/decrypt a secret.
/// Ordering is the visibility order: Public < Admin < SuperAdmin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessTier {
    Public,
    Admin,
    SuperAdmin,
}

impl AccessTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Admin => "admin",
            Self::SuperAdmin => "super_admin",
        }
    }

    /// Unknown tier strings fail closed to the most restrictive tier.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "public" => Self::Public,
            "admin" => Self::Admin,
            _ => Self::SuperAdmin,
        }
    }
}

impl std::fmt::Display for AccessTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Role of an already-authenticated principal. Identity and authentication
/// are external; this subsystem only consumes the role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    SuperAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::SuperAdmin => "super_admin",
        }
    }

    /// Unknown role strings fail closed to the least privileged role.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "super_admin" => Self::SuperAdmin,
            "admin" => Self::Admin,
            _ => Self::User,
        }
    }

    /// Highest tier this role may see.
    pub fn visibility(&self) -> AccessTier {
        match self {
            Self::User => AccessTier::Public,
            Self::Admin => AccessTier::Admin,
            Self::SuperAdmin => AccessTier::SuperAdmin,
        }
    }
}

/// A named, encrypted configuration value
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Secret {
    pub id: i64,
    pub key: String,
    pub category_id: Option<i64>,
    pub subcategory_id: Option<i64>,
    pub encrypted_value: String,
    pub salt: String,
    pub encryption_method: String,
    pub display_name: String,
    pub description: Option<String>,
    pub provider: Option<String>,
    pub access_tier: String,
    pub is_required: bool,
    pub requires_restart: bool,
    pub last_tested_at: Option<DateTime<Utc>>,
    pub test_status: Option<String>,
    pub is_active: bool,
    pub environment: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Secret {
    pub fn tier(&self) -> AccessTier {
        AccessTier::from_str(&self.access_tier)
    }
}

/// New secret creation request. The plaintext value travels separately and
/// is encrypted before it reaches the insert.
#[derive(Debug, Clone)]
pub struct NewSecret {
    pub key: String,
    pub category_id: Option<i64>,
    pub subcategory_id: Option<i64>,
    pub display_name: String,
    pub description: Option<String>,
    pub provider: Option<String>,
    pub access_tier: AccessTier,
    pub is_required: bool,
    pub requires_restart: bool,
    pub environment: String,
}

/// Top-level taxonomy node
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub label_en: String,
    pub label_ar: String,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub sort_order: i64,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCategory {
    pub name: String,
    pub label_en: String,
    pub label_ar: String,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub sort_order: i64,
    pub is_system: bool,
}

/// Second-level taxonomy node; the parent category is fixed at creation
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Subcategory {
    pub id: i64,
    pub category_id: i64,
    pub name: String,
    pub label_en: String,
    pub label_ar: String,
    pub sort_order: i64,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSubcategory {
    pub name: String,
    pub label_en: String,
    pub label_ar: String,
    pub sort_order: i64,
    pub is_system: bool,
}

/// Kind of audited access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Read,
    Decrypt,
    Export,
    SystemRead,
    SystemDecrypt,
}

impl AccessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Decrypt => "decrypt",
            Self::Export => "export",
            Self::SystemRead => "system_read",
            Self::SystemDecrypt => "system_decrypt",
        }
    }
}

/// Immutable access-log row. Never updated or deleted; the sole source of
/// truth for "who accessed what, when".
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SecretAccessLog {
    pub id: i64,
    pub secret_id: i64,
    /// Null for system (service-to-service) access
    pub accessed_by: Option<String>,
    pub is_system_access: bool,
    pub access_kind: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Immutable change-log row carrying old/new value hashes, never plaintext.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SecretChangeLog {
    pub id: i64,
    pub secret_id: i64,
    pub changed_by: String,
    pub old_value_hash: Option<String>,
    pub new_value_hash: String,
    pub reason: String,
    /// Approval reference for changes requiring dual control
    pub approval_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Redacted audit metadata for export tooling: who/when/what-key/what-action.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AuditExportRow {
    pub secret_key: String,
    pub access_kind: String,
    pub accessed_by: Option<String>,
    pub is_system_access: bool,
    pub created_at: DateTime<Utc>,
}

/// External provider (LLM, translation, TTS, ...)
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Provider {
    pub id: i64,
    pub key: String,
    pub category: String,
    /// JSON array of language codes, e.g., ["en", "ar"]
    pub supported_languages: String,
    /// JSON array of feature names, e.g., ["translate", "tts"]
    pub supported_features: String,
    pub rate_limit_per_minute: Option<i64>,
    pub health_status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Provider {
    pub fn languages(&self) -> Vec<String> {
        serde_json::from_str(&self.supported_languages).unwrap_or_default()
    }

    pub fn features(&self) -> Vec<String> {
        serde_json::from_str(&self.supported_features).unwrap_or_default()
    }

    /// Whether this provider can serve the given language pair.
    pub fn supports_pair(&self, source_lang: &str, target_lang: &str) -> bool {
        let langs = self.languages();
        langs.iter().any(|l| l == source_lang) && langs.iter().any(|l| l == target_lang)
    }
}

#[derive(Debug, Clone)]
pub struct NewProvider {
    pub key: String,
    pub category: String,
    pub supported_languages: Vec<String>,
    pub supported_features: Vec<String>,
    pub rate_limit_per_minute: Option<i64>,
}

/// Priority-ordered binding of a feature to a provider with failover
/// parameters.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct FeatureAssignment {
    pub id: i64,
    pub feature: String,
    pub source_lang: Option<String>,
    pub target_lang: Option<String>,
    pub provider_id: i64,
    pub priority: i64,
    pub max_retries: i64,
    pub retry_delay_ms: i64,
    pub quality_score: f64,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewFeatureAssignment {
    pub feature: String,
    pub source_lang: Option<String>,
    pub target_lang: Option<String>,
    pub provider_key: String,
    pub priority: i64,
    pub max_retries: i64,
    pub retry_delay_ms: i64,
    pub quality_score: f64,
    pub is_default: bool,
}

/// Status of one migration step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStepStatus {
    Started,
    Completed,
    Failed,
    Skipped,
}

impl MigrationStepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "started" => Some(Self::Started),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    /// A step counts as done when its latest run completed or was skipped.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// Durable per-step migration log row
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct MigrationLogEntry {
    pub id: i64,
    pub step: String,
    pub status: String,
    pub rows_processed: i64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Row of the legacy flat configuration table being normalized away.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LegacyConfigRow {
    pub id: i64,
    pub key: String,
    pub value: String,
    /// Free-text category name, resolved through the taxonomy during
    /// migration (exact match first, then case-insensitive)
    pub category: Option<String>,
    pub is_sensitive: bool,
    pub provider: Option<String>,
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- AccessTier tests ---

    #[test]
    fn test_tier_ordering_is_monotonic() {
        assert!(AccessTier::Public < AccessTier::Admin);
        assert!(AccessTier::Admin < AccessTier::SuperAdmin);
    }

    #[test]
    fn test_tier_round_trip() {
        for tier in [AccessTier::Public, AccessTier::Admin, AccessTier::SuperAdmin] {
            assert_eq!(AccessTier::from_str(tier.as_str()), tier);
        }
    }

    #[test]
    fn test_unknown_tier_fails_closed() {
        assert_eq!(AccessTier::from_str("banana"), AccessTier::SuperAdmin);
        assert_eq!(AccessTier::from_str(""), AccessTier::SuperAdmin);
    }

    #[test]
    fn test_tier_case_insensitive() {
        assert_eq!(AccessTier::from_str("PUBLIC"), AccessTier::Public);
        assert_eq!(AccessTier::from_str("Admin"), AccessTier::Admin);
    }

    // --- Role tests ---

    #[test]
    fn test_unknown_role_fails_closed() {
        assert_eq!(Role::from_str("root"), Role::User);
        assert_eq!(Role::from_str(""), Role::User);
    }

    #[test]
    fn test_role_visibility() {
        assert_eq!(Role::User.visibility(), AccessTier::Public);
        assert_eq!(Role::Admin.visibility(), AccessTier::Admin);
        assert_eq!(Role::SuperAdmin.visibility(), AccessTier::SuperAdmin);
    }

    // --- Provider tests ---

    fn provider_with_langs(langs: &str) -> Provider {
        Provider {
            id: 1,
            key: "google_translate".to_string(),
            category: "translation".to_string(),
            supported_languages: langs.to_string(),
            supported_features: r#"["translate"]"#.to_string(),
            rate_limit_per_minute: None,
            health_status: "healthy".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_provider_supports_pair() {
        let p = provider_with_langs(r#"["en","ar","fr"]"#);
        assert!(p.supports_pair("en", "ar"));
        assert!(!p.supports_pair("en", "ja"));
    }

    #[test]
    fn test_provider_invalid_json_defaults() {
        let p = provider_with_langs("not json");
        assert!(p.languages().is_empty());
        assert!(!p.supports_pair("en", "ar"));
    }

    // --- MigrationStepStatus tests ---

    #[test]
    fn test_step_status_round_trip() {
        for s in [
            MigrationStepStatus::Started,
            MigrationStepStatus::Completed,
            MigrationStepStatus::Failed,
            MigrationStepStatus::Skipped,
        ] {
            assert_eq!(MigrationStepStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(MigrationStepStatus::from_str("unknown"), None);
    }

    #[test]
    fn test_step_status_is_done() {
        assert!(MigrationStepStatus::Completed.is_done());
        assert!(MigrationStepStatus::Skipped.is_done());
        assert!(!MigrationStepStatus::Started.is_done());
        assert!(!MigrationStepStatus::Failed.is_done());
    }

    // --- Secret tier accessor ---

    #[test]
    fn test_secret_tier_accessor() {
        let secret = Secret {
            id: 1,
            key: "openai_api_key".to_string(),
            category_id: Some(1),
            subcategory_id: None,
            encrypted_value: "ct".to_string(),
            salt: "s".to_string(),
            encryption_method: "chacha20poly1305.v1".to_string(),
            display_name: "OpenAI API Key".to_string(),
            description: None,
            provider: Some("openai".to_string()),
            access_tier: "admin".to_string(),
            is_required: true,
            requires_restart: false,
            last_tested_at: None,
            test_status: None,
            is_active: true,
            environment: "production".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(secret.tier(), AccessTier::Admin);
    }
}
