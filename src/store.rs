//! Secret store service: role-gated, audited read/write of encrypted secrets.
//!
//! Every path that reaches the crypto envelope goes through
//! `access::authorize` first, and the audit write shares the protected
//! operation's transaction, so an unlogged access cannot happen.

use crate::access::{authorize, Action, Principal};
use crate::config::AppConfig;
use crate::crypto::{hash_value, SecretCipher, ENCRYPTION_METHOD};
use crate::db::models::*;
use crate::db::queries::{AuditRepo, DbPool, SecretRepo};
use crate::error::{AppError, AppResult};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Time-boxed plaintext cache entry
#[derive(Clone)]
struct CacheEntry {
    plaintext: String,
    created_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() > ttl
    }
}

/// Short-lived read cache for frequently-read public/admin-tier secrets.
/// SuperAdmin-tier plaintext is never inserted here; it must not outlive the
/// call that requested it.
struct SecretCache {
    cache: DashMap<String, CacheEntry>,
    ttl: Duration,
    max_size: usize,
}

impl SecretCache {
    fn new(ttl_secs: u64, max_size: usize) -> Self {
        Self {
            cache: DashMap::new(),
            ttl: Duration::from_secs(ttl_secs),
            max_size,
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        let entry = self.cache.get(key)?;
        if entry.is_expired(self.ttl) {
            drop(entry);
            self.cache.remove(key);
            None
        } else {
            Some(entry.plaintext.clone())
        }
    }

    fn insert(&self, key: String, plaintext: String) {
        if self.cache.len() >= self.max_size {
            let expired: Vec<_> = self
                .cache
                .iter()
                .filter(|r| r.value().is_expired(self.ttl))
                .map(|r| r.key().clone())
                .collect();
            for k in expired {
                self.cache.remove(&k);
            }
        }
        if self.cache.len() < self.max_size {
            self.cache.insert(
                key,
                CacheEntry {
                    plaintext,
                    created_at: Instant::now(),
                },
            );
        }
    }

    fn invalidate(&self, key: &str) {
        self.cache.remove(key);
    }
}

/// Role-gated secret access service
pub struct SecretService {
    pool: DbPool,
    cipher: Arc<SecretCipher>,
    cache: SecretCache,
}

impl std::fmt::Debug for SecretService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretService").finish_non_exhaustive()
    }
}

impl SecretService {
    pub fn new(pool: DbPool, cipher: SecretCipher, config: &AppConfig) -> Self {
        Self {
            pool,
            cipher: Arc::new(cipher),
            cache: SecretCache::new(config.cache.ttl_secs, config.cache.max_size),
        }
    }

    /// Construct with explicit cache parameters (tests, embedded use)
    pub fn with_cache(pool: DbPool, cipher: SecretCipher, ttl_secs: u64, max_size: usize) -> Self {
        Self {
            pool,
            cipher: Arc::new(cipher),
            cache: SecretCache::new(ttl_secs, max_size),
        }
    }

    async fn load_visible(&self, key: &str, principal: &Principal) -> AppResult<Secret> {
        let secret = SecretRepo::get_by_key(&self.pool, key).await?;

        let secret = match secret {
            Some(s) => s,
            // A miss must read the same as an invisible tier: a caller who
            // cannot see every tier would otherwise learn which keys exist
            // by comparing NotFound against AccessDenied.
            None if principal.role < Role::SuperAdmin => return Err(AppError::AccessDenied),
            None => return Err(AppError::NotFound),
        };

        // A caller whose role cannot see the tier gets AccessDenied without
        // confirmation that the key exists.
        authorize(principal.role, secret.tier(), Action::Read)?;

        if !secret.is_active {
            return Err(AppError::NotFound);
        }

        Ok(secret)
    }

    /// Write the paired read+decrypt audit rows in one transaction. An audit
    /// failure aborts the access; the plaintext is not returned unlogged.
    async fn audit_access_pair(
        &self,
        secret_id: i64,
        accessed_by: Option<&str>,
        is_system: bool,
        kinds: (AccessKind, AccessKind),
    ) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        AuditRepo::log_access_tx(&mut *tx, secret_id, accessed_by, is_system, kinds.0, None).await?;
        AuditRepo::log_access_tx(&mut *tx, secret_id, accessed_by, is_system, kinds.1, None).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Get and decrypt a secret on behalf of a principal.
    ///
    /// Emits two audit rows per successful access: one for the read (knowing
    /// the secret exists) and one for the decrypt (seeing its value).
    pub async fn get(&self, key: &str, principal: &Principal) -> AppResult<String> {
        let secret = self.load_visible(key, principal).await?;
        authorize(principal.role, secret.tier(), Action::Decrypt)?;

        let cacheable = secret.tier() < AccessTier::SuperAdmin;

        if cacheable {
            if let Some(plaintext) = self.cache.get(key) {
                debug!(key, "secret cache hit");
                self.audit_access_pair(
                    secret.id,
                    Some(&principal.id),
                    false,
                    (AccessKind::Read, AccessKind::Decrypt),
                )
                .await?;
                return Ok(plaintext);
            }
        }

        let plaintext = self
            .cipher
            .decrypt(&secret.encrypted_value, &secret.salt)
            .map_err(|e| {
                error!(key, error = %e, "secret decryption failed - treating as security event");
                AppError::DecryptionFailed(e)
            })?;

        self.audit_access_pair(
            secret.id,
            Some(&principal.id),
            false,
            (AccessKind::Read, AccessKind::Decrypt),
        )
        .await?;

        if cacheable {
            self.cache.insert(key.to_string(), plaintext.clone());
        }

        Ok(plaintext)
    }

    /// Trusted-service access: bypasses the role check but is fully audited
    /// with `is_system_access = true` and a null principal.
    pub async fn get_system(&self, key: &str) -> AppResult<String> {
        let secret = SecretRepo::get_by_key(&self.pool, key)
            .await?
            .ok_or(AppError::NotFound)?;

        if !secret.is_active {
            return Err(AppError::NotFound);
        }

        let cacheable = secret.tier() < AccessTier::SuperAdmin;

        if cacheable {
            if let Some(plaintext) = self.cache.get(key) {
                self.audit_access_pair(
                    secret.id,
                    None,
                    true,
                    (AccessKind::SystemRead, AccessKind::SystemDecrypt),
                )
                .await?;
                return Ok(plaintext);
            }
        }

        let plaintext = self
            .cipher
            .decrypt(&secret.encrypted_value, &secret.salt)
            .map_err(|e| {
                error!(key, error = %e, "secret decryption failed - treating as security event");
                AppError::DecryptionFailed(e)
            })?;

        self.audit_access_pair(
            secret.id,
            None,
            true,
            (AccessKind::SystemRead, AccessKind::SystemDecrypt),
        )
        .await?;

        if cacheable {
            self.cache.insert(key.to_string(), plaintext.clone());
        }

        Ok(plaintext)
    }

    /// Update a secret's value. Restricted to the highest privilege tier
    /// regardless of the secret's own tier. The change log and the value
    /// update commit together; the plaintext is re-encrypted before it
    /// touches storage.
    pub async fn set(
        &self,
        key: &str,
        plaintext: &str,
        reason: &str,
        principal: &Principal,
    ) -> AppResult<()> {
        // Tier is irrelevant for writes; only the role matters.
        authorize(principal.role, AccessTier::Public, Action::Write)?;

        let secret = SecretRepo::get_by_key(&self.pool, key)
            .await?
            .ok_or(AppError::NotFound)?;

        if secret.is_required && plaintext.is_empty() {
            return Err(AppError::validation(format!(
                "secret '{}' is required and cannot be set to an empty value",
                key
            )));
        }

        // Old-value hash for the change log. A corrupted old value must not
        // block the fix; it is recorded as unknown.
        let old_hash = match self.cipher.decrypt(&secret.encrypted_value, &secret.salt) {
            Ok(old) => Some(hash_value(&old)),
            Err(e) => {
                warn!(key, error = %e, "old value undecryptable; change-logging without old hash");
                None
            }
        };
        let new_hash = hash_value(plaintext);

        let (encrypted_value, salt) = self.cipher.encrypt(plaintext)?;

        let mut tx = self.pool.begin().await?;
        SecretRepo::update_value_tx(&mut *tx, secret.id, &encrypted_value, &salt).await?;
        AuditRepo::log_change_tx(
            &mut *tx,
            secret.id,
            &principal.id,
            old_hash.as_deref(),
            &new_hash,
            reason,
            None,
        )
        .await?;
        tx.commit().await?;

        self.cache.invalidate(key);
        Ok(())
    }

    /// Create a new secret (administrator or migration tooling).
    pub async fn create(
        &self,
        new: &NewSecret,
        plaintext: &str,
        reason: &str,
        principal: &Principal,
    ) -> AppResult<Secret> {
        authorize(principal.role, AccessTier::Public, Action::Write)?;

        if SecretRepo::get_by_key(&self.pool, &new.key).await?.is_some() {
            return Err(AppError::validation(format!(
                "secret '{}' already exists",
                new.key
            )));
        }

        if new.is_required && plaintext.is_empty() {
            return Err(AppError::validation(format!(
                "secret '{}' is required and cannot be created with an empty value",
                new.key
            )));
        }

        let (encrypted_value, salt) = self.cipher.encrypt(plaintext)?;

        // The row and its change-log entry commit together; a failed audit
        // write leaves no secret behind.
        let mut tx = self.pool.begin().await?;
        let secret_id =
            SecretRepo::insert_tx(&mut *tx, new, &encrypted_value, &salt, ENCRYPTION_METHOD)
                .await?;
        AuditRepo::log_change_tx(
            &mut *tx,
            secret_id,
            &principal.id,
            None,
            &hash_value(plaintext),
            reason,
            None,
        )
        .await?;
        tx.commit().await?;

        SecretRepo::get_by_key(&self.pool, &new.key)
            .await?
            .ok_or_else(|| AppError::internal("Failed to retrieve created secret"))
    }

    /// Redacted audit export: metadata only (who/when/what-key/what-action),
    /// never encrypted values. The export itself is audited.
    pub async fn export_metadata(&self, principal: &Principal) -> AppResult<Vec<AuditExportRow>> {
        authorize(principal.role, AccessTier::Public, Action::Export)?;

        let rows = AuditRepo::export_metadata(&self.pool).await?;
        AuditRepo::log_export(&self.pool, &principal.id).await?;

        Ok(rows)
    }
}
