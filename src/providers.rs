//! Provider routing: maps abstract features ("translate", "tts", "llm") to
//! ordered provider candidates with failover parameters.
//!
//! Resolution only orders candidates; invoking the actual provider is the
//! integration's job. `run_with_failover` is the shared walking loop so every
//! integration honors retry budgets the same way.

use crate::db::models::FeatureAssignment;
use crate::db::queries::{DbPool, ProviderRepo};
use crate::error::{AppError, AppResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// One entry in the ordered failover list for a feature.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCandidate {
    pub provider_id: i64,
    pub provider_key: String,
    pub priority: i64,
    pub quality_score: f64,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub is_default: bool,
}

fn pair_matches(assignment: &FeatureAssignment, source_lang: &str, target_lang: &str) -> bool {
    // A NULL language on the assignment is a wildcard.
    let source_ok = assignment
        .source_lang
        .as_deref()
        .map_or(true, |l| l == source_lang);
    let target_ok = assignment
        .target_lang
        .as_deref()
        .map_or(true, |l| l == target_lang);
    source_ok && target_ok
}

/// Resolve the ordered candidate list for a feature and language pair.
///
/// Candidates are filtered to assignments whose language constraints and
/// provider capabilities cover the pair, then ordered by priority ascending
/// and quality score descending. An empty list is a valid result; the caller
/// decides whether that is an error for its feature.
pub async fn resolve(
    pool: &DbPool,
    feature: &str,
    source_lang: &str,
    target_lang: &str,
) -> AppResult<Vec<ProviderCandidate>> {
    let assignments = ProviderRepo::assignments_for_feature(pool, feature).await?;

    let mut candidates = Vec::with_capacity(assignments.len());
    for assignment in &assignments {
        if !pair_matches(assignment, source_lang, target_lang) {
            continue;
        }
        let provider = match ProviderRepo::get_by_id(pool, assignment.provider_id).await? {
            Some(p) => p,
            None => {
                warn!(
                    feature,
                    provider_id = assignment.provider_id,
                    "assignment references a missing provider; skipping"
                );
                continue;
            }
        };
        if !provider.supports_pair(source_lang, target_lang) {
            continue;
        }
        candidates.push(ProviderCandidate {
            provider_id: provider.id,
            provider_key: provider.key,
            priority: assignment.priority,
            quality_score: assignment.quality_score,
            max_retries: assignment.max_retries.max(0) as u32,
            retry_delay: Duration::from_millis(assignment.retry_delay_ms.max(0) as u64),
            is_default: assignment.is_default,
        });
    }

    candidates.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(b.quality_score.total_cmp(&a.quality_score))
    });

    debug!(
        feature,
        source_lang,
        target_lang,
        candidates = candidates.len(),
        "resolved provider candidates"
    );
    Ok(candidates)
}

/// Walk a candidate list, retrying each candidate up to its own budget
/// before advancing to the next. Exhausting the list is terminal.
pub async fn run_with_failover<T, F, Fut>(
    feature: &str,
    candidates: &[ProviderCandidate],
    mut attempt: F,
) -> AppResult<T>
where
    F: FnMut(ProviderCandidate) -> Fut,
    Fut: Future<Output = AppResult<T>>,
{
    if candidates.is_empty() {
        return Err(AppError::validation(format!(
            "no provider candidates for feature '{feature}'"
        )));
    }

    let mut last_error = None;
    for candidate in candidates {
        let attempts = candidate.max_retries + 1;
        for n in 0..attempts {
            match attempt(candidate.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    warn!(
                        feature,
                        provider = %candidate.provider_key,
                        attempt = n + 1,
                        error = %err,
                        "provider attempt failed"
                    );
                    last_error = Some(err);
                    if n + 1 < attempts && !candidate.retry_delay.is_zero() {
                        tokio::time::sleep(candidate.retry_delay).await;
                    }
                }
            }
        }
    }

    match last_error {
        Some(err) => Err(err),
        None => Err(AppError::internal(format!(
            "provider list for '{feature}' exhausted without an error"
        ))),
    }
}
