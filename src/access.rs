//! Role-based access policy.
//!
//! `authorize` is the only place policy logic lives; every call site that can
//! reach the crypto envelope (read, decrypt, write, export) routes through
//! it, so policy cannot drift between code paths. The storage layer carries
//! no ambient privilege of its own.

use crate::db::models::{AccessTier, Role};
use crate::error::{AppError, AppResult};

/// Action a principal wants to perform on a secret
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    Decrypt,
    Write,
    Export,
}

/// An already-authenticated caller. Authentication happens upstream; this
/// subsystem only trusts the role it is handed.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
    pub role: Role,
}

impl Principal {
    pub fn new<S: Into<String>>(id: S, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

/// Can `role` perform `action` on a secret of `tier`?
///
/// Visibility is monotonic (public <= admin <= super_admin). Writes always
/// require the highest privilege tier regardless of the secret's own tier.
/// Export requires admin or above.
pub fn authorize(role: Role, tier: AccessTier, action: Action) -> AppResult<()> {
    let allowed = match action {
        Action::Read | Action::Decrypt => role.visibility() >= tier,
        Action::Write => role == Role::SuperAdmin,
        Action::Export => role >= Role::Admin,
    };

    if allowed {
        Ok(())
    } else {
        Err(AppError::AccessDenied)
    }
}
