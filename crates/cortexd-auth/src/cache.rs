//! The auth context attached to a request once a credential resolves.

use serde::{Deserialize, Serialize};

/// Identity and quota resolved from a presented credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    /// The tenant's user id.
    pub user_id: String,
    /// The tenant's project id.
    pub project_id: String,
    /// Scopes granted to this credential.
    pub scopes: Vec<String>,
    /// Requests allowed per window for this credential; carried through to
    /// whatever builds the rate limiter's per-identity key.
    pub rate_limit: u32,
}
