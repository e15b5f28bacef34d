//! JWT claims accepted on observer connections.

use serde::{Deserialize, Serialize};

/// Claims carried by an observer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (operator id).
    pub sub: String,
    /// Issued at (unix timestamp).
    #[serde(default)]
    pub iat: i64,
    /// Expiration (unix timestamp).
    pub exp: i64,
}

impl Claims {
    /// Operator id when the subject is numeric.
    pub fn operator_id(&self) -> Option<i64> {
        self.sub.parse().ok()
    }
}
