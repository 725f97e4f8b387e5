use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity attached to every outgoing batch.
///
/// The session id is regenerated each time the coordinating process cold
/// starts; the user id is generated once and persisted so it stays stable
/// across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdentity {
    pub session_id: String,
    pub user_id: String,
}

impl SessionIdentity {
    pub fn new(user_id: String) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            user_id,
        }
    }
}

/// Generate a fresh pseudonymous user id for first-run persistence.
pub fn generate_user_id() -> String {
    format!("user-{}", Uuid::new_v4())
}
