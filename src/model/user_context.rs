use serde::{Deserialize, Serialize};

/// The user performing a publish; its id is recorded as the release's `released_by`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    pub user_email: Option<String>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_email: None,
        }
    }

    pub fn with_email(user_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_email: Some(email.into()),
        }
    }

    /// Actor for bootstrap and seeding
    pub fn system() -> Self {
        Self::with_email("system", "system@releases.internal")
    }

    pub fn released_by(&self) -> String {
        self.user_id.clone()
    }
}
