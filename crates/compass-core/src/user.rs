//! Users referenced by assets as owners and as the author of a change.
//!
//! The asset subsystem only needs a small contract from user storage:
//! lookup by id or email and resolve-or-create by email.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{CompassError, InvalidError, Result};

/// A user known to Compass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub email: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl User {
    /// User carrying only an id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// User carrying only an email.
    pub fn with_email(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.email.is_empty() {
            return Err(InvalidError::Required("user email").into());
        }
        Ok(())
    }
}

/// Storage contract for users.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<User>;

    async fn get_by_email(&self, email: &str) -> Result<User>;

    /// Insert a new user and return its id. Fails with `AlreadyExists` on a
    /// duplicate email.
    async fn create(&self, user: &User) -> Result<String>;

    /// Return the id of the user with `user.email`, creating it when absent.
    async fn get_or_insert_by_email(&self, user: &User) -> Result<String>;
}

/// Resolves caller identities into user ids.
pub struct UserService {
    repository: Arc<dyn UserRepository>,
    provider: String,
}

impl UserService {
    pub fn new(repository: Arc<dyn UserRepository>, provider: impl Into<String>) -> Self {
        Self {
            repository,
            provider: provider.into(),
        }
    }

    /// Return the id of the user with `email`, creating the user when it
    /// does not exist yet.
    pub async fn validate_user(&self, email: &str) -> Result<String> {
        if email.is_empty() {
            return Err(CompassError::Invalid(InvalidError::Required("user email")));
        }

        let user = User {
            email: email.to_string(),
            provider: self.provider.clone(),
            ..Default::default()
        };
        self.repository
            .get_or_insert_by_email(&user)
            .await
            .inspect_err(|e| error!(email, error = %e, "Failed to resolve user"))
    }
}
