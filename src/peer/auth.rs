use async_trait::async_trait;
use tokio::sync::RwLock;

/// Authentication collaborator. The core never validates credentials; it
/// only asks who is signed in and whether the session is still valid.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn current_user(&self) -> Option<String>;

    async fn is_session_valid(&self) -> bool;
}

/// Fixed identity, switchable by hand
#[derive(Debug, Default)]
pub struct StaticAuth {
    user: RwLock<Option<String>>,
}

impl StaticAuth {
    pub fn signed_in(user: impl Into<String>) -> Self {
        Self {
            user: RwLock::new(Some(user.into())),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub async fn set_user(&self, user: Option<String>) {
        *self.user.write().await = user;
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn current_user(&self) -> Option<String> {
        self.user.read().await.clone()
    }

    async fn is_session_valid(&self) -> bool {
        self.user.read().await.is_some()
    }
}
