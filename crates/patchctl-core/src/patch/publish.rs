//! Publishing committed patch branches.

use async_trait::async_trait;

use crate::error::Result;
use crate::git::GitCli;

/// Makes a committed branch visible outside the local repository.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, git: &GitCli, branch: &str) -> Result<()>;
}

/// `git push -u <remote> <branch>`.
#[derive(Debug, Clone)]
pub struct GitPushPublisher {
    remote: String,
}

impl GitPushPublisher {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
        }
    }
}

#[async_trait]
impl Publisher for GitPushPublisher {
    async fn publish(&self, git: &GitCli, branch: &str) -> Result<()> {
        tracing::info!(remote = %self.remote, branch = %branch, "pushing patch branch");
        git.push(&self.remote, branch).await
    }
}
