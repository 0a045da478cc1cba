//! # Repository Client
//!
//! Read-only VCS capability used while crafting: branch, tag and default
//! branch lookups, and file contents at a ref. The engine never mutates VCS
//! state.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::RepositoryRef;

pub use memory::InMemoryRepositoryClient;

pub const BRANCH_REF_PREFIX: &str = "refs/heads/";
pub const TAG_REF_PREFIX: &str = "refs/tags/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// Short name, e.g. `main`
    pub name: String,
    pub latest_commit: String,
    pub is_default: bool,
}

impl Branch {
    /// Fully qualified ref, e.g. `refs/heads/main`
    pub fn git_ref(&self) -> String {
        format!("{BRANCH_REF_PREFIX}{}", self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub commit: String,
}

impl Tag {
    pub fn git_ref(&self) -> String {
        format!("{TAG_REF_PREFIX}{}", self.name)
    }
}

/// VCS lookups for one repository server.
///
/// Branch and tag names are accepted either short or fully qualified.
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    async fn get_branch(&self, repository: &RepositoryRef, name: &str) -> Result<Option<Branch>>;

    async fn get_default_branch(&self, repository: &RepositoryRef) -> Result<Branch>;

    async fn get_tag(&self, repository: &RepositoryRef, name: &str) -> Result<Option<Tag>>;

    async fn get_file_at_ref(
        &self,
        repository: &RepositoryRef,
        git_ref: &str,
        path: &str,
    ) -> Result<Vec<u8>>;
}
