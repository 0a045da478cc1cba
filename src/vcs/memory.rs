//! In-memory repository client for testing and embedding.
//!
//! Call counters make the resolver's caching observable in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Branch, RepositoryClient, Tag, BRANCH_REF_PREFIX, TAG_REF_PREFIX};
use crate::error::{EngineError, Result};
use crate::models::RepositoryRef;

#[derive(Debug, Default)]
struct RepositoryState {
    branches: Vec<Branch>,
    tags: Vec<Tag>,
    /// `(git ref, path)` → contents
    files: HashMap<(String, String), Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct InMemoryRepositoryClient {
    repositories: RwLock<HashMap<RepositoryRef, RepositoryState>>,
    branch_calls: AtomicUsize,
    default_branch_calls: AtomicUsize,
    tag_calls: AtomicUsize,
}

impl InMemoryRepositoryClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a branch; a default branch demotes the previous one
    pub fn add_branch(&self, repository: &RepositoryRef, name: &str, commit: &str, is_default: bool) {
        let mut repositories = self.repositories.write();
        let state = repositories.entry(repository.clone()).or_default();
        if is_default {
            for branch in &mut state.branches {
                branch.is_default = false;
            }
        }
        state.branches.retain(|b| b.name != name);
        state.branches.push(Branch {
            name: name.to_string(),
            latest_commit: commit.to_string(),
            is_default,
        });
    }

    pub fn add_tag(&self, repository: &RepositoryRef, name: &str, commit: &str) {
        let mut repositories = self.repositories.write();
        let state = repositories.entry(repository.clone()).or_default();
        state.tags.retain(|t| t.name != name);
        state.tags.push(Tag {
            name: name.to_string(),
            commit: commit.to_string(),
        });
    }

    pub fn add_file(&self, repository: &RepositoryRef, git_ref: &str, path: &str, contents: &[u8]) {
        self.repositories
            .write()
            .entry(repository.clone())
            .or_default()
            .files
            .insert((git_ref.to_string(), path.to_string()), contents.to_vec());
    }

    pub fn branch_calls(&self) -> usize {
        self.branch_calls.load(Ordering::SeqCst)
    }

    pub fn default_branch_calls(&self) -> usize {
        self.default_branch_calls.load(Ordering::SeqCst)
    }

    pub fn tag_calls(&self) -> usize {
        self.tag_calls.load(Ordering::SeqCst)
    }

    /// Total number of remote lookups served
    pub fn total_calls(&self) -> usize {
        self.branch_calls() + self.default_branch_calls() + self.tag_calls()
    }
}

#[async_trait]
impl RepositoryClient for InMemoryRepositoryClient {
    async fn get_branch(&self, repository: &RepositoryRef, name: &str) -> Result<Option<Branch>> {
        self.branch_calls.fetch_add(1, Ordering::SeqCst);
        let name = name.strip_prefix(BRANCH_REF_PREFIX).unwrap_or(name);
        let repositories = self.repositories.read();
        Ok(repositories
            .get(repository)
            .and_then(|state| state.branches.iter().find(|b| b.name == name))
            .cloned())
    }

    async fn get_default_branch(&self, repository: &RepositoryRef) -> Result<Branch> {
        self.default_branch_calls.fetch_add(1, Ordering::SeqCst);
        let repositories = self.repositories.read();
        repositories
            .get(repository)
            .and_then(|state| state.branches.iter().find(|b| b.is_default))
            .cloned()
            .ok_or_else(|| EngineError::Vcs(format!("no default branch for repository {repository}")))
    }

    async fn get_tag(&self, repository: &RepositoryRef, name: &str) -> Result<Option<Tag>> {
        self.tag_calls.fetch_add(1, Ordering::SeqCst);
        let name = name.strip_prefix(TAG_REF_PREFIX).unwrap_or(name);
        let repositories = self.repositories.read();
        Ok(repositories
            .get(repository)
            .and_then(|state| state.tags.iter().find(|t| t.name == name))
            .cloned())
    }

    async fn get_file_at_ref(
        &self,
        repository: &RepositoryRef,
        git_ref: &str,
        path: &str,
    ) -> Result<Vec<u8>> {
        let repositories = self.repositories.read();
        repositories
            .get(repository)
            .and_then(|state| state.files.get(&(git_ref.to_string(), path.to_string())))
            .cloned()
            .ok_or_else(|| EngineError::not_found("file", format!("{repository}:{git_ref}:{path}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> RepositoryRef {
        RepositoryRef::new("PROJ", "github", "ovh/app")
    }

    #[tokio::test]
    async fn test_branch_lookup_accepts_qualified_names() {
        let client = InMemoryRepositoryClient::new();
        client.add_branch(&repo(), "main", "abc123", true);
        client.add_branch(&repo(), "dev", "def456", false);

        let branch = client.get_branch(&repo(), "refs/heads/dev").await.unwrap().unwrap();
        assert_eq!(branch.latest_commit, "def456");
        assert_eq!(branch.git_ref(), "refs/heads/dev");
        assert!(client.get_branch(&repo(), "missing").await.unwrap().is_none());
        assert_eq!(client.branch_calls(), 2);
    }

    #[tokio::test]
    async fn test_default_branch_follows_latest_default() {
        let client = InMemoryRepositoryClient::new();
        client.add_branch(&repo(), "main", "abc123", true);
        client.add_branch(&repo(), "trunk", "fff000", true);

        let branch = client.get_default_branch(&repo()).await.unwrap();
        assert_eq!(branch.name, "trunk");

        let other = RepositoryRef::new("PROJ", "github", "ovh/none");
        assert!(matches!(
            client.get_default_branch(&other).await,
            Err(EngineError::Vcs(_))
        ));
    }

    #[tokio::test]
    async fn test_files_are_keyed_by_ref() {
        let client = InMemoryRepositoryClient::new();
        client.add_file(&repo(), "refs/heads/main", ".hatchery/actions/build.yml", b"name: build");
        let contents = client
            .get_file_at_ref(&repo(), "refs/heads/main", ".hatchery/actions/build.yml")
            .await
            .unwrap();
        assert_eq!(contents, b"name: build".to_vec());
        assert!(client
            .get_file_at_ref(&repo(), "refs/heads/dev", ".hatchery/actions/build.yml")
            .await
            .is_err());
    }
}
