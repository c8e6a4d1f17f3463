//! Explicit registry of engine instances.

use crate::config::RepoConfig;
use crate::repo::Repo;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Maps `(app name, database url)` to a shared [`Repo`].
///
/// Owners create a registry and pass it where repos are needed; there is
/// no process-wide instance.
#[derive(Debug, Default)]
pub struct RepoRegistry {
    repos: Mutex<HashMap<(String, String), Arc<Repo>>>,
}

impl RepoRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the repo for `app` and the config's url, creating it with a
    /// transport from `connect` if needed.
    pub fn get_or_create<F>(&self, app: &str, config: RepoConfig, connect: F) -> Arc<Repo>
    where
        F: FnOnce(&RepoConfig) -> Arc<dyn Transport>,
    {
        let key = (app.to_string(), config.url());
        let mut repos = self.repos.lock();
        repos
            .entry(key)
            .or_insert_with(|| {
                debug!(app, url = %config.url(), "creating repo");
                let transport = connect(&config);
                Arc::new(Repo::new(config, transport))
            })
            .clone()
    }

    /// The repo registered for `app` and `url`.
    pub fn get(&self, app: &str, url: &str) -> Option<Arc<Repo>> {
        self.repos
            .lock()
            .get(&(app.to_string(), url.to_string()))
            .cloned()
    }

    /// Removes and interrupts the repo for `app` and `url`.
    pub fn remove(&self, app: &str, url: &str) -> Option<Arc<Repo>> {
        let repo = self
            .repos
            .lock()
            .remove(&(app.to_string(), url.to_string()))?;
        repo.interrupt();
        Some(repo)
    }

    /// Removes and interrupts every repo.
    pub fn clear(&self) {
        let drained: Vec<Arc<Repo>> = self.repos.lock().drain().map(|(_, repo)| repo).collect();
        for repo in drained {
            repo.interrupt();
        }
    }

    /// Number of registered repos.
    pub fn len(&self) -> usize {
        self.repos.lock().len()
    }

    /// Returns true if no repo is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
