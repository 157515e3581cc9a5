//! Port Forward Manager.
//!
//! Host port (range) to guest port rules. No two rules of the same protocol
//! may claim a common host port. Rules are programmed through the
//! [`HostNetwork`] collaborator and saved as JSON after every change so the
//! daemon can re-apply them at start.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use virtpanel_hypervisor::HostNetwork;

use crate::command::AddPortForward;
use crate::dispatch::{Dispatcher, Target};
use crate::error::{CoreError, EntityKind, Result};
use crate::locks::{EntityKey, EntityLocks};
use crate::model::PortForwardRule;

fn persistence_error(path: &Path, source: io::Error) -> CoreError {
    CoreError::Persistence {
        path: path.to_path_buf(),
        source,
    }
}

pub struct PortForwardManager {
    host_network: Arc<dyn HostNetwork>,
    locks: Arc<EntityLocks>,
    dispatcher: Arc<Dispatcher>,
    /// `None` keeps rules in memory only
    state_path: Option<PathBuf>,
    /// Creation order
    rules: RwLock<Vec<PortForwardRule>>,
}

impl PortForwardManager {
    pub fn new(
        host_network: Arc<dyn HostNetwork>,
        locks: Arc<EntityLocks>,
        dispatcher: Arc<Dispatcher>,
        state_path: Option<PathBuf>,
    ) -> Self {
        Self {
            host_network,
            locks,
            dispatcher,
            state_path,
            rules: RwLock::new(Vec::new()),
        }
    }

    pub async fn list(&self) -> Vec<PortForwardRule> {
        self.rules.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Result<PortForwardRule> {
        self.rules
            .read()
            .await
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| CoreError::not_found(EntityKind::PortForward, id))
    }

    /// Add a rule. Fails with `Conflict` naming the existing rule when the
    /// host range overlaps one of the same protocol.
    #[instrument(skip(self, cmd, cancel), fields(rule = %cmd.forward))]
    pub async fn add(&self, cmd: AddPortForward, cancel: &CancellationToken) -> Result<PortForwardRule> {
        let _guard = self.locks.lock(EntityKey::PortForwards).await;

        if let Some(existing) = self
            .rules
            .read()
            .await
            .iter()
            .find(|r| r.forward.overlaps(&cmd.forward))
        {
            return Err(CoreError::conflict(
                EntityKind::PortForward,
                cmd.forward.to_string(),
                "add",
                format!("overlaps rule {} ({})", existing.id, existing.forward),
            ));
        }

        let rule = PortForwardRule {
            id: Uuid::new_v4().to_string(),
            forward: cmd.forward,
            comment: cmd.comment,
            created_at: Utc::now(),
        };
        self.apply(&rule, cancel).await?;

        let mut rules = self.rules.write().await;
        rules.push(rule.clone());
        if let Err(e) = self.save(&rules).await {
            rules.pop();
            drop(rules);
            if let Err(cleanup) = self.remove(&rule, &CancellationToken::new()).await {
                warn!(id = %rule.id, error = %cleanup, "Failed to remove unsaved port forward from host");
            }
            return Err(e);
        }
        info!(id = %rule.id, "Port forward added");
        Ok(rule)
    }

    /// Remove a rule by id. Unknown ids are `NotFound`. When the host
    /// refuses the removal, or the shortened list cannot be saved, the rule
    /// is kept on the host and in the list.
    #[instrument(skip(self, cancel), fields(id = %id))]
    pub async fn delete(&self, id: &str, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.locks.lock(EntityKey::PortForwards).await;
        let rule = self.get(id).await?;
        self.remove(&rule, cancel).await?;

        let mut rules = self.rules.write().await;
        let remaining: Vec<PortForwardRule> = rules.iter().filter(|r| r.id != id).cloned().collect();
        if let Err(e) = self.save(&remaining).await {
            drop(rules);
            if let Err(restore) = self.apply(&rule, &CancellationToken::new()).await {
                warn!(id = %rule.id, error = %restore, "Failed to re-apply unsaved port forward removal");
            }
            return Err(e);
        }
        *rules = remaining;
        info!(rule = %rule.forward, "Port forward deleted");
        Ok(())
    }

    /// Load the saved rules and program them on the host. Returns how many
    /// were applied; rules the host refuses are kept and logged.
    pub async fn restore(&self) -> Result<usize> {
        let Some(path) = &self.state_path else {
            return Ok(0);
        };
        let _guard = self.locks.lock(EntityKey::PortForwards).await;

        let json = match tokio::fs::read_to_string(path).await {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No saved port forwards");
                return Ok(0);
            }
            Err(e) => return Err(persistence_error(path, e)),
        };
        let saved: Vec<PortForwardRule> = serde_json::from_str(&json)
            .map_err(|e| persistence_error(path, io::Error::new(io::ErrorKind::InvalidData, e)))?;

        let mut applied = 0;
        for rule in &saved {
            match self.apply(rule, &CancellationToken::new()).await {
                Ok(()) => applied += 1,
                Err(e) => warn!(id = %rule.id, rule = %rule.forward, error = %e, "Failed to restore port forward"),
            }
        }
        info!(path = %path.display(), saved = saved.len(), applied, "Port forwards restored");
        *self.rules.write().await = saved;
        Ok(applied)
    }

    async fn apply(&self, rule: &PortForwardRule, cancel: &CancellationToken) -> Result<()> {
        let host = self.host_network.clone();
        let (id, forward) = (rule.id.clone(), rule.forward.clone());
        self.dispatcher
            .call(Target::new(EntityKind::PortForward, &rule.id), "apply", cancel, async move {
                host.apply_port_forward(&id, &forward).await
            })
            .await
    }

    async fn remove(&self, rule: &PortForwardRule, cancel: &CancellationToken) -> Result<()> {
        let host = self.host_network.clone();
        let (id, forward) = (rule.id.clone(), rule.forward.clone());
        self.dispatcher
            .call(Target::new(EntityKind::PortForward, &rule.id), "remove", cancel, async move {
                host.remove_port_forward(&id, &forward).await
            })
            .await
    }

    /// Write the rules next to the state file, then move them over it.
    async fn save(&self, rules: &[PortForwardRule]) -> Result<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(rules)
            .map_err(|e| persistence_error(path, io::Error::new(io::ErrorKind::InvalidData, e)))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| persistence_error(path, e))?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| persistence_error(path, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| persistence_error(path, e))?;
        debug!(path = %path.display(), count = rules.len(), "Port forwards saved");
        Ok(())
    }
}
