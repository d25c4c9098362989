//! Read-only external catalogs: the agent registry and stage/role playbooks
//! (SPEC_FULL.md §3's "external, read-only" entities). Loaded the same way
//! `ConfigStore` loads its JSON layers: a file under the data directory,
//! missing-or-unparsable treated as empty rather than fatal.

use std::path::{Path, PathBuf};

use agenterm_types::{AgentConfig, Playbook};
use tokio::fs;

#[derive(Clone)]
pub struct AgentCatalog {
    agents: Vec<AgentConfig>,
}

impl AgentCatalog {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let agents = read_json_list(path.as_ref()).await.unwrap_or_default();
        Ok(Self { agents })
    }

    pub fn all(&self) -> &[AgentConfig] {
        &self.agents
    }

    pub fn get(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == id)
    }

    pub fn orchestrator_candidates(&self) -> Vec<&AgentConfig> {
        self.agents.iter().filter(|a| a.supports_orchestrator).collect()
    }
}

#[derive(Clone)]
pub struct PlaybookCatalog {
    playbooks: Vec<Playbook>,
}

impl PlaybookCatalog {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let playbooks = read_json_list(path.as_ref()).await.unwrap_or_default();
        Ok(Self { playbooks })
    }

    pub fn get(&self, id: &str) -> Option<&Playbook> {
        self.playbooks.iter().find(|p| p.id == id)
    }

    pub fn default_playbook(&self) -> Option<&Playbook> {
        self.playbooks.first()
    }
}

async fn read_json_list<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

pub fn default_agents_path(data_dir: &Path) -> PathBuf {
    data_dir.join("agents.json")
}

pub fn default_playbooks_path(data_dir: &Path) -> PathBuf {
    data_dir.join("playbooks.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_catalog_file_loads_as_empty() {
        let catalog = AgentCatalog::load("/nonexistent/agenterm-catalog-test.json").await.unwrap();
        assert!(catalog.all().is_empty());
    }

    #[tokio::test]
    async fn agent_catalog_round_trips_from_json() {
        let dir = std::env::temp_dir().join(format!("agenterm-catalog-test-{}", agenterm_types::new_id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("agents.json");
        tokio::fs::write(
            &path,
            r#"[{"id":"claude","name":"Claude","command":"claude","max_parallel_agents":3,"supports_orchestrator":true}]"#,
        )
        .await
        .unwrap();
        let catalog = AgentCatalog::load(&path).await.unwrap();
        assert_eq!(catalog.all().len(), 1);
        assert!(catalog.get("claude").is_some());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
