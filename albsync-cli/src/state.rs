//! JSON files the CLI reads and writes.

use std::path::Path;

use albsync_engine::cloud::LoadBalancerState;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tracing::debug;

/// Reads and parses a JSON file.
pub async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Reads a load balancer state file, starting empty when it does not exist.
pub async fn load_state(path: &Path, load_balancer_arn: Option<&str>) -> Result<LoadBalancerState> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let state: LoadBalancerState = load_json(path).await?;
        if let Some(arn) = load_balancer_arn.filter(|arn| *arn != state.arn) {
            anyhow::bail!(
                "{} describes load balancer {}, not {}",
                path.display(),
                state.arn,
                arn
            );
        }
        return Ok(state);
    }

    let arn = load_balancer_arn.with_context(|| {
        format!(
            "{} does not exist; pass --load-balancer-arn to start from scratch",
            path.display()
        )
    })?;
    debug!(path = %path.display(), "State file missing, starting empty");
    Ok(LoadBalancerState {
        arn: arn.to_string(),
        listeners: Vec::new(),
    })
}

/// Writes a load balancer state file.
pub async fn save_state(path: &Path, state: &LoadBalancerState) -> Result<()> {
    let content = serde_json::to_string_pretty(state).context("Failed to serialize state")?;
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use albsync_engine::cloud::ListenerState;
    use albsync_engine::{ListenerDescriptor, Protocol};

    fn state() -> LoadBalancerState {
        LoadBalancerState {
            arn: "arn:lb/app/test".to_string(),
            listeners: vec![ListenerState {
                listener: ListenerDescriptor {
                    arn: Some("arn:lb/app/test/listener/1".to_string()),
                    port: 80,
                    protocol: Protocol::Http,
                    certificate_arn: None,
                    default_target_group_arn: Some("arn:tg/web".to_string()),
                },
                rules: vec![],
            }],
        }
    }

    #[tokio::test]
    async fn test_save_then_load_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        save_state(&path, &state()).await.unwrap();
        let loaded = load_state(&path, None).await.unwrap();
        assert_eq!(loaded, state());
    }

    #[tokio::test]
    async fn test_missing_state_needs_arn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");

        assert!(load_state(&path, None).await.is_err());
        let state = load_state(&path, Some("arn:lb/app/new")).await.unwrap();
        assert_eq!(state.arn, "arn:lb/app/new");
        assert!(state.listeners.is_empty());
    }

    #[tokio::test]
    async fn test_state_for_other_load_balancer_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        save_state(&path, &state()).await.unwrap();

        let err = load_state(&path, Some("arn:lb/app/other")).await.unwrap_err();
        assert!(err.to_string().contains("arn:lb/app/other"));
    }

    #[tokio::test]
    async fn test_load_json_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let err = load_json::<LoadBalancerState>(&path).await.unwrap_err();
        assert!(err.to_string().contains("broken.json"));
    }
}
