//! Git-hosted static file transport.
//!
//! Each publish re-runs the full sequence on a local clone of the content
//! repository: pull, prune stale audio, copy, stage, commit, push. The
//! sequence is idempotent, so a half-finished earlier attempt (staged but
//! not committed, committed but not pushed) is healed by simply running it
//! again. The CDN may serve cached copies, so every address carries a fresh
//! cache-busting stamp.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use super::{Backend, PublishResult, Transport};
use crate::artifact::Artifact;
use crate::config::RemotePublishConfig;
use crate::error::{PublishError, SetupError};
use crate::process::{args, CommandRunner};

pub struct RemotePublish {
    config: RemotePublishConfig,
    runner: Arc<dyn CommandRunner>,
    stale: Option<Regex>,
    last_stamp: i64,
}

impl RemotePublish {
    pub fn new(config: RemotePublishConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let stale = match Regex::new(&config.stale_pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("Invalid stale_pattern '{}': {e}, stale files will not be pruned", config.stale_pattern);
                None
            }
        };
        Self {
            config,
            runner,
            stale,
            last_stamp: 0,
        }
    }

    async fn git(&self, step: &'static str, argv: Vec<String>, cwd: Option<&Path>) -> Result<(), PublishError> {
        let output = self
            .runner
            .run("git", &argv, cwd)
            .await
            .map_err(|e| PublishError::step(step, format!("cannot run git: {e}")))?;
        if !output.success() {
            return Err(PublishError::step(step, output.failure_detail()));
        }
        Ok(())
    }

    async fn ensure_clone(&self) -> Result<(), PublishError> {
        if self.config.clone_dir.join(".git").exists() {
            return Ok(());
        }
        info!("Cloning {} into {}...", self.config.repo_url, self.config.clone_dir.display());
        let argv = args([
            "clone".to_string(),
            self.config.repo_url.clone(),
            self.config.clone_dir.to_string_lossy().into_owned(),
        ]);
        self.git("clone", argv, None).await
    }

    async fn prune_stale(&self, keep: &str) -> Result<(), PublishError> {
        let Some(stale) = &self.stale else {
            return Ok(());
        };

        let mut entries = tokio::fs::read_dir(&self.config.clone_dir)
            .await
            .map_err(|e| PublishError::step("prune", e.to_string()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PublishError::step("prune", e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == keep || !stale.is_match(&name) {
                continue;
            }
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            debug!("Removing stale artifact {name}");
            tokio::fs::remove_file(entry.path())
                .await
                .map_err(|e| PublishError::step("prune", format!("{name}: {e}")))?;
        }
        Ok(())
    }

    fn target_name(&self, artifact: &Artifact) -> String {
        if self.config.unique_names {
            artifact.file_name()
        } else {
            self.config.file_name.clone()
        }
    }

    /// Unix timestamp, bumped when needed so no two addresses share a stamp.
    fn next_stamp(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp();
        self.last_stamp = now.max(self.last_stamp + 1);
        self.last_stamp
    }
}

#[async_trait]
impl Transport for RemotePublish {
    fn backend(&self) -> Backend {
        Backend::RemotePublish
    }

    async fn prepare(&mut self) -> Result<(), SetupError> {
        self.ensure_clone()
            .await
            .map_err(|e| SetupError::Transport(e.to_string()))
    }

    async fn publish(&mut self, artifact: &Artifact) -> Result<PublishResult, PublishError> {
        let clone_dir = self.config.clone_dir.clone();
        let target = self.target_name(artifact);

        self.ensure_clone().await?;

        info!("Pulling latest from {}/{}...", self.config.remote, self.config.branch);
        self.git(
            "pull",
            args(["pull", self.config.remote.as_str(), self.config.branch.as_str()]),
            Some(&clone_dir),
        )
        .await?;

        self.prune_stale(&target).await?;

        debug!("Copying {} to {}", artifact.local_path.display(), target);
        tokio::fs::copy(&artifact.local_path, clone_dir.join(&target))
            .await
            .map_err(|e| PublishError::step("copy", e.to_string()))?;

        self.git("stage", args(["add", "-A"]), Some(&clone_dir)).await?;

        let message = format!("{}: {target}", self.config.commit_message);
        self.git(
            "commit",
            args(["commit".to_string(), "--allow-empty".into(), "-m".into(), message]),
            Some(&clone_dir),
        )
        .await?;

        info!("Pushing {target}...");
        self.git(
            "push",
            args(["push", self.config.remote.as_str(), self.config.branch.as_str()]),
            Some(&clone_dir),
        )
        .await?;

        let stamp = self.next_stamp();
        let url = format!(
            "{}/{target}?{}={stamp}",
            self.config.public_base_url.trim_end_matches('/'),
            self.config.cache_param
        );
        info!("Published {url}");
        Ok(PublishResult::url(url, Backend::RemotePublish))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{exit, ScriptedRunner};
    use crate::process::CommandOutput;
    use chrono::Local;
    use tempfile::TempDir;

    struct Fixture {
        clone: TempDir,
        work: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let clone = TempDir::new().unwrap();
            std::fs::create_dir(clone.path().join(".git")).unwrap();
            Self {
                clone,
                work: TempDir::new().unwrap(),
            }
        }

        fn config(&self) -> RemotePublishConfig {
            RemotePublishConfig {
                clone_dir: self.clone.path().to_path_buf(),
                public_base_url: "https://cdn.example.org/audio/".into(),
                ..RemotePublishConfig::default()
            }
        }

        fn artifact(&self, name: &str) -> Artifact {
            let local_path = self.work.path().join(name);
            std::fs::write(&local_path, b"mp3-bytes").unwrap();
            Artifact {
                id: "deadbeef".into(),
                local_path,
                created_at: Local::now(),
            }
        }
    }

    #[tokio::test]
    async fn publish_runs_full_sequence() {
        let fx = Fixture::new();
        std::fs::write(fx.clone.path().join("old_reply.mp3"), b"old").unwrap();
        std::fs::write(fx.clone.path().join("index.html"), b"<html>").unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        let mut transport = RemotePublish::new(fx.config(), runner.clone());
        let result = transport.publish(&fx.artifact("respuesta_deadbeef_1.mp3")).await.unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "git pull origin main".to_string(),
                "git add -A".to_string(),
                "git commit --allow-empty -m Actualizar archivo de audio: respuesta_chatbot.mp3".to_string(),
                "git push origin main".to_string(),
            ]
        );
        assert!(result
            .address
            .starts_with("https://cdn.example.org/audio/respuesta_chatbot.mp3?cache_bust="));
        assert_eq!(
            std::fs::read(fx.clone.path().join("respuesta_chatbot.mp3")).unwrap(),
            b"mp3-bytes"
        );
        assert!(!fx.clone.path().join("old_reply.mp3").exists());
        assert!(fx.clone.path().join("index.html").exists());
    }

    #[tokio::test]
    async fn successive_publishes_get_distinct_addresses() {
        let fx = Fixture::new();
        let mut transport = RemotePublish::new(fx.config(), Arc::new(ScriptedRunner::new()));

        let first = transport.publish(&fx.artifact("a.mp3")).await.unwrap();
        let second = transport.publish(&fx.artifact("b.mp3")).await.unwrap();
        assert_ne!(first.address, second.address);
    }

    #[tokio::test]
    async fn failing_step_is_named() {
        let fx = Fixture::new();
        let runner = Arc::new(
            ScriptedRunner::new().on(
                "git push",
                CommandOutput {
                    code: Some(1),
                    stdout: String::new(),
                    stderr: "error: failed to push some refs".into(),
                },
            ),
        );
        let mut transport = RemotePublish::new(fx.config(), runner);

        let err = transport.publish(&fx.artifact("a.mp3")).await.unwrap_err();
        assert_eq!(
            err,
            PublishError::step("push", "exit 1: error: failed to push some refs")
        );
    }

    #[tokio::test]
    async fn retry_reruns_whole_sequence() {
        let fx = Fixture::new();
        let runner = Arc::new(ScriptedRunner::new().once("git commit", exit(1, "")));
        let mut transport = RemotePublish::new(fx.config(), runner.clone());
        let artifact = fx.artifact("a.mp3");

        assert!(transport.publish(&artifact).await.is_err());
        transport.publish(&artifact).await.unwrap();

        let pulls = runner.calls().iter().filter(|c| c.starts_with("git pull")).count();
        assert_eq!(pulls, 2);
    }

    #[tokio::test]
    async fn missing_clone_is_cloned_first() {
        let work = TempDir::new().unwrap();
        let config = RemotePublishConfig {
            clone_dir: work.path().join("audio_repo"),
            ..RemotePublishConfig::default()
        };
        let runner = Arc::new(ScriptedRunner::new().on("git clone", exit(128, "")));
        let mut transport = RemotePublish::new(config, runner.clone());

        let err = transport.prepare().await.unwrap_err();
        assert!(matches!(err, SetupError::Transport(_)));
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("git clone https://github.com/pecec1to/audio.git"));
    }

    #[tokio::test]
    async fn unique_names_publish_under_artifact_name() {
        let fx = Fixture::new();
        let config = RemotePublishConfig {
            unique_names: true,
            ..fx.config()
        };
        let mut transport = RemotePublish::new(config, Arc::new(ScriptedRunner::new()));

        let result = transport.publish(&fx.artifact("respuesta_x_1.mp3")).await.unwrap();
        assert!(result.address.contains("/respuesta_x_1.mp3?cache_bust="));
        assert!(fx.clone.path().join("respuesta_x_1.mp3").exists());
    }
}
