//! Text-generation collaborator.
//!
//! The listener only depends on [`Generator`]. The stock implementation,
//! [`GenerationContext`], drives an out-of-process model runner described by
//! a `generator.json` manifest inside the model directory: the prompt goes
//! to the runner's stdin and its stdout is the reply.
//!
//! ```json
//! {
//!   "command": "llama-cli",
//!   "args": ["-m", "{model_dir}/model.gguf", "-n", "{max_length}", "-f", "/dev/stdin"],
//!   "env": { "OMP_NUM_THREADS": "4" }
//! }
//! ```

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_derive::Deserialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

pub const MANIFEST_FILE: &str = "generator.json";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Model path {0} does not exist")]
    NotFound(PathBuf),

    #[error("Invalid manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid generator: {0}")]
    Invalid(String),

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("Failed to start generator {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Generator IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Generator exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
}

/// Opaque prompt-to-reply function. May block for as long as the model needs.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone, Deserialize)]
struct Manifest {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

/// A loaded model runner. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct GenerationContext {
    model_dir: PathBuf,
    max_length: usize,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl GenerationContext {
    pub fn load<P: AsRef<Path>>(model_path: P, max_length: usize) -> Result<Self, LoadError> {
        let model_dir = model_path.as_ref().to_path_buf();
        if !model_dir.exists() {
            return Err(LoadError::NotFound(model_dir));
        }

        let manifest_path = model_dir.join(MANIFEST_FILE);
        let raw = std::fs::read_to_string(&manifest_path).map_err(|source| LoadError::Io {
            path: manifest_path.clone(),
            source,
        })?;
        let manifest: Manifest =
            serde_json::from_str(&raw).map_err(|source| LoadError::Manifest {
                path: manifest_path.clone(),
                source,
            })?;

        if manifest.command.trim().is_empty() {
            return Err(LoadError::Invalid("command must not be empty".to_string()));
        }

        let model_dir_text = model_dir.display().to_string();
        let expand = |value: &str| {
            value
                .replace("{model_dir}", &model_dir_text)
                .replace("{max_length}", &max_length.to_string())
        };
        let args = manifest.args.iter().map(|arg| expand(arg)).collect();
        let env = manifest
            .env
            .iter()
            .map(|(key, value)| (key.clone(), expand(value)))
            .collect();

        info!(
            model_dir = %model_dir.display(),
            command = %manifest.command,
            max_length,
            "generator loaded"
        );

        Ok(Self {
            model_dir,
            max_length,
            command: manifest.command,
            args,
            env,
        })
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[async_trait]
impl Generator for GenerationContext {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .current_dir(&self.model_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| GenerationError::Spawn {
            command: self.command.clone(),
            source,
        })?;

        // Feed stdin while stdout is drained so a chatty runner cannot stall
        // on a full pipe. Dropping stdin delivers EOF.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else {
                return Ok(());
            };
            match stdin.write_all(prompt.as_bytes()).await {
                // The runner is allowed to exit without reading its input.
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                other => other,
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());
        fed?;
        let output = output?;
        debug!(
            status = %output.status,
            stdout_bytes = output.stdout.len(),
            "generator finished"
        );

        if !output.status.success() {
            return Err(GenerationError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
