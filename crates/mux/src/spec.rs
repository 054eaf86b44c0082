use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use serde::Serialize;
use tokio::process::Command;

use crate::ServerName;

/// Declarative description of how to spawn and configure one child server.
///
/// Immutable once registered; re-registering a name replaces the whole spec.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSpec {
    pub name: ServerName,
    pub command: String,
    pub args: Vec<String>,
    /// Merged **over** the ambient process environment at spawn time.
    pub env: BTreeMap<String, String>,
    /// Working directory; defaults to the host's current directory.
    pub cwd: Option<PathBuf>,
    pub description: String,
    pub auto_start: bool,
}

impl ServerSpec {
    pub fn new(name: ServerName, command: impl Into<String>) -> Self {
        Self {
            name,
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            description: String::new(),
            auto_start: false,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    /// Composes the effective spec for a connect call: command/args/cwd are
    /// replaced wholesale when present, env is merged key-wise with the
    /// override winning.
    pub fn apply_overrides(&self, overrides: &SpecOverrides) -> ServerSpec {
        let mut spec = self.clone();
        if let Some(command) = &overrides.command {
            spec.command = command.clone();
        }
        if let Some(args) = &overrides.args {
            spec.args = args.clone();
        }
        if let Some(cwd) = &overrides.cwd {
            spec.cwd = Some(cwd.clone());
        }
        for (key, value) in &overrides.env {
            spec.env.insert(key.clone(), value.clone());
        }
        spec
    }

    /// Builds the spawn command: piped stderr (drained to the logger by the
    /// connection), spec env overlaid on the inherited environment.
    pub(crate) fn spawn_command(&self) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.envs(&self.env);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stderr(Stdio::piped());
        cmd
    }
}

/// Per-connect adjustments overlaid onto a registered spec.
#[derive(Debug, Clone, Default)]
pub struct SpecOverrides {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
}

impl SpecOverrides {
    pub fn is_empty(&self) -> bool {
        self.command.is_none() && self.args.is_none() && self.env.is_empty() && self.cwd.is_none()
    }
}
