use std::path::PathBuf;
use std::time::Duration;

use colloquy_protocol::PermissionMode;

use crate::errors::RuntimeError;

pub const DEFAULT_WORKSPACE_DIR: &str = "./workspace";

/// Tools auto-allowed in `acceptEdits` mode unless the allow-list is overridden.
pub const DEFAULT_SAFE_TOOLS: [&str; 7] = [
    "Read",
    "Glob",
    "Grep",
    "Write",
    "Edit",
    "WebSearch",
    "WebFetch",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub workspace_root: PathBuf,
    pub permission_mode: PermissionMode,
    pub safe_tools: Vec<String>,
    /// Upper bound for waiting on a cancelled run when the connection closes.
    pub shutdown_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from(DEFAULT_WORKSPACE_DIR),
            permission_mode: PermissionMode::default(),
            safe_tools: DEFAULT_SAFE_TOOLS.iter().map(|tool| (*tool).to_owned()).collect(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            ..Self::default()
        }
    }

    /// Override the mode new sessions start in.
    /// Allocation: none. Complexity: O(1).
    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    /// Replace the `acceptEdits` allow-list.
    /// Allocation: one Vec of owned names. Complexity: O(n).
    pub fn with_safe_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.safe_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.workspace_root.as_os_str().is_empty() {
            return Err(RuntimeError::InvalidConfig(
                "workspace_root must not be empty".to_owned(),
            ));
        }
        if self.safe_tools.iter().any(|tool| tool.trim().is_empty()) {
            return Err(RuntimeError::InvalidConfig(
                "safe_tools entries must not be blank".to_owned(),
            ));
        }
        if self.shutdown_grace.is_zero() {
            return Err(RuntimeError::InvalidConfig(
                "shutdown_grace must be > 0".to_owned(),
            ));
        }
        Ok(())
    }
}
