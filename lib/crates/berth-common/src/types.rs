use serde::{Deserialize, Serialize};

/// Lifecycle status of a proxy (one running or stopped app instance).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    #[default]
    New,
    Up,
    Stopping,
    Stopped,
    Pausing,
    Paused,
    Resuming,
}

impl ProxyStatus {
    /// Whether the proxy has backend objects that may still exist.
    #[must_use]
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

/// Substrate a backend targets.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// A single container engine.
    #[default]
    Docker,
    /// A cluster of container engines (swarm mode).
    DockerSwarm,
    /// A container orchestrator.
    Kubernetes,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::DockerSwarm => "docker-swarm",
            Self::Kubernetes => "kubernetes",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(Self::Docker),
            "docker-swarm" | "swarm" => Ok(Self::DockerSwarm),
            "kubernetes" | "k8s" => Ok(Self::Kubernetes),
            other => Err(format!("unknown backend '{other}'")),
        }
    }
}

/// When the engine backend pulls an image before creating a container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ImagePullPolicy {
    Never,
    Always,
    IfNotPresent,
}

impl ImagePullPolicy {
    /// Parse a configured policy string; unknown strings yield `None`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Never" => Some(Self::Never),
            "Always" => Some(Self::Always),
            "IfNotPresent" => Some(Self::IfNotPresent),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Never => "Never",
            Self::Always => "Always",
            Self::IfNotPresent => "IfNotPresent",
        }
    }
}

/// How an auxiliary orchestrator manifest is reconciled on every start.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ManifestPolicy {
    /// Create when absent, leave an existing object untouched.
    #[default]
    CreateOnce,
    /// Create when absent, merge-patch an existing object.
    Patch,
    /// Delete an existing object, then create it again.
    Replace,
    /// Delete the object if it exists, never create it.
    Delete,
}

impl ManifestPolicy {
    /// Parse a policy annotation value; unknown strings yield `None`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CreateOnce" => Some(Self::CreateOnce),
            "Patch" => Some(Self::Patch),
            "Replace" => Some(Self::Replace),
            "Delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

/// Step of a container's startup timeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StartupStepKind {
    Schedule,
    PullImage,
    StartContainer,
    StartApplication,
}

impl StartupStepKind {
    pub const ALL: [Self; 4] = [
        Self::Schedule,
        Self::PullImage,
        Self::StartContainer,
        Self::StartApplication,
    ];
}
