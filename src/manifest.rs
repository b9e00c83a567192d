use std::path::{Path, PathBuf};

use docker_compose_types::Compose;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DeployError, Result};

/// Dockerfile-equivalent names, in lookup order.
pub const DOCKERFILE_NAMES: [&str; 3] = ["Dockerfile", "dockerfile", "Containerfile"];

/// Compose-equivalent names, in lookup order.
pub const COMPOSE_NAMES: [&str; 4] = [
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// The recognized build file of a staged repository. Paths are
/// relative to the repository root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildManifest {
    Dockerfile { path: PathBuf },
    Compose { path: PathBuf, services: Vec<String> },
}

impl BuildManifest {
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Dockerfile { path } | Self::Compose { path, .. } => path,
        }
    }

    #[must_use]
    pub const fn is_compose(&self) -> bool {
        matches!(self, Self::Compose { .. })
    }

    #[must_use]
    pub fn services(&self) -> &[String] {
        match self {
            Self::Dockerfile { .. } => &[],
            Self::Compose { services, .. } => services,
        }
    }
}

/// Find the build manifest in `dir`.
///
/// A compose file wins over a Dockerfile when both exist, since the
/// compose file usually builds from that Dockerfile. `selected`
/// overrides the search and must exist.
pub fn detect(dir: &Path, selected: Option<&Path>) -> Result<BuildManifest> {
    if let Some(rel) = selected {
        let full = dir.join(rel);
        if !full.is_file() {
            return Err(DeployError::BuildFilesMissing {
                dir: dir.to_path_buf(),
                searched: vec![rel.display().to_string()],
            });
        }
        return if is_dockerfile_name(rel) {
            Ok(BuildManifest::Dockerfile {
                path: rel.to_path_buf(),
            })
        } else {
            load_compose(dir, rel)
        };
    }

    if let Some(name) = COMPOSE_NAMES.iter().find(|n| dir.join(n).is_file()) {
        return load_compose(dir, Path::new(name));
    }
    if let Some(name) = DOCKERFILE_NAMES.iter().find(|n| dir.join(n).is_file()) {
        debug!(file = name, "using Dockerfile");
        return Ok(BuildManifest::Dockerfile {
            path: PathBuf::from(name),
        });
    }

    Err(DeployError::BuildFilesMissing {
        dir: dir.to_path_buf(),
        searched: COMPOSE_NAMES
            .iter()
            .chain(DOCKERFILE_NAMES.iter())
            .map(ToString::to_string)
            .collect(),
    })
}

fn is_dockerfile_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_ascii_lowercase)
        .is_some_and(|n| n.contains("dockerfile") || n.contains("containerfile"))
}

fn load_compose(dir: &Path, rel: &Path) -> Result<BuildManifest> {
    let full = dir.join(rel);
    let content = std::fs::read_to_string(&full)?;
    let invalid = |reason: String| DeployError::InvalidManifest {
        path: rel.to_path_buf(),
        reason,
    };

    let compose: Compose = serde_yaml::from_str(&content).map_err(|e| invalid(e.to_string()))?;
    let services: Vec<String> = compose.services.0.keys().cloned().collect();
    if services.is_empty() {
        return Err(invalid("no services defined".to_string()));
    }

    debug!(file = %rel.display(), services = ?services, "using compose file");
    Ok(BuildManifest::Compose {
        path: rel.to_path_buf(),
        services,
    })
}
