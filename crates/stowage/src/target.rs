use std::path::{Path, PathBuf};

use crate::config::DockerConfig;
use crate::context::JobCtx;
use crate::error::{Error, Result};
use crate::exec::CommandSpec;
use crate::job::TargetSelector;

const WORKING_DIR_LABEL: &str = "com.docker.compose.project.working_dir";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeRef {
    pub compose_file: PathBuf,
    pub working_dir: PathBuf,
}

impl ComposeRef {
    pub fn new(compose_file: PathBuf) -> Self {
        let working_dir = compose_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            compose_file,
            working_dir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub dir: PathBuf,
    pub compose: Option<ComposeRef>,
}

impl ResolvedTarget {
    pub fn docker_enabled(&self) -> bool {
        self.compose.is_some()
    }
}

pub struct TargetResolver<'a> {
    ctx: &'a JobCtx,
    docker: &'a DockerConfig,
}

impl<'a> TargetResolver<'a> {
    pub fn new(ctx: &'a JobCtx, docker: &'a DockerConfig) -> Self {
        Self { ctx, docker }
    }

    /// Read-only: never changes the filesystem or any container.
    pub fn resolve(&self, selector: &TargetSelector) -> Result<ResolvedTarget> {
        match selector {
            TargetSelector::Service(name) => self.resolve_service(name),
            TargetSelector::Directory(dir) => self.resolve_dir(dir),
        }
    }

    fn resolve_service(&self, name: &str) -> Result<ResolvedTarget> {
        let spec = CommandSpec::new("docker").args([
            "inspect".to_string(),
            name.to_string(),
            "--format".to_string(),
            format!("{{{{ index .Config.Labels \"{WORKING_DIR_LABEL}\" }}}}"),
        ]);
        let out = self
            .ctx
            .runner
            .run(&spec)
            .map_err(|e| Error::target(format!("failed to run docker inspect: {e}")))?;
        if !out.success() {
            return Err(Error::target(format!(
                "service '{name}' not found: {}",
                out.summary()
            )));
        }

        let working_dir = out.stdout.trim();
        if working_dir.is_empty() || working_dir == "<no value>" {
            return Err(Error::target(format!(
                "service '{name}' has no compose working directory label"
            )));
        }
        let dir = normalize_dir(Path::new(working_dir));
        if !dir.is_dir() {
            return Err(Error::target(format!(
                "compose working directory {} of service '{name}' is not a directory",
                dir.display()
            )));
        }
        let Some(compose_file) = self.find_compose_file(&dir) else {
            return Err(Error::target(format!(
                "no compose file ({}) in {}",
                self.docker.compose_files.join(", "),
                dir.display()
            )));
        };

        tracing::debug!(service = name, dir = %dir.display(), "resolved service target");
        Ok(ResolvedTarget {
            dir,
            compose: Some(ComposeRef::new(compose_file)),
        })
    }

    fn resolve_dir(&self, raw: &Path) -> Result<ResolvedTarget> {
        let dir = normalize_dir(raw);
        let meta = std::fs::metadata(&dir).map_err(|e| {
            Error::target(format!("invalid target directory {}: {e}", dir.display()))
        })?;
        if !meta.is_dir() {
            return Err(Error::target(format!(
                "target {} is not a directory",
                dir.display()
            )));
        }
        // Absolute but not canonical: a symlinked target keeps its own name.
        let dir = match std::path::absolute(&dir) {
            Ok(abs) if abs.file_name().is_some() => abs,
            Ok(_) => dir.canonicalize().map_err(|e| {
                Error::target(format!("failed to resolve {}: {e}", dir.display()))
            })?,
            Err(e) => {
                return Err(Error::target(format!(
                    "failed to make {} absolute: {e}",
                    dir.display()
                )));
            }
        };

        if !self.docker.detect_compose {
            return Ok(ResolvedTarget { dir, compose: None });
        }
        match self.find_compose_file(&dir) {
            Some(compose_file) => {
                tracing::info!(
                    compose = %compose_file.display(),
                    "compose file found in target directory, treating as service backup"
                );
                Ok(ResolvedTarget {
                    dir,
                    compose: Some(ComposeRef::new(compose_file)),
                })
            }
            None => {
                tracing::debug!(dir = %dir.display(), "no compose file, plain directory backup");
                Ok(ResolvedTarget { dir, compose: None })
            }
        }
    }

    fn find_compose_file(&self, dir: &Path) -> Option<PathBuf> {
        self.docker
            .compose_files
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
    }
}

/// Drop trailing slashes (but keep `/` itself).
fn normalize_dir(p: &Path) -> PathBuf {
    let s = p.to_string_lossy();
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}
