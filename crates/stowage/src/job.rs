use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    Directory(PathBuf),
    Service(String),
}

impl TargetSelector {
    /// Exactly one of the two selectors must be given.
    pub fn from_parts(dir: Option<PathBuf>, service: Option<String>) -> Result<Self> {
        let service = service.filter(|s| !s.trim().is_empty());
        let dir = dir.filter(|d| !d.as_os_str().is_empty());
        match (dir, service) {
            (Some(d), None) => Ok(TargetSelector::Directory(d)),
            (None, Some(s)) => Ok(TargetSelector::Service(s.trim().to_string())),
            (Some(_), Some(_)) => Err(Error::config(
                "a target directory and a service name are mutually exclusive",
            )),
            (None, None) => Err(Error::config(
                "either a target directory or a service name is required",
            )),
        }
    }

    pub fn display_name(&self) -> String {
        match self {
            TargetSelector::Directory(d) => d.display().to_string(),
            TargetSelector::Service(s) => s.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTarget {
    pub user: String,
    pub host: String,
    /// Remote directory override; `None` falls back to the remote user's home.
    pub dir: Option<String>,
}

impl RemoteTarget {
    /// User and host must both be present or both be absent.
    pub fn from_parts(
        user: Option<String>,
        host: Option<String>,
        dir: Option<String>,
    ) -> Result<Option<Self>> {
        let user = user.filter(|s| !s.trim().is_empty());
        let host = host.filter(|s| !s.trim().is_empty());
        match (user, host) {
            (Some(user), Some(host)) => Ok(Some(Self {
                user: user.trim().to_string(),
                host: host.trim().to_string(),
                dir: dir.filter(|d| !d.trim().is_empty()),
            })),
            (None, None) => Ok(None),
            _ => Err(Error::transfer(
                "remote user and remote host must be given together",
            )),
        }
    }

    pub fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// `user@host` as rsync expects it before the `:path` part. IPv6 literals
    /// are bracketed, otherwise rsync splits at their first colon.
    pub fn rsync_login(&self) -> String {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            format!("{}@[{}]", self.user, self.host)
        } else {
            self.login()
        }
    }
}

/// Fully validated input to one job.
#[derive(Debug, Clone)]
pub struct JobParams {
    pub target: TargetSelector,
    /// Explicit output directory; wins over skip-local and the default store.
    pub output_dir: Option<PathBuf>,
    pub default_output_dir: PathBuf,
    pub tag: Option<String>,
    pub restart: bool,
    pub skip_local: bool,
    pub remote: Option<RemoteTarget>,
}

impl JobParams {
    pub fn new(target: TargetSelector, default_output_dir: impl Into<PathBuf>) -> Self {
        Self {
            target,
            output_dir: None,
            default_output_dir: default_output_dir.into(),
            tag: None,
            restart: true,
            skip_local: false,
            remote: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(tag) = &self.tag {
            validate_tag(tag)?;
        }
        if self.skip_local && self.remote.is_none() {
            return Err(Error::config(
                "skip-local requires a remote user and host, otherwise no copy would survive",
            ));
        }
        Ok(())
    }
}

pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() {
        return Err(Error::config("tag must not be empty"));
    }
    let ok = tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !ok || tag.starts_with('.') {
        return Err(Error::config(format!(
            "tag '{tag}' may only contain letters, digits, '-', '_' and '.'"
        )));
    }
    Ok(())
}

/// What one run did. Mutated in place by the orchestrator as the run progresses.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    pub target: String,
    pub target_dir: Option<PathBuf>,
    pub docker: bool,
    pub remote: bool,
    pub skip_local: bool,
    pub tag: Option<String>,
    pub restart: bool,
    pub remote_user: Option<String>,
    pub remote_host: Option<String>,
    pub remote_path: Option<String>,
    pub archive_path: Option<PathBuf>,
    pub archive_sha256: Option<String>,
    pub size_bytes: u64,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub success: bool,
    /// Set when restarting the service failed after archive and transfer succeeded.
    pub restore_error: Option<String>,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

impl JobRecord {
    pub fn start(job_id: &str, params: &JobParams) -> Self {
        Self {
            job_id: job_id.to_string(),
            started_at: Utc::now(),
            target: params.target.display_name(),
            target_dir: None,
            docker: false,
            remote: params.remote.is_some(),
            skip_local: params.skip_local,
            tag: params.tag.clone(),
            restart: params.restart,
            remote_user: params.remote.as_ref().map(|r| r.user.clone()),
            remote_host: params.remote.as_ref().map(|r| r.host.clone()),
            remote_path: None,
            archive_path: None,
            archive_sha256: None,
            size_bytes: 0,
            elapsed: Duration::ZERO,
            success: false,
            restore_error: None,
        }
    }

    pub fn set_target(&mut self, dir: &Path, docker: bool) {
        self.target = target_base_name(dir);
        self.target_dir = Some(dir.to_path_buf());
        self.docker = docker;
    }

    pub fn size_human(&self) -> String {
        format!("{:.1} MB", self.size_bytes as f64 / (1024.0 * 1024.0))
    }
}

pub const FALLBACK_BASE_NAME: &str = "unnamed-backup";

/// Last path component, or a fixed fallback for paths such as `/`.
pub fn target_base_name(dir: &Path) -> String {
    match dir.file_name().and_then(|n| n.to_str()) {
        Some(name) if !name.is_empty() && name != "." && name != ".." => name.to_string(),
        _ => FALLBACK_BASE_NAME.to_string(),
    }
}
