use std::fs;
use std::path::{Path, PathBuf};

use crate::config::DockerConfig;
use crate::context::JobCtx;
use crate::error::{Error, Result};
use crate::exec::{CommandOutput, CommandSpec};
use crate::target::ComposeRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Untouched, or started again after the backup.
    Running,
    /// Brought down for archiving.
    Stopped,
    /// Left down on purpose because no restart was requested.
    LeftStopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub id: String,
    pub digest: String,
}

impl ImageInfo {
    pub fn manifest_line(&self) -> String {
        format!("Image ID: {}  |  Image Digest: {}", self.id, self.digest)
    }
}

/// Quiesces one compose service and brings it back. Restoring is idempotent so
/// every failure branch of a job can call it without tracking who went first.
pub struct ServiceController<'a> {
    ctx: &'a JobCtx,
    compose: ComposeRef,
    manifest_name: String,
    state: ServiceState,
}

impl<'a> ServiceController<'a> {
    pub fn new(ctx: &'a JobCtx, compose: ComposeRef, docker: &DockerConfig) -> Self {
        Self {
            ctx,
            compose,
            manifest_name: docker.manifest_name.clone(),
            state: ServiceState::Running,
        }
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn compose(&self) -> &ComposeRef {
        &self.compose
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.compose.working_dir.join(&self.manifest_name)
    }

    /// Record image versions and stop the service. Any error leaves the job
    /// unable to proceed safely.
    pub fn pre_backup(&mut self) -> Result<Vec<ImageInfo>> {
        if !self.any_running() {
            tracing::warn!(
                compose = %self.compose.compose_file.display(),
                "no running containers for service, creating them without starting to read image metadata"
            );
            self.compose_cmd(["up", "--no-start"])
                .map_err(|e| Error::service(format!("failed to create containers for image inspection: {e}")))?;
        }

        let images = self.collect_images()?;
        let manifest = self.manifest_path();
        write_manifest(&manifest, &images)?;
        tracing::info!(
            manifest = %manifest.display(),
            images = images.len(),
            "image IDs and digests recorded"
        );

        self.compose_cmd(["down"])
            .map_err(|e| Error::service(format!("failed to stop service: {e}")))?;
        self.state = ServiceState::Stopped;
        tracing::info!(compose = %self.compose.compose_file.display(), "service stopped for backup");
        Ok(images)
    }

    /// Start the service again unless `restart` is false. A no-op once the
    /// service is running or was deliberately left down.
    pub fn post_backup(&mut self, restart: bool) -> Result<()> {
        match self.state {
            ServiceState::Running | ServiceState::LeftStopped => return Ok(()),
            ServiceState::Stopped => {}
        }
        if !restart {
            tracing::info!("service restart disabled, leaving service down");
            self.state = ServiceState::LeftStopped;
            return Ok(());
        }

        self.compose_cmd(["up", "-d"]).map_err(|e| {
            Error::service(format!(
                "failed to restart service at {}: {e}",
                self.compose.compose_file.display()
            ))
        })?;
        self.state = ServiceState::Running;
        tracing::info!(compose = %self.compose.compose_file.display(), "service restarted");
        Ok(())
    }

    fn any_running(&self) -> bool {
        match self.compose_output(["ps", "--services", "--filter", "status=running"]) {
            Ok(out) => !out.stdout.trim().is_empty(),
            Err(e) => {
                tracing::warn!(error = %e, "failed to read service run state");
                false
            }
        }
    }

    fn collect_images(&self) -> Result<Vec<ImageInfo>> {
        let out = self
            .compose_output(["images", "--quiet"])
            .map_err(|e| Error::service(format!("failed to list service images: {e}")))?;

        let mut images = Vec::new();
        for id in out.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let spec = CommandSpec::new("docker").args([
                "inspect",
                "--format",
                "{{index .RepoDigests 0}}",
                id,
            ]);
            let digest = self
                .ctx
                .runner
                .run(&spec)
                .map_err(|e| Error::service(format!("failed to run docker inspect: {e}")))?;
            if !digest.success() {
                return Err(Error::service(format!(
                    "failed to inspect image {id}: {}",
                    digest.summary()
                )));
            }
            images.push(ImageInfo {
                id: id.to_string(),
                digest: digest.stdout.trim().to_string(),
            });
        }
        Ok(images)
    }

    fn compose_spec<const N: usize>(&self, args: [&str; N]) -> CommandSpec {
        CommandSpec::new("docker")
            .arg("compose")
            .arg("-f")
            .arg(self.compose.compose_file.display().to_string())
            .args(args)
    }

    fn compose_output<const N: usize>(&self, args: [&str; N]) -> std::result::Result<CommandOutput, String> {
        let spec = self.compose_spec(args);
        let out = self.ctx.runner.run(&spec).map_err(|e| format!("{spec}: {e}"))?;
        if !out.success() {
            return Err(out.summary());
        }
        Ok(out)
    }

    fn compose_cmd<const N: usize>(&self, args: [&str; N]) -> std::result::Result<(), String> {
        self.compose_output(args).map(|_| ())
    }
}

fn write_manifest(path: &Path, images: &[ImageInfo]) -> Result<()> {
    let body = images
        .iter()
        .map(ImageInfo::manifest_line)
        .collect::<Vec<_>>()
        .join("\n");
    atomic_write_text(path, &body)
        .map_err(|e| Error::service(format!("failed to write image manifest {}: {e}", path.display())))
}

fn atomic_write_text(path: &Path, body: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new()
        .prefix(".stowage-manifest")
        .tempfile_in(dir)?;
    std::io::Write::write_all(&mut tmp, body.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    // NamedTempFile is created 0600; the manifest is meant to be read alongside the compose file.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o644))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::TracingSink;
    use crate::error::ErrorKind;
    use crate::exec::fake::ScriptedRunner;

    fn setup() -> (tempfile::TempDir, ComposeRef, Arc<ScriptedRunner>, JobCtx) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let compose_file = tmp.path().join("docker-compose.yml");
        fs::write(&compose_file, "services: {}\n").expect("compose");
        let runner = Arc::new(ScriptedRunner::new());
        let ctx = JobCtx::new(runner.clone(), Arc::new(TracingSink));
        (tmp, ComposeRef::new(compose_file), runner, ctx)
    }

    #[test]
    fn pre_backup_writes_manifest_and_stops_running_service() {
        let (_tmp, compose, runner, ctx) = setup();
        runner
            .on("ps --services", CommandOutput::ok("web\ndb\n"))
            .on("images --quiet", CommandOutput::ok("sha256:aaa\nsha256:bbb\n"))
            .on("inspect --format {{index .RepoDigests 0}} sha256:aaa", CommandOutput::ok("nginx@sha256:111\n"))
            .on("inspect --format {{index .RepoDigests 0}} sha256:bbb", CommandOutput::ok("postgres@sha256:222\n"));

        let docker = DockerConfig::default();
        let mut svc = ServiceController::new(&ctx, compose, &docker);
        let images = svc.pre_backup().expect("pre backup");

        assert_eq!(images.len(), 2);
        assert_eq!(svc.state(), ServiceState::Stopped);
        let manifest = fs::read_to_string(svc.manifest_path()).expect("manifest");
        assert_eq!(
            manifest,
            "Image ID: sha256:aaa  |  Image Digest: nginx@sha256:111\nImage ID: sha256:bbb  |  Image Digest: postgres@sha256:222"
        );
        assert_eq!(runner.count_matching("up --no-start"), 0);
        assert!(runner.command_lines().last().expect("calls").ends_with(" down"));
    }

    #[test]
    fn stopped_service_is_created_before_reading_images() {
        let (_tmp, compose, runner, ctx) = setup();
        runner.on("ps --services", CommandOutput::ok(""));
        let docker = DockerConfig::default();
        let mut svc = ServiceController::new(&ctx, compose, &docker);
        svc.pre_backup().expect("pre backup");

        let lines = runner.command_lines();
        let create = lines.iter().position(|l| l.ends_with("up --no-start")).expect("create");
        let images = lines.iter().position(|l| l.ends_with("images --quiet")).expect("images");
        assert!(create < images);
    }

    #[test]
    fn stop_failure_is_a_lifecycle_error() {
        let (_tmp, compose, runner, ctx) = setup();
        runner
            .on("ps --services", CommandOutput::ok("web\n"))
            .on(" down", CommandOutput::failed(1, "daemon unavailable"));
        let docker = DockerConfig::default();
        let mut svc = ServiceController::new(&ctx, compose, &docker);
        let err = svc.pre_backup().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceLifecycle);
        assert_eq!(svc.state(), ServiceState::Running);
    }

    #[test]
    fn post_backup_is_idempotent() {
        let (_tmp, compose, runner, ctx) = setup();
        runner.on("ps --services", CommandOutput::ok("web\n"));
        let docker = DockerConfig::default();
        let mut svc = ServiceController::new(&ctx, compose, &docker);
        svc.pre_backup().expect("pre backup");

        svc.post_backup(true).expect("first restore");
        svc.post_backup(true).expect("second restore");
        assert_eq!(runner.count_matching("up -d"), 1);
        assert_eq!(svc.state(), ServiceState::Running);
    }

    #[test]
    fn post_backup_without_restart_leaves_service_down() {
        let (_tmp, compose, runner, ctx) = setup();
        runner.on("ps --services", CommandOutput::ok("web\n"));
        let docker = DockerConfig::default();
        let mut svc = ServiceController::new(&ctx, compose, &docker);
        svc.pre_backup().expect("pre backup");

        svc.post_backup(false).expect("skip");
        svc.post_backup(false).expect("skip again");
        assert_eq!(runner.count_matching("up -d"), 0);
        assert_eq!(svc.state(), ServiceState::LeftStopped);
    }

    #[test]
    fn restart_failure_is_reported_and_retryable() {
        let (_tmp, compose, runner, ctx) = setup();
        runner
            .on("ps --services", CommandOutput::ok("web\n"))
            .on("up -d", CommandOutput::failed(1, "port is already allocated"))
            .on("up -d", CommandOutput::ok(""));
        let docker = DockerConfig::default();
        let mut svc = ServiceController::new(&ctx, compose, &docker);
        svc.pre_backup().expect("pre backup");

        let err = svc.post_backup(true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ServiceLifecycle);
        assert!(err.to_string().contains("port is already allocated"), "{err}");
        assert_eq!(svc.state(), ServiceState::Stopped);
        svc.post_backup(true).expect("second attempt");
        assert_eq!(svc.state(), ServiceState::Running);
    }
}
