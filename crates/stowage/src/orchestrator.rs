use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use thiserror::Error;

use crate::archive::{archive_file_name, create_archive, ensure_writable};
use crate::config::Settings;
use crate::context::{JobCtx, JobEvent, Step};
use crate::error::{Error, ErrorKind, Result};
use crate::job::{JobParams, JobRecord, target_base_name};
use crate::service::ServiceController;
use crate::target::TargetResolver;
use crate::transfer::TransferCoordinator;

/// A job that did not complete. Carries whatever the record had collected so
/// callers can still report target and duration.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct JobFailure {
    #[source]
    pub error: Error,
    /// Restoring the service after the failure went wrong as well.
    pub restore_error: Option<Error>,
    pub record: Box<JobRecord>,
}

impl JobFailure {
    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Compensation {
    RemoveArchive(PathBuf),
    RestoreService,
}

/// Undo actions pushed as the pipeline creates things; unwound LIFO on failure.
#[derive(Debug, Default)]
struct Rollback {
    stack: Vec<Compensation>,
}

impl Rollback {
    fn push(&mut self, c: Compensation) {
        self.stack.push(c);
    }

    fn commit(&mut self) {
        self.stack.clear();
    }

    fn unwind(
        &mut self,
        orch: &JobOrchestrator<'_>,
        mut service: Option<&mut ServiceController<'_>>,
        restart: bool,
    ) -> Option<Error> {
        let mut restore_error = None;
        while let Some(c) = self.stack.pop() {
            match c {
                Compensation::RemoveArchive(path) => match fs::remove_file(&path) {
                    Ok(()) => tracing::info!(archive = %path.display(), "removed local temporary archive"),
                    Err(e) => tracing::warn!(archive = %path.display(), error = %e, "failed to remove temporary archive"),
                },
                Compensation::RestoreService => {
                    let Some(svc) = service.as_deref_mut() else {
                        continue;
                    };
                    if let Err(e) = orch.step(Step::Restore, || svc.post_backup(restart)) {
                        tracing::error!(error = %e, "service could not be restored after failed backup");
                        restore_error = Some(e);
                    }
                }
            }
        }
        restore_error
    }
}

/// Runs one backup job end to end: resolve, quiesce, archive, transfer, restore.
pub struct JobOrchestrator<'a> {
    settings: &'a Settings,
    ctx: JobCtx,
}

impl<'a> JobOrchestrator<'a> {
    pub fn new(settings: &'a Settings, ctx: JobCtx) -> Self {
        Self { settings, ctx }
    }

    pub fn ctx(&self) -> &JobCtx {
        &self.ctx
    }

    pub fn run(&self, params: &JobParams) -> std::result::Result<JobRecord, JobFailure> {
        let started = Instant::now();
        let mut record = JobRecord::start(&self.ctx.job_id, params);
        let span = tracing::info_span!("job", job_id = %self.ctx.job_id);
        let _guard = span.enter();
        tracing::info!(backup_target = %record.target, "backup job started");

        let mut service: Option<ServiceController<'_>> = None;
        let mut rollback = Rollback::default();
        let result = self.execute(params, &mut record, &mut service, &mut rollback);

        match result {
            Ok(()) => {
                rollback.commit();
                if let Some(svc) = service.as_mut() {
                    if let Err(e) = self.step(Step::Restore, || svc.post_backup(params.restart)) {
                        tracing::error!(error = %e, "backup succeeded but the service could not be restarted");
                        record.restore_error = Some(e.to_string());
                    }
                }
                record.success = true;
                record.elapsed = started.elapsed();
                tracing::info!(
                    backup_target = %record.target,
                    size = %record.size_human(),
                    elapsed_secs = record.elapsed.as_secs_f64(),
                    "backup job finished"
                );
                self.job_done(&record, None);
                Ok(record)
            }
            Err(error) => {
                let restore_error = rollback.unwind(self, service.as_mut(), params.restart);
                record.restore_error = restore_error.as_ref().map(ToString::to_string);
                record.elapsed = started.elapsed();
                tracing::error!(error_kind = error.kind().as_str(), error = %error, "backup job failed");
                self.job_done(&record, Some(error.kind()));
                Err(JobFailure {
                    error,
                    restore_error,
                    record: Box::new(record),
                })
            }
        }
    }

    fn execute<'s>(
        &'s self,
        params: &JobParams,
        record: &mut JobRecord,
        service: &mut Option<ServiceController<'s>>,
        rollback: &mut Rollback,
    ) -> Result<()> {
        params.validate()?;

        let resolved = self.step(Step::Resolve, || {
            TargetResolver::new(&self.ctx, &self.settings.docker).resolve(&params.target)
        })?;
        record.set_target(&resolved.dir, resolved.docker_enabled());

        let dest_dir = self.destination_dir(params)?;
        let dest = dest_dir.join(archive_file_name(
            &target_base_name(&resolved.dir),
            params.tag.as_deref(),
        ));
        ensure_writable(&dest_dir)?;

        if let Some(compose) = resolved.compose.clone() {
            let svc = service.insert(ServiceController::new(&self.ctx, compose, &self.settings.docker));
            self.step(Step::Quiesce, || svc.pre_backup().map(|_| ()))?;
            rollback.push(Compensation::RestoreService);
        }

        let archive = self.step(Step::Archive, || create_archive(&resolved.dir, &dest))?;
        record.archive_path = Some(archive.path.clone());
        record.archive_sha256 = Some(archive.sha256.clone());
        record.size_bytes = archive.size_bytes;
        if params.skip_local {
            rollback.push(Compensation::RemoveArchive(archive.path.clone()));
        }

        if let Some(remote) = &params.remote {
            let remote_path = self.step(Step::Transfer, || {
                TransferCoordinator::new(&self.ctx, &self.settings.ssh).transfer(&archive.path, remote)
            })?;
            record.remote_path = Some(remote_path);

            if params.skip_local {
                remove_local_copy(&archive.path);
                record.archive_path = None;
            }
        }
        Ok(())
    }

    fn destination_dir(&self, params: &JobParams) -> Result<PathBuf> {
        if let Some(dir) = &params.output_dir {
            return Ok(dir.clone());
        }
        if params.skip_local {
            return Ok(std::env::temp_dir());
        }
        let dir = &params.default_output_dir;
        fs::create_dir_all(dir).map_err(|e| {
            Error::archive(format!("failed to create local store {}: {e}", dir.display()))
        })?;
        Ok(dir.clone())
    }

    /// Wrap one pipeline step with start/finish events.
    fn step<T>(&self, step: Step, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let started = Instant::now();
        self.ctx.emit(JobEvent::StepStarted {
            job_id: self.ctx.job_id.clone(),
            step,
        });
        let out = f();
        self.ctx.emit(JobEvent::StepFinished {
            job_id: self.ctx.job_id.clone(),
            step,
            ok: out.is_ok(),
            error: out.as_ref().err().map(Error::kind),
            elapsed_ms: started.elapsed().as_millis(),
        });
        out
    }

    fn job_done(&self, record: &JobRecord, error: Option<ErrorKind>) {
        self.ctx.emit(JobEvent::JobDone {
            job_id: self.ctx.job_id.clone(),
            ok: error.is_none(),
            error,
            size_bytes: record.size_bytes,
            elapsed_ms: record.elapsed.as_millis(),
        });
    }
}

fn remove_local_copy(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => tracing::info!(archive = %path.display(), "local copy removed, archive kept only on remote"),
        Err(e) => tracing::warn!(archive = %path.display(), error = %e, "failed to remove local copy"),
    }
}
