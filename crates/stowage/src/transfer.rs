use std::fs;
use std::path::{Path, PathBuf};

use crate::config::SshConfig;
use crate::context::JobCtx;
use crate::error::{Error, Result};
use crate::exec::{CommandOutput, CommandSpec};
use crate::job::RemoteTarget;
use crate::output::mentions_password_prompt;
use crate::reachability::ReachabilityChecker;

/// Refuse keys that are not regular files, are readable by anyone but the
/// owner, or belong to another user.
pub fn validate_private_key(path: &Path) -> Result<()> {
    let meta = fs::metadata(path)
        .map_err(|e| Error::transfer(format!("SSH key {} is not usable: {e}", path.display())))?;
    if !meta.is_file() {
        return Err(Error::transfer(format!(
            "SSH key {} is not a regular file",
            path.display()
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        let mode = meta.mode() & 0o777;
        if mode & !0o600 != 0 {
            return Err(Error::transfer(format!(
                "SSH key {} has mode {mode:o}, must be 600 or stricter",
                path.display()
            )));
        }
        // SAFETY: geteuid has no preconditions and cannot fail.
        let euid = unsafe { libc::geteuid() };
        if meta.uid() != euid {
            return Err(Error::transfer(format!(
                "SSH key {} is owned by uid {}, not the current user (uid {euid})",
                path.display(),
                meta.uid()
            )));
        }
    }
    Ok(())
}

pub fn public_key_path(private_key: &Path) -> PathBuf {
    let mut s = private_key.as_os_str().to_os_string();
    s.push(".pub");
    PathBuf::from(s)
}

/// `<dir>/<archive-name>` when a remote dir is set, else `~/<archive-name>`.
pub fn remote_path(remote: &RemoteTarget, archive: &Path) -> String {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match remote.dir.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        Some(dir) => format!("{}/{name}", dir.trim_end_matches('/')),
        None => format!("~/{name}"),
    }
}

pub struct TransferCoordinator<'a> {
    ctx: &'a JobCtx,
    ssh: &'a SshConfig,
}

impl<'a> TransferCoordinator<'a> {
    pub fn new(ctx: &'a JobCtx, ssh: &'a SshConfig) -> Self {
        Self { ctx, ssh }
    }

    /// Ship `archive` to the remote and return the remote path it landed at.
    pub fn transfer(&self, archive: &Path, remote: &RemoteTarget) -> Result<String> {
        let key = self.ssh.private_key_path();
        validate_private_key(&key)?;
        if !archive.is_file() {
            return Err(Error::transfer(format!(
                "local archive {} does not exist",
                archive.display()
            )));
        }

        ReachabilityChecker::new(self.ctx, self.ssh).check(remote, &key)?;

        let dest = remote_path(remote, archive);
        let spec = self.rsync_spec(archive, remote, &key, &dest);
        tracing::info!(
            remote_host = %remote.host,
            remote_path = %dest,
            archive = %archive.display(),
            "transferring archive"
        );

        let first = self.run_rsync(&spec)?;
        if first.success() {
            tracing::info!(remote_host = %remote.host, remote_path = %dest, "transfer complete");
            return Ok(dest);
        }
        if !mentions_password_prompt(&first.combined()) {
            return Err(Error::transfer(format!(
                "rsync to {} failed: {}",
                remote.login(),
                first.summary()
            )));
        }

        tracing::warn!(
            remote_host = %remote.host,
            "remote asked for a password, installing the public key and retrying once"
        );
        self.install_public_key(remote)?;

        let retry = self.run_rsync(&spec)?;
        if !retry.success() {
            return Err(Error::transfer(format!(
                "rsync to {} failed after installing the public key: {}",
                remote.login(),
                retry.summary()
            )));
        }
        tracing::info!(remote_host = %remote.host, remote_path = %dest, "transfer complete after key install");
        Ok(dest)
    }

    /// Copy the managed public key into the remote user's authorized keys.
    /// Interactive: the operator may have to type the remote password.
    pub fn install_public_key(&self, remote: &RemoteTarget) -> Result<()> {
        let public = public_key_path(&self.ssh.private_key_path());
        if !public.is_file() {
            return Err(Error::transfer(format!(
                "public key {} does not exist",
                public.display()
            )));
        }
        let spec = CommandSpec::new("ssh-copy-id")
            .args(["-i".to_string(), public.display().to_string(), remote.login()])
            .interactive();
        let out = self
            .ctx
            .runner
            .run(&spec)
            .map_err(|e| Error::transfer(format!("failed to run ssh-copy-id: {e}")))?;
        if !out.success() {
            return Err(Error::transfer(format!(
                "failed to install public key on {}: {}",
                remote.login(),
                out.summary()
            )));
        }
        tracing::info!(remote_host = %remote.host, remote_user = %remote.user, "public key installed");
        Ok(())
    }

    fn rsync_spec(&self, archive: &Path, remote: &RemoteTarget, key: &Path, dest: &str) -> CommandSpec {
        let ssh_cmd = format!(
            "ssh -i {} -o BatchMode=yes -o ConnectTimeout={} -o ServerAliveInterval={} -o ServerAliveCountMax={}",
            key.display(),
            self.ssh.connect_timeout_secs,
            self.ssh.keepalive_interval_secs,
            self.ssh.keepalive_count_max
        );
        CommandSpec::new("rsync").args([
            "-az".to_string(),
            "--checksum".to_string(),
            "-e".to_string(),
            ssh_cmd,
            archive.display().to_string(),
            format!("{}:{dest}", remote.rsync_login()),
        ])
    }

    fn run_rsync(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.ctx
            .runner
            .run(spec)
            .map_err(|e| Error::transfer(format!("failed to run rsync: {e}")))
    }
}
