use std::net::{IpAddr, ToSocketAddrs};
use std::path::Path;

use crate::config::SshConfig;
use crate::context::JobCtx;
use crate::error::{Error, Result};
use crate::exec::CommandSpec;
use crate::job::RemoteTarget;
use crate::output::mentions_password_prompt;

/// Accept a routable IPv4/IPv6 literal or a hostname that resolves.
pub fn validate_host(host: &str) -> Result<()> {
    let host = host.trim();
    if host.is_empty() {
        return Err(Error::config("remote host must not be empty"));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        if ip.is_unspecified() || ip.is_loopback() || ip.is_multicast() {
            return Err(Error::config(format!(
                "remote host {host} is not a usable remote address (unspecified, loopback or multicast)"
            )));
        }
        return Ok(());
    }
    (host, 22)
        .to_socket_addrs()
        .map(|_| ())
        .map_err(|e| Error::config(format!("remote host '{host}' does not resolve: {e}")))
}

pub struct ReachabilityChecker<'a> {
    ctx: &'a JobCtx,
    ssh: &'a SshConfig,
}

impl<'a> ReachabilityChecker<'a> {
    pub fn new(ctx: &'a JobCtx, ssh: &'a SshConfig) -> Self {
        Self { ctx, ssh }
    }

    /// Run whichever probes are enabled. Best-effort: a failure here only
    /// saves waiting for the real transfer to time out.
    pub fn check(&self, remote: &RemoteTarget, key: &Path) -> Result<()> {
        if self.ssh.icmp_test {
            self.ping(&remote.host)?;
        }
        if self.ssh.ssh_test {
            self.ssh_round_trip(remote, key)?;
        }
        Ok(())
    }

    pub fn ping(&self, host: &str) -> Result<()> {
        let spec = CommandSpec::new("ping").args([
            "-c".to_string(),
            "1".to_string(),
            "-W".to_string(),
            self.ssh.probe_timeout_secs.to_string(),
            host.to_string(),
        ]);
        let out = self
            .ctx
            .runner
            .run(&spec)
            .map_err(|e| Error::transfer(format!("failed to run ping: {e}")))?;
        if !out.success() {
            return Err(Error::transfer(format!(
                "remote host {host} is unreachable via ICMP"
            )));
        }
        tracing::debug!(remote_host = host, "ICMP probe ok");
        Ok(())
    }

    pub fn ssh_round_trip(&self, remote: &RemoteTarget, key: &Path) -> Result<()> {
        let spec = CommandSpec::new("ssh")
            .args(["-i".to_string(), key.display().to_string()])
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=accept-new"])
            .args([
                "-o".to_string(),
                format!("ConnectTimeout={}", self.ssh.connect_timeout_secs),
            ])
            .arg(remote.login())
            .arg("whoami");
        let out = self
            .ctx
            .runner
            .run(&spec)
            .map_err(|e| Error::transfer(format!("failed to run ssh: {e}")))?;
        if !out.success() {
            if mentions_password_prompt(&out.combined()) {
                // Host answered; the key is just not authorized yet.
                tracing::warn!(
                    remote_host = %remote.host,
                    "SSH check reached the host but it wants a password, continuing so the key can be installed"
                );
                return Ok(());
            }
            return Err(Error::transfer(format!(
                "failed to connect via SSH to {}: {}",
                remote.login(),
                out.summary()
            )));
        }
        tracing::debug!(remote_user = %out.stdout.trim(), "SSH probe ok");
        Ok(())
    }
}
