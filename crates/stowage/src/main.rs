use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use stowage::config::Settings;
use stowage::context::JobCtx;
use stowage::job::{JobParams, JobRecord, RemoteTarget, TargetSelector};
use stowage::orchestrator::JobOrchestrator;
use stowage::reachability::validate_host;
use stowage::transfer::TransferCoordinator;
use stowage::{Error, Result};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to the stowage config TOML
    #[arg(long, global = true, env = "STOWAGE_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Back up a directory or a compose service
    Run(RunArgs),
    /// Install the managed public key on a remote host
    CopyKey {
        #[arg(long)]
        remote_user: String,
        #[arg(long)]
        remote_host: String,
    },
    /// Print the fully-resolved configuration (after extends)
    Config,
}

#[derive(Debug, ClapArgs)]
struct RunArgs {
    /// Directory to archive
    #[arg(long, conflicts_with = "service")]
    target_dir: Option<PathBuf>,
    /// Compose service whose working directory is archived
    #[arg(long)]
    service: Option<String>,
    /// Write the archive here instead of the local store
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Appended to the archive name: <name>-<tag>.bak.tar.gz
    #[arg(long)]
    tag: Option<String>,
    /// Leave a quiesced service stopped after the backup
    #[arg(long)]
    no_restart: bool,
    /// Keep no local copy once the archive is on the remote
    #[arg(long)]
    skip_local: bool,
    #[arg(long)]
    remote_user: Option<String>,
    #[arg(long)]
    remote_host: Option<String>,
    /// Remote directory; defaults to the remote user's home
    #[arg(long)]
    remote_dir: Option<String>,
    /// Take remote user, host and directory from the config file
    #[arg(long)]
    remote_defaults: bool,
    /// Print the job record as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let settings = stowage::config::load_or_default(args.config.as_deref())?;
    stowage::logging::init(&settings.log)?;
    report_config_warnings(&settings);

    match args.cmd {
        Command::Run(run) => cmd_run(&settings, run),
        Command::CopyKey {
            remote_user,
            remote_host,
        } => cmd_copy_key(&settings, remote_user, remote_host),
        Command::Config => {
            print!("{}", settings.to_toml_string()?);
            Ok(())
        }
    }
}

fn report_config_warnings(settings: &Settings) {
    for warning in &settings.warnings {
        tracing::warn!("{warning}");
    }
}

/// Merge CLI flags with config defaults into validated job parameters.
fn finalize_params(settings: &Settings, run: RunArgs) -> Result<JobParams> {
    let target = TargetSelector::from_parts(run.target_dir, run.service)?;

    let (mut user, mut host) = (run.remote_user, run.remote_host);
    if run.remote_defaults {
        user = user.or_else(|| settings.remote.user.clone());
        host = host.or_else(|| settings.remote.host.clone());
    }
    let dir = run.remote_dir.or_else(|| settings.remote.dir.clone());
    let remote = RemoteTarget::from_parts(user, host, dir)?;
    if let Some(r) = &remote {
        validate_host(&r.host)?;
    }

    let mut params = JobParams::new(target, settings.storage.output_dir.clone());
    params.output_dir = run.output_dir;
    params.tag = run.tag.filter(|t| !t.is_empty());
    params.restart = !run.no_restart;
    // The configured default only applies to runs that actually ship somewhere.
    params.skip_local = run.skip_local || (settings.remote.skip_local && remote.is_some());
    params.remote = remote;
    params.validate()?;
    Ok(params)
}

fn cmd_run(settings: &Settings, run: RunArgs) -> Result<()> {
    let json = run.json;
    let params = finalize_params(settings, run)?;
    let orch = JobOrchestrator::new(settings, JobCtx::system());

    match orch.run(&params) {
        Ok(record) => {
            print_record(&record, json)?;
            if let Some(restore) = &record.restore_error {
                return Err(Error::service(format!(
                    "backup completed but the service was not restarted: {restore}"
                )));
            }
            Ok(())
        }
        Err(failure) => {
            print_record(&failure.record, json)?;
            if let Some(restore) = &failure.restore_error {
                eprintln!("service restore also failed: {restore}");
            }
            Err(failure.error)
        }
    }
}

fn print_record(record: &JobRecord, json: bool) -> Result<()> {
    if json {
        let s = serde_json::to_string_pretty(record)
            .map_err(|e| Error::config(format!("failed to encode job record: {e}")))?;
        println!("{s}");
        return Ok(());
    }

    let status = if record.success { "ok" } else { "FAILED" };
    println!("job {}  {status}", record.job_id);
    println!("  target:   {}", record.target);
    if let Some(dir) = &record.target_dir {
        println!("  dir:      {}{}", dir.display(), if record.docker { " (docker)" } else { "" });
    }
    if let Some(path) = &record.archive_path {
        println!("  archive:  {}", path.display());
    }
    if let (Some(host), Some(path)) = (&record.remote_host, &record.remote_path) {
        println!("  remote:   {host}:{path}");
    }
    println!("  size:     {}", record.size_human());
    println!("  elapsed:  {:.1}s", record.elapsed.as_secs_f64());
    Ok(())
}

fn cmd_copy_key(settings: &Settings, user: String, host: String) -> Result<()> {
    let Some(remote) = RemoteTarget::from_parts(Some(user), Some(host), None)? else {
        return Err(Error::config("copy-key needs --remote-user and --remote-host"));
    };
    validate_host(&remote.host)?;
    let ctx = JobCtx::system();
    TransferCoordinator::new(&ctx, &settings.ssh).install_public_key(&remote)?;
    println!("public key installed for {}", remote.login());
    Ok(())
}
