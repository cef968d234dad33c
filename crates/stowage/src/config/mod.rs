use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::error::{Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/stowage/stowage.toml";

fn default_true() -> bool {
    true
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("/var/lib/stowage/local")
}

fn default_compose_files() -> Vec<String> {
    [
        "docker-compose.yml",
        "docker-compose.yaml",
        "compose.yml",
        "compose.yaml",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_manifest_name() -> String {
    "compose-img-digests.txt".into()
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("/var/lib/stowage/.ssh")
}

fn default_key_name() -> String {
    "stowage_id_ed25519".into()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_keepalive_interval() -> u64 {
    5
}

fn default_keepalive_count() -> u32 {
    2
}

fn default_probe_timeout() -> u64 {
    2
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub storage: StorageConfig,
    pub docker: DockerConfig,
    pub remote: RemoteConfig,
    pub ssh: SshConfig,
    pub log: LogConfig,
    /// Soft fixes applied by `validate`. Config loads before the log
    /// subscriber exists, so the binary reports these once logging is up.
    #[serde(skip)]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Local store used when a job names no output directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Treat a plain directory holding a compose file as a service backup.
    #[serde(default = "default_true")]
    pub detect_compose: bool,
    #[serde(default = "default_compose_files")]
    pub compose_files: Vec<String>,
    #[serde(default = "default_manifest_name")]
    pub manifest_name: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            detect_compose: true,
            compose_files: default_compose_files(),
            manifest_name: default_manifest_name(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub user: Option<String>,
    pub host: Option<String>,
    pub dir: Option<String>,
    pub skip_local: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SshConfig {
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,
    #[serde(default = "default_key_name")]
    pub key_name: String,
    #[serde(default = "default_true")]
    pub icmp_test: bool,
    #[serde(default = "default_true")]
    pub ssh_test: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_keepalive_count")]
    pub keepalive_count_max: u32,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            key_dir: default_key_dir(),
            key_name: default_key_name(),
            icmp_test: true,
            ssh_test: true,
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_count_max: default_keepalive_count(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl SshConfig {
    pub fn private_key_path(&self) -> PathBuf {
        self.key_dir.join(&self.key_name)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Text,
        }
    }
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Settings {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let value: Value = toml::from_str(raw)?;
        Self::from_value(value)
    }

    fn from_value(value: Value) -> Result<Self> {
        let mut settings: Settings = value
            .try_into()
            .map_err(|e| Error::config(format!("failed to deserialize config: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Hard errors for values no job could run with; soft fixes for log settings.
    pub fn validate(&mut self) -> Result<()> {
        self.warnings.clear();
        if self.ssh.key_name.trim().is_empty() {
            return Err(Error::config("ssh.key_name must not be empty"));
        }
        if self.ssh.connect_timeout_secs == 0 || self.ssh.probe_timeout_secs == 0 {
            return Err(Error::config(
                "ssh.connect_timeout_secs and ssh.probe_timeout_secs must be greater than zero",
            ));
        }
        if self.ssh.keepalive_interval_secs == 0 || self.ssh.keepalive_count_max == 0 {
            return Err(Error::config(
                "ssh.keepalive_interval_secs and ssh.keepalive_count_max must be greater than zero",
            ));
        }
        self.docker.compose_files.retain(|f| !f.trim().is_empty());
        if self.docker.compose_files.is_empty() {
            return Err(Error::config("docker.compose_files must list at least one name"));
        }
        if self.docker.manifest_name.contains('/') || self.docker.manifest_name.trim().is_empty() {
            return Err(Error::config(format!(
                "docker.manifest_name '{}' must be a plain file name",
                self.docker.manifest_name
            )));
        }

        let level = self.log.level.trim().to_ascii_lowercase();
        if LOG_LEVELS.contains(&level.as_str()) {
            self.log.level = level;
        } else {
            self.warnings
                .push(format!("unknown log.level '{}', using 'info'", self.log.level));
            self.log.level = default_log_level();
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("failed to encode config: {e}")))
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "config extends cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        let base_path = resolve_ref_path(path, ext);
        out = load_value_inner(&base_path, stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<Settings> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    Settings::from_value(value)
}

/// Explicit path must exist; the default location may be absent, in which
/// case built-in defaults apply.
pub fn load_or_default(explicit: Option<&Path>) -> Result<Settings> {
    if let Some(path) = explicit {
        return load(path);
    }
    let default = Path::new(DEFAULT_CONFIG_PATH);
    if default.is_file() {
        return load(default);
    }
    tracing::debug!(path = DEFAULT_CONFIG_PATH, "no config file, using defaults");
    let mut settings = Settings::default();
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let s = Settings::from_toml_str("").expect("defaults");
        assert!(s.docker.detect_compose);
        assert_eq!(s.docker.compose_files[0], "docker-compose.yml");
        assert_eq!(s.ssh.connect_timeout_secs, 10);
        assert_eq!(s.ssh.keepalive_interval_secs, 5);
        assert_eq!(s.ssh.keepalive_count_max, 2);
        assert_eq!(s.log.format, LogFormat::Text);
        assert_eq!(
            s.ssh.private_key_path(),
            PathBuf::from("/var/lib/stowage/.ssh/stowage_id_ed25519")
        );
    }

    #[test]
    fn sections_override_defaults() {
        let s = Settings::from_toml_str(
            r#"
[storage]
output_dir = "/srv/backups"

[docker]
detect_compose = false

[remote]
user = "backup"
host = "192.0.2.10"
skip_local = true

[log]
level = "DEBUG"
format = "json"
"#,
        )
        .expect("parse");
        assert_eq!(s.storage.output_dir, PathBuf::from("/srv/backups"));
        assert!(!s.docker.detect_compose);
        assert_eq!(s.remote.user.as_deref(), Some("backup"));
        assert!(s.remote.skip_local);
        assert_eq!(s.log.level, "debug");
        assert_eq!(s.log.format, LogFormat::Json);
    }

    #[test]
    fn unknown_log_level_falls_back_to_info() {
        let s = Settings::from_toml_str("[log]\nlevel = \"loud\"\n").expect("parse");
        assert_eq!(s.log.level, "info");
        assert_eq!(s.warnings, vec!["unknown log.level 'loud', using 'info'".to_string()]);
    }

    #[test]
    fn known_log_level_leaves_no_warning() {
        let s = Settings::from_toml_str("[log]\nlevel = \"warn\"\n").expect("parse");
        assert!(s.warnings.is_empty());
        assert!(!s.to_toml_string().expect("encode").contains("warnings"));
    }

    #[test]
    fn zero_timeout_rejected() {
        let err = Settings::from_toml_str("[ssh]\nconnect_timeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("greater than zero"), "{err}");
    }

    #[test]
    fn manifest_name_must_be_plain() {
        let err = Settings::from_toml_str("[docker]\nmanifest_name = \"../x.txt\"\n").unwrap_err();
        assert!(err.to_string().contains("plain file name"), "{err}");
    }

    #[test]
    fn extends_merges_child_over_base() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("base.toml"),
            "[remote]\nuser = \"base\"\nhost = \"192.0.2.1\"\n[ssh]\nicmp_test = false\n",
        )
        .expect("write base");
        fs::write(
            tmp.path().join("host.toml"),
            "extends = \"base.toml\"\n[remote]\nuser = \"override\"\n",
        )
        .expect("write child");

        let s = load(&tmp.path().join("host.toml")).expect("load");
        assert_eq!(s.remote.user.as_deref(), Some("override"));
        assert_eq!(s.remote.host.as_deref(), Some("192.0.2.1"));
        assert!(!s.ssh.icmp_test);
    }

    #[test]
    fn extends_cycle_detected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a.toml"), "extends = \"b.toml\"\n").expect("write a");
        fs::write(tmp.path().join("b.toml"), "extends = \"a.toml\"\n").expect("write b");
        let err = load(&tmp.path().join("a.toml")).unwrap_err();
        assert!(err.to_string().contains("cycle"), "{err}");
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let err = load_or_default(Some(Path::new("/nonexistent/stowage.toml"))).unwrap_err();
        assert!(err.to_string().contains("failed to read config"), "{err}");
    }

    #[test]
    fn settings_round_trip_through_toml() {
        let s = Settings::default();
        let text = s.to_toml_string().expect("encode");
        let back = Settings::from_toml_str(&text).expect("decode");
        assert_eq!(back.ssh.key_name, s.ssh.key_name);
    }
}
