#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::OrchError;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub workspace: WorkspaceConfig,
    pub agents: AgentsConfig,
    pub orchestrator: OrchestratorConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Repository the workspaces branch off; empty means the current directory.
    pub repository: String,
    #[serde(alias = "basedir")]
    pub root: String,
    pub base_branch: String,
    pub branch_prefix: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            repository: String::new(),
            root: "~/.agent-orch/workspaces".to_owned(),
            base_branch: "main".to_owned(),
            branch_prefix: "agent-orch".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentsConfig {
    pub default_backend: String,
    pub claude_executable: String,
    pub codex_executable: String,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default_backend: "claude".to_owned(),
            claude_executable: "claude".to_owned(),
            codex_executable: "codex".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub notify_debounce_ms: u64,
    pub notify_max_wait_ms: u64,
    pub flush_interval_ms: u64,
    pub progress_interval_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            notify_debounce_ms: 50,
            notify_max_wait_ms: 1000,
            flush_interval_ms: 500,
            progress_interval_ms: 2000,
        }
    }
}

impl OrchestratorConfig {
    #[must_use]
    pub fn notify_debounce(&self) -> Duration {
        Duration::from_millis(self.notify_debounce_ms)
    }

    #[must_use]
    pub fn notify_max_wait(&self) -> Duration {
        Duration::from_millis(self.notify_max_wait_ms)
    }

    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.agent-orch/data".to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub config_file: PathBuf,
}

pub fn default_paths() -> anyhow::Result<ConfigPaths> {
    let unix = home_config_path_unix();
    if !cfg!(windows) {
        return Ok(ConfigPaths { config_file: unix });
    }

    // Windows: prefer the Unix-style path if present for portability.
    if unix.exists() {
        return Ok(ConfigPaths { config_file: unix });
    }

    let proj = ProjectDirs::from("dev", "agent-orch", "agent-orch")
        .context("failed to determine platform config directory")?;
    Ok(ConfigPaths {
        config_file: proj.config_dir().join("config.toml"),
    })
}

fn home_config_path_unix() -> PathBuf {
    let home = home_dir().unwrap_or_else(|| PathBuf::from("~"));
    home.join(".config").join("agent-orch").join("config.toml")
}

fn home_dir() -> Option<PathBuf> {
    if let Some(v) = std::env::var_os("HOME") {
        return Some(PathBuf::from(v));
    }
    if let Some(v) = std::env::var_os("USERPROFILE") {
        return Some(PathBuf::from(v));
    }
    let drive = std::env::var_os("HOMEDRIVE");
    let path = std::env::var_os("HOMEPATH");
    match (drive, path) {
        (Some(d), Some(p)) => Some(PathBuf::from(d).join(PathBuf::from(p))),
        _ => None,
    }
}

#[must_use]
pub fn expand_tilde(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("~/")
        && let Some(home) = home_dir()
    {
        return home.join(rest).to_string_lossy().to_string();
    }
    input.to_owned()
}

pub fn expand_path(input: &str) -> anyhow::Result<PathBuf> {
    let expanded = expand_env_vars(&expand_tilde(input));
    let p = PathBuf::from(expanded);
    if p.is_absolute() {
        return Ok(p);
    }
    let cwd = std::env::current_dir().context("failed to get current directory")?;
    Ok(cwd.join(p))
}

fn expand_env_vars(input: &str) -> String {
    // Expand $VAR and ${VAR}. Leave unknown vars untouched.
    let Ok(re) = regex::Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?") else {
        return input.to_owned();
    };
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        std::env::var(key).unwrap_or_else(|_| caps[0].to_owned())
    })
    .to_string()
}

pub fn load() -> anyhow::Result<(Config, ConfigPaths)> {
    let paths = default_paths()?;
    let (_doc, cfg) = load_from_file(&paths.config_file)?;
    cfg.validate()?;
    Ok((cfg, paths))
}

pub fn list_resolved_toml() -> anyhow::Result<String> {
    let (cfg, _paths) = load()?;
    Ok(toml::to_string_pretty(&cfg)?)
}

pub fn get_value_string(key: &str) -> anyhow::Result<Option<String>> {
    let paths = default_paths()?;
    get_value_string_at_path(&paths.config_file, key)
}

pub fn set_value_string(key: &str, value: &str) -> anyhow::Result<()> {
    let paths = default_paths()?;
    set_value_string_at_path(&paths.config_file, key, value)
}

pub fn load_from_file(path: &Path) -> anyhow::Result<(toml_edit::DocumentMut, Config)> {
    if !path.exists() {
        return Ok((toml_edit::DocumentMut::new(), Config::default()));
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let doc = raw
        .parse::<toml_edit::DocumentMut>()
        .with_context(|| format!("failed to parse TOML in {}", path.display()))?;

    let cfg: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to deserialize TOML in {}", path.display()))?;
    Ok((doc, cfg))
}

pub fn get_value_string_at_path(path: &Path, key: &str) -> anyhow::Result<Option<String>> {
    let (_doc, cfg) = load_from_file(path)?;
    cfg.validate()?;

    let norm = normalize_key(key);
    let value = lookup_value(&cfg, &norm);
    Ok(value.map(format_value_for_stdout))
}

pub fn set_value_string_at_path(path: &Path, key: &str, value: &str) -> anyhow::Result<()> {
    let (mut doc, cfg) = load_from_file(path)?;
    cfg.validate()?;

    let (norm_key, value_item) = normalize_key_and_parse_value(key, value)?;
    apply_set(&mut doc, &norm_key, value_item)?;

    // Validate by re-parsing the updated doc into a Config.
    let new_raw = doc.to_string();
    let new_cfg: Config = toml::from_str(&new_raw)
        .with_context(|| format!("config update produced invalid TOML for {}", path.display()))?;
    new_cfg.validate()?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, new_raw.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;

    Ok(())
}

impl Config {
    pub fn validate(&self) -> Result<(), OrchError> {
        if self.workspace.root.trim().is_empty() {
            return Err(OrchError::Config(
                "workspace.root must not be empty".to_owned(),
            ));
        }
        if self.workspace.branch_prefix.trim().is_empty() {
            return Err(OrchError::Config(
                "workspace.branch_prefix must not be empty".to_owned(),
            ));
        }
        if self.agents.claude_executable.trim().is_empty()
            || self.agents.codex_executable.trim().is_empty()
        {
            return Err(OrchError::Config(
                "agent executables must not be empty".to_owned(),
            ));
        }
        if !BACKENDS.contains(&self.agents.default_backend.as_str()) {
            return Err(OrchError::Config(format!(
                "agents.default_backend must be one of: {}",
                BACKENDS.join(", ")
            )));
        }
        if self.orchestrator.notify_debounce_ms == 0
            || self.orchestrator.flush_interval_ms == 0
            || self.orchestrator.progress_interval_ms == 0
        {
            return Err(OrchError::Config(
                "orchestrator intervals must be >= 1ms".to_owned(),
            ));
        }
        if self.orchestrator.notify_max_wait_ms < self.orchestrator.notify_debounce_ms {
            return Err(OrchError::Config(
                "orchestrator.notify_max_wait_ms must be >= notify_debounce_ms".to_owned(),
            ));
        }
        if self.store.data_dir.trim().is_empty() {
            return Err(OrchError::Config(
                "store.data_dir must not be empty".to_owned(),
            ));
        }
        Ok(())
    }

    /// Workspaces root with `~` and `$VAR` expanded.
    pub fn workspace_root(&self) -> anyhow::Result<PathBuf> {
        expand_path(&self.workspace.root)
    }

    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        expand_path(&self.store.data_dir)
    }
}

const BACKENDS: &[&str] = &["claude", "codex"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyType {
    Int,
    String,
    Enum(&'static [&'static str]),
}

fn normalize_key(key: &str) -> String {
    match key {
        "workspace.basedir" | "workspace.base_dir" => "workspace.root",
        "claude.executable" => "agents.claude_executable",
        "codex.executable" => "agents.codex_executable",
        "agents.backend" => "agents.default_backend",
        _ => key,
    }
    .to_owned()
}

fn normalize_key_and_parse_value(
    key: &str,
    value: &str,
) -> anyhow::Result<(String, toml_edit::Item)> {
    let norm = normalize_key(key);
    let key_type = key_type(&norm).ok_or_else(|| OrchError::InvalidConfigKey(key.to_owned()))?;
    let item = match key_type {
        KeyType::Int => toml_edit::value(parse_int(value).map_err(|msg| {
            OrchError::InvalidConfigValue {
                key: key.to_owned(),
                msg,
            }
        })?),
        KeyType::String => toml_edit::value(value),
        KeyType::Enum(allowed) => {
            let v = value.trim();
            if !allowed.contains(&v) {
                return Err(OrchError::InvalidConfigValue {
                    key: key.to_owned(),
                    msg: format!("must be one of: {}", allowed.join(", ")),
                }
                .into());
            }
            toml_edit::value(v)
        }
    };

    Ok((norm, item))
}

fn key_type(key: &str) -> Option<KeyType> {
    Some(match key {
        "workspace.repository"
        | "workspace.root"
        | "workspace.base_branch"
        | "workspace.branch_prefix"
        | "agents.claude_executable"
        | "agents.codex_executable"
        | "store.data_dir" => KeyType::String,

        "orchestrator.notify_debounce_ms"
        | "orchestrator.notify_max_wait_ms"
        | "orchestrator.flush_interval_ms"
        | "orchestrator.progress_interval_ms" => KeyType::Int,

        "agents.default_backend" => KeyType::Enum(BACKENDS),

        _ => return None,
    })
}

fn parse_int(s: &str) -> Result<i64, String> {
    let n = s
        .trim()
        .parse::<i64>()
        .map_err(|e| format!("expected integer, got '{s}': {e}"))?;
    if n < 0 {
        return Err(format!("expected a non-negative integer, got {n}"));
    }
    Ok(n)
}

fn apply_set(
    doc: &mut toml_edit::DocumentMut,
    key: &str,
    value: toml_edit::Item,
) -> anyhow::Result<()> {
    let parts: Vec<&str> = key.split('.').filter(|p| !p.is_empty()).collect();
    let Some((leaf, tables)) = parts.split_last() else {
        return Err(OrchError::InvalidConfigKey(key.to_owned()).into());
    };

    let mut cur = doc.as_table_mut();
    for &seg in tables {
        if !cur.contains_key(seg) {
            let mut t = toml_edit::Table::new();
            t.set_implicit(true);
            cur.insert(seg, toml_edit::Item::Table(t));
        }
        cur = cur[seg].as_table_mut().ok_or_else(|| {
            OrchError::Config(format!("cannot set {key}: '{seg}' is not a table"))
        })?;
    }

    cur.insert(leaf, value);
    Ok(())
}

fn lookup_value(cfg: &Config, key: &str) -> Option<serde_json::Value> {
    let mut v = serde_json::to_value(cfg).ok()?;
    for seg in key.split('.').filter(|s| !s.is_empty()) {
        match v {
            serde_json::Value::Object(mut map) => {
                v = map.remove(seg)?;
            }
            _ => return None,
        }
    }
    Some(v)
}

fn format_value_for_stdout(v: serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "null".to_owned(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s,
        other => serde_json::to_string_pretty(&other).unwrap_or_else(|_| other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn config_validation_catches_invalid_values() {
        let mut cfg = Config::default();
        cfg.orchestrator.flush_interval_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.agents.default_backend = "gemini".to_owned();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.orchestrator.notify_max_wait_ms = 10;
        cfg.orchestrator.notify_debounce_ms = 50;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_set_and_get_dot_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");

        set_value_string_at_path(&path, "orchestrator.notify_debounce_ms", "200").unwrap();
        assert_eq!(
            get_value_string_at_path(&path, "orchestrator.notify_debounce_ms")
                .unwrap()
                .as_deref(),
            Some("200")
        );

        set_value_string_at_path(&path, "workspace.basedir", "~/wt").unwrap();
        assert_eq!(
            get_value_string_at_path(&path, "workspace.root")
                .unwrap()
                .as_deref(),
            Some("~/wt")
        );

        set_value_string_at_path(&path, "agents.default_backend", "codex").unwrap();
        assert!(set_value_string_at_path(&path, "agents.default_backend", "gemini").is_err());
        assert!(set_value_string_at_path(&path, "agents.nope", "x").is_err());
        assert!(set_value_string_at_path(&path, "orchestrator.flush_interval_ms", "-5").is_err());

        let (_doc, cfg) = load_from_file(&path).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.orchestrator.notify_debounce_ms, 200);
        assert_eq!(cfg.workspace.root, "~/wt");
        assert_eq!(cfg.agents.default_backend, "codex");
    }

    #[test]
    fn set_preserves_comments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "# keep me\n[workspace]\nbase_branch = \"develop\"\n").unwrap();

        set_value_string_at_path(&path, "workspace.branch_prefix", "bot").unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("# keep me"));
        let (_doc, cfg) = load_from_file(&path).unwrap();
        assert_eq!(cfg.workspace.base_branch, "develop");
        assert_eq!(cfg.workspace.branch_prefix, "bot");
    }
}
