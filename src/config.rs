use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEBOUNCE_PERIOD_SECS: u64 = 10;
const ICLOUD_CHECK_PERIOD_SECS: u64 = 20;
const ICLOUD_REFRESH_PERIOD_SECS: u64 = 90;

#[derive(Debug, Default, Deserialize, Clone)]
struct PartialConfig {
    #[serde(default)]
    directory: Option<PathBuf>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    cookie_directory: Option<PathBuf>,
    #[serde(default)]
    ignore_regexes_path: Option<PathBuf>,
    #[serde(default)]
    include_regexes_path: Option<PathBuf>,
    #[serde(default)]
    logging_config_path: Option<PathBuf>,
    #[serde(default)]
    log_path: Option<PathBuf>,
    #[serde(default)]
    debounce_period: Option<u64>,
    #[serde(default)]
    icloud_check_period: Option<u64>,
    #[serde(default)]
    icloud_refresh_period: Option<u64>,
    #[serde(default)]
    max_workers: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub directory: PathBuf,
    pub username: String,
    pub password: Option<String>,
    pub cookie_directory: PathBuf,
    pub ignore_regexes_path: Option<PathBuf>,
    pub include_regexes_path: Option<PathBuf>,
    pub logging_config_path: Option<PathBuf>,
    pub log_path: PathBuf,
    pub debounce_period: Duration,
    pub icloud_check_period: Duration,
    pub icloud_refresh_period: Duration,
    pub max_workers: usize,
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub directory: Option<PathBuf>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub cookie_directory: Option<PathBuf>,
    pub ignore_regexes_path: Option<PathBuf>,
    pub include_regexes_path: Option<PathBuf>,
    pub logging_config_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub debounce_period: Option<u64>,
    pub icloud_check_period: Option<u64>,
    pub icloud_refresh_period: Option<u64>,
    pub max_workers: Option<usize>,
}

impl Config {
    pub fn default_cookie_directory() -> PathBuf {
        home_dir().join(".pyicloud")
    }

    pub fn default_log_path() -> PathBuf {
        home_dir().join(".icloudds").join("icloudds.log")
    }

    pub fn default_max_workers() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn default_config_path() -> PathBuf {
        home_dir().join(".icloudds").join("config.json")
    }

    pub fn resolve_config_path(flag_path: Option<&Path>) -> PathBuf {
        if let Some(p) = flag_path {
            return absolutize_path(p);
        }

        if let Ok(env_path) = std::env::var("ICLOUDDS_CONFIG_PATH") {
            let env_path = env_path.trim();
            if !env_path.is_empty() {
                return absolutize_path(Path::new(env_path));
            }
        }

        absolutize_path(&Self::default_config_path())
    }

    /// Loads `path` (if present), layers env vars and `overrides` on top
    /// (highest precedence wins: overrides > env > file > default), then
    /// normalizes and validates the result.
    pub fn load_with_overrides(path: &Path, overrides: ConfigOverrides) -> Result<Self> {
        let file_cfg = if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("read config {}", path.display()))?;
            serde_json::from_str::<PartialConfig>(&data).context("parse config json")?
        } else {
            PartialConfig::default()
        };

        let env_cfg = read_env_config();

        let directory = overrides
            .directory
            .or(env_cfg.directory)
            .or(file_cfg.directory)
            .context("directory is required (-d, ICLOUDDS_DIRECTORY, or config file)")?;
        let username = overrides
            .username
            .or(env_cfg.username)
            .or(file_cfg.username)
            .context("username is required (-u, ICLOUDDS_USERNAME, or config file)")?;
        let password = overrides.password.or(env_cfg.password).or(file_cfg.password);
        let cookie_directory = overrides
            .cookie_directory
            .or(env_cfg.cookie_directory)
            .or(file_cfg.cookie_directory)
            .unwrap_or_else(Self::default_cookie_directory);
        let ignore_regexes_path = overrides
            .ignore_regexes_path
            .or(env_cfg.ignore_regexes_path)
            .or(file_cfg.ignore_regexes_path);
        let include_regexes_path = overrides
            .include_regexes_path
            .or(env_cfg.include_regexes_path)
            .or(file_cfg.include_regexes_path);
        let logging_config_path = overrides
            .logging_config_path
            .or(env_cfg.logging_config_path)
            .or(file_cfg.logging_config_path);
        let log_path = overrides
            .log_path
            .or(env_cfg.log_path)
            .or(file_cfg.log_path)
            .unwrap_or_else(Self::default_log_path);
        let debounce_period = Duration::from_secs(
            overrides
                .debounce_period
                .or(env_cfg.debounce_period)
                .or(file_cfg.debounce_period)
                .unwrap_or(DEBOUNCE_PERIOD_SECS),
        );
        let icloud_check_period = Duration::from_secs(
            overrides
                .icloud_check_period
                .or(env_cfg.icloud_check_period)
                .or(file_cfg.icloud_check_period)
                .unwrap_or(ICLOUD_CHECK_PERIOD_SECS),
        );
        let icloud_refresh_period = Duration::from_secs(
            overrides
                .icloud_refresh_period
                .or(env_cfg.icloud_refresh_period)
                .or(file_cfg.icloud_refresh_period)
                .unwrap_or(ICLOUD_REFRESH_PERIOD_SECS),
        );
        let max_workers = overrides
            .max_workers
            .or(env_cfg.max_workers)
            .or(file_cfg.max_workers)
            .unwrap_or_else(Self::default_max_workers);

        let mut cfg = Config {
            directory,
            username,
            password,
            cookie_directory,
            ignore_regexes_path,
            include_regexes_path,
            logging_config_path,
            log_path,
            debounce_period,
            icloud_check_period,
            icloud_refresh_period,
            max_workers,
            config_path: Some(path.to_path_buf()),
        };
        cfg.normalize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn normalize(&mut self) -> Result<()> {
        self.directory = absolutize_path(&self.directory);
        self.cookie_directory = absolutize_path(&self.cookie_directory);
        self.log_path = absolutize_path(&self.log_path);
        if let Some(p) = self.ignore_regexes_path.take() {
            self.ignore_regexes_path = Some(absolutize_path(&p));
        }
        if let Some(p) = self.include_regexes_path.take() {
            self.include_regexes_path = Some(absolutize_path(&p));
        }
        if let Some(p) = self.logging_config_path.take() {
            self.logging_config_path = Some(absolutize_path(&p));
        }
        if let Some(p) = self.config_path.take() {
            self.config_path = Some(absolutize_path(&p));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !self.directory.is_dir() {
            anyhow::bail!("not a directory: {}", self.directory.display());
        }
        if self.username.trim().is_empty() {
            anyhow::bail!("username must not be empty");
        }
        if self.debounce_period < Duration::from_secs(DEBOUNCE_PERIOD_SECS) {
            anyhow::bail!("debounce_period must be at least {DEBOUNCE_PERIOD_SECS}s");
        }
        if self.icloud_check_period < Duration::from_secs(ICLOUD_CHECK_PERIOD_SECS) {
            anyhow::bail!("icloud_check_period must be at least {ICLOUD_CHECK_PERIOD_SECS}s");
        }
        if self.icloud_refresh_period < Duration::from_secs(ICLOUD_REFRESH_PERIOD_SECS) {
            anyhow::bail!("icloud_refresh_period must be at least {ICLOUD_REFRESH_PERIOD_SECS}s");
        }
        if self.max_workers == 0 {
            anyhow::bail!("max_workers must be at least 1");
        }
        Ok(())
    }
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn absolutize_path(path: &Path) -> PathBuf {
    let expanded = expand_tilde(path);
    let abs = if expanded.is_absolute() {
        expanded
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(expanded)
    };
    let cleaned = clean_lexical(&abs);
    // On macOS, /tmp is a symlink to /private/tmp; canonicalize so all path
    // comparisons use consistent forms. Fall back when the path doesn't
    // exist yet.
    std::fs::canonicalize(&cleaned).unwrap_or(cleaned)
}

fn expand_tilde(path: &Path) -> PathBuf {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(c)) if c == OsStr::new("~") => {
            let mut out = home_dir();
            for c in components {
                out.push(c.as_os_str());
            }
            out
        }
        _ => path.to_path_buf(),
    }
}

fn clean_lexical(path: &Path) -> PathBuf {
    // Like Go's filepath.Clean + Abs, but without requiring the path to exist.
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(&std::path::MAIN_SEPARATOR.to_string())),
            Component::CurDir => {}
            Component::ParentDir => {
                if !pop_normal_component(&mut out) && !out.as_os_str().is_empty() {
                    out.push("..");
                }
            }
            Component::Normal(p) => out.push(p),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        out
    }
}

fn pop_normal_component(path: &mut PathBuf) -> bool {
    let mut comps = path.components().collect::<Vec<_>>();
    match comps.pop() {
        Some(Component::Normal(_)) => {
            *path = rebuild_components(&comps);
            true
        }
        Some(Component::Prefix(_)) | Some(Component::RootDir) | None => false,
        Some(Component::CurDir) => {
            *path = rebuild_components(&comps);
            false
        }
        Some(Component::ParentDir) => {
            *path = rebuild_components(&comps);
            false
        }
    }
}

fn rebuild_components(components: &[Component<'_>]) -> PathBuf {
    let mut out = PathBuf::new();
    for c in components {
        match c {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Path::new(&std::path::MAIN_SEPARATOR.to_string())),
            Component::CurDir => {}
            Component::ParentDir => out.push(".."),
            Component::Normal(p) => out.push(p),
        }
    }
    out
}

fn read_env_config() -> PartialConfig {
    let mut out = PartialConfig::default();
    if let Ok(v) = std::env::var("ICLOUDDS_DIRECTORY") {
        let v = v.trim();
        if !v.is_empty() {
            out.directory = Some(PathBuf::from(v));
        }
    }
    if let Ok(v) = std::env::var("ICLOUDDS_USERNAME") {
        let v = v.trim();
        if !v.is_empty() {
            out.username = Some(v.to_string());
        }
    }
    if let Ok(v) = std::env::var("ICLOUDDS_PASSWORD") {
        if !v.is_empty() {
            out.password = Some(v);
        }
    }
    if let Ok(v) = std::env::var("ICLOUDDS_COOKIE_DIRECTORY") {
        let v = v.trim();
        if !v.is_empty() {
            out.cookie_directory = Some(PathBuf::from(v));
        }
    }
    if let Ok(v) = std::env::var("ICLOUDDS_LOG_PATH") {
        let v = v.trim();
        if !v.is_empty() {
            out.log_path = Some(PathBuf::from(v));
        }
    }
    if let Ok(v) = std::env::var("ICLOUDDS_ICLOUD_CHECK_PERIOD") {
        if let Ok(n) = v.trim().parse() {
            out.icloud_check_period = Some(n);
        }
    }
    if let Ok(v) = std::env::var("ICLOUDDS_ICLOUD_REFRESH_PERIOD") {
        if let Ok(n) = v.trim().parse() {
            out.icloud_refresh_period = Some(n);
        }
    }
    if let Ok(v) = std::env::var("ICLOUDDS_DEBOUNCE_PERIOD") {
        if let Ok(n) = v.trim().parse() {
            out.debounce_period = Some(n);
        }
    }
    if let Ok(v) = std::env::var("ICLOUDDS_MAX_WORKERS") {
        if let Ok(n) = v.trim().parse() {
            out.max_workers = Some(n);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::{env, fs};

    static ENV_LOCK: once_cell::sync::Lazy<Mutex<()>> =
        once_cell::sync::Lazy::new(|| Mutex::new(()));

    const ENV_KEYS: &[&str] = &[
        "ICLOUDDS_DIRECTORY",
        "ICLOUDDS_USERNAME",
        "ICLOUDDS_PASSWORD",
        "ICLOUDDS_COOKIE_DIRECTORY",
        "ICLOUDDS_LOG_PATH",
        "ICLOUDDS_ICLOUD_CHECK_PERIOD",
        "ICLOUDDS_ICLOUD_REFRESH_PERIOD",
        "ICLOUDDS_DEBOUNCE_PERIOD",
        "ICLOUDDS_MAX_WORKERS",
        "ICLOUDDS_CONFIG_PATH",
    ];

    struct EnvGuard {
        saved: HashMap<String, Option<String>>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let mut saved = HashMap::new();
            for k in keys {
                saved.insert((*k).to_string(), env::var(k).ok());
                env::remove_var(k);
            }
            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (k, v) in self.saved.drain() {
                match v {
                    Some(val) => env::set_var(k, val),
                    None => env::remove_var(k),
                }
            }
        }
    }

    fn fresh_dir(tag: &str) -> PathBuf {
        let tmp = env::temp_dir().join(format!("icloudds-rs-config-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();
        tmp
    }

    #[test]
    fn load_config_from_json_and_normalize() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(ENV_KEYS);

        let tmp = fresh_dir("json");
        let sync_dir = tmp.join("synced");
        fs::create_dir_all(&sync_dir).unwrap();
        let cfg_path = tmp.join("config.json");
        let sync_dir_str = sync_dir.display().to_string().replace('\\', "/");
        let json = format!(
            r#"{{"directory": "{}", "username": "alice@example.com"}}"#,
            sync_dir_str
        );
        fs::write(&cfg_path, json).unwrap();

        let cfg = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.username, "alice@example.com");
        assert!(cfg.directory.is_absolute());
        assert_eq!(cfg.debounce_period, Duration::from_secs(10));
        assert_eq!(cfg.icloud_check_period, Duration::from_secs(20));
        assert_eq!(cfg.icloud_refresh_period, Duration::from_secs(90));
        assert!(cfg.max_workers >= 1);
    }

    #[test]
    fn missing_directory_is_rejected() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(ENV_KEYS);

        let tmp = fresh_dir("missing-dir");
        let cfg_path = tmp.join("config.json");
        let missing = tmp.join("does-not-exist");
        let json = format!(
            r#"{{"directory": "{}", "username": "alice@example.com"}}"#,
            missing.display().to_string().replace('\\', "/")
        );
        fs::write(&cfg_path, json).unwrap();

        let err = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }

    #[test]
    fn period_below_minimum_is_rejected() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(ENV_KEYS);

        let tmp = fresh_dir("short-period");
        let sync_dir = tmp.join("synced");
        fs::create_dir_all(&sync_dir).unwrap();
        let cfg_path = tmp.join("config.json");
        fs::write(&cfg_path, "{}").unwrap();

        let overrides = ConfigOverrides {
            directory: Some(sync_dir),
            username: Some("alice@example.com".to_string()),
            debounce_period: Some(1),
            ..Default::default()
        };
        let err = Config::load_with_overrides(&cfg_path, overrides).unwrap_err();
        assert!(err.to_string().contains("debounce_period"));
    }

    #[test]
    fn load_with_overrides_flag_beats_env_beats_file() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(ENV_KEYS);

        let tmp = fresh_dir("precedence");
        let file_dir = tmp.join("file-data");
        let env_dir = tmp.join("env-data");
        let flag_dir = tmp.join("flag-data");
        for d in [&file_dir, &env_dir, &flag_dir] {
            fs::create_dir_all(d).unwrap();
        }

        let cfg_path = tmp.join("config.json");
        fs::write(
            &cfg_path,
            format!(
                r#"{{"directory": "{}", "username": "file@example.com"}}"#,
                file_dir.display().to_string().replace('\\', "/")
            ),
        )
        .unwrap();

        env::set_var("ICLOUDDS_USERNAME", "env@example.com");
        env::set_var("ICLOUDDS_DIRECTORY", env_dir.to_string_lossy().as_ref());

        let cfg = Config::load_with_overrides(&cfg_path, ConfigOverrides::default()).unwrap();
        assert_eq!(cfg.username, "env@example.com");
        assert_eq!(cfg.directory, env_dir.canonicalize().unwrap());

        let overrides = ConfigOverrides {
            username: Some("flag@example.com".to_string()),
            directory: Some(flag_dir.clone()),
            ..Default::default()
        };
        let cfg = Config::load_with_overrides(&cfg_path, overrides).unwrap();
        assert_eq!(cfg.username, "flag@example.com");
        assert_eq!(cfg.directory, flag_dir.canonicalize().unwrap());
    }

    #[test]
    fn default_cookie_directory_matches_pyicloud_convention() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(&["HOME"]);

        let tmp = fresh_dir("home");
        env::set_var("HOME", &tmp);

        let p = Config::default_cookie_directory();
        assert!(p.ends_with(".pyicloud"));
    }
}
