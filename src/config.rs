use crate::error::AliDockError;
use crate::log::Log;
use dirs::home_dir;
use serde::Deserialize;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const CONFIG_FILE_NAME: &str = ".alidock-config.yaml";
pub const CONFIG_ENV: &str = "ALIDOCK_CONFIG";

/// Home of the container user, bound to `dir_outside` on the host.
pub const DIR_INSIDE: &str = "/home/alidock";

/// One layer of optional settings: the configuration file or the command line.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Overrides {
    pub dock_name: Option<String>,
    pub image_name: Option<String>,
    pub dir_outside: Option<String>,
    pub update_period: Option<u64>,
    pub dont_update_image: Option<bool>,
    pub dont_update_alidock: Option<bool>,
    pub nvidia: Option<bool>,
    pub rocm: Option<bool>,
    pub cvmfs: Option<bool>,
    pub web: Option<bool>,
    pub mount: Option<Vec<String>>,
}

impl Overrides {
    pub fn validate(&self) -> Result<(), AliDockError> {
        if let Some(name) = &self.dock_name {
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
            {
                return Err(AliDockError::Config(format!(
                    "invalid dock_name '{name}': use letters, digits, '_', '.' or '-'"
                )));
            }
        }
        if let Some(image) = &self.image_name {
            if image.trim().is_empty() {
                return Err(AliDockError::Config("image_name cannot be empty".to_string()));
            }
        }
        if let Some(dir) = &self.dir_outside {
            if dir.trim().is_empty() {
                return Err(AliDockError::Config("dir_outside cannot be empty".to_string()));
            }
        }
        Ok(())
    }
}

/// Merged settings before the per-user transforms are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub dock_name: String,
    pub image_name: String,
    pub dir_outside: String,
    pub update_period: u64,
    pub dont_update_image: bool,
    pub dont_update_alidock: bool,
    pub nvidia: bool,
    pub rocm: bool,
    pub cvmfs: bool,
    pub web: bool,
    pub mount: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dock_name: "alidock".to_string(),
            image_name: "alidock/alidock:latest".to_string(),
            dir_outside: "~/alidock".to_string(),
            update_period: 43_200,
            dont_update_image: false,
            dont_update_alidock: false,
            nvidia: false,
            rocm: false,
            cvmfs: false,
            web: false,
            mount: Vec::new(),
        }
    }
}

impl Settings {
    pub fn merge(self, layer: Overrides) -> Self {
        Self {
            dock_name: layer.dock_name.unwrap_or(self.dock_name),
            image_name: layer.image_name.unwrap_or(self.image_name),
            dir_outside: layer.dir_outside.unwrap_or(self.dir_outside),
            update_period: layer.update_period.unwrap_or(self.update_period),
            dont_update_image: layer.dont_update_image.unwrap_or(self.dont_update_image),
            dont_update_alidock: layer.dont_update_alidock.unwrap_or(self.dont_update_alidock),
            nvidia: layer.nvidia.unwrap_or(self.nvidia),
            rocm: layer.rocm.unwrap_or(self.rocm),
            cvmfs: layer.cvmfs.unwrap_or(self.cvmfs),
            web: layer.web.unwrap_or(self.web),
            mount: layer.mount.unwrap_or(self.mount),
        }
    }
}

/// Effective configuration for one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Name as configured, without the user suffix.
    pub base_name: String,
    /// Container name, always `{base_name}-{uid}`.
    pub dock_name: String,
    pub image_name: String,
    pub dir_outside: PathBuf,
    pub update_period: u64,
    pub dont_update_image: bool,
    pub dont_update_alidock: bool,
    pub nvidia: bool,
    pub rocm: bool,
    pub cvmfs: bool,
    pub web: bool,
    pub mount: Vec<String>,
}

impl Config {
    pub fn resolve(
        defaults: Settings,
        file: Overrides,
        cli: Overrides,
        uid: u32,
    ) -> Result<Self, AliDockError> {
        cli.validate()?;
        let merged = defaults.merge(file).merge(cli);
        Ok(Self {
            dock_name: format!("{}-{uid}", merged.dock_name),
            base_name: merged.dock_name,
            image_name: merged.image_name,
            dir_outside: PathBuf::from(expand_path(&merged.dir_outside)),
            update_period: merged.update_period,
            dont_update_image: merged.dont_update_image,
            dont_update_alidock: merged.dont_update_alidock,
            nvidia: merged.nvidia,
            rocm: merged.rocm,
            cvmfs: merged.cvmfs,
            web: merged.web,
            mount: merged.mount,
        })
    }

    /// Per-container directory holding the init scripts and the container log.
    pub fn run_dir(&self) -> PathBuf {
        self.dir_outside.join(".alidock-run").join(&self.dock_name)
    }

    /// Same as [`Config::run_dir`], seen from inside the container.
    pub fn run_dir_inside(&self) -> String {
        format!("{DIR_INSIDE}/.alidock-run/{}", self.dock_name)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.dir_outside.join(".alidock-state")
    }

    pub fn log_file(&self) -> PathBuf {
        self.run_dir().join("log.txt")
    }
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_FILE_NAME)
}

pub fn read_overrides_from_str(content: &str) -> Result<Overrides, AliDockError> {
    if content.trim().is_empty() {
        return Ok(Overrides::default());
    }
    let overrides: Option<Overrides> = serde_yaml::from_str(content)?;
    let overrides = overrides.unwrap_or_default();
    overrides.validate()?;
    Ok(overrides)
}

/// Reads the configuration file. A missing file is not an error; a broken one is
/// reported and ignored.
pub fn load_file_overrides(path: &Path, log: &Log) -> Overrides {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Overrides::default(),
        Err(err) => {
            log.warning(format!(
                "cannot read {}, using defaults: {err}",
                path.display()
            ));
            return Overrides::default();
        }
    };
    match read_overrides_from_str(&content) {
        Ok(overrides) => {
            log.debug(format!("loaded configuration from {}", path.display()));
            overrides
        }
        Err(err) => {
            log.warning(format!(
                "ignoring malformed configuration {}: {err}",
                path.display()
            ));
            Overrides::default()
        }
    }
}

pub fn expand_path(input: &str) -> String {
    if input == "~" {
        if let Some(home) = home_dir() {
            return home.to_string_lossy().to_string();
        }
    }
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn file_layer() -> Overrides {
        Overrides {
            image_name: Some("registry.example.org/dev/box:2".to_string()),
            nvidia: Some(true),
            update_period: Some(60),
            mount: Some(vec!["/data".to_string()]),
            ..Overrides::default()
        }
    }

    #[test]
    fn cli_wins_over_file_only_when_present() {
        let cli = Overrides {
            update_period: Some(0),
            ..Overrides::default()
        };
        let cfg = Config::resolve(Settings::default(), file_layer(), cli, 1000).unwrap();
        assert_eq!(cfg.image_name, "registry.example.org/dev/box:2");
        assert!(cfg.nvidia);
        assert_eq!(cfg.update_period, 0);
        assert_eq!(cfg.mount, vec!["/data".to_string()]);
        assert!(!cfg.web);
    }

    #[test]
    fn cli_false_overrides_file_true() {
        let cli = Overrides {
            nvidia: Some(false),
            ..Overrides::default()
        };
        let cfg = Config::resolve(Settings::default(), file_layer(), cli, 1000).unwrap();
        assert!(!cfg.nvidia);
    }

    #[test]
    fn dock_name_gets_user_suffix() {
        let cli = Overrides {
            dock_name: Some("devbox".to_string()),
            dir_outside: Some("/srv/devbox".to_string()),
            ..Overrides::default()
        };
        let cfg = Config::resolve(Settings::default(), Overrides::default(), cli, 4242).unwrap();
        assert_eq!(cfg.dock_name, "devbox-4242");
        assert_eq!(cfg.base_name, "devbox");
        assert_eq!(cfg.run_dir(), PathBuf::from("/srv/devbox/.alidock-run/devbox-4242"));
        assert_eq!(cfg.run_dir_inside(), "/home/alidock/.alidock-run/devbox-4242");
        assert_eq!(
            cfg.log_file(),
            PathBuf::from("/srv/devbox/.alidock-run/devbox-4242/log.txt")
        );
    }

    #[test]
    fn malformed_cli_name_is_hard_error() {
        let cli = Overrides {
            dock_name: Some("my box".to_string()),
            ..Overrides::default()
        };
        let err = Config::resolve(Settings::default(), Overrides::default(), cli, 1)
            .expect_err("space in name should fail");
        assert!(matches!(err, AliDockError::Config(_)));
    }

    #[test]
    fn home_is_expanded_in_dir_outside() {
        let cfg =
            Config::resolve(Settings::default(), Overrides::default(), Overrides::default(), 1)
                .unwrap();
        assert!(!cfg.dir_outside.to_string_lossy().starts_with('~'));
        assert!(cfg.dir_outside.ends_with("alidock"));
    }

    #[test]
    fn bundled_example_config_matches_defaults() {
        let overrides = read_overrides_from_str(DEFAULT_CONFIG_YAML).expect("example config");
        let merged = Settings::default().merge(overrides);
        assert_eq!(merged, Settings::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = read_overrides_from_str("dock_name: x\ncolour: blue\n")
            .expect_err("unknown key should fail");
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn empty_documents_are_empty_overrides() {
        assert_eq!(read_overrides_from_str("").unwrap(), Overrides::default());
        assert_eq!(read_overrides_from_str("---\n").unwrap(), Overrides::default());
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "dock_name: [unclosed\n").unwrap();
        assert_eq!(load_file_overrides(&path, &Log::silent()), Overrides::default());

        fs::write(&path, "update_period: soon\n").unwrap();
        assert_eq!(load_file_overrides(&path, &Log::silent()), Overrides::default());

        fs::write(&path, "web: true\n").unwrap();
        assert_eq!(load_file_overrides(&path, &Log::silent()).web, Some(true));
    }

    #[test]
    fn missing_file_is_silent_default() {
        let dir = tempdir().unwrap();
        let overrides = load_file_overrides(&dir.path().join("absent.yaml"), &Log::silent());
        assert_eq!(overrides, Overrides::default());
    }

    #[test]
    fn explicit_config_path_wins() {
        let path = PathBuf::from("/tmp/custom-alidock.yaml");
        assert_eq!(resolve_config_path(Some(&path)), path);
    }
}
