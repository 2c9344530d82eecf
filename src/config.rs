use std::{
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context as _, bail};
use serde::Deserialize;

use crate::proxy::ProxySpec;

pub const PROJECT_CONFIG_FILE_NAME: &str = "autodemo.toml";
pub const HOME_CONFIG_RELATIVE_PATH: &str = ".autodemo/config.toml";
pub const DEFAULT_PKI_SUBDIR: &str = ".autodemo/pki";
pub const CA_KEY_FILE_NAME: &str = "ca_key.pem";
pub const CA_CERT_FILE_NAME: &str = "ca_cert.pem";
pub const EE_KEY_FILE_NAME: &str = "ee_key.pem";

const DEFAULT_DB_FILE_NAME: &str = "autodemo.db";
const DEFAULT_PROJECTS_DIR: &str = "projects";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub pki: PkiConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub proxies: Vec<ProxySpec>,
    #[serde(skip)]
    source_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PkiConfig {
    pub dir: Option<PathBuf>,
    pub ca_key: Option<PathBuf>,
    pub ca_cert: Option<PathBuf>,
    pub ee_key: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkiPaths {
    pub ca_key: PathBuf,
    pub ca_cert: PathBuf,
    pub ee_key: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlConfig {
    #[serde(default = "default_control_listen")]
    pub listen: SocketAddr,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: default_control_listen(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_listen")]
    pub listen: SocketAddr,
    pub db_path: Option<PathBuf>,
    pub projects_dir: Option<PathBuf>,
    pub busy_timeout_ms: Option<u64>,
    #[serde(default)]
    pub hooks: HookConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen: default_worker_listen(),
            db_path: None,
            projects_dir: None,
            busy_timeout_ms: None,
            hooks: HookConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn projects_dir(&self) -> PathBuf {
        self.projects_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_PROJECTS_DIR))
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_FILE_NAME))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms.unwrap_or(DEFAULT_BUSY_TIMEOUT_MS))
    }
}

/// External commands run by the default stage handler.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HookConfig {
    pub history: Option<Vec<String>>,
    pub postprocess: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    pub worker_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    Pretty,
}

fn default_control_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 11080))
}

fn default_worker_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

impl Config {
    /// Loads the explicit path if given, otherwise the first config found by discovery,
    /// otherwise built-in defaults.
    pub fn load(explicit_path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit_path {
            return Self::from_path(path);
        }
        let cwd = env::current_dir().context("resolve current directory")?;
        let home = env::var_os("HOME").map(PathBuf::from);
        match discover_config_path(&cwd, home.as_deref()) {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let mut config = Self::from_toml_str(&toml)
            .with_context(|| format!("load config {}", path.display()))?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }

    pub fn pki_paths(&self) -> anyhow::Result<PkiPaths> {
        let dir = match self.pki.dir.as_ref() {
            Some(dir) => dir.clone(),
            None => default_pki_dir()?,
        };
        Ok(PkiPaths {
            ca_key: self
                .pki
                .ca_key
                .clone()
                .unwrap_or_else(|| dir.join(CA_KEY_FILE_NAME)),
            ca_cert: self
                .pki
                .ca_cert
                .clone()
                .unwrap_or_else(|| dir.join(CA_CERT_FILE_NAME)),
            ee_key: self
                .pki
                .ee_key
                .clone()
                .unwrap_or_else(|| dir.join(EE_KEY_FILE_NAME)),
        })
    }

    fn validate(&self) -> anyhow::Result<()> {
        if let Some(worker_url) = self.session.worker_url.as_deref() {
            let uri: hyper::Uri = worker_url
                .parse()
                .with_context(|| format!("parse `session.worker_url` `{worker_url}`"))?;
            if uri.scheme_str() != Some("http") || uri.authority().is_none() {
                bail!("`session.worker_url` must be an absolute http:// URL, got `{worker_url}`");
            }
        }
        for hook in [
            self.worker.hooks.history.as_ref(),
            self.worker.hooks.postprocess.as_ref(),
        ]
        .into_iter()
        .flatten()
        {
            if hook.is_empty() {
                bail!("`worker.hooks` commands must not be empty arrays");
            }
        }
        for (idx, proxy) in self.proxies.iter().enumerate() {
            proxy
                .validate()
                .with_context(|| format!("invalid `proxies[{idx}]`"))?;
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Self = toml::from_str(s).context("parse config TOML")?;
        config.validate()?;
        Ok(config)
    }
}

pub fn default_pki_dir() -> anyhow::Result<PathBuf> {
    let Some(home) = env::var_os("HOME") else {
        bail!("cannot resolve PKI directory: HOME is not set; set `[pki].dir`");
    };
    Ok(Path::new(&home).join(DEFAULT_PKI_SUBDIR))
}

fn discover_config_path(cwd: &Path, home: Option<&Path>) -> Option<PathBuf> {
    let project = cwd.join(PROJECT_CONFIG_FILE_NAME);
    if project.is_file() {
        return Some(project);
    }
    let home_config = home?.join(HOME_CONFIG_RELATIVE_PATH);
    home_config.is_file().then_some(home_config)
}

#[cfg(test)]
mod tests {
    use std::{fs, path::Path};

    use super::{Config, LogFormat, discover_config_path};
    use crate::proxy::Scheme;
    use tempfile::tempdir;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml_str("").expect("empty config should parse");
        assert_eq!(config.control.listen.to_string(), "127.0.0.1:11080");
        assert_eq!(config.worker.listen.to_string(), "127.0.0.1:8080");
        assert_eq!(config.worker.projects_dir(), Path::new("projects"));
        assert_eq!(config.worker.busy_timeout().as_millis(), 5_000);
        assert!(config.proxies.is_empty());
        assert!(config.session.worker_url.is_none());
    }

    #[test]
    fn full_config_parses_every_section() {
        let config = Config::from_toml_str(
            r#"
[pki]
dir = "/tmp/pki"
ee_key = "/tmp/other/ee.pem"

[control]
listen = "127.0.0.1:9000"

[worker]
listen = "127.0.0.1:9001"
db_path = "/tmp/jobs.db"
projects_dir = "/tmp/projects"
busy_timeout_ms = 250

[worker.hooks]
history = ["./render-history.sh"]
postprocess = ["./render.sh", "--final"]

[session]
worker_url = "http://127.0.0.1:9001"

[logging]
level = "debug"
format = "pretty"

[[proxies]]
listen_host = "127.0.0.1"
listen_port = 8443
listen_scheme = "https"
forward_host = "api.internal"
forward_port = 443
forward_scheme = "https"
forward_insecure = true
"#,
        )
        .expect("config should parse");

        let pki = config.pki_paths().expect("pki paths resolve");
        assert_eq!(pki.ca_key, Path::new("/tmp/pki/ca_key.pem"));
        assert_eq!(pki.ca_cert, Path::new("/tmp/pki/ca_cert.pem"));
        assert_eq!(pki.ee_key, Path::new("/tmp/other/ee.pem"));
        assert_eq!(config.worker.busy_timeout().as_millis(), 250);
        assert_eq!(
            config.worker.hooks.postprocess,
            Some(vec!["./render.sh".to_owned(), "--final".to_owned()])
        );
        assert_eq!(
            config.logging.as_ref().and_then(|logging| logging.format),
            Some(LogFormat::Pretty)
        );
        assert_eq!(config.proxies.len(), 1);
        assert_eq!(config.proxies[0].listen_scheme, Scheme::Https);
        assert!(config.proxies[0].forward_insecure);
    }

    #[test]
    fn rejects_non_http_worker_url() {
        let err = Config::from_toml_str(
            r#"
[session]
worker_url = "ftp://127.0.0.1:9001"
"#,
        )
        .expect_err("ftp worker url should fail");
        assert!(
            err.to_string().contains("absolute http:// URL"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn rejects_empty_hook_command() {
        let err = Config::from_toml_str(
            r#"
[worker.hooks]
history = []
"#,
        )
        .expect_err("empty hook should fail");
        assert!(
            err.to_string().contains("must not be empty"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn rejects_proxy_with_zero_forward_port() {
        let err = Config::from_toml_str(
            r#"
[[proxies]]
listen_host = "127.0.0.1"
listen_port = 8080
listen_scheme = "http"
forward_host = "example.test"
forward_port = 0
forward_scheme = "http"
"#,
        )
        .expect_err("zero forward port should fail");
        assert!(
            format!("{err:#}").contains("forward_port"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = Config::from_toml_str(
            r#"
[control]
listen = "127.0.0.1:9000"
bogus = true
"#,
        )
        .expect_err("unknown field should fail");
        assert!(
            format!("{err:#}").contains("bogus"),
            "unexpected error: {err:#}"
        );
    }

    #[test]
    fn discovery_prefers_project_file_over_home_file() {
        let sandbox = tempdir().expect("tempdir should be created");
        let project_dir = sandbox.path().join("project");
        let home_dir = sandbox.path().join("home");
        fs::create_dir_all(&project_dir).expect("project dir");
        fs::create_dir_all(home_dir.join(".autodemo")).expect("home config dir");
        let home_config = home_dir.join(".autodemo").join("config.toml");
        fs::write(&home_config, "").expect("home config");

        assert_eq!(
            discover_config_path(&project_dir, Some(&home_dir)),
            Some(home_config)
        );

        let project_config = project_dir.join("autodemo.toml");
        fs::write(&project_config, "").expect("project config");
        assert_eq!(
            discover_config_path(&project_dir, Some(&home_dir)),
            Some(project_config)
        );
        assert_eq!(discover_config_path(sandbox.path(), None), None);
    }

    #[test]
    fn from_path_records_source_path() {
        let sandbox = tempdir().expect("tempdir should be created");
        let path = sandbox.path().join("autodemo.toml");
        fs::write(&path, "[control]\nlisten = \"127.0.0.1:0\"\n").expect("write config");

        let config = Config::from_path(&path).expect("config should load");
        assert_eq!(config.source_path(), Some(path.as_path()));
    }
}
