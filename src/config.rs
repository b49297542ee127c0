//! Runtime configuration passed explicitly into the lifecycle manager.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{
    error::{Error, Result},
    keys::KeyAlgorithm,
};

const LETSENCRYPT_URL: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETSENCRYPT_STAGING_URL: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Top-level configuration.
///
/// Built from defaults, an optional TOML file, and environment overrides, in that order.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Root of the certificate store.
    pub cert_dir: PathBuf,

    /// Root of the account store. Defaults to `<cert_dir>/accounts`.
    pub account_dir: Option<PathBuf>,

    /// ACME directory URL. Takes precedence over `staging`.
    pub directory_url: Option<String>,

    /// Use the Let's Encrypt staging environment.
    pub staging: bool,

    pub key_algorithm: KeyAlgorithm,

    /// Port for the built-in HTTP-01 responder when no web root is given.
    pub http_port: u16,

    /// Port for the TLS-ALPN-01 responder.
    pub tls_port: u16,

    pub poll_interval_secs: u64,
    pub poll_attempts: u32,

    /// How long to wait for another operation on the same certificate directory.
    pub lock_timeout_secs: u64,

    pub nginx: NginxConfig,
    pub apache: ApacheConfig,
    pub iis: IisConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NginxConfig {
    pub conf_dir: PathBuf,
    pub binary: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApacheConfig {
    pub conf_dir: PathBuf,
    pub ctl: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IisConfig {
    pub appcmd: String,
    pub site_name: Option<String>,
    pub app_pool: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cert_dir: default_home().join("certs"),
            account_dir: None,
            directory_url: None,
            staging: false,
            key_algorithm: KeyAlgorithm::default(),
            http_port: 80,
            tls_port: 443,
            poll_interval_secs: 2,
            poll_attempts: 30,
            lock_timeout_secs: 60,
            nginx: NginxConfig::default(),
            apache: ApacheConfig::default(),
            iis: IisConfig::default(),
        }
    }
}

impl Default for NginxConfig {
    fn default() -> Self {
        NginxConfig {
            conf_dir: PathBuf::from("/etc/nginx/conf.d"),
            binary: "nginx".to_owned(),
        }
    }
}

impl Default for ApacheConfig {
    fn default() -> Self {
        let conf_dir = if Path::new("/etc/apache2").exists() {
            "/etc/apache2/sites-enabled"
        } else {
            "/etc/httpd/conf.d"
        };

        ApacheConfig {
            conf_dir: PathBuf::from(conf_dir),
            ctl: "apachectl".to_owned(),
        }
    }
}

impl Default for IisConfig {
    fn default() -> Self {
        IisConfig {
            appcmd: r"C:\Windows\System32\inetsrv\appcmd.exe".to_owned(),
            site_name: None,
            app_pool: "DefaultAppPool".to_owned(),
        }
    }
}

fn default_home() -> PathBuf {
    if let Some(home) = env::var_os("AUTOCERT_HOME") {
        return PathBuf::from(home);
    }

    if cfg!(windows) {
        PathBuf::from(r"C:\ProgramData\autocert")
    } else {
        PathBuf::from("/etc/autocert")
    }
}

impl Config {
    /// Loads configuration from `path`, or from `$AUTOCERT_CONFIG` when no path is given, then
    /// applies environment overrides. A missing file is only an error when named explicitly.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let from_env = env::var_os("AUTOCERT_CONFIG").map(PathBuf::from);

        let mut config = match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => Self::from_file(&path)?,
            None => Config::default(),
        };

        if let Some(dir) = env::var_os("AUTOCERT_CERT_DIR") {
            config.cert_dir = PathBuf::from(dir);
        }

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("reading {}: {err}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| Error::Config(err.to_string()))
    }

    /// Config rooted at `dir`, for tests and embedding.
    pub fn with_cert_dir(dir: impl Into<PathBuf>) -> Self {
        Config {
            cert_dir: dir.into(),
            ..Config::default()
        }
    }

    pub fn account_dir(&self) -> PathBuf {
        self.account_dir
            .clone()
            .unwrap_or_else(|| self.cert_dir.join("accounts"))
    }

    pub fn directory_url(&self) -> &str {
        match &self.directory_url {
            Some(url) => url,
            None if self.staging => LETSENCRYPT_STAGING_URL,
            None => LETSENCRYPT_URL,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}
