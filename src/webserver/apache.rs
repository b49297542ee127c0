use std::{fmt::Write as _, path::PathBuf, sync::Arc};

use async_trait::async_trait;

use super::{
    run_checked, write_managed_block, CommandRunner, ConfigTarget, Configurator, WebServerKind,
};
use crate::{
    config::ApacheConfig,
    error::{Error, Result},
};

/// Apache httpd with `mod_ssl`, configured through a managed file in the sites directory.
pub struct Apache {
    conf_dir: PathBuf,
    ctl: String,
    runner: Arc<dyn CommandRunner>,
}

impl Apache {
    pub fn new(config: &ApacheConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Apache {
            conf_dir: config.conf_dir.clone(),
            ctl: config.ctl.clone(),
            runner,
        }
    }
}

fn virtual_host(target: &ConfigTarget) -> String {
    let mut names = target.domains.split_whitespace();
    let server_name = names.next().unwrap_or(&target.primary);
    let aliases = names.collect::<Vec<_>>().join(" ");

    let mut out = String::new();

    let _ = writeln!(out, "<VirtualHost *:443>");
    let _ = writeln!(out, "    ServerName {server_name}");
    if !aliases.is_empty() {
        let _ = writeln!(out, "    ServerAlias {aliases}");
    }
    if let Some(webroot) = &target.webroot {
        let _ = writeln!(out, "    DocumentRoot {}", webroot.display());
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "    SSLEngine on");
    let _ = writeln!(out, "    SSLCertificateFile {}", target.cert_path.display());
    let _ = writeln!(out, "    SSLCertificateKeyFile {}", target.key_path.display());
    let _ = writeln!(out, "</VirtualHost>");

    out
}

#[async_trait]
impl Configurator for Apache {
    fn kind(&self) -> WebServerKind {
        WebServerKind::Apache
    }

    async fn configure(&self, target: &ConfigTarget) -> Result<()> {
        let path = write_managed_block(&self.conf_dir, &target.primary, &virtual_host(target))?;
        log::info!("updated {}", path.display());
        Ok(())
    }

    async fn test(&self) -> Result<()> {
        run_checked(&*self.runner, &self.ctl, &["configtest"])
            .await
            .map(drop)
            .map_err(|output| Error::ConfigurationInvalid {
                server: WebServerKind::Apache,
                output,
            })
    }

    /// Graceful restart; in-flight requests finish on the old configuration.
    async fn reload(&self) -> Result<()> {
        run_checked(&*self.runner, &self.ctl, &["graceful"])
            .await
            .map(drop)
            .map_err(|output| Error::ReloadFailed {
                server: WebServerKind::Apache,
                output,
            })
    }
}
