use std::{fmt::Write as _, path::PathBuf, sync::Arc};

use async_trait::async_trait;

use super::{
    run_checked, write_managed_block, CommandRunner, ConfigTarget, Configurator, WebServerKind,
};
use crate::{
    config::NginxConfig,
    error::{Error, Result},
};

/// nginx, configured through a managed file in `conf.d`.
pub struct Nginx {
    conf_dir: PathBuf,
    binary: String,
    runner: Arc<dyn CommandRunner>,
}

impl Nginx {
    pub fn new(config: &NginxConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Nginx {
            conf_dir: config.conf_dir.clone(),
            binary: config.binary.clone(),
            runner,
        }
    }
}

fn server_block(target: &ConfigTarget) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "server {{");
    let _ = writeln!(out, "    listen 443 ssl;");
    let _ = writeln!(out, "    listen [::]:443 ssl;");
    let _ = writeln!(out, "    server_name {};", target.domains);
    let _ = writeln!(out);
    let _ = writeln!(out, "    ssl_certificate {};", target.cert_path.display());
    let _ = writeln!(out, "    ssl_certificate_key {};", target.key_path.display());
    let _ = writeln!(out, "    ssl_protocols TLSv1.2 TLSv1.3;");

    if let Some(webroot) = &target.webroot {
        let _ = writeln!(out);
        let _ = writeln!(out, "    root {};", webroot.display());
    }

    let _ = writeln!(out, "}}");

    if let Some(webroot) = &target.webroot {
        let _ = writeln!(out);
        let _ = writeln!(out, "server {{");
        let _ = writeln!(out, "    listen 80;");
        let _ = writeln!(out, "    listen [::]:80;");
        let _ = writeln!(out, "    server_name {};", target.domains);
        let _ = writeln!(out);
        let _ = writeln!(out, "    location /.well-known/acme-challenge/ {{");
        let _ = writeln!(out, "        root {};", webroot.display());
        let _ = writeln!(out, "    }}");
        let _ = writeln!(out);
        let _ = writeln!(out, "    location / {{");
        let _ = writeln!(out, "        return 301 https://$host$request_uri;");
        let _ = writeln!(out, "    }}");
        let _ = writeln!(out, "}}");
    }

    out
}

#[async_trait]
impl Configurator for Nginx {
    fn kind(&self) -> WebServerKind {
        WebServerKind::Nginx
    }

    async fn configure(&self, target: &ConfigTarget) -> Result<()> {
        let path = write_managed_block(&self.conf_dir, &target.primary, &server_block(target))?;
        log::info!("updated {}", path.display());
        Ok(())
    }

    async fn test(&self) -> Result<()> {
        run_checked(&*self.runner, &self.binary, &["-t"])
            .await
            .map(drop)
            .map_err(|output| Error::ConfigurationInvalid {
                server: WebServerKind::Nginx,
                output,
            })
    }

    async fn reload(&self) -> Result<()> {
        run_checked(&*self.runner, &self.binary, &["-s", "reload"])
            .await
            .map(drop)
            .map_err(|output| Error::ReloadFailed {
                server: WebServerKind::Nginx,
                output,
            })
    }
}
