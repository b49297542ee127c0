use std::{fmt::Write as _, path::Path, sync::Arc};

use async_trait::async_trait;

use super::{run_checked, CommandRunner, ConfigTarget, Configurator, WebServerKind};
use crate::{
    config::IisConfig,
    error::{Error, Result},
};

const DEFAULT_SITE: &str = "Default Web Site";

/// IIS. The certificate is imported into the machine store and bound to the site by host name,
/// so existing bindings are left alone.
pub struct Iis {
    appcmd: String,
    site_name: String,
    app_pool: String,
    runner: Arc<dyn CommandRunner>,
}

impl Iis {
    pub fn new(config: &IisConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Iis {
            appcmd: config.appcmd.clone(),
            site_name: config
                .site_name
                .clone()
                .unwrap_or_else(|| DEFAULT_SITE.to_owned()),
            app_pool: config.app_pool.clone(),
            runner,
        }
    }
}

/// Single-quoted PowerShell literal.
fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn ps_path(path: &Path) -> String {
    ps_quote(&path.display().to_string())
}

/// Imports the PEM pair and adds one SNI binding per name.
fn import_script(site: &str, target: &ConfigTarget) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "$ErrorActionPreference = 'Stop'");
    let _ = writeln!(out, "Import-Module WebAdministration");
    let _ = writeln!(
        out,
        "$pem = [System.Security.Cryptography.X509Certificates.X509Certificate2]::CreateFromPemFile({}, {})",
        ps_path(&target.cert_path),
        ps_path(&target.key_path),
    );
    let _ = writeln!(
        out,
        "$pfx = [System.Security.Cryptography.X509Certificates.X509Certificate2]::new($pem.Export('Pfx'), '', 'MachineKeySet,PersistKeySet')"
    );
    let _ = writeln!(
        out,
        "$store = [System.Security.Cryptography.X509Certificates.X509Store]::new('My', 'LocalMachine')"
    );
    let _ = writeln!(out, "$store.Open('ReadWrite'); $store.Add($pfx); $store.Close()");

    for name in target.domains.split_whitespace() {
        let host = ps_quote(name);
        let site = ps_quote(site);

        let _ = writeln!(
            out,
            "if (-not (Get-WebBinding -Name {site} -Protocol https -HostHeader {host})) {{ New-WebBinding -Name {site} -Protocol https -Port 443 -HostHeader {host} -SslFlags 1 }}"
        );
        let _ = writeln!(
            out,
            "(Get-WebBinding -Name {site} -Protocol https -HostHeader {host}).AddSslCertificate($pfx.Thumbprint, 'My')"
        );
    }

    out
}

#[async_trait]
impl Configurator for Iis {
    fn kind(&self) -> WebServerKind {
        WebServerKind::Iis
    }

    async fn configure(&self, target: &ConfigTarget) -> Result<()> {
        let args = ["-NoProfile", "-NonInteractive", "-Command", "-"].map(str::to_owned);
        let script = import_script(&self.site_name, target);

        let output = self
            .runner
            .run_with_input("powershell", &args, &script)
            .await
            .map_err(|err| Error::ConfigurationInvalid {
                server: WebServerKind::Iis,
                output: format!("could not run powershell: {err}"),
            })?;

        if !output.success {
            return Err(Error::ConfigurationInvalid {
                server: WebServerKind::Iis,
                output: output.combined(),
            });
        }

        log::info!("bound certificate to IIS site {:?}", self.site_name);
        Ok(())
    }

    async fn test(&self) -> Result<()> {
        let site = format!("/name:{}", self.site_name);

        let output = run_checked(&*self.runner, &self.appcmd, &["list", "site", &site])
            .await
            .map_err(|output| Error::ConfigurationInvalid {
                server: WebServerKind::Iis,
                output,
            })?;

        if output.stdout.trim().is_empty() {
            return Err(Error::ConfigurationInvalid {
                server: WebServerKind::Iis,
                output: format!("site {:?} not found", self.site_name),
            });
        }

        Ok(())
    }

    /// Recycles the application pool; HTTP.sys picks up new bindings without a restart.
    async fn reload(&self) -> Result<()> {
        let pool = format!("/apppool.name:{}", self.app_pool);

        run_checked(&*self.runner, &self.appcmd, &["recycle", "apppool", &pool])
            .await
            .map(drop)
            .map_err(|output| Error::ReloadFailed {
                server: WebServerKind::Iis,
                output,
            })
    }
}
