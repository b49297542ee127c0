//! Deploying certificates into a running web server.
//!
//! Every variant follows the same sequence: [`Configurator::configure`] writes the TLS
//! configuration, [`Configurator::test`] runs the server's own syntax check, and only if that
//! passes [`Configurator::reload`] applies it. See [`apply`].

use std::{
    fmt, io,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    error::{Error, Result, Step},
    store::write_atomic,
};

mod apache;
mod iis;
mod nginx;

pub use self::{apache::Apache, iis::Iis, nginx::Nginx};

/// Supported web servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebServerKind {
    Nginx,
    Apache,
    Iis,
}

impl fmt::Display for WebServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WebServerKind::Nginx => "nginx",
            WebServerKind::Apache => "apache",
            WebServerKind::Iis => "iis",
        })
    }
}

impl FromStr for WebServerKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nginx" => Ok(WebServerKind::Nginx),
            "apache" | "httpd" => Ok(WebServerKind::Apache),
            "iis" => Ok(WebServerKind::Iis),
            other => Err(Error::Config(format!("unknown web server {other:?}"))),
        }
    }
}

/// What to deploy and where the files are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigTarget {
    pub kind: WebServerKind,

    /// Primary name, used to name the managed configuration.
    pub primary: String,

    /// Every name, space separated.
    pub domains: String,

    /// Certificate followed by its chain.
    pub cert_path: PathBuf,
    pub key_path: PathBuf,

    /// Served on port 80 so HTTP-01 renewals keep working.
    pub webroot: Option<PathBuf>,
}

/// Exit status and captured output of an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Both streams, trimmed, for error messages.
    pub fn combined(&self) -> String {
        [self.stderr.trim(), self.stdout.trim()]
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Runs external programs. Swapped out in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput>;

    /// Like [`run`](Self::run), feeding `stdin` to the process.
    async fn run_with_input(
        &self,
        program: &str,
        args: &[String],
        stdin: &str,
    ) -> io::Result<CommandOutput>;
}

/// [`CommandRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> io::Result<CommandOutput> {
        log::debug!("running {program} {}", args.join(" "));

        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn run_with_input(
        &self,
        program: &str,
        args: &[String],
        stdin: &str,
    ) -> io::Result<CommandOutput> {
        use std::process::Stdio;

        use tokio::io::AsyncWriteExt as _;

        log::debug!("running {program} {} with input", args.join(" "));

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// A web server whose TLS configuration can be updated.
#[async_trait]
pub trait Configurator: Send + Sync {
    fn kind(&self) -> WebServerKind;

    /// Writes or patches the TLS configuration for `target`, leaving unrelated configuration
    /// untouched.
    async fn configure(&self, target: &ConfigTarget) -> Result<()>;

    /// Runs the server's configuration check.
    async fn test(&self) -> Result<()>;

    /// Applies the configuration without dropping connections.
    async fn reload(&self) -> Result<()>;
}

/// Builds the configurator for `kind` from `config`.
pub fn configurator_for(
    kind: WebServerKind,
    config: &Config,
    runner: Arc<dyn CommandRunner>,
) -> Box<dyn Configurator> {
    match kind {
        WebServerKind::Nginx => Box::new(Nginx::new(&config.nginx, runner)),
        WebServerKind::Apache => Box::new(Apache::new(&config.apache, runner)),
        WebServerKind::Iis => Box::new(Iis::new(&config.iis, runner)),
    }
}

/// Configures, tests, then reloads. A failed test stops before reload.
pub async fn apply(configurator: &dyn Configurator, target: &ConfigTarget) -> Result<()> {
    let kind = configurator.kind();

    log::debug!("{}: writing {kind} configuration for {}", Step::Configure, target.primary);
    configurator.configure(target).await?;

    log::debug!("{}: checking {kind} configuration", Step::Test);
    configurator.test().await?;

    log::debug!("{}: reloading {kind}", Step::Reload);
    configurator.reload().await?;

    log::info!("{kind} now serves the certificate for {}", target.domains);
    Ok(())
}

/// Runs a command, treating spawn failures and non-zero exits alike.
pub(crate) async fn run_checked(
    runner: &dyn CommandRunner,
    program: &str,
    args: &[&str],
) -> std::result::Result<CommandOutput, String> {
    let args = args.iter().map(|arg| (*arg).to_owned()).collect::<Vec<_>>();

    match runner.run(program, &args).await {
        Ok(output) if output.success => Ok(output),
        Ok(output) => Err(output.combined()),
        Err(err) => Err(format!("could not run {program}: {err}")),
    }
}

fn begin_marker(primary: &str) -> String {
    format!("# BEGIN autocert {primary}")
}

fn end_marker(primary: &str) -> String {
    format!("# END autocert {primary}")
}

/// Replaces the block managed for `primary` inside `existing`, or appends it.
///
/// Everything outside the markers is preserved byte for byte.
pub(crate) fn merge_managed_block(existing: &str, primary: &str, body: &str) -> String {
    let begin = begin_marker(primary);
    let end = end_marker(primary);

    let mut block = format!("{begin}\n{body}");
    if !block.ends_with('\n') {
        block.push('\n');
    }
    block.push_str(&end);
    block.push('\n');

    if let Some(start) = existing.find(&begin) {
        if let Some(end_at) = existing[start..].find(&end).map(|i| start + i + end.len()) {
            let rest = existing[end_at..]
                .strip_prefix('\n')
                .unwrap_or(&existing[end_at..]);
            return format!("{}{block}{rest}", &existing[..start]);
        }
    }

    let mut merged = existing.to_owned();
    if !merged.is_empty() {
        if !merged.ends_with('\n') {
            merged.push('\n');
        }
        merged.push('\n');
    }
    merged.push_str(&block);
    merged
}

/// File name of the configuration managed for `primary`.
pub(crate) fn managed_file_name(primary: &str) -> String {
    format!("autocert-{}.conf", primary.replace('*', "_wildcard"))
}

/// Reads `<dir>/<name>`, merges the block, and writes it back atomically.
pub(crate) fn write_managed_block(dir: &Path, primary: &str, body: &str) -> Result<PathBuf> {
    let name = managed_file_name(primary);
    let path = dir.join(&name);

    let existing = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(Error::io(Step::Configure, path, err)),
    };

    std::fs::create_dir_all(dir).map_err(|err| Error::io(Step::Configure, dir, err))?;
    write_atomic(
        dir,
        &name,
        merge_managed_block(&existing, primary, body).as_bytes(),
        false,
        Step::Configure,
    )?;

    Ok(path)
}
