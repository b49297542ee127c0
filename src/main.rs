//! `autocert` command line.

use std::{path::PathBuf, sync::Arc};

use autocert::{
    scheduler::{self, DEFAULT_CRON, DEFAULT_TASK_NAME},
    webserver::SystemRunner,
    AcmeClient, CertStatus, ChallengeIntent, Config, InstallOutcome, InstallRequest,
    LifecycleManager, Origin, RenewOutcome, ServerOutcome, WebServerKind,
};
use clap::{ArgGroup, Args, Parser, Subcommand};

/// Issue, renew, and deploy ACME certificates
#[derive(Debug, Parser)]
#[command(name = "autocert", version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "AUTOCERT_CONFIG")]
    config: Option<PathBuf>,

    /// Certificate store directory
    #[arg(long, global = true, env = "AUTOCERT_CERT_DIR")]
    cert_dir: Option<PathBuf>,

    /// Use the Let's Encrypt staging environment
    #[arg(long, global = true)]
    staging: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Obtain a certificate and deploy it
    Install(InstallArgs),

    /// Renew certificates that expire within 30 days
    Renew {
        /// Only this certificate
        #[arg(short, long, conflicts_with = "all")]
        domain: Option<String>,

        /// Renew every certificate regardless of expiry
        #[arg(long)]
        all: bool,
    },

    /// Show certificate expiry
    Status {
        /// Only this certificate
        #[arg(short, long)]
        domain: Option<String>,
    },

    /// Manage the scheduled renewal task
    #[command(subcommand)]
    Schedule(ScheduleCommand),
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("target").required(true).args(["domain", "domains"])))]
#[command(group(ArgGroup::new("method").args(["webroot", "standalone", "dns"])))]
#[command(group(ArgGroup::new("server").args(["nginx", "apache", "iis"])))]
struct InstallArgs {
    /// Domain name, e.g. example.com or *.example.com
    #[arg(short, long)]
    domain: Option<String>,

    /// Comma-separated domain names for one certificate
    #[arg(long)]
    domains: Option<String>,

    /// Contact email for the ACME account
    #[arg(short, long)]
    email: String,

    /// Answer HTTP-01 challenges from this web root
    #[arg(short, long)]
    webroot: Option<PathBuf>,

    /// Answer TLS-ALPN-01 challenges on a temporary listener
    #[arg(long)]
    standalone: bool,

    /// Validate through DNS TXT records (required for wildcards)
    #[arg(long)]
    dns: bool,

    /// Deploy to nginx
    #[arg(long)]
    nginx: bool,

    /// Deploy to Apache
    #[arg(long)]
    apache: bool,

    /// Deploy to IIS
    #[arg(long)]
    iis: bool,
}

impl InstallArgs {
    fn web_server(&self) -> Option<WebServerKind> {
        if self.nginx {
            Some(WebServerKind::Nginx)
        } else if self.apache {
            Some(WebServerKind::Apache)
        } else if self.iis {
            Some(WebServerKind::Iis)
        } else {
            None
        }
    }

    fn into_request(self) -> InstallRequest {
        let web_server = self.web_server();

        InstallRequest {
            domains: self.domains.or(self.domain).unwrap_or_default(),
            email: self.email,
            intent: ChallengeIntent {
                standalone: self.standalone,
                webroot: self.webroot,
                dns: self.dns,
            },
            web_server,
        }
    }
}

#[derive(Debug, Subcommand)]
enum ScheduleCommand {
    /// Register a daily `autocert renew` run
    Install {
        #[arg(long, default_value = DEFAULT_TASK_NAME)]
        name: String,

        /// Cron expression; Windows accepts daily expressions only
        #[arg(long, default_value = DEFAULT_CRON)]
        cron: String,
    },

    /// Remove the scheduled task
    Remove {
        #[arg(long, default_value = DEFAULT_TASK_NAME)]
        name: String,
    },

    /// List scheduled autocert tasks
    List,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.cert_dir {
        config.cert_dir = dir;
    }
    if cli.staging {
        config.staging = true;
    }

    // no requests are made until a command needs the authority
    let acme = Arc::new(AcmeClient::from_config(&config)?);
    log::debug!("using ACME directory {}", acme.directory_url());
    let manager = LifecycleManager::new(config, acme);

    match cli.command {
        Command::Install(args) => {
            let outcome = manager.install(&args.into_request()).await?;
            print_install(&outcome);
        }

        Command::Renew {
            domain: Some(domain),
            ..
        } => {
            let domains = manager.find(&domain)?;

            match manager.renew(&domains, false).await? {
                RenewOutcome::NotDue { days_left, .. } => {
                    println!("{domains}: {days_left} days left, renewal not due");
                }
                RenewOutcome::Renewed(outcome) => print_install(&outcome),
            }
        }

        Command::Renew { domain: None, all } => {
            let reports = manager.renew_all(all).await?;

            if reports.is_empty() {
                println!("no certificates found in {}", manager.store().root().display());
            }

            let mut failed = 0;
            for report in reports {
                match report.result {
                    Ok(RenewOutcome::NotDue { days_left, .. }) => {
                        println!("{}: {days_left} days left, renewal not due", report.domains);
                    }
                    Ok(RenewOutcome::Renewed(outcome)) => print_install(&outcome),
                    Err(err) => {
                        failed += 1;
                        eprintln!("{}: renewal failed: {err}", report.domains);
                    }
                }
            }

            if failed > 0 {
                eyre::bail!("{failed} certificate(s) failed to renew");
            }
        }

        Command::Status {
            domain: Some(domain),
        } => {
            let status = manager.status(&manager.find(&domain)?)?;
            print_status(&status);
        }

        Command::Status { domain: None } => {
            let statuses = manager.status_all()?;

            if statuses.is_empty() {
                println!("no certificates found in {}", manager.store().root().display());
            } else {
                print_status_table(&statuses);
            }
        }

        Command::Schedule(cmd) => schedule(cmd).await?,
    }

    Ok(())
}

async fn schedule(cmd: ScheduleCommand) -> eyre::Result<()> {
    let sched = scheduler::system_scheduler(Arc::new(SystemRunner));

    match cmd {
        ScheduleCommand::Install { name, cron } => {
            let exe = std::env::current_exe()?;
            sched.install(&name, &exe, &cron).await?;
            println!("scheduled task {name:?} installed ({cron})");
        }

        ScheduleCommand::Remove { name } => {
            sched.remove(&name).await?;
            println!("scheduled task {name:?} removed");
        }

        ScheduleCommand::List => {
            let tasks = sched.list().await?;

            if tasks.is_empty() {
                println!("no autocert tasks scheduled");
                return Ok(());
            }

            println!("{:<24} {:<12} {:<24} {:<24}", "NAME", "STATUS", "NEXT RUN", "LAST RUN");
            for task in tasks {
                let next = task.next_run.or(task.schedule).unwrap_or_else(|| "-".to_owned());
                let last = task.last_run.unwrap_or_else(|| "-".to_owned());
                println!("{:<24} {:<12} {next:<24} {last:<24}", task.name, task.status);
            }
        }
    }

    Ok(())
}

fn print_install(outcome: &InstallOutcome) {
    let record = &outcome.record;

    for name in &outcome.dns_records {
        println!("DNS TXT record required: {name}");
    }

    match &outcome.origin {
        Origin::Authority => println!(
            "certificate for {} issued, expires {}",
            record.domains,
            record.expires_at.date()
        ),

        Origin::SelfSigned { reason } => {
            eprintln!("WARNING: {} uses a SELF-SIGNED certificate", record.domains);
            eprintln!("WARNING: reason: {reason}");
            eprintln!("WARNING: clients will reject it until `autocert renew --all` succeeds");
        }
    }

    match outcome.server {
        ServerOutcome::Configured(kind) => println!("{kind} configured and reloaded"),
        ServerOutcome::Skipped => println!("no web server selected; configure it manually"),
    }
}

fn print_status(status: &CertStatus) {
    println!("domain:      {}", status.domain);
    if status.domains.len() > 1 {
        println!("all names:   {}", status.domains.join(", "));
    }
    println!("certificate: {}", status.cert_path.display());
    println!("key:         {}", status.key_path.display());
    println!("expires:     {}", status.expires_at_rfc3339());
    println!("days left:   {}", status.days_left);
    println!("issuer:      {}", issuer_label(status));
    println!("valid:       {}", if status.is_valid { "yes" } else { "EXPIRED" });
}

fn print_status_table(statuses: &[CertStatus]) {
    println!(
        "{:<32} {:<8} {:<22} {:>9}  {}",
        "DOMAIN", "VALID", "EXPIRES", "DAYS LEFT", "ISSUER"
    );

    for status in statuses {
        println!(
            "{:<32} {:<8} {:<22} {:>9}  {}",
            status.domains.join(","),
            if status.is_valid { "yes" } else { "EXPIRED" },
            status.expires_at_rfc3339(),
            status.days_left,
            issuer_label(status),
        );
    }
}

fn issuer_label(status: &CertStatus) -> &'static str {
    match status.issuer {
        Some(autocert::store::Issuer::Acme) => "acme",
        Some(autocert::store::Issuer::SelfSigned) => "SELF-SIGNED",
        None => "unknown",
    }
}
