//! The install and renew state machine.
//!
//! ```text
//! Idle -> Validating -> ObtainingIdentity -> Acquiring -> Persisting -> Configuring -> Done
//!   \-> CheckingExpiry (renew) -------------^  (not due: straight to Done)
//! ```
//!
//! Any state can end in `Failed`. Remote failures inside `Acquiring` do not; they produce a
//! self-signed certificate instead.

use std::{fmt, path::PathBuf, sync::Arc};

use crate::{
    account::AccountStore,
    acme::{AcmeCapability, CertificateMaterial, DnsPublisher},
    challenge::{self, ChallengeIntent, ChallengeMethod},
    config::Config,
    domain::DomainSet,
    error::{Error, Result},
    pipeline::{AcquisitionRequest, Origin, Pipeline},
    store::{self, CertStatus, CertificateRecord, CertificateStore, Issuer},
    webserver::{
        self, configurator_for, CommandRunner, ConfigTarget, Configurator, SystemRunner,
        WebServerKind,
    },
};

/// Lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    CheckingExpiry,
    Validating,
    ObtainingIdentity,
    Acquiring,
    Persisting,
    Configuring,
    Done,
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Idle => "idle",
            State::CheckingExpiry => "checking-expiry",
            State::Validating => "validating",
            State::ObtainingIdentity => "obtaining-identity",
            State::Acquiring => "acquiring",
            State::Persisting => "persisting",
            State::Configuring => "configuring",
            State::Done => "done",
            State::Failed => "failed",
        })
    }
}

struct Transitions {
    label: String,
    state: State,
}

impl Transitions {
    fn new(label: impl Into<String>) -> Self {
        Transitions {
            label: label.into(),
            state: State::Idle,
        }
    }

    fn enter(&mut self, next: State) {
        log::debug!("{}: {} -> {next}", self.label, self.state);
        self.state = next;
    }

    fn finish<T>(&mut self, res: Result<T>) -> Result<T> {
        match &res {
            Ok(_) => self.enter(State::Done),
            Err(err) => {
                self.enter(State::Failed);
                log::debug!("{}: {err}", self.label);
            }
        }

        res
    }
}

/// Input to [`LifecycleManager::install`].
#[derive(Debug, Clone)]
pub struct InstallRequest {
    /// One name or a comma-separated list, validated during install.
    pub domains: String,
    pub email: String,
    pub intent: ChallengeIntent,
    pub web_server: Option<WebServerKind>,
}

/// Whether the web server was touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerOutcome {
    Configured(WebServerKind),
    Skipped,
}

#[derive(Debug)]
pub struct InstallOutcome {
    pub record: CertificateRecord,
    pub origin: Origin,

    /// TXT record names the operator must publish for DNS validation.
    pub dns_records: Vec<String>,

    pub server: ServerOutcome,
    pub state: State,
}

#[derive(Debug)]
pub enum RenewOutcome {
    /// Expiry is further away than the renewal threshold; nothing was done.
    NotDue { domains: DomainSet, days_left: i64 },

    Renewed(InstallOutcome),
}

/// Result of renewing one stored certificate during [`LifecycleManager::renew_all`].
#[derive(Debug)]
pub struct RenewReport {
    pub domains: DomainSet,
    pub result: Result<RenewOutcome>,
}

/// Everything needed from `ObtainingIdentity` onward.
struct Job {
    domains: DomainSet,
    email: String,
    method: ChallengeMethod,
    webroot: Option<PathBuf>,
    web_server: Option<WebServerKind>,
    existing: Option<CertificateMaterial>,
}

type ConfiguratorFactory = dyn Fn(WebServerKind) -> Arc<dyn Configurator> + Send + Sync;

/// Issues, renews, stores and deploys certificates.
pub struct LifecycleManager {
    config: Config,
    acme: Arc<dyn AcmeCapability>,
    dns: Option<Arc<dyn DnsPublisher>>,
    accounts: AccountStore,
    store: CertificateStore,
    configurators: Box<ConfiguratorFactory>,
    orders: tokio::sync::Mutex<()>,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    pub fn new(config: Config, acme: Arc<dyn AcmeCapability>) -> Self {
        let store = CertificateStore::new(&config.cert_dir, config.lock_timeout());
        let accounts = AccountStore::new(config.account_dir());

        let server_config = config.clone();
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let configurators: Box<ConfiguratorFactory> = Box::new(move |kind: WebServerKind| {
            let configurator: Arc<dyn Configurator> =
                configurator_for(kind, &server_config, Arc::clone(&runner)).into();
            configurator
        });

        LifecycleManager {
            config,
            acme,
            dns: None,
            accounts,
            store,
            configurators,
            orders: tokio::sync::Mutex::new(()),
        }
    }

    /// Uses `publisher` for DNS-01 instead of falling back to a self-signed certificate.
    pub fn with_dns_publisher(mut self, publisher: Arc<dyn DnsPublisher>) -> Self {
        self.dns = Some(publisher);
        self
    }

    /// Replaces how web server configurators are built.
    pub fn with_configurators<F>(mut self, factory: F) -> Self
    where
        F: Fn(WebServerKind) -> Arc<dyn Configurator> + Send + Sync + 'static,
    {
        self.configurators = Box::new(factory);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    /// Obtains a certificate for a new request, stores it, and deploys it.
    pub async fn install(&self, req: &InstallRequest) -> Result<InstallOutcome> {
        let mut states = Transitions::new(format!("install {}", req.domains));
        let res = self.install_inner(req, &mut states).await;
        states.finish(res).map(|mut outcome| {
            outcome.state = states.state;
            outcome
        })
    }

    async fn install_inner(
        &self,
        req: &InstallRequest,
        states: &mut Transitions,
    ) -> Result<InstallOutcome> {
        states.enter(State::Validating);

        let domains = DomainSet::parse(&req.domains)?;
        let method = challenge::select(&domains, &req.intent)?;
        Pipeline::check_method(&domains, method)?;

        log::info!("installing certificate for {domains} using {method} validation");

        let job = Job {
            domains,
            email: req.email.clone(),
            method,
            webroot: req.intent.webroot.clone(),
            web_server: req.web_server,
            existing: None,
        };

        self.run(job, states).await
    }

    /// Renews the certificate for `domains` if it is due, or unconditionally with `force`.
    ///
    /// Uses the parameters recorded when the certificate was installed.
    pub async fn renew(&self, domains: &DomainSet, force: bool) -> Result<RenewOutcome> {
        let mut states = Transitions::new(format!("renew {domains}"));
        let res = self.renew_inner(domains, force, &mut states).await;
        states.finish(res).map(|outcome| match outcome {
            RenewOutcome::Renewed(mut outcome) => {
                outcome.state = states.state;
                RenewOutcome::Renewed(outcome)
            }
            not_due => not_due,
        })
    }

    async fn renew_inner(
        &self,
        domains: &DomainSet,
        force: bool,
        states: &mut Transitions,
    ) -> Result<RenewOutcome> {
        states.enter(State::CheckingExpiry);

        let status = self.store.info(domains)?;

        if !force && !store::needs_renewal(&status) {
            log::info!(
                "certificate for {domains} has {} days left, not due for renewal",
                status.days_left
            );
            return Ok(RenewOutcome::NotDue {
                domains: domains.clone(),
                days_left: status.days_left,
            });
        }

        log::info!(
            "renewing certificate for {domains} ({} days left)",
            status.days_left
        );

        let meta = self.store.metadata(domains)?.unwrap_or_default();

        let email = meta.email.clone().ok_or_else(|| {
            Error::Config(format!(
                "no account email recorded for {domains}; run install again"
            ))
        })?;

        states.enter(State::Validating);
        let method = meta.challenge.unwrap_or(ChallengeMethod::Webroot);
        let intent = ChallengeIntent::from_method(method, meta.webroot.clone());
        let method = challenge::select(domains, &intent)?;

        let existing = match meta.issuer {
            Some(Issuer::Acme) => {
                self.store
                    .certificate_pem(domains)?
                    .map(|(certificate_pem, issuer_chain_pem)| CertificateMaterial {
                        domains: domains.clone(),
                        certificate_pem,
                        issuer_chain_pem,
                        cert_url: meta.cert_url.clone(),
                        cert_stable_url: meta.cert_stable_url.clone(),
                    })
            }
            _ => None,
        };

        let job = Job {
            domains: domains.clone(),
            email,
            method,
            webroot: meta.webroot,
            web_server: meta.web_server,
            existing,
        };

        self.run(job, states).await.map(RenewOutcome::Renewed)
    }

    /// Renews every stored certificate that is due, or all of them with `force`.
    ///
    /// A failure for one certificate does not stop the others.
    pub async fn renew_all(&self, force: bool) -> Result<Vec<RenewReport>> {
        let mut reports = Vec::new();

        for domains in self.store.list()? {
            let result = self.renew(&domains, force).await;

            if let Err(err) = &result {
                log::error!("renewal of {domains} failed: {err}");
            }

            reports.push(RenewReport { domains, result });
        }

        Ok(reports)
    }

    /// Resolves command line input to a stored domain set.
    ///
    /// A single name matches a stored set whose primary name it is, so `example.com` finds the
    /// `example.com_san` certificate. Anything else is parsed as given.
    pub fn find(&self, input: &str) -> Result<DomainSet> {
        let requested = DomainSet::parse(input)?;

        if requested.is_multi() {
            return Ok(requested);
        }

        let stored = self
            .store
            .list()?
            .into_iter()
            .find(|set| set.primary() == requested.primary());

        Ok(stored.unwrap_or(requested))
    }

    pub fn status(&self, domains: &DomainSet) -> Result<CertStatus> {
        self.store.info(domains)
    }

    /// Status of every stored certificate. Unreadable ones are logged and skipped.
    pub fn status_all(&self) -> Result<Vec<CertStatus>> {
        let mut statuses = Vec::new();

        for domains in self.store.list()? {
            match self.store.info(&domains) {
                Ok(status) => statuses.push(status),
                Err(err) => log::warn!("skipping {domains}: {err}"),
            }
        }

        Ok(statuses)
    }

    async fn run(&self, job: Job, states: &mut Transitions) -> Result<InstallOutcome> {
        states.enter(State::ObtainingIdentity);

        // creates the certificate directory; must fail before the authority is contacted
        let lock = self.store.lock(&job.domains).await?;
        let mut account = self.accounts.load_or_create(&job.email)?;

        match self
            .accounts
            .ensure_registered(&mut account, &*self.acme)
            .await
        {
            Ok(()) => {}
            Err(err @ Error::AccountRegistrationFailed { .. }) => {
                log::warn!("{err}; continuing without a cached registration");
            }
            Err(err) => return Err(err),
        }

        states.enter(State::Acquiring);

        let pipeline = Pipeline {
            store: &self.store,
            acme: &*self.acme,
            orders: &self.orders,
            dns: self.dns.clone(),
            key_algorithm: self.config.key_algorithm,
            http_port: self.config.http_port,
            tls_port: self.config.tls_port,
        };

        let req = AcquisitionRequest {
            domains: &job.domains,
            method: job.method,
            webroot: job.webroot.clone(),
            account: &account,
            existing: job.existing,
            web_server: job.web_server,
        };

        let acquisition = pipeline.acquire(&lock, &req).await?;

        states.enter(State::Persisting);
        pipeline.persist(&lock, &acquisition)?;
        drop(lock);

        states.enter(State::Configuring);

        let server = match job.web_server {
            Some(kind) => {
                let target = ConfigTarget {
                    kind,
                    primary: job.domains.primary().to_owned(),
                    domains: job.domains.join(" "),
                    cert_path: self.store.fullchain_path(&job.domains),
                    key_path: self.store.key_path(&job.domains),
                    webroot: job.webroot,
                };

                let configurator = (self.configurators)(kind);
                webserver::apply(&*configurator, &target).await?;
                ServerOutcome::Configured(kind)
            }

            None => {
                log::warn!(
                    "no web server selected; certificate for {} stored but not deployed",
                    job.domains
                );
                ServerOutcome::Skipped
            }
        };

        Ok(InstallOutcome {
            record: acquisition.record,
            origin: acquisition.origin,
            dns_records: acquisition.dns_records,
            server,
            state: states.state,
        })
    }
}
