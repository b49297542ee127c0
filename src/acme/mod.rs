//! Certificate authority access.
//!
//! The lifecycle code only sees the [`AcmeCapability`] interface. [`AcmeClient`] implements it
//! against an RFC 8555 server such as [Let's Encrypt](https://letsencrypt.org/), answering
//! challenges with the responder set through
//! [`set_challenge_responder`](AcmeCapability::set_challenge_responder).
//!
//! # Rate Limits
//!
//! Let's Encrypt uses [rate limits] to ensure the API is not being abused. Use the staging
//! directory while developing.
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::prelude::*;
use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::{account::Account, config::Config, domain::DomainSet, store::split_pem_chain};

pub mod api;
mod jws;
mod responder;
mod transport;

#[cfg(test)]
mod test;

pub use self::responder::HTTP_CHALLENGE_PATH;
use self::{
    responder::ActiveResponder,
    transport::{expect_header, NoncePool, Transport},
};

/// Certificate and chain as returned by the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateMaterial {
    pub domains: DomainSet,

    /// Leaf certificate in PEM.
    pub certificate_pem: String,

    /// Issuer certificates in PEM, when the authority sent any.
    pub issuer_chain_pem: Option<String>,

    pub cert_url: Option<String>,
    pub cert_stable_url: Option<String>,
}

impl CertificateMaterial {
    /// Splits a downloaded `application/pem-certificate-chain` body into leaf and chain.
    pub fn from_pem_chain(domains: DomainSet, pem_chain: &str) -> eyre::Result<Self> {
        let mut ders = split_pem_chain(pem_chain)?.into_iter();

        let leaf = ders
            .next()
            .ok_or_else(|| eyre::eyre!("certificate download contained no certificate"))?;

        let chain = ders
            .map(|der| encode_cert_pem(&der))
            .collect::<eyre::Result<String>>()?;

        Ok(CertificateMaterial {
            domains,
            certificate_pem: encode_cert_pem(&leaf)?,
            issuer_chain_pem: (!chain.is_empty()).then_some(chain),
            cert_url: None,
            cert_stable_url: None,
        })
    }
}

fn encode_cert_pem(der: &[u8]) -> eyre::Result<String> {
    pem::encode_string("CERTIFICATE", pem::LineEnding::LF, der)
        .map_err(|err| eyre::eyre!("failed to encode certificate PEM: {err}"))
}

/// Publishes DNS-01 TXT records. Nothing in this crate implements it; provider integrations
/// plug in here.
#[async_trait]
pub trait DnsPublisher: Send + Sync {
    /// Creates a TXT record `record` (e.g. `_acme-challenge.example.com`) holding `value`.
    async fn publish(&self, record: &str, value: &str) -> eyre::Result<()>;

    /// Removes what [`publish`](Self::publish) created.
    async fn cleanup(&self, record: &str) -> eyre::Result<()>;
}

/// How challenges are answered during the next order.
#[derive(Clone)]
pub enum ResponderSpec {
    /// HTTP-01. Files go into `webroot` when given, otherwise a temporary server listens on
    /// `port`.
    Http01 { webroot: Option<PathBuf>, port: u16 },

    /// TLS-ALPN-01 on a temporary listener.
    TlsAlpn01 { port: u16 },

    /// DNS-01 through an external publisher.
    Dns01 { publisher: Arc<dyn DnsPublisher> },
}

impl fmt::Debug for ResponderSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponderSpec::Http01 { webroot, port } => f
                .debug_struct("Http01")
                .field("webroot", webroot)
                .field("port", port)
                .finish(),
            ResponderSpec::TlsAlpn01 { port } => {
                f.debug_struct("TlsAlpn01").field("port", port).finish()
            }
            ResponderSpec::Dns01 { .. } => f.debug_struct("Dns01").finish_non_exhaustive(),
        }
    }
}

/// The certificate authority, as seen by the acquisition pipeline.
///
/// Every failure is recoverable from the caller's point of view.
#[async_trait]
pub trait AcmeCapability: Send + Sync {
    /// Registers `account` and returns its account URL.
    async fn register(&self, account: &Account) -> eyre::Result<String>;

    /// Selects how the next order's challenges are answered.
    ///
    /// There is one responder per capability, not per order; callers running orders
    /// concurrently must hold their own lock from this call until the order completes.
    fn set_challenge_responder(&self, responder: ResponderSpec);

    /// Orders, validates, finalizes with `csr_der`, and downloads a certificate.
    async fn obtain(
        &self,
        account: &Account,
        domains: &DomainSet,
        csr_der: &[u8],
    ) -> eyre::Result<CertificateMaterial>;

    /// Replaces `existing` with a freshly issued certificate for the same names.
    async fn renew(
        &self,
        account: &Account,
        existing: &CertificateMaterial,
        csr_der: &[u8],
    ) -> eyre::Result<CertificateMaterial> {
        self.obtain(account, &existing.domains, csr_der).await
    }
}

/// Directory resources shared by every request to one server.
#[derive(Debug)]
struct DirectoryState {
    api: api::Directory,
    nonce_pool: Arc<NoncePool>,
}

/// [`AcmeCapability`] over RFC 8555.
pub struct AcmeClient {
    directory_url: String,
    http: reqwest::Client,
    directory: OnceCell<DirectoryState>,
    responder: Mutex<Option<ResponderSpec>>,
    poll_interval: Duration,
    poll_attempts: u32,
}

impl fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeClient")
            .field("directory_url", &self.directory_url)
            .finish_non_exhaustive()
    }
}

impl AcmeClient {
    pub fn new(directory_url: impl Into<String>) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("autocert/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(AcmeClient {
            directory_url: directory_url.into(),
            http,
            directory: OnceCell::new(),
            responder: Mutex::new(None),
            poll_interval: Duration::from_secs(2),
            poll_attempts: 30,
        })
    }

    pub fn from_config(config: &Config) -> eyre::Result<Self> {
        let client = Self::new(config.directory_url())?;
        Ok(client.with_polling(config.poll_interval(), config.poll_attempts))
    }

    pub fn with_polling(mut self, interval: Duration, attempts: u32) -> Self {
        self.poll_interval = interval;
        self.poll_attempts = attempts.max(1);
        self
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    async fn directory(&self) -> eyre::Result<&DirectoryState> {
        self.directory
            .get_or_try_init(|| async {
                let res = transport::get(&self.http, &self.directory_url).await?;
                let api = res.json::<api::Directory>().await?;
                let nonce_pool = Arc::new(NoncePool::new(&api.new_nonce));

                log::debug!("using ACME directory {}", self.directory_url);
                Ok::<_, eyre::Report>(DirectoryState { api, nonce_pool })
            })
            .await
    }

    /// Calls newAccount. For a key the server already knows this returns the existing
    /// account, so it doubles as the key ID lookup.
    async fn upsert_account(&self, account: &Account) -> eyre::Result<Transport> {
        let dir = self.directory().await?;

        let payload = api::Account {
            contact: Some(vec![format!("mailto:{}", account.email)]),
            terms_of_service_agreed: Some(true),
            ..Default::default()
        };

        let mut transport = Transport::new(
            self.http.clone(),
            Arc::clone(&dir.nonce_pool),
            account.key.clone(),
        );
        let res = transport.call_jwk(&dir.api.new_account, &payload).await?;

        let kid = expect_header(&res, "location")
            .ok_or_else(|| eyre::eyre!("newAccount response has no Location header"))?;
        log::debug!("key ID is: {kid}");

        let api_account = res.json::<api::Account>().await?;
        if let Some(status) = api_account.status.as_deref().filter(|s| *s != "valid") {
            eyre::bail!("account {kid} is {status}");
        }

        transport.set_key_id(kid);
        Ok(transport)
    }

    async fn transport_for(&self, account: &Account) -> eyre::Result<Transport> {
        match &account.registration {
            Some(kid) => {
                let dir = self.directory().await?;
                let mut transport = Transport::new(
                    self.http.clone(),
                    Arc::clone(&dir.nonce_pool),
                    account.key.clone(),
                );
                transport.set_key_id(kid.clone());
                Ok(transport)
            }

            None => self.upsert_account(account).await,
        }
    }

    async fn new_order(
        &self,
        transport: &Transport,
        domains: &DomainSet,
    ) -> eyre::Result<(api::Order, String)> {
        let dir = self.directory().await?;

        let mut order = api::Order::from_domains(domains.domains().iter().map(String::as_str));
        let res = transport.call_kid(&dir.api.new_order, &order).await?;

        let order_url = expect_header(&res, "location")
            .ok_or_else(|| eyre::eyre!("newOrder response has no Location header"))?;
        order.overwrite(res.json::<api::Order>().await?)?;

        log::debug!("created order {order_url} for {domains}");
        Ok((order, order_url))
    }

    async fn fetch<T>(&self, transport: &Transport, url: &str) -> eyre::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        Ok(transport
            .call_kid(url, &api::EmptyString)
            .await?
            .json::<T>()
            .await?)
    }

    async fn authorize(
        &self,
        transport: &Transport,
        responder: &mut ActiveResponder,
        auth_url: &str,
    ) -> eyre::Result<()> {
        let auth = self.fetch::<api::Authorization>(transport, auth_url).await?;
        let domain = auth.identifier.value.clone();

        match auth.status {
            api::AuthorizationStatus::Valid => {
                log::debug!("{domain} is already authorized");
                return Ok(());
            }
            api::AuthorizationStatus::Pending => {}
            status => eyre::bail!("authorization for {domain} is {status:?}"),
        }

        let challenge_type = responder.challenge_type();
        let challenge = auth.challenge(challenge_type).ok_or_else(|| {
            eyre::eyre!("server offered no {challenge_type} challenge for {domain}")
        })?;

        let key_auth = jws::key_authorization(&challenge.token, transport.key())?;
        responder
            .present(&domain, &challenge.token, &key_auth)
            .await?;

        log::info!("requesting {challenge_type} validation for {domain}");
        transport
            .call_kid(&challenge.url, &api::EmptyObject)
            .await?;

        let auth = self.poll_authorization(transport, auth_url).await?;

        if auth.status != api::AuthorizationStatus::Valid {
            let reason = auth
                .problem()
                .map_or_else(|| "no error reported".to_owned(), ToString::to_string);
            eyre::bail!("validation of {domain} failed: {reason}");
        }

        log::info!("{domain} validated");
        Ok(())
    }

    /// Polls the authorization until it leaves the "pending" state.
    async fn poll_authorization(
        &self,
        transport: &Transport,
        auth_url: &str,
    ) -> eyre::Result<api::Authorization> {
        for _ in 0..self.poll_attempts {
            let auth = self.fetch::<api::Authorization>(transport, auth_url).await?;

            if auth.status != api::AuthorizationStatus::Pending {
                return Ok(auth);
            }

            tokio::time::sleep(self.poll_interval).await;
        }

        eyre::bail!(
            "authorization {auth_url} still pending after {} polls",
            self.poll_attempts
        )
    }

    /// Polls the order until `done` holds or it turns invalid.
    async fn poll_order(
        &self,
        transport: &Transport,
        order: &mut api::Order,
        order_url: &str,
        done: impl Fn(api::OrderStatus) -> bool,
    ) -> eyre::Result<()> {
        for attempt in 0..self.poll_attempts {
            match order.status {
                Some(status) if done(status) => return Ok(()),

                Some(api::OrderStatus::Invalid) => {
                    let reason = order
                        .error
                        .as_ref()
                        .map_or_else(|| "no error reported".to_owned(), ToString::to_string);
                    eyre::bail!("order {order_url} is invalid: {reason}");
                }

                _ => {}
            }

            if attempt > 0 {
                tokio::time::sleep(self.poll_interval).await;
            }

            order.overwrite(self.fetch(transport, order_url).await?)?;
        }

        eyre::bail!(
            "order {order_url} stuck in {:?} after {} polls",
            order.status,
            self.poll_attempts
        )
    }

    async fn run_order(
        &self,
        transport: &Transport,
        responder: &mut ActiveResponder,
        domains: &DomainSet,
        csr_der: &[u8],
    ) -> eyre::Result<CertificateMaterial> {
        let (mut order, order_url) = self.new_order(transport, domains).await?;

        for auth_url in order.authorizations.clone() {
            self.authorize(transport, responder, &auth_url).await?;
        }

        self.poll_order(transport, &mut order, &order_url, |status| {
            matches!(status, api::OrderStatus::Ready | api::OrderStatus::Valid)
        })
        .await?;

        if order.status != Some(api::OrderStatus::Valid) {
            log::info!("finalizing order for {domains}");

            let finalize = api::Finalize {
                csr: BASE64_URL_SAFE_NO_PAD.encode(csr_der),
            };
            // a rejected CSR comes back as an error status
            transport.call_kid(&order.finalize, &finalize).await?;

            self.poll_order(transport, &mut order, &order_url, |status| {
                status == api::OrderStatus::Valid
            })
            .await?;
        }

        let cert_url = order
            .certificate
            .clone()
            .ok_or_else(|| eyre::eyre!("valid order {order_url} has no certificate URL"))?;

        log::info!("downloading certificate for {domains}");
        let pem_chain = transport
            .call_kid(&cert_url, &api::EmptyString)
            .await?
            .text()
            .await?;

        let mut material = CertificateMaterial::from_pem_chain(domains.clone(), &pem_chain)?;
        material.cert_url = Some(cert_url.clone());
        material.cert_stable_url = Some(cert_url);

        Ok(material)
    }
}

#[async_trait]
impl AcmeCapability for AcmeClient {
    async fn register(&self, account: &Account) -> eyre::Result<String> {
        let transport = self.upsert_account(account).await?;

        transport
            .key_id()
            .map(ToOwned::to_owned)
            .ok_or_else(|| eyre::eyre!("registration returned no account URL"))
    }

    fn set_challenge_responder(&self, responder: ResponderSpec) {
        log::debug!("challenge responder: {responder:?}");
        *self.responder.lock() = Some(responder);
    }

    async fn obtain(
        &self,
        account: &Account,
        domains: &DomainSet,
        csr_der: &[u8],
    ) -> eyre::Result<CertificateMaterial> {
        let spec = self
            .responder
            .lock()
            .clone()
            .ok_or_else(|| eyre::eyre!("no challenge responder configured"))?;

        let transport = self.transport_for(account).await?;
        let mut responder = ActiveResponder::start(&spec)?;

        let res = self
            .run_order(&transport, &mut responder, domains, csr_der)
            .await;

        responder.cleanup().await;
        res
    }
}
