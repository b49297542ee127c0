//! Key generation, signing request, authority interaction, and the self-signed fallback.

use std::{path::PathBuf, sync::Arc};

use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use zeroize::Zeroizing;

use crate::{
    account::Account,
    acme::{AcmeCapability, CertificateMaterial, DnsPublisher, ResponderSpec},
    challenge::ChallengeMethod,
    domain::DomainSet,
    error::{Error, Result, Step},
    keys::{self, CertKey, KeyAlgorithm},
    store::{self, CertMetadata, CertificateRecord, CertificateStore, DirLock, Issuer},
    webserver::WebServerKind,
};

/// Everything the pipeline needs to know about one certificate request.
#[derive(Debug)]
pub struct AcquisitionRequest<'a> {
    pub domains: &'a DomainSet,
    pub method: ChallengeMethod,
    pub webroot: Option<PathBuf>,
    pub account: &'a Account,

    /// Authority-issued material being replaced, when renewing.
    pub existing: Option<CertificateMaterial>,

    /// Recorded in the metadata sidecar for later renewals.
    pub web_server: Option<WebServerKind>,
}

/// Where a certificate came from.
#[derive(Debug)]
pub enum Origin {
    Authority,

    /// Synthesized locally after `reason` prevented issuance.
    SelfSigned { reason: Error },
}

impl Origin {
    pub fn is_self_signed(&self) -> bool {
        matches!(self, Origin::SelfSigned { .. })
    }
}

/// A certificate ready to be persisted.
#[derive(Debug)]
pub struct Acquisition {
    pub record: CertificateRecord,
    pub origin: Origin,

    /// DNS-01 record names surfaced to the operator.
    pub dns_records: Vec<String>,
}

/// Turns an [`AcquisitionRequest`] into a [`CertificateRecord`].
pub struct Pipeline<'a> {
    pub store: &'a CertificateStore,
    pub acme: &'a dyn AcmeCapability,

    /// Held from choosing the challenge responder until the order finishes, since the
    /// capability keeps a single responder for all orders.
    pub orders: &'a tokio::sync::Mutex<()>,

    pub dns: Option<Arc<dyn DnsPublisher>>,
    pub key_algorithm: KeyAlgorithm,
    pub http_port: u16,
    pub tls_port: u16,
}

impl Pipeline<'_> {
    /// Rejects methods that cannot validate wildcard names.
    pub fn check_method(domains: &DomainSet, method: ChallengeMethod) -> Result<()> {
        match (method, domains.first_wildcard()) {
            (ChallengeMethod::Webroot | ChallengeMethod::Standalone, Some(domain)) => {
                Err(Error::WildcardUnsupportedForMethod {
                    method,
                    domain: domain.to_owned(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Generates a key, requests a certificate and falls back to a self-signed one if the
    /// authority cannot deliver.
    ///
    /// Only local failures are returned as errors. The key is on disk before the first remote
    /// call.
    pub async fn acquire(&self, lock: &DirLock, req: &AcquisitionRequest<'_>) -> Result<Acquisition> {
        let domains = req.domains;
        Self::check_method(domains, req.method)?;

        log::debug!("{}: generating {} key for {domains}", Step::KeyGen, self.key_algorithm);
        let key = CertKey::generate(self.key_algorithm)?;
        let key_path = self.store.write_key(lock, domains, key.pem())?;
        log::debug!("key written to {}", key_path.display());

        log::debug!("{}: building signing request", Step::Request);
        let csr = keys::create_csr(&key, domains)?;

        let dns_records = match req.method {
            ChallengeMethod::Dns => domains.dns_record_names(),
            _ => Vec::new(),
        };

        let obtained = self
            .obtain(req, &csr, &dns_records)
            .await
            .and_then(|material| self.authority_record(req, &key, material));

        match obtained {
            Ok(record) => {
                log::info!(
                    "certificate for {domains} issued by the authority, expires {}",
                    format_time(record.expires_at)
                );

                Ok(Acquisition {
                    record,
                    origin: Origin::Authority,
                    dns_records,
                })
            }

            Err(reason) => {
                log::warn!("SELF-SIGNED certificate issued for {domains}: {reason}");
                log::warn!("clients will not trust this certificate until it is renewed");

                let record = self.self_signed_record(req, &key)?;

                Ok(Acquisition {
                    record,
                    origin: Origin::SelfSigned { reason },
                    dns_records,
                })
            }
        }
    }

    /// Writes the acquired files into the store.
    pub fn persist(&self, lock: &DirLock, acquisition: &Acquisition) -> Result<()> {
        log::debug!("{}: saving certificate", Step::Persist);
        self.store.save(lock, &acquisition.record)?;

        log::info!(
            "certificate saved to {}",
            self.store.dir(&acquisition.record.domains).display()
        );
        Ok(())
    }

    /// Remote part of the pipeline. Every error routes to the fallback.
    async fn obtain(
        &self,
        req: &AcquisitionRequest<'_>,
        csr: &[u8],
        dns_records: &[String],
    ) -> Result<CertificateMaterial> {
        let responder = match req.method {
            ChallengeMethod::Webroot => ResponderSpec::Http01 {
                webroot: req.webroot.clone(),
                port: self.http_port,
            },

            ChallengeMethod::Standalone => ResponderSpec::TlsAlpn01 {
                port: self.tls_port,
            },

            ChallengeMethod::Dns => {
                for record in dns_records {
                    log::warn!("DNS validation requires a TXT record at {record}");
                }

                match &self.dns {
                    Some(publisher) => ResponderSpec::Dns01 {
                        publisher: Arc::clone(publisher),
                    },
                    None => return Err(Error::DnsProviderMissing),
                }
            }
        };

        log::debug!(
            "{}: requesting certificate for {} via {}",
            Step::Obtain,
            req.domains,
            req.method.acme_type()
        );
        let res = {
            let _turn = self.orders.lock().await;
            self.acme.set_challenge_responder(responder);

            match &req.existing {
                Some(existing) => self.acme.renew(req.account, existing, csr).await,
                None => self.acme.obtain(req.account, req.domains, csr).await,
            }
        };

        res.map_err(|cause| Error::AcquisitionFailed {
            step: Step::Obtain,
            cause,
        })
    }

    fn authority_record(
        &self,
        req: &AcquisitionRequest<'_>,
        key: &CertKey,
        material: CertificateMaterial,
    ) -> Result<CertificateRecord> {
        let parsed = store::parse_certificate(&material.certificate_pem).map_err(|reason| {
            Error::AcquisitionFailed {
                step: Step::Finalize,
                cause: eyre::eyre!("authority returned an unreadable certificate: {reason}"),
            }
        })?;

        let mut metadata = self.metadata(req, Issuer::Acme);
        metadata.cert_url = material.cert_url;
        metadata.cert_stable_url = material.cert_stable_url;

        Ok(CertificateRecord {
            domains: req.domains.clone(),
            certificate_pem: material.certificate_pem,
            private_key_pem: Zeroizing::new(key.pem().to_owned()),
            chain_pem: material.issuer_chain_pem,
            expires_at: parsed.not_after,
            issued_for: parsed.dns_names,
            metadata,
        })
    }

    fn self_signed_record(
        &self,
        req: &AcquisitionRequest<'_>,
        key: &CertKey,
    ) -> Result<CertificateRecord> {
        log::debug!("{}: signing with the generated key", Step::Fallback);

        let certificate_pem = keys::self_signed(key, req.domains)?;
        let parsed = store::parse_certificate(&certificate_pem).map_err(|reason| {
            Error::CertificateParse {
                path: self.store.cert_path(req.domains),
                reason,
            }
        })?;

        Ok(CertificateRecord {
            domains: req.domains.clone(),
            certificate_pem,
            private_key_pem: Zeroizing::new(key.pem().to_owned()),
            chain_pem: None,
            expires_at: parsed.not_after,
            issued_for: parsed.dns_names,
            metadata: self.metadata(req, Issuer::SelfSigned),
        })
    }

    fn metadata(&self, req: &AcquisitionRequest<'_>, issuer: Issuer) -> CertMetadata {
        CertMetadata {
            domain: req.domains.primary().to_owned(),
            domains: req.domains.domains().to_vec(),
            issuer: Some(issuer),
            issued_at: Some(format_time(OffsetDateTime::now_utc())),
            email: Some(req.account.email.clone()),
            challenge: Some(req.method),
            webroot: req.webroot.clone(),
            web_server: req.web_server,
            ..Default::default()
        }
    }
}

fn format_time(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_else(|_| at.to_string())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::account::AccountKey;

    /// Records responder selection and either fails or signs with a throwaway key.
    #[derive(Default)]
    struct ScriptedAcme {
        succeed: bool,
        responders: Mutex<Vec<String>>,
        renewals: Mutex<usize>,
    }

    #[async_trait]
    impl AcmeCapability for ScriptedAcme {
        async fn register(&self, _account: &Account) -> eyre::Result<String> {
            Ok("https://acme.test/acct/1".to_owned())
        }

        fn set_challenge_responder(&self, responder: ResponderSpec) {
            self.responders.lock().push(format!("{responder:?}"));
        }

        async fn obtain(
            &self,
            _account: &Account,
            domains: &DomainSet,
            _csr_der: &[u8],
        ) -> eyre::Result<CertificateMaterial> {
            if !self.succeed {
                eyre::bail!("connection refused");
            }

            let key = CertKey::generate(KeyAlgorithm::EcdsaP256)?;
            let pem = keys::self_signed(&key, domains)?;

            let mut material = CertificateMaterial::from_pem_chain(domains.clone(), &pem)?;
            material.issuer_chain_pem = Some(pem);
            material.cert_url = Some("https://acme.test/cert/1".to_owned());
            material.cert_stable_url = material.cert_url.clone();
            Ok(material)
        }

        async fn renew(
            &self,
            account: &Account,
            existing: &CertificateMaterial,
            csr_der: &[u8],
        ) -> eyre::Result<CertificateMaterial> {
            *self.renewals.lock() += 1;
            self.obtain(account, &existing.domains, csr_der).await
        }
    }

    /// Keeps one responder for every order and reports the one in effect mid-order.
    #[derive(Default)]
    struct SharedResponderAcme {
        current: Mutex<Option<String>>,
        seen: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl AcmeCapability for SharedResponderAcme {
        async fn register(&self, _account: &Account) -> eyre::Result<String> {
            Ok("https://acme.test/acct/1".to_owned())
        }

        fn set_challenge_responder(&self, responder: ResponderSpec) {
            *self.current.lock() = Some(format!("{responder:?}"));
        }

        async fn obtain(
            &self,
            _account: &Account,
            domains: &DomainSet,
            _csr_der: &[u8],
        ) -> eyre::Result<CertificateMaterial> {
            tokio::time::sleep(Duration::from_millis(50)).await;

            let responder = self.current.lock().clone().unwrap_or_default();
            self.seen.lock().push((domains.to_string(), responder));
            eyre::bail!("connection refused")
        }

        async fn renew(
            &self,
            account: &Account,
            existing: &CertificateMaterial,
            csr_der: &[u8],
        ) -> eyre::Result<CertificateMaterial> {
            self.obtain(account, &existing.domains, csr_der).await
        }
    }

    fn account() -> Account {
        Account {
            email: "ops@example.com".to_owned(),
            registration: None,
            key: AccountKey::generate(),
        }
    }

    fn pipeline<'a>(store: &'a CertificateStore, acme: &'a ScriptedAcme) -> Pipeline<'a> {
        Pipeline {
            store,
            acme,
            orders: Box::leak(Box::default()),
            dns: None,
            key_algorithm: KeyAlgorithm::EcdsaP256,
            http_port: 8080,
            tls_port: 8443,
        }
    }

    fn request<'a>(
        domains: &'a DomainSet,
        method: ChallengeMethod,
        account: &'a Account,
    ) -> AcquisitionRequest<'a> {
        AcquisitionRequest {
            domains,
            method,
            webroot: None,
            account,
            existing: None,
            web_server: None,
        }
    }

    #[tokio::test]
    async fn authority_certificate_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path(), Duration::from_secs(1));
        let acme = ScriptedAcme {
            succeed: true,
            ..Default::default()
        };
        let pipeline = pipeline(&store, &acme);

        let domains = DomainSet::parse("example.com").unwrap();
        let account = account();
        let req = request(&domains, ChallengeMethod::Webroot, &account);

        let lock = store.lock(&domains).await.unwrap();
        let acq = pipeline.acquire(&lock, &req).await.unwrap();
        pipeline.persist(&lock, &acq).unwrap();

        assert!(matches!(acq.origin, Origin::Authority));
        assert_eq!(acq.record.issued_for, ["example.com"]);
        assert!(acq.record.chain_pem.is_some());
        assert_eq!(acq.record.metadata.issuer, Some(Issuer::Acme));
        assert_eq!(
            acq.record.metadata.cert_url.as_deref(),
            Some("https://acme.test/cert/1")
        );

        // built-in HTTP server when no web root is given
        assert!(acme.responders.lock()[0].starts_with("Http01"));
        assert!(acme.responders.lock()[0].contains("8080"));
    }

    #[tokio::test]
    async fn remote_failure_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path(), Duration::from_secs(1));
        let acme = ScriptedAcme::default();
        let pipeline = pipeline(&store, &acme);

        let domains = DomainSet::parse("example.com,www.example.com").unwrap();
        let account = account();
        let req = request(&domains, ChallengeMethod::Standalone, &account);

        let lock = store.lock(&domains).await.unwrap();
        let acq = pipeline.acquire(&lock, &req).await.unwrap();

        match &acq.origin {
            Origin::SelfSigned {
                reason: Error::AcquisitionFailed { step, cause },
            } => {
                assert_eq!(*step, Step::Obtain);
                assert!(cause.to_string().contains("connection refused"));
            }
            other => panic!("unexpected origin {other:?}"),
        }

        assert!(acq.record.is_self_signed());
        assert_eq!(acq.record.issued_for, ["example.com", "www.example.com"]);
        assert!(acq.record.chain_pem.is_none());
        assert!(acme.responders.lock()[0].starts_with("TlsAlpn01"));

        // key is on disk even before persisting
        assert!(store.key_path(&domains).exists());
        assert!(!store.cert_path(&domains).exists());
    }

    #[tokio::test]
    async fn dns_without_publisher_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path(), Duration::from_secs(1));
        let acme = ScriptedAcme {
            succeed: true,
            ..Default::default()
        };
        let pipeline = pipeline(&store, &acme);

        let domains = DomainSet::parse("*.example.com,example.com").unwrap();
        let account = account();
        let req = request(&domains, ChallengeMethod::Dns, &account);

        let lock = store.lock(&domains).await.unwrap();
        let acq = pipeline.acquire(&lock, &req).await.unwrap();

        assert!(matches!(
            acq.origin,
            Origin::SelfSigned {
                reason: Error::DnsProviderMissing
            }
        ));
        // the wildcard shares its record with the base name
        assert_eq!(acq.dns_records, ["_acme-challenge.example.com"]);
        // the authority is never asked
        assert!(acme.responders.lock().is_empty());
    }

    #[tokio::test]
    async fn renewal_uses_existing_material() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path(), Duration::from_secs(1));
        let acme = ScriptedAcme {
            succeed: true,
            ..Default::default()
        };
        let pipeline = pipeline(&store, &acme);

        let domains = DomainSet::parse("example.com").unwrap();
        let account = account();

        let key = CertKey::generate(KeyAlgorithm::EcdsaP256).unwrap();
        let pem = keys::self_signed(&key, &domains).unwrap();
        let mut req = request(&domains, ChallengeMethod::Webroot, &account);
        req.existing = Some(CertificateMaterial::from_pem_chain(domains.clone(), &pem).unwrap());

        let lock = store.lock(&domains).await.unwrap();
        pipeline.acquire(&lock, &req).await.unwrap();

        assert_eq!(*acme.renewals.lock(), 1);
    }

    #[tokio::test]
    async fn concurrent_orders_keep_their_responder() {
        let dir = tempfile::tempdir().unwrap();
        let store = CertificateStore::new(dir.path(), Duration::from_secs(1));
        let acme = SharedResponderAcme::default();
        let orders = tokio::sync::Mutex::new(());
        let pipeline = Pipeline {
            store: &store,
            acme: &acme,
            orders: &orders,
            dns: None,
            key_algorithm: KeyAlgorithm::EcdsaP256,
            http_port: 8080,
            tls_port: 8443,
        };

        let web = DomainSet::parse("web.example.com").unwrap();
        let tls = DomainSet::parse("tls.example.com").unwrap();
        let account = account();
        let web_req = request(&web, ChallengeMethod::Webroot, &account);
        let tls_req = request(&tls, ChallengeMethod::Standalone, &account);

        let web_lock = store.lock(&web).await.unwrap();
        let tls_lock = store.lock(&tls).await.unwrap();
        let (web_acq, tls_acq) = tokio::join!(
            pipeline.acquire(&web_lock, &web_req),
            pipeline.acquire(&tls_lock, &tls_req),
        );
        assert!(matches!(web_acq.unwrap().origin, Origin::SelfSigned { .. }));
        assert!(matches!(tls_acq.unwrap().origin, Origin::SelfSigned { .. }));

        let seen = acme.seen.lock();
        assert_eq!(seen.len(), 2);
        for (domains, responder) in seen.iter() {
            let expected = if domains.starts_with("web.") { "Http01" } else { "TlsAlpn01" };
            assert!(responder.starts_with(expected), "{domains} answered by {responder}");
        }
    }

    #[test]
    fn wildcards_need_dns() {
        let domains = DomainSet::parse("*.example.com").unwrap();

        for method in [ChallengeMethod::Webroot, ChallengeMethod::Standalone] {
            assert!(matches!(
                Pipeline::check_method(&domains, method),
                Err(Error::WildcardUnsupportedForMethod { .. })
            ));
        }

        Pipeline::check_method(&domains, ChallengeMethod::Dns).unwrap();
    }
}
