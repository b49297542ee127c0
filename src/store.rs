//! On-disk certificate material, one directory per domain set.
//!
//! ```text
//! <cert_dir>/<primary>[_san]/
//!   cert.pem        leaf certificate
//!   key.pem         private key (owner read/write only)
//!   chain.pem       issuer chain, when the authority sent one
//!   fullchain.pem   cert.pem followed by chain.pem
//!   cert.json       metadata sidecar
//!   domains.txt     newline-separated names, multi-domain sets only
//! ```

use std::{
    fs,
    io::{self, BufReader, Cursor, Write as _},
    path::{Path, PathBuf},
    time::{Duration, Instant, SystemTime},
};

use serde::{Deserialize, Serialize};
use der::{oid::AssociatedOid as _, Decode as _};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use x509_cert::ext::pkix::{name::GeneralName, SubjectAltName};
use zeroize::Zeroizing;

use crate::{
    challenge::ChallengeMethod,
    domain::DomainSet,
    error::{Error, Result, Step},
    webserver::WebServerKind,
};

/// Certificates with this many days left or fewer are renewed.
pub const RENEWAL_THRESHOLD_DAYS: i64 = 30;

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";
const CHAIN_FILE: &str = "chain.pem";
const FULLCHAIN_FILE: &str = "fullchain.pem";
const META_FILE: &str = "cert.json";
const DOMAINS_FILE: &str = "domains.txt";
const LOCK_FILE: &str = ".lock";

/// Lock files older than this are assumed to belong to a crashed process.
const STALE_LOCK_AGE: Duration = Duration::from_secs(60 * 60);

/// Who signed a stored certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Issuer {
    /// Issued by the ACME certificate authority.
    Acme,

    /// Synthesized locally because the authority could not be used.
    SelfSigned,
}

/// Contents of `cert.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertMetadata {
    /// Primary domain.
    pub domain: String,

    #[serde(default)]
    pub domains: Vec<String>,

    #[serde(rename = "certURL", default)]
    pub cert_url: Option<String>,

    #[serde(rename = "certStableURL", default)]
    pub cert_stable_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<Issuer>,

    /// RFC 3339 timestamp of when this record was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<String>,

    // parameters needed to renew without operator input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<ChallengeMethod>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webroot: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_server: Option<WebServerKind>,
}

/// A complete set of certificate material for one domain set.
#[derive(Debug, Clone)]
pub struct CertificateRecord {
    pub domains: DomainSet,

    /// Leaf certificate in PEM.
    pub certificate_pem: String,

    pub private_key_pem: Zeroizing<String>,

    /// Issuer chain in PEM, without the leaf.
    pub chain_pem: Option<String>,

    pub expires_at: OffsetDateTime,

    /// Names the certificate was actually issued for, in certificate order.
    pub issued_for: Vec<String>,

    pub metadata: CertMetadata,
}

impl CertificateRecord {
    pub fn issuer(&self) -> Option<Issuer> {
        self.metadata.issuer
    }

    pub fn is_self_signed(&self) -> bool {
        self.metadata.issuer == Some(Issuer::SelfSigned)
    }

    /// Leaf followed by the issuer chain.
    pub fn full_chain_pem(&self) -> String {
        let mut full = self.certificate_pem.clone();

        if let Some(chain) = &self.chain_pem {
            if !full.ends_with('\n') {
                full.push('\n');
            }
            full.push_str(chain);
        }

        full
    }
}

/// Expiry introspection for a stored certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertStatus {
    pub domain: String,
    pub domains: Vec<String>,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub chain_path: PathBuf,
    pub expires_at: OffsetDateTime,
    pub is_valid: bool,
    pub days_left: i64,
    pub issuer: Option<Issuer>,
}

impl CertStatus {
    pub fn expires_at_rfc3339(&self) -> String {
        self.expires_at
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.expires_at.to_string())
    }
}

/// Whole days until `not_after`, rounded down. Negative once expired.
pub fn days_until(not_after: OffsetDateTime, now: OffsetDateTime) -> i64 {
    (not_after - now).whole_seconds().div_euclid(24 * 60 * 60)
}

/// True when the certificate is within the renewal window.
pub fn needs_renewal(status: &CertStatus) -> bool {
    status.days_left <= RENEWAL_THRESHOLD_DAYS
}

/// The fields of a certificate the store cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCertificate {
    pub not_after: OffsetDateTime,
    pub dns_names: Vec<String>,
}

/// Parses the first certificate of a PEM bundle.
pub fn parse_certificate(pem: &str) -> std::result::Result<ParsedCertificate, String> {
    let der = split_pem_chain(pem)
        .map_err(|err| err.to_string())?
        .into_iter()
        .next()
        .ok_or_else(|| "no certificate in PEM".to_owned())?;

    let cert = x509_cert::Certificate::from_der(&der).map_err(|err| err.to_string())?;

    let not_after = cert.tbs_certificate.validity.not_after.to_unix_duration();
    let not_after = OffsetDateTime::UNIX_EPOCH + not_after;

    let dns_names = subject_alt_names(&cert).map_err(|err| err.to_string())?;

    Ok(ParsedCertificate {
        not_after,
        dns_names,
    })
}

/// DNS names from the Subject Alternative Name extension, in certificate order.
pub(crate) fn subject_alt_names(
    cert: &x509_cert::Certificate,
) -> std::result::Result<Vec<String>, der::Error> {
    let mut names = Vec::new();

    for ext in cert.tbs_certificate.extensions.iter().flatten() {
        if ext.extn_id != SubjectAltName::OID {
            continue;
        }

        let san = SubjectAltName::from_der(ext.extn_value.as_bytes())?;
        for name in san.0 {
            if let GeneralName::DnsName(dns) = name {
                names.push(dns.to_string());
            }
        }
    }

    Ok(names)
}

/// Splits a PEM bundle into DER certificates.
pub(crate) fn split_pem_chain(pem: &str) -> io::Result<Vec<Vec<u8>>> {
    let mut rdr = BufReader::new(Cursor::new(pem));

    rustls_pemfile::certs(&mut rdr)
        .map(|res| res.map(|cert| cert.to_vec()))
        .collect()
}

/// Certificate store rooted at a directory.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    root: PathBuf,
    lock_timeout: Duration,
}

impl CertificateStore {
    pub fn new(root: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        CertificateStore {
            root: root.into(),
            lock_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, domains: &DomainSet) -> PathBuf {
        self.root.join(domains.dir_name())
    }

    pub fn cert_path(&self, domains: &DomainSet) -> PathBuf {
        self.dir(domains).join(CERT_FILE)
    }

    pub fn key_path(&self, domains: &DomainSet) -> PathBuf {
        self.dir(domains).join(KEY_FILE)
    }

    pub fn chain_path(&self, domains: &DomainSet) -> PathBuf {
        self.dir(domains).join(CHAIN_FILE)
    }

    pub fn fullchain_path(&self, domains: &DomainSet) -> PathBuf {
        self.dir(domains).join(FULLCHAIN_FILE)
    }

    /// Creates the certificate directory and takes its lock.
    ///
    /// Waits for a concurrent holder up to the configured timeout.
    pub async fn lock(&self, domains: &DomainSet) -> Result<DirLock> {
        let dir = self.dir(domains);
        fs::create_dir_all(&dir).map_err(|err| Error::io(Step::KeyGen, &dir, err))?;

        let path = dir.join(LOCK_FILE);
        let started = Instant::now();

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    // informational only
                    let _ = writeln!(file, "{}", std::process::id());
                    log::trace!("locked {}", dir.display());
                    return Ok(DirLock { path });
                }

                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    if lock_is_stale(&path) {
                        log::warn!("removing stale lock {}", path.display());
                        let _ = fs::remove_file(&path);
                        continue;
                    }

                    if started.elapsed() >= self.lock_timeout {
                        return Err(Error::DirectoryLocked { path: dir });
                    }

                    tokio::time::sleep(Duration::from_millis(100)).await;
                }

                Err(err) => return Err(Error::io(Step::KeyGen, &path, err)),
            }
        }
    }

    /// Writes the private key on its own, ahead of any remote call.
    pub fn write_key(&self, _lock: &DirLock, domains: &DomainSet, key_pem: &str) -> Result<PathBuf> {
        let dir = self.dir(domains);
        write_atomic(&dir, KEY_FILE, key_pem.as_bytes(), true, Step::KeyGen)?;
        Ok(dir.join(KEY_FILE))
    }

    /// Writes every file of `record`, replacing whatever the directory held before.
    ///
    /// Each file is replaced atomically; the set of files is not.
    pub fn save(&self, _lock: &DirLock, record: &CertificateRecord) -> Result<()> {
        let dir = self.dir(&record.domains);
        let step = Step::Persist;

        write_atomic(&dir, CERT_FILE, record.certificate_pem.as_bytes(), false, step)?;
        write_atomic(&dir, KEY_FILE, record.private_key_pem.as_bytes(), true, step)?;

        match &record.chain_pem {
            Some(chain) => write_atomic(&dir, CHAIN_FILE, chain.as_bytes(), false, step)?,

            // a chain left over from an earlier issuance no longer matches
            None => remove_if_exists(&dir.join(CHAIN_FILE))?,
        }

        write_atomic(
            &dir,
            FULLCHAIN_FILE,
            record.full_chain_pem().as_bytes(),
            false,
            step,
        )?;

        let meta = serde_json::to_vec_pretty(&record.metadata)
            .map_err(|err| Error::io(step, dir.join(META_FILE), err.into()))?;
        write_atomic(&dir, META_FILE, &meta, false, step)?;

        if record.domains.is_multi() {
            let list = record.domains.join("\n");
            write_atomic(&dir, DOMAINS_FILE, list.as_bytes(), false, step)?;
        }

        log::info!(
            "saved certificate for {} to {}",
            record.domains,
            dir.display()
        );

        Ok(())
    }

    /// Reads and inspects the stored certificate for `domains`.
    pub fn info(&self, domains: &DomainSet) -> Result<CertStatus> {
        self.info_at(domains, OffsetDateTime::now_utc())
    }

    pub(crate) fn info_at(&self, domains: &DomainSet, now: OffsetDateTime) -> Result<CertStatus> {
        let cert_path = self.cert_path(domains);

        let pem = match fs::read_to_string(&cert_path) {
            Ok(pem) => pem,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::CertificateNotFound { path: cert_path })
            }
            Err(err) => return Err(Error::io(Step::Status, &cert_path, err)),
        };

        let parsed = parse_certificate(&pem).map_err(|reason| Error::CertificateParse {
            path: cert_path.clone(),
            reason,
        })?;

        let issuer = self
            .metadata(domains)
            .ok()
            .flatten()
            .and_then(|meta| meta.issuer);

        Ok(CertStatus {
            domain: domains.primary().to_owned(),
            domains: parsed.dns_names,
            key_path: self.key_path(domains),
            chain_path: self.chain_path(domains),
            cert_path,
            expires_at: parsed.not_after,
            is_valid: now < parsed.not_after,
            days_left: days_until(parsed.not_after, now),
            issuer,
        })
    }

    /// Reads `cert.json`, if present.
    pub fn metadata(&self, domains: &DomainSet) -> Result<Option<CertMetadata>> {
        let path = self.dir(domains).join(META_FILE);

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::io(Step::Status, &path, err)),
        };

        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|err| Error::io(Step::Status, &path, err.into()))
    }

    /// Reads the stored leaf certificate and chain, if a certificate exists.
    pub fn certificate_pem(&self, domains: &DomainSet) -> Result<Option<(String, Option<String>)>> {
        let cert_path = self.cert_path(domains);

        let cert = match fs::read_to_string(&cert_path) {
            Ok(cert) => cert,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::io(Step::Status, &cert_path, err)),
        };

        let chain_path = self.chain_path(domains);
        let chain = match fs::read_to_string(&chain_path) {
            Ok(chain) => Some(chain),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(Error::io(Step::Status, &chain_path, err)),
        };

        Ok(Some((cert, chain)))
    }

    /// Every domain set that has a certificate in the store, sorted by directory name.
    pub fn list(&self) -> Result<Vec<DomainSet>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Error::io(Step::Status, &self.root, err)),
        };

        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| Error::io(Step::Status, &self.root, err))?;
            let path = entry.path();

            if path.is_dir() && path.join(CERT_FILE).is_file() {
                dirs.push(path);
            }
        }
        dirs.sort();

        let mut sets = Vec::with_capacity(dirs.len());
        for dir in dirs {
            match domains_of_dir(&dir) {
                Some(set) => sets.push(set),
                None => log::warn!("cannot tell which domains {} holds", dir.display()),
            }
        }

        Ok(sets)
    }
}

/// Recovers the domain set of a certificate directory from its sidecar files.
fn domains_of_dir(dir: &Path) -> Option<DomainSet> {
    if let Ok(data) = fs::read(dir.join(META_FILE)) {
        if let Ok(meta) = serde_json::from_slice::<CertMetadata>(&data) {
            if let Ok(set) = DomainSet::from_entries(&meta.domains) {
                return Some(set);
            }
        }
    }

    if let Ok(list) = fs::read_to_string(dir.join(DOMAINS_FILE)) {
        if let Ok(set) = DomainSet::from_entries(list.lines()) {
            return Some(set);
        }
    }

    let name = dir.file_name()?.to_str()?;
    if name.ends_with("_san") {
        return None;
    }
    DomainSet::parse(name).ok()
}

/// Exclusive hold on one certificate directory. Released on drop.
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            log::warn!("failed to release lock {}: {err}", self.path.display());
        }
    }
}

fn lock_is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::io(Step::Persist, path, err)),
    }
}

/// Writes `contents` to a temporary file beside the target, then renames it into place.
pub(crate) fn write_atomic(
    dir: &Path,
    name: &str,
    contents: &[u8],
    private: bool,
    step: Step,
) -> Result<()> {
    let path = dir.join(name);
    let tmp = staged(dir, &path, contents, private, step)?;

    tmp.persist(&path)
        .map_err(|err| Error::io(step, &path, err.error))?;

    Ok(())
}

/// Like [`write_atomic`], but never replaces an existing file.
///
/// Returns false, leaving the existing file untouched, when `name` already exists.
pub(crate) fn write_new(
    dir: &Path,
    name: &str,
    contents: &[u8],
    private: bool,
    step: Step,
) -> Result<bool> {
    let path = dir.join(name);
    let tmp = staged(dir, &path, contents, private, step)?;

    match tmp.persist_noclobber(&path) {
        Ok(_) => Ok(true),
        Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(Error::io(step, &path, err.error)),
    }
}

fn staged(
    dir: &Path,
    path: &Path,
    contents: &[u8],
    private: bool,
    step: Step,
) -> Result<tempfile::NamedTempFile> {
    let io_err = |err: io::Error| Error::io(step, path, err);

    let mut tmp = tempfile::Builder::new()
        .prefix(".autocert-")
        .tempfile_in(dir)
        .map_err(io_err)?;

    tmp.write_all(contents).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;

        let mode = if private { 0o600 } else { 0o644 };
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode)).map_err(io_err)?;
    }
    #[cfg(not(unix))]
    let _ = private;

    Ok(tmp)
}
