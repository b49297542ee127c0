//! Long-lived ACME identities, one per contact email.

use std::{
    collections::HashMap,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::Mutex;
use pkcs8::{DecodePrivateKey as _, EncodePrivateKey as _};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    acme::AcmeCapability,
    error::{Error, Result, Step},
    store::{write_atomic, write_new},
};

const ACCOUNT_FILE: &str = "account.json";
const KEY_FILE: &str = "account.key";

/// P-256 key authenticating an account to the certificate authority.
#[derive(Clone)]
pub struct AccountKey {
    signing_key: p256::ecdsa::SigningKey,
}

impl AccountKey {
    pub fn generate() -> Self {
        let csprng = &mut rand::thread_rng();

        AccountKey {
            signing_key: p256::ecdsa::SigningKey::from(p256::SecretKey::random(csprng)),
        }
    }

    pub fn from_pem(pem: &str) -> eyre::Result<Self> {
        let signing_key = p256::ecdsa::SigningKey::from_pkcs8_pem(pem)
            .map_err(|err| eyre::eyre!("failed to read account key PEM: {err}"))?;

        Ok(AccountKey { signing_key })
    }

    pub fn to_pem(&self) -> eyre::Result<Zeroizing<String>> {
        self.signing_key
            .to_pkcs8_pem(pem::LineEnding::LF)
            .map_err(|err| eyre::eyre!("failed to encode account key: {err}"))
    }

    pub(crate) fn signing_key(&self) -> &p256::ecdsa::SigningKey {
        &self.signing_key
    }
}

impl fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKey").finish_non_exhaustive()
    }
}

/// An identity with the certificate authority.
#[derive(Debug, Clone)]
pub struct Account {
    pub email: String,

    /// Account URL returned by the authority; absent until first registration.
    pub registration: Option<String>,

    pub key: AccountKey,
}

impl Account {
    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }
}

/// Contents of `account.json`.
#[derive(Debug, Serialize, Deserialize)]
struct AccountRecord {
    email: String,

    #[serde(default)]
    registration: Option<String>,
}

/// Account material under `<account_dir>/<sanitized email>/`.
#[derive(Debug)]
pub struct AccountStore {
    root: PathBuf,

    /// Serializes "check, register, persist" per email.
    registering: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AccountStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        AccountStore {
            root: root.into(),
            registering: Mutex::default(),
        }
    }

    pub fn dir(&self, email: &str) -> PathBuf {
        self.root.join(sanitize_email(email))
    }

    /// Loads the account for `email`, creating and persisting a fresh key when none exists.
    ///
    /// Concurrent first calls for one email all end up with the key that reached the disk.
    pub fn load_or_create(&self, email: &str) -> Result<Account> {
        let dir = self.dir(email);
        let key_path = dir.join(KEY_FILE);

        let key = match read_key(&key_path)? {
            Some(key) => {
                log::info!("loaded ACME account for {email}");
                key
            }

            None => {
                fs::create_dir_all(&dir).map_err(|err| Error::io(Step::Identity, &dir, err))?;
                restrict_dir(&dir)?;

                let key = AccountKey::generate();
                let pem = key.to_pem().map_err(|cause| invalid_key(&key_path, cause))?;

                if write_new(&dir, KEY_FILE, pem.as_bytes(), true, Step::Identity)? {
                    log::info!("created ACME account key for {email}");
                    key
                } else {
                    log::debug!("account key for {email} created concurrently, loading it");
                    read_key(&key_path)?.ok_or_else(|| {
                        Error::io(
                            Step::Identity,
                            &key_path,
                            io::Error::new(io::ErrorKind::NotFound, "account key vanished"),
                        )
                    })?
                }
            }
        };

        let registration = read_record(&dir)?.and_then(|record| record.registration);

        Ok(Account {
            email: email.to_owned(),
            registration,
            key,
        })
    }

    /// Writes the email and registration reference. The key file is left untouched.
    pub fn persist(&self, account: &Account) -> Result<()> {
        let dir = self.dir(&account.email);
        fs::create_dir_all(&dir).map_err(|err| Error::io(Step::Identity, &dir, err))?;

        let record = AccountRecord {
            email: account.email.clone(),
            registration: account.registration.clone(),
        };
        let data = serde_json::to_vec_pretty(&record)
            .map_err(|err| Error::io(Step::Identity, dir.join(ACCOUNT_FILE), err.into()))?;

        write_atomic(&dir, ACCOUNT_FILE, &data, true, Step::Identity)
    }

    /// Registers `account` with the authority unless it already holds a reference.
    ///
    /// Concurrent callers for the same email register at most once. A registration that
    /// succeeds remotely but cannot be written locally is only logged.
    pub async fn ensure_registered(
        &self,
        account: &mut Account,
        acme: &dyn AcmeCapability,
    ) -> Result<()> {
        let lock = self.registration_lock(&account.email);
        let _guard = lock.lock().await;

        if account.registration.is_none() {
            // another task may have finished while we waited
            let dir = self.dir(&account.email);
            if let Ok(Some(record)) = read_record(&dir) {
                account.registration = record.registration;
            }
        }

        if account.is_registered() {
            return Ok(());
        }

        let registration = acme
            .register(account)
            .await
            .map_err(|cause| Error::AccountRegistrationFailed {
                email: account.email.clone(),
                cause,
            })?;

        log::info!("registered ACME account for {}", account.email);
        account.registration = Some(registration);

        if let Err(err) = self.persist(account) {
            log::warn!("failed to save ACME account for {}: {err}", account.email);
        }

        Ok(())
    }

    fn registration_lock(&self, email: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.registering.lock();
        Arc::clone(locks.entry(email.to_owned()).or_default())
    }
}

fn read_key(path: &Path) -> Result<Option<AccountKey>> {
    match fs::read_to_string(path) {
        Ok(pem) => AccountKey::from_pem(&pem)
            .map(Some)
            .map_err(|cause| invalid_key(path, cause)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(Error::io(Step::Identity, path, err)),
    }
}

fn invalid_key(path: &Path, cause: eyre::Report) -> Error {
    Error::io(
        Step::Identity,
        path,
        io::Error::new(io::ErrorKind::InvalidData, format!("{cause:#}")),
    )
}

fn read_record(dir: &Path) -> Result<Option<AccountRecord>> {
    let path = dir.join(ACCOUNT_FILE);

    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(Error::io(Step::Identity, path, err)),
    };

    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|err| Error::io(Step::Identity, path, err.into()))
}

#[cfg(unix)]
fn restrict_dir(dir: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
        .map_err(|err| Error::io(Step::Identity, dir, err))
}

#[cfg(not(unix))]
fn restrict_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

/// Maps an email to a directory name, replacing anything outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_email(email: &str) -> String {
    email
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        acme::{CertificateMaterial, ResponderSpec},
        domain::DomainSet,
    };

    #[derive(Default)]
    struct CountingAcme {
        registrations: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AcmeCapability for CountingAcme {
        async fn register(&self, _account: &Account) -> eyre::Result<String> {
            tokio::task::yield_now().await;

            if self.fail {
                eyre::bail!("directory unreachable");
            }

            let n = self.registrations.fetch_add(1, Ordering::SeqCst);
            Ok(format!("https://acme.test/acct/{n}"))
        }

        fn set_challenge_responder(&self, _responder: ResponderSpec) {}

        async fn obtain(
            &self,
            _account: &Account,
            _domains: &DomainSet,
            _csr_der: &[u8],
        ) -> eyre::Result<CertificateMaterial> {
            eyre::bail!("not used")
        }
    }

    #[test]
    fn sanitizes_email() {
        assert_eq!(sanitize_email("ops+certs@example.com"), "ops_certs_example.com");
        assert_eq!(sanitize_email("a-b_c.d"), "a-b_c.d");
    }

    #[test]
    fn create_then_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AccountStore::new(tmp.path());

        let created = store.load_or_create("admin@example.com").unwrap();
        assert!(!created.is_registered());

        let key_path = tmp.path().join("admin_example.com").join(KEY_FILE);
        assert!(key_path.is_file());
        assert!(!tmp.path().join("admin_example.com").join(ACCOUNT_FILE).exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            let mode = fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = store.load_or_create("admin@example.com").unwrap();
        assert_eq!(
            loaded.key.to_pem().unwrap().as_str(),
            created.key.to_pem().unwrap().as_str()
        );
    }

    #[test]
    fn persist_keeps_key() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AccountStore::new(tmp.path());

        let mut account = store.load_or_create("admin@example.com").unwrap();
        let key_before = fs::read(store.dir(&account.email).join(KEY_FILE)).unwrap();

        account.registration = Some("https://acme.test/acct/1".to_owned());
        store.persist(&account).unwrap();

        let key_after = fs::read(store.dir(&account.email).join(KEY_FILE)).unwrap();
        assert_eq!(key_before, key_after);

        let loaded = store.load_or_create("admin@example.com").unwrap();
        assert_eq!(loaded.registration.as_deref(), Some("https://acme.test/acct/1"));
    }

    #[tokio::test]
    async fn concurrent_registration_happens_once() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(AccountStore::new(tmp.path()));
        let acme = Arc::new(CountingAcme::default());

        store.load_or_create("admin@example.com").unwrap();

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            let acme = Arc::clone(&acme);

            tasks.push(tokio::spawn(async move {
                let mut account = store.load_or_create("admin@example.com").unwrap();
                store.ensure_registered(&mut account, &*acme).await.unwrap();
                account.registration.unwrap()
            }));
        }

        for task in tasks {
            assert_eq!(task.await.unwrap(), "https://acme.test/acct/0");
        }
        assert_eq!(acme.registrations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_creation_shares_one_key() {
        for _ in 0..10 {
            let tmp = tempfile::tempdir().unwrap();
            let store = Arc::new(AccountStore::new(tmp.path()));
            let barrier = Arc::new(std::sync::Barrier::new(4));

            let threads = (0..4)
                .map(|_| {
                    let store = Arc::clone(&store);
                    let barrier = Arc::clone(&barrier);

                    std::thread::spawn(move || {
                        barrier.wait();
                        let account = store.load_or_create("new@example.com").unwrap();
                        account.key.to_pem().unwrap()
                    })
                })
                .collect::<Vec<_>>();

            let keys = threads
                .into_iter()
                .map(|thread| thread.join().unwrap())
                .collect::<Vec<_>>();

            let on_disk =
                fs::read_to_string(store.dir("new@example.com").join(KEY_FILE)).unwrap();

            for key in keys {
                assert_eq!(key.as_str(), on_disk);
            }
        }
    }

    #[tokio::test]
    async fn unsaved_registration_is_kept() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AccountStore::new(tmp.path());
        let acme = CountingAcme::default();

        let mut account = store.load_or_create("admin@example.com").unwrap();

        // a directory in its place makes the record unwritable
        fs::create_dir(store.dir(&account.email).join(ACCOUNT_FILE)).unwrap();

        store.ensure_registered(&mut account, &acme).await.unwrap();

        assert_eq!(account.registration.as_deref(), Some("https://acme.test/acct/0"));
        assert_eq!(acme.registrations.load(Ordering::SeqCst), 1);
        assert!(store.dir(&account.email).join(ACCOUNT_FILE).is_dir());
    }

    #[tokio::test]
    async fn failed_registration_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let store = AccountStore::new(tmp.path());
        let acme = CountingAcme {
            fail: true,
            ..Default::default()
        };

        let mut account = store.load_or_create("admin@example.com").unwrap();
        let err = store.ensure_registered(&mut account, &acme).await.unwrap_err();

        assert!(matches!(err, Error::AccountRegistrationFailed { .. }));
        assert!(!account.is_registered());
    }
}
