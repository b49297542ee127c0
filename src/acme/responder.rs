//! Challenge responders: where the proof for each authorization is placed while the server
//! validates it.

use std::{
    collections::HashMap,
    fs, io,
    net::{SocketAddr, TcpListener},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use actix_web::{dev::ServerHandle, web, App, HttpResponse, HttpServer};
use eyre::WrapErr as _;
use parking_lot::{Mutex, RwLock};
use rustls::{
    pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer},
    server::Acceptor,
    sign::{CertifiedKey, SingleCertAndKey},
};

use super::{jws, DnsPublisher, ResponderSpec};

/// Path prefix HTTP-01 validation requests are made against.
pub const HTTP_CHALLENGE_PATH: &str = ".well-known/acme-challenge";

/// ALPN protocol of TLS-ALPN-01, see RFC 8737 §4.
const ACME_ALPN: &[u8] = b"acme-tls/1";

type TokenMap = Arc<RwLock<HashMap<String, String>>>;
type AlpnConfigMap = Arc<Mutex<HashMap<String, Arc<rustls::ServerConfig>>>>;

/// A responder started for the duration of one order.
pub(crate) enum ActiveResponder {
    Webroot {
        root: PathBuf,
        written: Vec<PathBuf>,
    },
    Http(HttpResponder),
    TlsAlpn(TlsAlpnResponder),
    Dns {
        publisher: Arc<dyn DnsPublisher>,
        published: Vec<String>,
    },
}

impl ActiveResponder {
    pub(crate) fn start(spec: &ResponderSpec) -> eyre::Result<Self> {
        Ok(match spec {
            ResponderSpec::Http01 {
                webroot: Some(root),
                ..
            } => ActiveResponder::Webroot {
                root: root.clone(),
                written: Vec::new(),
            },

            ResponderSpec::Http01 {
                webroot: None,
                port,
            } => ActiveResponder::Http(HttpResponder::start(*port)?),

            ResponderSpec::TlsAlpn01 { port } => {
                ActiveResponder::TlsAlpn(TlsAlpnResponder::start(*port)?)
            }

            ResponderSpec::Dns01 { publisher } => ActiveResponder::Dns {
                publisher: Arc::clone(publisher),
                published: Vec::new(),
            },
        })
    }

    /// ACME challenge type this responder answers.
    pub(crate) fn challenge_type(&self) -> &'static str {
        match self {
            ActiveResponder::Webroot { .. } | ActiveResponder::Http(_) => "http-01",
            ActiveResponder::TlsAlpn(_) => "tls-alpn-01",
            ActiveResponder::Dns { .. } => "dns-01",
        }
    }

    /// Makes the proof for `token` available for `domain`.
    pub(crate) async fn present(
        &mut self,
        domain: &str,
        token: &str,
        key_auth: &str,
    ) -> eyre::Result<()> {
        match self {
            ActiveResponder::Webroot { root, written } => {
                let path = write_webroot_token(root, token, key_auth)
                    .wrap_err_with(|| format!("failed to place HTTP-01 token for {domain}"))?;
                written.push(path);
            }

            ActiveResponder::Http(http) => {
                http.tokens
                    .write()
                    .insert(token.to_owned(), key_auth.to_owned());
            }

            ActiveResponder::TlsAlpn(tls) => {
                let config = alpn_server_config(domain, jws::tls_alpn_digest(key_auth))?;
                tls.configs.lock().insert(domain.to_owned(), config);
            }

            ActiveResponder::Dns {
                publisher,
                published,
            } => {
                let record = crate::domain::dns_record_name(domain);
                let value = jws::dns_txt_value(key_auth);

                publisher
                    .publish(&record, &value)
                    .await
                    .wrap_err_with(|| format!("failed to publish {record}"))?;
                published.push(record);
            }
        }

        log::debug!("presented {} proof for {domain}", self.challenge_type());
        Ok(())
    }

    /// Removes everything [`present`](Self::present) placed and releases listening ports.
    /// Failures are only logged.
    pub(crate) async fn cleanup(&mut self) {
        match self {
            ActiveResponder::Webroot { written, .. } => {
                for path in written.drain(..) {
                    if let Err(err) = fs::remove_file(&path) {
                        log::warn!("failed to remove {}: {err}", path.display());
                    }
                }
            }

            ActiveResponder::Http(http) => {
                http.tokens.write().clear();
                http.stop().await;
            }

            ActiveResponder::TlsAlpn(tls) => {
                tls.configs.lock().clear();
                tls.stop().await;
            }

            ActiveResponder::Dns {
                publisher,
                published,
            } => {
                for record in published.drain(..) {
                    if let Err(err) = publisher.cleanup(&record).await {
                        log::warn!("failed to clean up {record}: {err:#}");
                    }
                }
            }
        }
    }
}

/// Writes `<root>/.well-known/acme-challenge/<token>`.
pub(crate) fn write_webroot_token(root: &Path, token: &str, key_auth: &str) -> io::Result<PathBuf> {
    let well_formed = !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');

    if !well_formed {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing unexpected challenge token {token:?}"),
        ));
    }

    let dir = root.join(HTTP_CHALLENGE_PATH);
    fs::create_dir_all(&dir)?;

    let path = dir.join(token);
    fs::write(&path, key_auth)?;

    Ok(path)
}

/// Temporary HTTP server answering `/.well-known/acme-challenge/<token>`.
pub(crate) struct HttpResponder {
    tokens: TokenMap,
    handle: ServerHandle,
    addrs: Vec<SocketAddr>,
}

impl HttpResponder {
    fn start(port: u16) -> eyre::Result<Self> {
        let tokens = TokenMap::default();

        let srv = HttpServer::new({
            let tokens = web::Data::new(Arc::clone(&tokens));

            move || {
                App::new().app_data(tokens.clone()).route(
                    &format!("/{HTTP_CHALLENGE_PATH}/{{token}}"),
                    web::get().to(serve_token),
                )
            }
        })
        .workers(1)
        .disable_signals()
        .shutdown_timeout(0)
        .bind(("0.0.0.0", port))
        .wrap_err_with(|| format!("failed to bind HTTP-01 responder to port {port}"))?;

        let addrs = srv.addrs();
        let srv = srv.run();
        let handle = srv.handle();

        tokio::spawn(srv);
        log::info!("HTTP-01 responder listening on port {port}");

        Ok(HttpResponder {
            tokens,
            handle,
            addrs,
        })
    }

    /// Resolves once the listener is closed.
    async fn stop(&self) {
        self.handle.stop(false).await;
        log::debug!("HTTP-01 responder on {:?} stopped", self.addrs);
    }

    #[cfg(test)]
    pub(crate) fn port(&self) -> u16 {
        self.addrs.first().map_or(0, SocketAddr::port)
    }
}

impl Drop for HttpResponder {
    fn drop(&mut self) {
        log::debug!("stopping HTTP-01 responder on {:?}", self.addrs);
        drop(self.handle.stop(false));
    }
}

async fn serve_token(tokens: web::Data<TokenMap>, token: web::Path<String>) -> HttpResponse {
    match tokens.read().get(token.as_str()) {
        Some(key_auth) => HttpResponse::Ok()
            .content_type("text/plain")
            .body(key_auth.clone()),
        None => HttpResponse::NotFound().finish(),
    }
}

/// Temporary TLS listener presenting `acme-tls/1` certificates.
pub(crate) struct TlsAlpnResponder {
    configs: AlpnConfigMap,
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    port: u16,
}

impl TlsAlpnResponder {
    fn start(port: u16) -> eyre::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .wrap_err_with(|| format!("failed to bind TLS-ALPN-01 responder to port {port}"))?;
        listener.set_nonblocking(true)?;

        let configs = AlpnConfigMap::default();
        let shutdown = Arc::new(AtomicBool::new(false));

        let port = listener.local_addr()?.port();

        let thread = thread::Builder::new().name("tls-alpn-01".to_owned()).spawn({
            let configs = Arc::clone(&configs);
            let shutdown = Arc::clone(&shutdown);
            move || serve_alpn(listener, configs, shutdown)
        })?;

        log::info!("TLS-ALPN-01 responder listening on port {port}");

        Ok(TlsAlpnResponder {
            configs,
            shutdown,
            thread: Some(thread),
            port,
        })
    }

    /// Resolves once the listener thread has exited and the port is free.
    async fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);

        let Some(thread) = self.thread.take() else {
            return;
        };

        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Ok(())) => log::debug!("TLS-ALPN-01 responder on port {} stopped", self.port),
            _ => log::warn!("TLS-ALPN-01 responder thread on port {} panicked", self.port),
        }
    }

    #[cfg(test)]
    pub(crate) fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for TlsAlpnResponder {
    fn drop(&mut self) {
        log::debug!("stopping TLS-ALPN-01 responder");
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

fn serve_alpn(listener: TcpListener, configs: AlpnConfigMap, shutdown: Arc<AtomicBool>) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = answer_alpn(stream, &configs) {
                    log::debug!("TLS-ALPN-01 connection from {peer} failed: {err:#}");
                }
            }

            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }

            Err(err) => {
                log::warn!("TLS-ALPN-01 responder stopped: {err}");
                return;
            }
        }
    }
}

fn answer_alpn(mut stream: std::net::TcpStream, configs: &AlpnConfigMap) -> eyre::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;

    let mut acceptor = Acceptor::default();

    let accepted = loop {
        if acceptor.read_tls(&mut stream)? == 0 {
            eyre::bail!("connection closed during handshake");
        }

        if let Some(accepted) = acceptor
            .accept()
            .map_err(|(err, _alert)| err)
            .wrap_err("invalid client hello")?
        {
            break accepted;
        }
    };

    // validation servers always send SNI
    let Some(server_name) = accepted.client_hello().server_name().map(ToOwned::to_owned) else {
        return Ok(());
    };

    let Some(config) = configs.lock().get(&server_name).cloned() else {
        log::debug!("no TLS-ALPN-01 proof for {server_name}");
        return Ok(());
    };

    log::info!("answering TLS-ALPN-01 validation for {server_name}");

    let mut conn = accepted
        .into_connection(config)
        .map_err(|(err, _alert)| err)
        .wrap_err("failed to accept connection")?;

    conn.complete_io(&mut stream)
        .wrap_err("failed to complete handshake")?;

    Ok(())
}

/// Server config presenting a self-signed certificate for `domain` that carries `digest` in
/// the critical `acmeIdentifier` extension.
fn alpn_server_config(domain: &str, digest: [u8; 32]) -> eyre::Result<Arc<rustls::ServerConfig>> {
    let mut params = rcgen::CertificateParams::new(vec![domain.to_owned()])
        .wrap_err("failed to construct cert params")?;
    params.custom_extensions = vec![rcgen::CustomExtension::new_acme_identifier(&digest)];

    let key_pair = rcgen::KeyPair::generate().wrap_err("failed to generate key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .wrap_err("failed to generate certificate")?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    // built by hand: webpki rejects the critical acmeIdentifier extension
    let private_key = provider
        .key_provider
        .load_private_key(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
            key_pair.serialize_der(),
        )))
        .wrap_err("failed to load private key")?;
    let certified_key = CertifiedKey::new(vec![cert.der().clone()], private_key);

    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SingleCertAndKey::from(certified_key)));

    config.alpn_protocols = vec![ACME_ALPN.to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webroot_token_file() {
        let tmp = tempfile::tempdir().unwrap();

        let path = write_webroot_token(tmp.path(), "tok-3n_x", "tok-3n_x.thumb").unwrap();
        assert_eq!(path, tmp.path().join(".well-known/acme-challenge/tok-3n_x"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "tok-3n_x.thumb");

        assert!(write_webroot_token(tmp.path(), "../escape", "x").is_err());
    }

    #[tokio::test]
    async fn webroot_cleanup_removes_tokens() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = ResponderSpec::Http01 {
            webroot: Some(tmp.path().to_owned()),
            port: 80,
        };

        let mut responder = ActiveResponder::start(&spec).unwrap();
        assert_eq!(responder.challenge_type(), "http-01");

        responder
            .present("example.com", "abc", "abc.thumb")
            .await
            .unwrap();
        let path = tmp.path().join(HTTP_CHALLENGE_PATH).join("abc");
        assert!(path.is_file());

        responder.cleanup().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn built_in_http_server_serves_tokens() {
        let mut responder = ActiveResponder::start(&ResponderSpec::Http01 {
            webroot: None,
            port: 0,
        })
        .unwrap();

        responder
            .present("example.com", "abc", "abc.thumb")
            .await
            .unwrap();

        let ActiveResponder::Http(http) = &responder else {
            panic!("expected built-in HTTP responder");
        };
        let base = format!("http://127.0.0.1:{}/{HTTP_CHALLENGE_PATH}", http.port());

        let res = reqwest::get(format!("{base}/abc")).await.unwrap();
        assert!(res.status().is_success());
        assert_eq!(res.text().await.unwrap(), "abc.thumb");

        let res = reqwest::get(format!("{base}/missing")).await.unwrap();
        assert_eq!(res.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn cleanup_frees_http_port() {
        let mut responder = ActiveResponder::start(&ResponderSpec::Http01 {
            webroot: None,
            port: 0,
        })
        .unwrap();

        let ActiveResponder::Http(http) = &responder else {
            panic!("expected built-in HTTP responder");
        };
        let port = http.port();

        responder.cleanup().await;
        drop(responder);

        // immediately reusable for the next order
        let again = ActiveResponder::start(&ResponderSpec::Http01 {
            webroot: None,
            port,
        })
        .unwrap();
        drop(again);
    }

    #[tokio::test]
    async fn cleanup_frees_tls_port() {
        let mut responder = ActiveResponder::start(&ResponderSpec::TlsAlpn01 { port: 0 }).unwrap();

        let ActiveResponder::TlsAlpn(tls) = &responder else {
            panic!("expected TLS-ALPN-01 responder");
        };
        let port = tls.port();

        responder.cleanup().await;
        drop(responder);

        let mut again = ActiveResponder::start(&ResponderSpec::TlsAlpn01 { port }).unwrap();
        again.cleanup().await;
    }

    #[test]
    fn alpn_config_advertises_protocol() {
        let config = alpn_server_config("example.com", [7; 32]).unwrap();
        assert_eq!(config.alpn_protocols, [b"acme-tls/1".to_vec()]);
    }
}
