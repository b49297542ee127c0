#![allow(clippy::trivial_regex)]

use std::{
    convert::Infallible,
    future::ready,
    net::TcpListener,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
    time::Duration,
};

use actix_http::{HttpService, Method, Request, Response, StatusCode};
use actix_server::{Server, ServerHandle};
use actix_web::body::{BoxBody, MessageBody as _};
use regex::Regex;

use super::{AcmeCapability as _, AcmeClient, ResponderSpec};
use crate::{
    account::{Account, AccountKey},
    domain::DomainSet,
    keys::{self, CertKey, KeyAlgorithm},
};

pub(crate) const TEST_DOMAIN: &str = "acme-test.example.com";

static RE_URL: OnceLock<Regex> = OnceLock::new();

fn re_url() -> &'static Regex {
    RE_URL.get_or_init(|| Regex::new("<URL>").unwrap())
}

/// Progress of the single order the fake server knows about.
#[derive(Default)]
struct ServerState {
    accounts_created: AtomicUsize,
    challenge_posted: AtomicBool,
    finalized: AtomicBool,
    reject_validation: bool,
    cert_chain: String,
}

pub(crate) struct TestServer {
    pub dir_url: String,
    state: Arc<ServerState>,
    handle: ServerHandle,
}

impl TestServer {
    pub(crate) fn accounts_created(&self) -> usize {
        self.state.accounts_created.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        drop(self.handle.stop(false));
    }
}

fn with_url(body: &str, url: &str) -> String {
    re_url().replace_all(body, url).into_owned()
}

fn get_directory(url: &str) -> Response<BoxBody> {
    const BODY: &str = r#"{
    "keyChange": "<URL>/acme/key-change",
    "newAccount": "<URL>/acme/new-acct",
    "newNonce": "<URL>/acme/new-nonce",
    "newOrder": "<URL>/acme/new-order",
    "revokeCert": "<URL>/acme/revoke-cert",
    "meta": {
        "caaIdentities": ["testdir.org"]
    }
    }"#;

    Response::with_body(StatusCode::OK, with_url(BODY, url)).map_into_boxed_body()
}

fn head_new_nonce() -> Response<BoxBody> {
    Response::build(StatusCode::NO_CONTENT)
        .insert_header(("Replay-Nonce", "8_uBBV3N2DBRJczhoiB46ugJKUkUHxGzVe6xIMpjHFM"))
        .finish()
        .map_into_boxed_body()
}

fn post_new_acct(url: &str, state: &ServerState) -> Response<BoxBody> {
    const BODY: &str = r#"{
    "contact": ["mailto:foo@bar.com"],
    "createdAt": "2018-12-31T17:15:40.399104457Z",
    "status": "valid"
    }"#;

    state.accounts_created.fetch_add(1, Ordering::SeqCst);

    Response::build(StatusCode::CREATED)
        .insert_header(("Location", with_url("<URL>/acme/acct/7728515", url)))
        .body(BODY)
        .map_into_boxed_body()
}

fn order_body(url: &str, status: &str, certificate: bool) -> String {
    let certificate = if certificate {
        r#", "certificate": "<URL>/acme/cert/fae41c070f967713109028""#
    } else {
        ""
    };

    let body = format!(
        r#"{{
        "status": "{status}",
        "expires": "2019-01-09T08:26:43.570360537Z",
        "identifiers": [{{ "type": "dns", "value": "{TEST_DOMAIN}" }}],
        "authorizations": ["<URL>/acme/authz/YTqpYUthlVfwBncUufE8IRWLMSRqcSs"],
        "finalize": "<URL>/acme/finalize/7738992/18234324"{certificate}
        }}"#
    );

    with_url(&body, url)
}

fn post_new_order(url: &str) -> Response<BoxBody> {
    Response::build(StatusCode::CREATED)
        .insert_header((
            "Location",
            with_url("<URL>/acme/order/YTqpYUthlVfwBncUufE8", url),
        ))
        .body(order_body(url, "pending", false))
        .map_into_boxed_body()
}

fn post_get_order(url: &str, state: &ServerState) -> Response<BoxBody> {
    let body = if state.finalized.load(Ordering::SeqCst) {
        order_body(url, "valid", true)
    } else if state.reject_validation {
        order_body(url, "invalid", false)
    } else if state.challenge_posted.load(Ordering::SeqCst) {
        order_body(url, "ready", false)
    } else {
        order_body(url, "pending", false)
    };

    Response::build(StatusCode::OK).body(body).map_into_boxed_body()
}

fn post_authz(url: &str, state: &ServerState) -> Response<BoxBody> {
    let (status, error) = match state.challenge_posted.load(Ordering::SeqCst) {
        false => ("pending", ""),
        true if state.reject_validation => (
            "invalid",
            r#", "error": { "type": "urn:ietf:params:acme:error:unauthorized", "detail": "Invalid response from http://acme-test.example.com/.well-known/acme-challenge/MUi: 404" }"#,
        ),
        true => ("valid", ""),
    };

    let body = format!(
        r#"{{
        "identifier": {{ "type": "dns", "value": "{TEST_DOMAIN}" }},
        "status": "{status}",
        "expires": "2019-01-09T08:26:43Z",
        "challenges": [
            {{
                "type": "http-01",
                "status": "{status}",
                "url": "<URL>/acme/challenge/YTqpYUthlVfwBncUufE8IRWLMSRqcSs/216789597",
                "token": "MUi-gqeOJdRkSb_YR2eaMxQBqf6al8dgt_dOttSWb0w"{error}
            }},
            {{
                "type": "tls-alpn-01",
                "status": "pending",
                "url": "<URL>/acme/challenge/YTqpYUthlVfwBncUufE8IRWLMSRqcSs/216789598",
                "token": "WCdRWkCy4THTD_j5IH4ISAzr59lFIg5wzYmKxuOJ1lU"
            }},
            {{
                "type": "dns-01",
                "status": "pending",
                "url": "<URL>/acme/challenge/YTqpYUthlVfwBncUufE8IRWLMSRqcSs/216789599",
                "token": "RRo2ZcXAEqxKvMH8RGcATjSK1KknLEUmauwfQ5i3gG8"
            }}
        ]
        }}"#
    );

    Response::build(StatusCode::OK)
        .body(with_url(&body, url))
        .map_into_boxed_body()
}

fn post_challenge(url: &str, state: &ServerState) -> Response<BoxBody> {
    state.challenge_posted.store(true, Ordering::SeqCst);

    let body = with_url(
        r#"{
        "type": "http-01",
        "status": "processing",
        "url": "<URL>/acme/challenge/YTqpYUthlVfwBncUufE8IRWLMSRqcSs/216789597",
        "token": "MUi-gqeOJdRkSb_YR2eaMxQBqf6al8dgt_dOttSWb0w"
        }"#,
        url,
    );

    Response::build(StatusCode::OK).body(body).map_into_boxed_body()
}

fn post_finalize(url: &str, state: &ServerState) -> Response<BoxBody> {
    state.finalized.store(true, Ordering::SeqCst);

    Response::build(StatusCode::OK)
        .body(order_body(url, "processing", false))
        .map_into_boxed_body()
}

fn post_certificate(state: &ServerState) -> Response<BoxBody> {
    Response::build(StatusCode::OK)
        .content_type("application/pem-certificate-chain")
        .body(state.cert_chain.clone())
        .map_into_boxed_body()
}

fn route_request(req: Request, url: &str, state: &ServerState) -> Response<BoxBody> {
    match (req.method(), req.path()) {
        (&Method::GET, "/directory") => get_directory(url),
        (&Method::HEAD, "/acme/new-nonce") => head_new_nonce(),
        (&Method::POST, "/acme/new-acct") => post_new_acct(url, state),
        (&Method::POST, "/acme/new-order") => post_new_order(url),
        (&Method::POST, "/acme/order/YTqpYUthlVfwBncUufE8") => post_get_order(url, state),
        (&Method::POST, "/acme/authz/YTqpYUthlVfwBncUufE8IRWLMSRqcSs") => post_authz(url, state),

        (&Method::POST, "/acme/challenge/YTqpYUthlVfwBncUufE8IRWLMSRqcSs/216789597") => {
            post_challenge(url, state)
        }

        (&Method::POST, "/acme/finalize/7738992/18234324") => post_finalize(url, state),
        (&Method::POST, "/acme/cert/fae41c070f967713109028") => post_certificate(state),

        (_, _) => Response::build(StatusCode::NOT_FOUND)
            .finish()
            .map_into_boxed_body(),
    }
}

/// Leaf plus a stand-in issuer, both for [`TEST_DOMAIN`].
fn issued_chain() -> String {
    let domains = DomainSet::parse(TEST_DOMAIN).unwrap();

    let leaf_key = CertKey::generate(KeyAlgorithm::EcdsaP256).unwrap();
    let issuer_key = CertKey::generate(KeyAlgorithm::EcdsaP256).unwrap();

    let leaf = keys::self_signed(&leaf_key, &domains).unwrap();
    let issuer = keys::self_signed(&issuer_key, &domains).unwrap();

    format!("{leaf}\n{issuer}")
}

fn start(reject_validation: bool) -> TestServer {
    let lst = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = lst.local_addr().unwrap().port();

    let url = format!("http://127.0.0.1:{port}");
    let dir_url = format!("{url}/directory");

    let state = Arc::new(ServerState {
        reject_validation,
        cert_chain: issued_chain(),
        ..Default::default()
    });

    let server = Server::build()
        .listen("acme", lst, {
            let state = Arc::clone(&state);

            move || {
                let url = url.clone();
                let state = Arc::clone(&state);

                HttpService::build()
                    .finish(move |req| ready(Ok::<_, Infallible>(route_request(req, &url, &state))))
                    .tcp()
            }
        })
        .unwrap()
        .workers(1)
        .run();

    let handle = server.handle();

    tokio::spawn(server);

    TestServer {
        dir_url,
        state,
        handle,
    }
}

pub(crate) fn with_directory_server() -> TestServer {
    start(false)
}

pub(crate) fn with_rejecting_server() -> TestServer {
    start(true)
}

fn client(server: &TestServer) -> AcmeClient {
    AcmeClient::new(&server.dir_url)
        .unwrap()
        .with_polling(Duration::from_millis(1), 5)
}

fn account() -> Account {
    Account {
        email: "foo@bar.com".to_owned(),
        registration: None,
        key: AccountKey::generate(),
    }
}

fn csr() -> Vec<u8> {
    let domains = DomainSet::parse(TEST_DOMAIN).unwrap();
    let key = CertKey::generate(KeyAlgorithm::EcdsaP256).unwrap();
    keys::create_csr(&key, &domains).unwrap()
}

#[tokio::test]
async fn test_make_directory() {
    let server = with_directory_server();
    let res = reqwest::get(&server.dir_url).await.unwrap();
    assert!(res.status().is_success());
}

#[tokio::test]
async fn register_returns_account_url() {
    let server = with_directory_server();

    let kid = client(&server).register(&account()).await.unwrap();

    assert!(kid.ends_with("/acme/acct/7728515"));
    assert_eq!(server.accounts_created(), 1);
}

#[tokio::test]
async fn obtain_through_webroot() {
    let server = with_directory_server();
    let webroot = tempfile::tempdir().unwrap();

    let client = client(&server);
    client.set_challenge_responder(ResponderSpec::Http01 {
        webroot: Some(webroot.path().to_owned()),
        port: 80,
    });

    let mut account = account();
    account.registration = Some(client.register(&account).await.unwrap());

    let domains = DomainSet::parse(TEST_DOMAIN).unwrap();
    let material = client.obtain(&account, &domains, &csr()).await.unwrap();

    assert_eq!(material.domains, domains);
    assert!(material.certificate_pem.starts_with("-----BEGIN CERTIFICATE-----"));
    assert!(material.issuer_chain_pem.is_some());
    assert!(material
        .cert_url
        .as_deref()
        .unwrap()
        .ends_with("/acme/cert/fae41c070f967713109028"));

    // registered accounts skip newAccount
    assert_eq!(server.accounts_created(), 1);

    // token file is gone once the order completes
    let token_dir = webroot.path().join(super::HTTP_CHALLENGE_PATH);
    assert_eq!(std::fs::read_dir(token_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn obtain_without_registration_looks_up_account() {
    let server = with_directory_server();
    let webroot = tempfile::tempdir().unwrap();

    let client = client(&server);
    client.set_challenge_responder(ResponderSpec::Http01 {
        webroot: Some(webroot.path().to_owned()),
        port: 80,
    });

    let domains = DomainSet::parse(TEST_DOMAIN).unwrap();
    client.obtain(&account(), &domains, &csr()).await.unwrap();

    assert_eq!(server.accounts_created(), 1);
}

#[tokio::test]
async fn failed_validation_is_an_error() {
    let server = with_rejecting_server();
    let webroot = tempfile::tempdir().unwrap();

    let client = client(&server);
    client.set_challenge_responder(ResponderSpec::Http01 {
        webroot: Some(webroot.path().to_owned()),
        port: 80,
    });

    let domains = DomainSet::parse(TEST_DOMAIN).unwrap();
    let err = client.obtain(&account(), &domains, &csr()).await.unwrap_err();

    let msg = format!("{err:#}");
    assert!(msg.contains("validation of acme-test.example.com failed"), "{msg}");
    assert!(msg.contains("unauthorized"), "{msg}");
}

#[tokio::test]
async fn obtain_needs_a_responder() {
    let server = with_directory_server();

    let domains = DomainSet::parse(TEST_DOMAIN).unwrap();
    let err = client(&server)
        .obtain(&account(), &domains, &csr())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("no challenge responder"));
}

#[tokio::test]
async fn unreachable_directory_is_an_error() {
    let lst = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = lst.local_addr().unwrap().port();
    drop(lst);

    let client = AcmeClient::new(format!("http://127.0.0.1:{port}/directory")).unwrap();
    assert!(client.register(&account()).await.is_err());
}
