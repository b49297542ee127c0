use std::{collections::VecDeque, sync::Arc};

use parking_lot::Mutex;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;

use super::{
    api,
    jws::{self, Jwk, JwsProtectedHeader},
};
use crate::account::AccountKey;

/// Give up after this many consecutive nonce rejections.
const MAX_NONCE_RETRIES: usize = 5;

/// Signed requests and nonce handling for one account key.
///
/// Setup is:
///
/// 1. `Transport::new()`
/// 2. `call_jwk()` against the newAccount URL
/// 3. `set_key_id()` from the returned `Location` header
/// 4. `call_kid()` for every request after that
#[derive(Clone, Debug)]
pub(crate) struct Transport {
    http: reqwest::Client,
    key: AccountKey,
    key_id: Option<String>,
    nonce_pool: Arc<NoncePool>,
}

impl Transport {
    pub(crate) fn new(http: reqwest::Client, nonce_pool: Arc<NoncePool>, key: AccountKey) -> Self {
        Transport {
            http,
            key,
            key_id: None,
            nonce_pool,
        }
    }

    pub(crate) fn set_key_id(&mut self, kid: String) {
        self.key_id = Some(kid);
    }

    pub(crate) fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    pub(crate) fn key(&self) -> &AccountKey {
        &self.key
    }

    /// Makes a call carrying the full public key. Only used for newAccount.
    pub(crate) async fn call_jwk<T>(&self, url: &str, body: &T) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        let jwk = Jwk::try_from(&self.key)?;

        self.do_call(url, body, |nonce| {
            JwsProtectedHeader::new_jwk(jwk.clone(), url, nonce)
        })
        .await
    }

    /// Makes a call identified by the account URL.
    pub(crate) async fn call_kid<T>(&self, url: &str, body: &T) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
    {
        let kid = self
            .key_id
            .as_deref()
            .ok_or_else(|| eyre::eyre!("account key ID unknown; register first"))?;

        self.do_call(url, body, |nonce| JwsProtectedHeader::new_kid(kid, url, nonce))
            .await
    }

    async fn do_call<T, F>(
        &self,
        url: &str,
        body: &T,
        make_header: F,
    ) -> eyre::Result<reqwest::Response>
    where
        T: Serialize + ?Sized,
        F: Fn(String) -> JwsProtectedHeader,
    {
        let mut attempt = 0;

        // the server may invalidate every nonce at any point
        loop {
            attempt += 1;

            let nonce = self.nonce_pool.get_nonce(&self.http).await?;
            let jws = jws::sign(&make_header(nonce), &self.key, body)?;

            log::debug!("call endpoint: {url}");

            let res = self
                .http
                .post(url)
                .header(CONTENT_TYPE, "application/jose+json")
                .body(jws)
                .send()
                .await?;

            // error responses carry nonces too
            self.nonce_pool.extract_nonce(&res);

            match handle_error(res).await {
                Ok(res) => return Ok(res),

                Err(problem)
                    if (problem.is_bad_nonce() || problem.is_jws_verification_error())
                        && attempt < MAX_NONCE_RETRIES =>
                {
                    log::debug!("retrying after {problem}");
                }

                Err(problem) => return Err(problem.into()),
            }
        }
    }
}

/// Nonces handed out by the server, shared by every transport of one directory.
#[derive(Debug, Default)]
pub(crate) struct NoncePool {
    nonce_url: String,
    pool: Mutex<VecDeque<String>>,
}

impl NoncePool {
    pub(crate) fn new(nonce_url: &str) -> Self {
        NoncePool {
            nonce_url: nonce_url.to_owned(),
            ..Default::default()
        }
    }

    fn extract_nonce(&self, res: &reqwest::Response) {
        let Some(nonce) = res
            .headers()
            .get("replay-nonce")
            .and_then(|value| value.to_str().ok())
            .filter(|nonce| is_valid_nonce(nonce))
        else {
            return;
        };

        log::trace!("extracting new nonce");

        let mut pool = self.pool.lock();
        pool.push_back(nonce.to_owned());

        if pool.len() > 10 {
            pool.pop_front();
        }
    }

    async fn get_nonce(&self, http: &reqwest::Client) -> eyre::Result<String> {
        let pooled = self.pool.lock().pop_front();

        if let Some(nonce) = pooled {
            log::trace!("using previous nonce");
            return Ok(nonce);
        }

        log::debug!("requesting new nonce");
        let res = handle_error(http.head(&self.nonce_url).send().await?).await?;

        expect_header(&res, "replay-nonce")
            .filter(|nonce| is_valid_nonce(nonce))
            .ok_or_else(|| eyre::eyre!("newNonce response has no usable Replay-Nonce header"))
    }
}

/// Nonces are base64url without padding; see RFC 8555 §6.5.1.
fn is_valid_nonce(nonce: &str) -> bool {
    !nonce.is_empty()
        && nonce
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Fetches an unauthenticated resource, i.e. the directory.
pub(crate) async fn get(http: &reqwest::Client, url: &str) -> eyre::Result<reqwest::Response> {
    log::debug!("fetch {url}");
    Ok(handle_error(http.get(url).send().await?).await?)
}

/// Passes successful responses through and turns everything else into a [`api::Problem`].
async fn handle_error(res: reqwest::Response) -> Result<reqwest::Response, api::Problem> {
    let status = res.status();

    if status.is_success() {
        return Ok(res);
    }

    let is_problem = res
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/problem+json"));

    // a truncated body is still worth reporting
    let body = res.text().await.unwrap_or_default();

    let problem = if is_problem {
        serde_json::from_str(&body).unwrap_or_else(|err| {
            api::Problem::other(
                "problemJsonFail",
                format!("failed to deserialize application/problem+json ({err}) body: {body}"),
            )
        })
    } else {
        api::Problem::other("httpReqError", format!("{status} body: {body}"))
    };

    Err(problem)
}

pub(crate) fn expect_header(res: &reqwest::Response, name: &str) -> Option<String> {
    res.headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
}
