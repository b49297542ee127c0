//! Request signing. See [RFC 8555 §6.2](https://datatracker.ietf.org/doc/html/rfc8555#section-6.2).

use base64::prelude::*;
use p256::ecdsa::{signature::Signer as _, Signature};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::account::AccountKey;

/// Protected header. Carries `jwk` for newAccount and `kid` for every other request.
#[derive(Debug, Serialize, Deserialize, Default)]
pub(crate) struct JwsProtectedHeader {
    alg: String,
    nonce: String,
    url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,

    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl JwsProtectedHeader {
    pub(crate) fn new_jwk(jwk: Jwk, url: &str, nonce: String) -> Self {
        JwsProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            nonce,
            jwk: Some(jwk),
            ..Default::default()
        }
    }

    pub(crate) fn new_kid(kid: &str, url: &str, nonce: String) -> Self {
        JwsProtectedHeader {
            alg: "ES256".to_owned(),
            url: url.to_owned(),
            nonce,
            kid: Some(kid.to_owned()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct Jwk {
    alg: String,
    crv: String,
    kty: String,
    #[serde(rename = "use")]
    _use: String,
    x: String,
    y: String,
}

impl TryFrom<&AccountKey> for Jwk {
    type Error = eyre::Error;

    fn try_from(key: &AccountKey) -> eyre::Result<Self> {
        let point = key.signing_key().verifying_key().to_encoded_point(false);

        let x = point
            .x()
            .ok_or_else(|| eyre::eyre!("account key has no x coordinate"))?;
        let y = point
            .y()
            .ok_or_else(|| eyre::eyre!("account key has no y coordinate"))?;

        Ok(Jwk {
            alg: "ES256".to_owned(),
            kty: "EC".to_owned(),
            crv: "P-256".to_owned(),
            _use: "sig".to_owned(),
            x: BASE64_URL_SAFE_NO_PAD.encode(x),
            y: BASE64_URL_SAFE_NO_PAD.encode(y),
        })
    }
}

/// Required members only, in lexical order, for the RFC 7638 thumbprint.
#[derive(Debug, Serialize)]
struct JwkThumb<'a> {
    crv: &'a str,
    kty: &'a str,
    x: &'a str,
    y: &'a str,
}

impl<'a> From<&'a Jwk> for JwkThumb<'a> {
    fn from(jwk: &'a Jwk) -> Self {
        JwkThumb {
            crv: &jwk.crv,
            kty: &jwk.kty,
            x: &jwk.x,
            y: &jwk.y,
        }
    }
}

/// <https://datatracker.ietf.org/doc/html/rfc7515#section-7.2.2>
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct FlattenedJsonJws {
    protected: String,
    payload: String,
    signature: String,
}

/// Signs `payload` under `protected`, producing the flattened JSON serialization.
///
/// A payload serializing to `""` is sent as an empty string (POST-as-GET).
pub(crate) fn sign<T: Serialize + ?Sized>(
    protected: &JwsProtectedHeader,
    key: &AccountKey,
    payload: &T,
) -> eyre::Result<String> {
    let protected = BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(protected)?);

    let payload = match serde_json::to_string(payload)?.as_str() {
        "\"\"" => String::new(),
        json => BASE64_URL_SAFE_NO_PAD.encode(json),
    };

    let to_sign = format!("{protected}.{payload}");
    let signature: Signature = key
        .signing_key()
        .try_sign(to_sign.as_bytes())
        .map_err(|err| eyre::eyre!("failed to sign request: {err}"))?;

    let jws = FlattenedJsonJws {
        protected,
        payload,
        signature: BASE64_URL_SAFE_NO_PAD.encode(signature.to_bytes()),
    };

    Ok(serde_json::to_string(&jws)?)
}

/// Key authorization for `token`: `<token>.<base64url(JWK thumbprint)>`.
pub(crate) fn key_authorization(token: &str, key: &AccountKey) -> eyre::Result<String> {
    let jwk = Jwk::try_from(key)?;
    let thumb = serde_json::to_string(&JwkThumb::from(&jwk))?;

    let digest = BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(thumb));
    Ok(format!("{token}.{digest}"))
}

/// TXT record value for DNS-01.
pub(crate) fn dns_txt_value(key_auth: &str) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(key_auth))
}

/// Digest carried in the `acmeIdentifier` extension for TLS-ALPN-01.
pub(crate) fn tls_alpn_digest(key_auth: &str) -> [u8; 32] {
    Sha256::digest(key_auth).into()
}

#[cfg(test)]
mod tests {
    use p256::ecdsa::{signature::Verifier as _, VerifyingKey};

    use super::*;
    use crate::acme::api::EmptyString;

    #[test]
    fn signature_verifies() {
        let key = AccountKey::generate();
        let header = JwsProtectedHeader::new_kid(
            "https://acme.test/acct/1",
            "https://acme.test/x",
            "n0nce".to_owned(),
        );

        let jws: serde_json::Value =
            serde_json::from_str(&sign(&header, &key, &serde_json::json!({ "a": 1 })).unwrap())
                .unwrap();

        let protected = jws["protected"].as_str().unwrap();
        let payload = jws["payload"].as_str().unwrap();
        let signature = BASE64_URL_SAFE_NO_PAD
            .decode(jws["signature"].as_str().unwrap())
            .unwrap();

        let header: serde_json::Value =
            serde_json::from_slice(&BASE64_URL_SAFE_NO_PAD.decode(protected).unwrap()).unwrap();
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["kid"], "https://acme.test/acct/1");
        assert!(header.get("jwk").is_none());

        let signature = Signature::from_slice(&signature).unwrap();
        let verifying_key = VerifyingKey::from(key.signing_key());
        verifying_key
            .verify(format!("{protected}.{payload}").as_bytes(), &signature)
            .unwrap();
    }

    #[test]
    fn post_as_get_has_empty_payload() {
        let key = AccountKey::generate();
        let header = JwsProtectedHeader::new_kid("kid", "https://acme.test/x", "n".to_owned());

        let jws: serde_json::Value =
            serde_json::from_str(&sign(&header, &key, &EmptyString).unwrap())
                .unwrap();
        assert_eq!(jws["payload"], "");
    }

    #[test]
    fn key_authorization_shape() {
        let key = AccountKey::generate();
        let key_auth = key_authorization("tok3n", &key).unwrap();

        let (token, thumb) = key_auth.split_once('.').unwrap();
        assert_eq!(token, "tok3n");
        // base64url of a SHA-256 digest
        assert_eq!(thumb.len(), 43);

        assert_eq!(dns_txt_value(&key_auth).len(), 43);
        assert_ne!(tls_alpn_digest(&key_auth), [0; 32]);
    }
}
