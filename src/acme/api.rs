//! JSON payloads exchanged with the ACME server.

use std::fmt;

use serde::{
    ser::{SerializeMap as _, Serializer},
    Deserialize, Serialize,
};

/// Serializes to `""`. Used as the payload of POST-as-GET requests.
pub(crate) struct EmptyString;

impl Serialize for EmptyString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("")
    }
}

/// Serializes to `{}`. Used to tell the server a challenge is ready.
pub(crate) struct EmptyObject;

impl Serialize for EmptyObject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_map(Some(0))?.end()
    }
}

/// See [RFC 8555 §7.1.1](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.1).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoke_cert: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_change: Option<String>,
}

/// See [RFC 8555 §7.1.2](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.2).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service_agreed: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub orders: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub _type: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: &str) -> Self {
        Identifier {
            _type: "dns".to_owned(),
            value: value.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// See [RFC 8555 §7.1.3](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.3).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,

    pub identifiers: Vec<Identifier>,

    #[serde(default, skip_serializing)]
    pub error: Option<Problem>,

    #[serde(default, skip_serializing)]
    pub authorizations: Vec<String>,

    #[serde(default, skip_serializing)]
    pub finalize: String,

    #[serde(default, skip_serializing)]
    pub certificate: Option<String>,
}

impl Order {
    pub fn from_domains<'a>(domains: impl IntoIterator<Item = &'a str>) -> Self {
        Order {
            identifiers: domains.into_iter().map(Identifier::dns).collect(),
            ..Default::default()
        }
    }

    pub fn domains(&self) -> Vec<&str> {
        self.identifiers
            .iter()
            .map(|identifier| identifier.value.as_str())
            .collect()
    }

    /// Replaces `self` with the server's view while keeping the requested identifier order.
    ///
    /// Servers have been seen to return identifiers reordered, which would swap the primary
    /// name with an alternative one.
    pub fn overwrite(&mut self, mut from_api: Self) -> eyre::Result<()> {
        if from_api.identifiers.len() != self.identifiers.len()
            || from_api
                .identifiers
                .iter()
                .any(|id| !self.identifiers.contains(id))
        {
            eyre::bail!(
                "order identifiers mismatch: requested {:?}, server has {:?}",
                self.domains(),
                from_api.domains()
            );
        }

        from_api.identifiers = std::mem::take(&mut self.identifiers);
        *self = from_api;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

/// See [RFC 8555 §7.1.4](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorization {
    pub identifier: Identifier,
    pub status: AuthorizationStatus,
    pub challenges: Vec<Challenge>,

    #[serde(default)]
    pub wildcard: Option<bool>,
}

impl Authorization {
    pub fn challenge(&self, challenge_type: &str) -> Option<&Challenge> {
        self.challenges.iter().find(|c| c._type == challenge_type)
    }

    /// First error reported on any challenge of this authorization.
    pub fn problem(&self) -> Option<&Problem> {
        self.challenges.iter().find_map(|c| c.error.as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// See [RFC 8555 §7.1.5](https://datatracker.ietf.org/doc/html/rfc8555#section-7.1.5).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub _type: String,
    pub url: String,
    pub status: ChallengeStatus,

    #[serde(default)]
    pub token: String,

    #[serde(default)]
    pub error: Option<Problem>,
}

/// Signing request in base64url-encoded DER, not PEM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finalize {
    pub csr: String,
}

/// An `application/problem+json` document, or a stand-in for an unexpected HTTP response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    #[serde(rename = "type")]
    pub _type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subproblems: Option<Vec<Subproblem>>,
}

impl Problem {
    pub(crate) fn other(_type: impl Into<String>, detail: impl Into<String>) -> Self {
        Problem {
            _type: _type.into(),
            detail: Some(detail.into()),
            subproblems: None,
        }
    }

    pub fn is_bad_nonce(&self) -> bool {
        self._type == "urn:ietf:params:acme:error:badNonce" || self._type == "badNonce"
    }

    pub fn is_jws_verification_error(&self) -> bool {
        (self._type == "urn:ietf:params:acme:error:malformed"
            || self._type == "urn:acme:error:malformed")
            && self.detail.as_deref() == Some("JWS verification error")
    }
}

impl fmt::Display for Problem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {detail}", self._type)?,
            None => f.write_str(&self._type)?,
        }

        for sub in self.subproblems.iter().flatten() {
            write!(f, "; {}", sub._type)?;
            if let Some(detail) = &sub.detail {
                write!(f, ": {detail}")?;
            }
        }

        Ok(())
    }
}

impl std::error::Error for Problem {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subproblem {
    #[serde(rename = "type")]
    pub _type: String,
    pub detail: Option<String>,
    pub identifier: Option<Identifier>,
}
