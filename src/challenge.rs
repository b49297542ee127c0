//! Choosing how domain control is proven to the certificate authority.

use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    domain::DomainSet,
    error::{Error, Result},
};

/// Proof-of-control mechanism used for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeMethod {
    /// HTTP-01, answered from a web root or a temporary built-in HTTP server.
    Webroot,

    /// TLS-ALPN-01, answered by a temporary TLS listener.
    Standalone,

    /// DNS-01, answered by a TXT record under `_acme-challenge.<domain>`.
    Dns,
}

impl ChallengeMethod {
    /// ACME challenge type name for this method.
    pub fn acme_type(self) -> &'static str {
        match self {
            ChallengeMethod::Webroot => "http-01",
            ChallengeMethod::Standalone => "tls-alpn-01",
            ChallengeMethod::Dns => "dns-01",
        }
    }
}

impl fmt::Display for ChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChallengeMethod::Webroot => "webroot",
            ChallengeMethod::Standalone => "standalone",
            ChallengeMethod::Dns => "dns",
        })
    }
}

impl FromStr for ChallengeMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "webroot" => Ok(ChallengeMethod::Webroot),
            "standalone" => Ok(ChallengeMethod::Standalone),
            "dns" => Ok(ChallengeMethod::Dns),
            other => Err(Error::Config(format!("unknown challenge method {other:?}"))),
        }
    }
}

/// What the caller asked for. Each field corresponds to one explicit flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChallengeIntent {
    pub standalone: bool,
    pub webroot: Option<PathBuf>,
    pub dns: bool,
}

impl ChallengeIntent {
    pub fn standalone() -> Self {
        Self {
            standalone: true,
            ..Default::default()
        }
    }

    pub fn webroot(path: impl Into<PathBuf>) -> Self {
        Self {
            webroot: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn dns() -> Self {
        Self {
            dns: true,
            ..Default::default()
        }
    }

    /// Reconstructs the intent that would select `method` again, used when renewing from
    /// persisted parameters.
    pub fn from_method(method: ChallengeMethod, webroot: Option<PathBuf>) -> Self {
        match method {
            ChallengeMethod::Webroot => Self {
                webroot,
                ..Default::default()
            },
            ChallengeMethod::Standalone => Self::standalone(),
            ChallengeMethod::Dns => Self::dns(),
        }
    }

    fn explicit_count(&self) -> usize {
        [self.standalone, self.webroot.is_some(), self.dns]
            .into_iter()
            .filter(|given| *given)
            .count()
    }
}

/// Maps a domain set and the caller's intent to exactly one challenge method.
///
/// Runs before anything touches the network or the filesystem. No intent means webroot. A
/// wildcard entry is never silently switched to DNS; the caller must ask for it.
pub fn select(domains: &DomainSet, intent: &ChallengeIntent) -> Result<ChallengeMethod> {
    if intent.explicit_count() > 1 {
        return Err(Error::ConflictingChallengeIntent);
    }

    let method = if intent.dns {
        ChallengeMethod::Dns
    } else if intent.standalone {
        ChallengeMethod::Standalone
    } else {
        ChallengeMethod::Webroot
    };

    if method != ChallengeMethod::Dns {
        if let Some(wildcard) = domains.first_wildcard() {
            return Err(Error::WildcardRequiresDns {
                domain: wildcard.to_owned(),
            });
        }
    }

    Ok(method)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(input: &str) -> DomainSet {
        DomainSet::parse(input).unwrap()
    }

    #[test]
    fn default_is_webroot() {
        let method = select(&set("example.com"), &ChallengeIntent::default()).unwrap();
        assert_eq!(method, ChallengeMethod::Webroot);
    }

    #[test]
    fn explicit_intents() {
        let domains = set("example.com,www.example.com");

        assert_eq!(
            select(&domains, &ChallengeIntent::webroot("/var/www")).unwrap(),
            ChallengeMethod::Webroot
        );
        assert_eq!(
            select(&domains, &ChallengeIntent::standalone()).unwrap(),
            ChallengeMethod::Standalone
        );
        assert_eq!(
            select(&domains, &ChallengeIntent::dns()).unwrap(),
            ChallengeMethod::Dns
        );
    }

    #[test]
    fn conflicting_intents() {
        let intent = ChallengeIntent {
            standalone: true,
            dns: true,
            ..Default::default()
        };
        assert!(matches!(
            select(&set("example.com"), &intent),
            Err(Error::ConflictingChallengeIntent)
        ));

        let intent = ChallengeIntent {
            standalone: true,
            webroot: Some("/srv".into()),
            dns: false,
        };
        assert!(matches!(
            select(&set("example.com"), &intent),
            Err(Error::ConflictingChallengeIntent)
        ));
    }

    #[test]
    fn wildcard_never_picks_another_method() {
        let domains = set("example.com,*.example.com");

        for intent in [
            ChallengeIntent::default(),
            ChallengeIntent::standalone(),
            ChallengeIntent::webroot("/var/www"),
        ] {
            match select(&domains, &intent) {
                Err(Error::WildcardRequiresDns { domain }) => assert_eq!(domain, "*.example.com"),
                other => panic!("expected WildcardRequiresDns, got {other:?}"),
            }
        }

        assert_eq!(
            select(&domains, &ChallengeIntent::dns()).unwrap(),
            ChallengeMethod::Dns
        );
    }

    #[test]
    fn method_names_round_trip() {
        for method in [
            ChallengeMethod::Webroot,
            ChallengeMethod::Standalone,
            ChallengeMethod::Dns,
        ] {
            assert_eq!(method.to_string().parse::<ChallengeMethod>().unwrap(), method);
        }
        assert_eq!(ChallengeMethod::Standalone.acme_type(), "tls-alpn-01");
    }
}
