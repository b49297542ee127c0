use std::{fmt, io, path::PathBuf};

use crate::{challenge::ChallengeMethod, webserver::WebServerKind};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Named stage of an install or renew operation, attached to every wrapped failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Validate,
    Identity,
    KeyGen,
    Request,
    Obtain,
    Finalize,
    Fallback,
    Persist,
    Status,
    Configure,
    Test,
    Reload,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::Validate => "validate",
            Step::Identity => "identity",
            Step::KeyGen => "keygen",
            Step::Request => "request",
            Step::Obtain => "obtain",
            Step::Finalize => "finalize",
            Step::Fallback => "fallback",
            Step::Persist => "persist",
            Step::Status => "status",
            Step::Configure => "configure",
            Step::Test => "test",
            Step::Reload => "reload",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid domain format {input:?}: {reason}")]
    InvalidDomainFormat { input: String, reason: &'static str },

    #[error("only one of --standalone, --webroot or --dns may be given")]
    ConflictingChallengeIntent,

    #[error("wildcard domain {domain} requires DNS validation (--dns)")]
    WildcardRequiresDns { domain: String },

    #[error("wildcard domain {domain} cannot be validated with the {method} method")]
    WildcardUnsupportedForMethod {
        method: ChallengeMethod,
        domain: String,
    },

    #[error("ACME account registration for {email} failed: {cause:#}")]
    AccountRegistrationFailed { email: String, cause: eyre::Report },

    #[error("certificate acquisition failed at {step}: {cause:#}")]
    AcquisitionFailed { step: Step, cause: eyre::Report },

    #[error("no DNS provider configured to publish challenge records")]
    DnsProviderMissing,

    #[error("certificate not found at {}", path.display())]
    CertificateNotFound { path: PathBuf },

    #[error("could not parse certificate {}: {reason}", path.display())]
    CertificateParse { path: PathBuf, reason: String },

    #[error("{server} configuration test failed: {output}")]
    ConfigurationInvalid { server: WebServerKind, output: String },

    #[error("{server} reload failed: {output}")]
    ReloadFailed { server: WebServerKind, output: String },

    #[error("{step} failed on {}: {source}", path.display())]
    Io {
        step: Step,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{step} failed: {source}")]
    Crypto {
        step: Step,
        #[source]
        source: rcgen::Error,
    },

    #[error("certificate directory {} is locked by another operation", path.display())]
    DirectoryLocked { path: PathBuf },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("scheduler: {0}")]
    Scheduler(String),
}

impl Error {
    pub(crate) fn io(step: Step, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Io {
            step,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn crypto(step: Step) -> impl FnOnce(rcgen::Error) -> Self {
        move |source| Error::Crypto { step, source }
    }

    /// Returns true for failures that leave an issued certificate on disk but not yet live.
    pub fn is_deployment_failure(&self) -> bool {
        matches!(
            self,
            Error::ConfigurationInvalid { .. } | Error::ReloadFailed { .. }
        )
    }
}
