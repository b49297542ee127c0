//! Issuing, renewing, and deploying TLS certificates from ACME (Automatic Certificate Management
//! Environment) providers such as [Let's Encrypt](https://letsencrypt.org/).
//!
//! The [`LifecycleManager`] takes a set of domain names, picks a validation method, obtains a
//! certificate through an [`AcmeCapability`], stores it on disk, and wires it into nginx, Apache,
//! or IIS.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use autocert::{AcmeClient, ChallengeIntent, Config, InstallRequest, LifecycleManager};
//!
//! # async fn run() -> eyre::Result<()> {
//! let config = Config::load(None)?;
//! let acme = Arc::new(AcmeClient::from_config(&config)?);
//! let manager = LifecycleManager::new(config, acme);
//!
//! let outcome = manager
//!     .install(&InstallRequest {
//!         domains: "example.com,www.example.com".to_owned(),
//!         email: "admin@example.com".to_owned(),
//!         intent: ChallengeIntent::webroot("/var/www/html"),
//!         web_server: None,
//!     })
//!     .await?;
//!
//! assert!(!outcome.origin.is_self_signed());
//! # Ok(())
//! # }
//! ```
//!
//! # Domain Ownership
//!
//! The authority only issues a certificate after the requester proves control over each name,
//! either by answering HTTP or TLS requests for it, or by publishing a DNS record:
//!
//! - webroot (default): HTTP-01 through files under `<webroot>/.well-known/acme-challenge/`, or a
//!   temporary built-in HTTP server when no web root is given;
//! - standalone: TLS-ALPN-01 through a temporary TLS listener;
//! - DNS: DNS-01 through a [`DnsPublisher`]. This is the only method accepted for wildcard names.
//!
//! # Self-Signed Fallback
//!
//! When the authority cannot be reached or rejects the order, a self-signed certificate valid for
//! 90 days is stored in its place so the web server keeps working. Such certificates are flagged
//! in logs, in [`InstallOutcome::origin`], and in the `cert.json` sidecar, and are replaced on the
//! next successful renewal.
//!
//! # Rate Limits
//!
//! Let's Encrypt uses [rate limits] to ensure the API is not being abused. Use the staging
//! environment (`staging = true` in the configuration) while developing.
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

pub mod account;
pub mod acme;
pub mod challenge;
pub mod config;
pub mod domain;
mod error;
pub mod keys;
pub mod manager;
pub mod pipeline;
pub mod scheduler;
pub mod store;
pub mod webserver;

pub use crate::{
    acme::{AcmeCapability, AcmeClient, CertificateMaterial, DnsPublisher, ResponderSpec},
    challenge::{ChallengeIntent, ChallengeMethod},
    config::Config,
    domain::DomainSet,
    error::{Error, Result, Step},
    manager::{
        InstallOutcome, InstallRequest, LifecycleManager, RenewOutcome, RenewReport,
        ServerOutcome, State,
    },
    pipeline::Origin,
    store::{CertStatus, CertificateStore},
    webserver::{ConfigTarget, Configurator, WebServerKind},
};
