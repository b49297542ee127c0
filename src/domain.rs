//! Validated sets of host names requested together on one certificate.

use std::fmt;

use crate::error::{Error, Result};

const WILDCARD_PREFIX: &str = "*.";

/// An ordered, non-empty list of host patterns treated as one certificate request.
///
/// The first entry is the primary name: it becomes the certificate's Common Name and names the
/// on-disk directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainSet {
    domains: Vec<String>,
}

impl DomainSet {
    /// Parses a comma-separated list (or a single name) into a domain set.
    ///
    /// Validation is purely syntactic; no lookups are performed. Surrounding whitespace around
    /// each comma-separated entry is trimmed, but whitespace inside an entry is rejected.
    pub fn parse(input: &str) -> Result<Self> {
        Self::from_entries(input.split(','))
    }

    /// Builds a domain set from already separated entries.
    pub fn from_entries<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut domains = Vec::new();

        for entry in entries {
            let entry = entry.as_ref().trim();
            validate_entry(entry)?;

            // a repeated name adds nothing to the certificate
            if !domains.iter().any(|d: &String| d.eq_ignore_ascii_case(entry)) {
                domains.push(entry.to_owned());
            }
        }

        if domains.is_empty() {
            return Err(invalid("", "no domains given"));
        }

        Ok(DomainSet { domains })
    }

    pub fn primary(&self) -> &str {
        &self.domains[0]
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn is_multi(&self) -> bool {
        self.domains.len() > 1
    }

    pub fn has_wildcard(&self) -> bool {
        self.first_wildcard().is_some()
    }

    /// First wildcard entry, if any.
    pub fn first_wildcard(&self) -> Option<&str> {
        self.domains
            .iter()
            .map(String::as_str)
            .find(|d| d.starts_with(WILDCARD_PREFIX))
    }

    /// Name of the certificate directory for this set.
    ///
    /// Single names use the name itself; multi-name sets append `_san` to the primary name.
    /// Windows forbids `*` in file names, so there a wildcard marker is spelled `_wildcard`.
    pub fn dir_name(&self) -> String {
        let primary = if cfg!(windows) {
            self.primary().replace('*', "_wildcard")
        } else {
            self.primary().to_owned()
        };

        if self.is_multi() {
            format!("{primary}_san")
        } else {
            primary
        }
    }

    /// The TXT record names an operator must publish for DNS validation, one per entry.
    ///
    /// A wildcard entry shares its record with the base domain, so duplicates are dropped.
    pub fn dns_record_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::with_capacity(self.domains.len());

        for domain in &self.domains {
            let name = dns_record_name(domain);
            if !names.contains(&name) {
                names.push(name);
            }
        }

        names
    }

    /// Joins the names with `sep`, e.g. for an nginx `server_name` directive.
    pub fn join(&self, sep: &str) -> String {
        self.domains.join(sep)
    }
}

impl fmt::Display for DomainSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.join(","))
    }
}

/// DNS-01 record name for a single entry: `_acme-challenge.<base-domain>`.
pub fn dns_record_name(domain: &str) -> String {
    let base = domain.strip_prefix(WILDCARD_PREFIX).unwrap_or(domain);
    format!("_acme-challenge.{base}")
}

fn validate_entry(entry: &str) -> Result<()> {
    if entry.is_empty() {
        return Err(invalid(entry, "empty domain entry"));
    }

    if entry.chars().any(char::is_whitespace) {
        return Err(invalid(entry, "domain contains whitespace"));
    }

    // names end up in file paths and web server configuration
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '*');
    if !entry.chars().all(allowed) {
        return Err(invalid(
            entry,
            "domain may only contain letters, digits, `-`, `_`, `.` and a leading `*.`",
        ));
    }

    let base = match entry.strip_prefix(WILDCARD_PREFIX) {
        Some(base) => {
            if base.is_empty() {
                return Err(invalid(entry, "wildcard needs a domain after `*.`"));
            }
            if base.contains('*') {
                return Err(invalid(entry, "only one leading wildcard label is allowed"));
            }
            base
        }

        None if entry.contains('*') => {
            return Err(invalid(entry, "wildcard must be the full leftmost label `*.`"));
        }

        None => entry,
    };

    if base.split('.').any(str::is_empty) {
        return Err(invalid(entry, "domain contains an empty label"));
    }

    Ok(())
}

fn invalid(input: &str, reason: &'static str) -> Error {
    Error::InvalidDomainFormat {
        input: input.to_owned(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reason(input: &str) -> &'static str {
        match DomainSet::parse(input) {
            Err(Error::InvalidDomainFormat { reason, .. }) => reason,
            other => panic!("expected InvalidDomainFormat for {input:?}, got {other:?}"),
        }
    }

    #[test]
    fn single_domain() {
        let set = DomainSet::parse("example.com").unwrap();
        assert_eq!(set.primary(), "example.com");
        assert_eq!(set.domains(), ["example.com"]);
        assert!(!set.is_multi());
        assert!(!set.has_wildcard());
        assert_eq!(set.dir_name(), "example.com");
    }

    #[test]
    fn multi_domain_keeps_order_and_trims() {
        let set = DomainSet::parse(" example.com , www.example.com,api.example.com").unwrap();
        assert_eq!(
            set.domains(),
            ["example.com", "www.example.com", "api.example.com"]
        );
        assert_eq!(set.primary(), "example.com");
        assert_eq!(set.dir_name(), "example.com_san");
        assert_eq!(set.to_string(), "example.com,www.example.com,api.example.com");
    }

    #[test]
    fn duplicates_collapse() {
        let set = DomainSet::parse("example.com,EXAMPLE.com").unwrap();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn wildcard_detection() {
        let set = DomainSet::parse("example.com,*.example.com").unwrap();
        assert!(set.has_wildcard());
        assert_eq!(set.first_wildcard(), Some("*.example.com"));

        #[cfg(unix)]
        {
            let set = DomainSet::parse("*.example.com").unwrap();
            assert_eq!(set.dir_name(), "*.example.com");
        }
    }

    #[test]
    fn rejects_malformed_entries() {
        assert_eq!(reason(""), "empty domain entry");
        assert_eq!(reason("example.com,,www.example.com"), "empty domain entry");
        assert_eq!(reason("exa mple.com"), "domain contains whitespace");
        assert_eq!(reason("*."), "wildcard needs a domain after `*.`");
        assert_eq!(reason("*.*.example.com"), "only one leading wildcard label is allowed");
        assert_eq!(reason("*.ex*ample.com"), "only one leading wildcard label is allowed");
        assert_eq!(reason("www.*.example.com"), "wildcard must be the full leftmost label `*.`");
        assert_eq!(reason("*example.com"), "wildcard must be the full leftmost label `*.`");

        let charset = "domain may only contain letters, digits, `-`, `_`, `.` and a leading `*.`";
        for input in [
            "../escaped",
            "a/b.example",
            "a\\b.example",
            "example.com;",
            "example.com{",
            "}example.com",
            "ex\"ample.com",
        ] {
            assert_eq!(reason(input), charset, "{input}");
        }

        assert_eq!(reason(".."), "domain contains an empty label");
        assert_eq!(reason("a..example.com"), "domain contains an empty label");
        assert_eq!(reason(".example.com"), "domain contains an empty label");
        assert_eq!(reason("*..example.com"), "domain contains an empty label");
    }

    #[test]
    fn dns_record_names_strip_wildcard() {
        let set = DomainSet::parse("example.com,*.example.com,www.example.org").unwrap();
        assert_eq!(
            set.dns_record_names(),
            ["_acme-challenge.example.com", "_acme-challenge.www.example.org"]
        );
        assert_eq!(dns_record_name("*.a.b"), "_acme-challenge.a.b");
    }
}
