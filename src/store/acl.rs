//! Container access control lists
//!
//! The store expresses access control as two header values,
//! `X-Container-Read` and `X-Container-Write`, each a comma-separated list
//! of rules:
//!
//! - `.r:<host>`: referrer rule; `.r:*` lets anyone read objects
//! - `.rlistings`: allows listing the container's contents
//! - `<account>[:<user>]`: grants an account (or one of its users)
//!
//! Rules are additive: every matching rule grants its permission and no
//! rule takes precedence over another. Rule order only matters for how the
//! headers are written back.

use std::fmt;

use reqwest::header::HeaderMap;

use crate::transport::header_str;

/// Header carrying read rules
pub const READ_HEADER: &str = "x-container-read";
/// Header carrying write rules
pub const WRITE_HEADER: &str = "x-container-write";

/// Permission granted by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Read,
    Write,
    ReadWrite,
}

impl Permission {
    pub fn allows_read(self) -> bool {
        matches!(self, Permission::Read | Permission::ReadWrite)
    }

    pub fn allows_write(self) -> bool {
        matches!(self, Permission::Write | Permission::ReadWrite)
    }
}

/// Who a rule applies to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Grantee {
    /// An account, optionally narrowed to one user
    Account {
        account: String,
        user: Option<String>,
    },
    /// Requests whose referrer matches a host pattern (`*` for everyone)
    Referrer(String),
    /// Container listings
    Listings,
}

/// One access rule
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub permission: Permission,
    pub grantee: Grantee,
}

impl Rule {
    fn read_entry(&self) -> Option<String> {
        if !self.permission.allows_read() {
            return None;
        }
        Some(match &self.grantee {
            Grantee::Referrer(host) => format!(".r:{}", host),
            Grantee::Listings => ".rlistings".to_string(),
            Grantee::Account { account, user } => account_entry(account, user.as_deref()),
        })
    }

    fn write_entry(&self) -> Option<String> {
        if !self.permission.allows_write() {
            return None;
        }
        match &self.grantee {
            Grantee::Account { account, user } => Some(account_entry(account, user.as_deref())),
            Grantee::Referrer(_) | Grantee::Listings => None,
        }
    }
}

fn account_entry(account: &str, user: Option<&str>) -> String {
    match user {
        Some(user) => format!("{}:{}", account, user),
        None => account.to_string(),
    }
}

/// Serialized form of an [`Acl`]; a side with no rules is `None`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AclHeaders {
    pub read: Option<String>,
    pub write: Option<String>,
}

impl AclHeaders {
    pub fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

/// An ordered set of access rules
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Acl {
    rules: Vec<Rule>,
}

impl Acl {
    /// An ACL with no rules (private)
    pub fn new() -> Self {
        Self::default()
    }

    /// Anyone may read objects and list the container
    pub fn make_public() -> Self {
        let mut acl = Self::new();
        acl.add_referrer(Permission::Read, "*");
        acl.allow_listings();
        acl
    }

    /// Only the owning account has access
    pub fn make_non_public() -> Self {
        Self::new()
    }

    /// Parse the read and write header values
    pub fn from_headers(read: Option<&str>, write: Option<&str>) -> Self {
        let mut acl = Self::new();
        for (permission, value) in [(Permission::Read, read), (Permission::Write, write)] {
            for entry in value.unwrap_or_default().split(',') {
                if let Some(rule) = Self::parse_rule(permission, entry) {
                    acl.rules.push(rule);
                }
            }
        }
        acl
    }

    /// Parse the ACL headers of a container response
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        Self::from_headers(
            header_str(headers, READ_HEADER),
            header_str(headers, WRITE_HEADER),
        )
    }

    /// Parse a single rule.
    ///
    /// Malformed rules yield `None` and are dropped by callers rather than
    /// reported. Referrer and listing rules are read-only: offered for
    /// write alone they are rejected, offered for read-write they are kept
    /// as read.
    pub fn parse_rule(permission: Permission, text: &str) -> Option<Rule> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        if let Some(host) = text.strip_prefix(".r:") {
            let host = host.trim();
            if host.is_empty() || !permission.allows_read() {
                return None;
            }
            return Some(Rule {
                permission: Permission::Read,
                grantee: Grantee::Referrer(host.to_string()),
            });
        }

        if text.starts_with(".rlistings") {
            if !permission.allows_read() {
                return None;
            }
            return Some(Rule {
                permission: Permission::Read,
                grantee: Grantee::Listings,
            });
        }

        if text.starts_with('.') {
            return None;
        }

        let (account, user) = match text.split_once(':') {
            Some((account, user)) => (account.trim(), Some(user.trim())),
            None => (text, None),
        };
        if account.is_empty() {
            return None;
        }

        Some(Rule {
            permission,
            grantee: Grantee::Account {
                account: account.to_string(),
                user: user.filter(|u| !u.is_empty()).map(str::to_string),
            },
        })
    }

    /// Grant an account (or one of its users)
    pub fn add_account(&mut self, permission: Permission, account: &str, user: Option<&str>) {
        self.rules.push(Rule {
            permission,
            grantee: Grantee::Account {
                account: account.to_string(),
                user: user.map(str::to_string),
            },
        });
    }

    /// Grant requests from hosts matching `host`; referrer rules only ever
    /// carry read permission.
    pub fn add_referrer(&mut self, permission: Permission, host: &str) {
        if !permission.allows_read() {
            return;
        }
        self.rules.push(Rule {
            permission: Permission::Read,
            grantee: Grantee::Referrer(host.to_string()),
        });
    }

    /// Allow container listings
    pub fn allow_listings(&mut self) {
        self.rules.push(Rule {
            permission: Permission::Read,
            grantee: Grantee::Listings,
        });
    }

    /// Rules in insertion order
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Serialize into read and write header values
    pub fn headers(&self) -> AclHeaders {
        let join = |entries: Vec<String>| Some(entries.join(",")).filter(|s| !s.is_empty());
        AclHeaders {
            read: join(self.rules.iter().filter_map(Rule::read_entry).collect()),
            write: join(self.rules.iter().filter_map(Rule::write_entry).collect()),
        }
    }

    /// True iff everyone may read and listings are allowed
    pub fn is_public(&self) -> bool {
        let all_hosts = self.rules.iter().any(|rule| {
            rule.permission.allows_read()
                && matches!(&rule.grantee, Grantee::Referrer(host) if host == "*")
        });
        let listings = self
            .rules
            .iter()
            .any(|rule| rule.grantee == Grantee::Listings);
        all_hosts && listings
    }

    /// True iff there are no rules at all.
    ///
    /// Not the negation of [`Acl::is_public`]: an ACL granting some
    /// accounts or hosts is neither public nor non-public.
    pub fn is_non_public(&self) -> bool {
        self.rules.is_empty()
    }
}

impl fmt::Display for Acl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers = self.headers();
        write!(
            f,
            "ACL(READ={}, WRITE={})",
            headers.read.unwrap_or_default(),
            headers.write.unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rule_grammars() {
        assert_eq!(
            Acl::parse_rule(Permission::Read, ".r:*.example.com"),
            Some(Rule {
                permission: Permission::Read,
                grantee: Grantee::Referrer("*.example.com".to_string()),
            })
        );
        assert_eq!(
            Acl::parse_rule(Permission::Read, " .rlistings "),
            Some(Rule {
                permission: Permission::Read,
                grantee: Grantee::Listings,
            })
        );
        assert_eq!(
            Acl::parse_rule(Permission::Write, "acct:bob"),
            Some(Rule {
                permission: Permission::Write,
                grantee: Grantee::Account {
                    account: "acct".to_string(),
                    user: Some("bob".to_string()),
                },
            })
        );
        assert_eq!(
            Acl::parse_rule(Permission::Read, "acct"),
            Some(Rule {
                permission: Permission::Read,
                grantee: Grantee::Account {
                    account: "acct".to_string(),
                    user: None,
                },
            })
        );
    }

    #[test]
    fn test_malformed_rules_are_ignored() {
        assert_eq!(Acl::parse_rule(Permission::Read, ""), None);
        assert_eq!(Acl::parse_rule(Permission::Read, ".r:"), None);
        assert_eq!(Acl::parse_rule(Permission::Read, ":bob"), None);
        assert_eq!(Acl::parse_rule(Permission::Read, ".bogus"), None);
        assert_eq!(Acl::parse_rule(Permission::Write, ".r:*"), None);
        assert_eq!(Acl::parse_rule(Permission::Write, ".rlistings"), None);

        let acl = Acl::from_headers(Some(",,.r:, acct ,"), None);
        assert_eq!(acl.rules().len(), 1);
    }

    #[test]
    fn test_empty_acl_is_non_public_and_has_no_headers() {
        let acl = Acl::new();
        assert!(acl.is_non_public());
        assert!(!acl.is_public());
        assert!(acl.headers().is_empty());
    }

    #[test]
    fn test_public_survives_header_round_trip() {
        let headers = Acl::make_public().headers();
        assert_eq!(headers.read.as_deref(), Some(".r:*,.rlistings"));
        assert_eq!(headers.write, None);

        let parsed = Acl::from_headers(headers.read.as_deref(), headers.write.as_deref());
        assert!(parsed.is_public());
        assert!(!parsed.is_non_public());
    }

    #[test]
    fn test_partially_public_is_neither() {
        let mut acl = Acl::new();
        acl.add_referrer(Permission::Read, "*");
        assert!(!acl.is_public());
        assert!(!acl.is_non_public());

        let mut acl = Acl::new();
        acl.add_referrer(Permission::Read, "example.com");
        acl.allow_listings();
        assert!(!acl.is_public());
        assert!(!acl.is_non_public());
    }

    #[test]
    fn test_host_rules_never_written() {
        let mut acl = Acl::new();
        acl.add_account(Permission::ReadWrite, "acct", Some("bob"));
        acl.add_referrer(Permission::ReadWrite, "example.com");
        acl.add_account(Permission::Write, "other", None);

        let headers = acl.headers();
        assert_eq!(headers.read.as_deref(), Some("acct:bob,.r:example.com"));
        assert_eq!(headers.write.as_deref(), Some("acct:bob,other"));
    }

    #[test]
    fn test_insertion_order_preserved() {
        let acl = Acl::from_headers(Some("b,a,.rlistings"), Some("z"));
        let headers = acl.headers();
        assert_eq!(headers.read.as_deref(), Some("b,a,.rlistings"));
        assert_eq!(headers.write.as_deref(), Some("z"));
        assert_eq!(acl.to_string(), "ACL(READ=b,a,.rlistings, WRITE=z)");
    }
}
