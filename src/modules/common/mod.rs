use mail_parser::{Addr as MimeAddr, Address as MimeAddress};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::ops::Deref;

pub mod parallel;
pub mod periodic;
pub mod signal;

/// A parsed mailbox participant. Either side may be missing, though in
/// practice at least one of `name` or `address` is present.
#[derive(Debug, PartialEq, Eq, Clone, Default, Serialize, Deserialize)]
pub struct Addr {
    /// The optional display name associated with the email address (e.g., "John Doe").
    pub name: Option<String>,
    /// The optional email address (e.g., "john.doe@example.com").
    pub address: Option<String>,
}

impl Addr {
    /// Accepts both `"Name" <addr>` and bare addresses.
    pub fn parse(s: &str) -> Self {
        let re = Regex::new(r#"(?:(?P<name>.*)\s*)?<(?P<email>[^<>]+)>"#).unwrap();
        if let Some(caps) = re.captures(s) {
            let name: Option<String> = caps
                .name("name")
                .map(|m| m.as_str().trim().trim_matches('"').trim().into());
            let email: Option<String> = caps.name("email").map(|m| m.as_str().trim().into());
            Addr {
                name: name.filter(|n| !n.is_empty()),
                address: email,
            }
        } else {
            let s_trimmed = s.trim();
            Addr {
                name: None,
                address: if s_trimmed.is_empty() {
                    None
                } else {
                    Some(s_trimmed.into())
                },
            }
        }
    }
}

impl std::fmt::Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.name, &self.address) {
            (Some(name), Some(address)) => write!(f, "{} <{}>", name, address),
            (None, Some(address)) => write!(f, "<{}>", address),
            (Some(name), None) => write!(f, "{}", name),
            (None, None) => write!(f, ""),
        }
    }
}

impl<'x> From<&MimeAddr<'x>> for Addr {
    fn from(original: &MimeAddr<'x>) -> Self {
        Addr {
            name: original.name.as_ref().map(|s| s.to_string()),
            address: original.address.as_ref().map(|s| s.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddrVec(pub Vec<Addr>);

impl Deref for AddrVec {
    type Target = Vec<Addr>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'x> From<&MimeAddress<'x>> for AddrVec {
    fn from(original: &MimeAddress<'x>) -> Self {
        let vec = match original {
            MimeAddress::List(addrs) => addrs.iter().map(Addr::from).collect(),
            MimeAddress::Group(groups) => groups
                .iter()
                .flat_map(|group| group.addresses.iter().map(Addr::from))
                .collect(),
        };
        AddrVec(vec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_address() {
        let addr = Addr::parse("John Doe <john@example.com>");
        assert_eq!(addr.name.as_deref(), Some("John Doe"));
        assert_eq!(addr.address.as_deref(), Some("john@example.com"));
    }

    #[test]
    fn parses_quoted_name() {
        let addr = Addr::parse("\"Doe, John\" <john@example.com>");
        assert_eq!(addr.name.as_deref(), Some("Doe, John"));
        assert_eq!(addr.address.as_deref(), Some("john@example.com"));
    }

    #[test]
    fn parses_bare_address() {
        let addr = Addr::parse("jane@example.com");
        assert_eq!(addr.name, None);
        assert_eq!(addr.address.as_deref(), Some("jane@example.com"));
    }

    #[test]
    fn empty_input_yields_empty_addr() {
        let addr = Addr::parse("   ");
        assert_eq!(addr.name, None);
        assert_eq!(addr.address, None);
    }
}
