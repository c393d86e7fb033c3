use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::JidError;

/// A protocol address: `local@domain/resource`, where only the domain is
/// mandatory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    local: String,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn parse(s: &str) -> Result<Self, JidError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(JidError::Empty);
        }

        let (without_resource, resource) = match s.split_once('/') {
            Some((head, res)) => {
                if res.is_empty() {
                    return Err(JidError::EmptyPart(s.to_string()));
                }
                (head, Some(res.to_string()))
            }
            None => (s, None),
        };

        let (local, domain) = match without_resource.split_once('@') {
            Some((local, domain)) => {
                if local.is_empty() {
                    return Err(JidError::EmptyPart(s.to_string()));
                }
                (local.to_string(), domain.to_string())
            }
            None => (String::new(), without_resource.to_string()),
        };

        if domain.is_empty() {
            return Err(JidError::MissingDomain(s.to_string()));
        }

        Ok(Self {
            local,
            domain,
            resource,
        })
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// The address without its resource part.
    pub fn bare(&self) -> Jid {
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn with_resource(&self, resource: impl Into<String>) -> Jid {
        let resource = resource.into();
        Jid {
            local: self.local.clone(),
            domain: self.domain.clone(),
            resource: if resource.is_empty() {
                None
            } else {
                Some(resource)
            },
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.local.is_empty() {
            write!(f, "{}@", self.local)?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(ref resource) = self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Jid {
    type Error = JidError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_address() {
        let jid = Jid::parse("romeo@example.net/orchard").unwrap();
        assert_eq!(jid.local(), "romeo");
        assert_eq!(jid.domain(), "example.net");
        assert_eq!(jid.resource(), Some("orchard"));
        assert_eq!(jid.bare().to_string(), "romeo@example.net");
        assert_eq!(jid.to_string(), "romeo@example.net/orchard");
    }

    #[test]
    fn test_resource_may_contain_slashes() {
        let jid = Jid::parse("a@b.org/phone/2").unwrap();
        assert_eq!(jid.resource(), Some("phone/2"));
    }

    #[test]
    fn test_server_address() {
        let jid = Jid::parse("proxy.example.net").unwrap();
        assert_eq!(jid.local(), "");
        assert!(jid.is_bare());
        assert_eq!(jid.to_string(), "proxy.example.net");
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(Jid::parse(""), Err(JidError::Empty));
        assert!(matches!(Jid::parse("me@"), Err(JidError::MissingDomain(_))));
        assert!(matches!(Jid::parse("@x.org"), Err(JidError::EmptyPart(_))));
        assert!(matches!(Jid::parse("me@x.org/"), Err(JidError::EmptyPart(_))));
    }

    #[test]
    fn test_with_resource() {
        let jid = Jid::parse("some@one.org").unwrap().with_resource("foo");
        assert_eq!(jid.to_string(), "some@one.org/foo");
        assert!(Jid::parse("some@one.org").unwrap().with_resource("").is_bare());
    }
}
