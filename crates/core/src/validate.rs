use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};
use crate::models::{AccessLevel, SubjectKind};
use crate::remote::{access_level_from_wire, subject_kind_from_wire};

pub const MAX_INPUT_LEN: usize = 1000;
const MAX_EMAIL_LEN: usize = 254;
const MAX_DOMAIN_LEN: usize = 253;

static FILE_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]{10,100}$").unwrap());
static ENTRY_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]{5,100}$").unwrap());
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());
static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9-]{0,61}[a-zA-Z0-9]?\.([a-zA-Z]{2,}\.)*[a-zA-Z]{2,}$")
        .unwrap()
});

/// Trims and bounds free-text input.
pub fn sanitize(input: &str) -> &str {
    let trimmed = input.trim();
    match trimmed.char_indices().nth(MAX_INPUT_LEN) {
        Some((idx, _)) => &trimmed[..idx],
        None => trimmed,
    }
}

pub fn is_valid_file_id(id: &str) -> bool {
    FILE_ID_RE.is_match(id)
}

pub fn is_valid_entry_id(id: &str) -> bool {
    ENTRY_ID_RE.is_match(id)
}

pub fn is_valid_email(email: &str) -> bool {
    email.len() <= MAX_EMAIL_LEN && EMAIL_RE.is_match(email)
}

pub fn is_valid_domain(domain: &str) -> bool {
    domain.len() <= MAX_DOMAIN_LEN && DOMAIN_RE.is_match(domain)
}

pub fn file_id(id: &str) -> Result<&str> {
    if is_valid_file_id(id) {
        Ok(id)
    } else {
        Err(Error::validation(format!("Invalid file ID: {id}")))
    }
}

pub fn entry_id(id: &str) -> Result<&str> {
    if is_valid_entry_id(id) {
        Ok(id)
    } else {
        Err(Error::validation("Invalid permission ID"))
    }
}

pub fn email(email: &str) -> Result<&str> {
    let email = sanitize(email);
    if email.is_empty() {
        return Err(Error::validation("Email address is required"));
    }
    if is_valid_email(email) {
        Ok(email)
    } else {
        Err(Error::validation("Invalid email address"))
    }
}

pub fn file_ids<S: AsRef<str>>(ids: &[S]) -> Result<()> {
    if ids.is_empty() {
        return Err(Error::validation("File IDs are required"));
    }
    for id in ids {
        file_id(id.as_ref())?;
    }
    Ok(())
}

impl FromStr for SubjectKind {
    type Err = Error;

    /// Accepts both the local names and the remote API's names.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "individual" => Ok(SubjectKind::Individual),
            "organizationDomain" => Ok(SubjectKind::OrganizationDomain),
            "anyoneWithLink" => Ok(SubjectKind::AnyoneWithLink),
            other => subject_kind_from_wire(other)
                .ok_or_else(|| Error::validation("Invalid permission type")),
        }
    }
}

impl FromStr for AccessLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "editor" => Ok(AccessLevel::Editor),
            "viewer" => Ok(AccessLevel::Viewer),
            other => {
                access_level_from_wire(other).ok_or_else(|| Error::validation("Invalid role"))
            }
        }
    }
}

/// A validated request to add one access entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    subject_kind: SubjectKind,
    access_level: AccessLevel,
    subject_identity: Option<String>,
}

impl Grant {
    pub fn new(
        subject_kind: SubjectKind,
        access_level: AccessLevel,
        identity: Option<&str>,
    ) -> Result<Self> {
        let identity = identity.map(sanitize).filter(|s| !s.is_empty());
        let subject_identity = match subject_kind {
            SubjectKind::Individual | SubjectKind::Group => {
                let Some(addr) = identity else {
                    return Err(Error::validation(
                        "Email address is required for user/group permissions",
                    ));
                };
                Some(email(addr)?.to_string())
            }
            SubjectKind::OrganizationDomain => {
                let Some(domain) = identity else {
                    return Err(Error::validation("Domain is required for domain permissions"));
                };
                if !is_valid_domain(domain) {
                    return Err(Error::validation("Invalid domain"));
                }
                Some(domain.to_string())
            }
            SubjectKind::AnyoneWithLink => None,
        };
        Ok(Self {
            subject_kind,
            access_level,
            subject_identity,
        })
    }

    /// Builds a grant from loosely typed request fields.
    pub fn parse(
        kind: Option<&str>,
        role: Option<&str>,
        email: Option<&str>,
        domain: Option<&str>,
    ) -> Result<Self> {
        let (Some(kind), Some(role)) = (
            kind.map(str::trim).filter(|s| !s.is_empty()),
            role.map(str::trim).filter(|s| !s.is_empty()),
        ) else {
            return Err(Error::validation("Type and role are required"));
        };
        let subject_kind: SubjectKind = kind.parse()?;
        let access_level: AccessLevel = role.parse()?;
        let identity = if subject_kind.uses_email() {
            email
        } else {
            domain
        };
        Self::new(subject_kind, access_level, identity)
    }

    pub fn subject_kind(&self) -> SubjectKind {
        self.subject_kind
    }

    pub fn access_level(&self) -> AccessLevel {
        self.access_level
    }

    pub fn subject_identity(&self) -> Option<&str> {
        self.subject_identity.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_id_format() {
        assert!(is_valid_file_id("1a2B3c4D5e_-xyz"));
        assert!(!is_valid_file_id("short"));
        assert!(!is_valid_file_id("has spaces in it"));
        assert!(!is_valid_file_id("../../etc/passwd"));
        assert!(!is_valid_file_id(&"a".repeat(101)));
    }

    #[test]
    fn entry_ids() {
        assert!(is_valid_entry_id("anyoneWithLink"));
        assert!(is_valid_entry_id("12345"));
        assert!(!is_valid_entry_id("1234"));
    }

    #[test]
    fn emails() {
        assert!(is_valid_email("bob@example.com"));
        assert!(!is_valid_email("bob@example"));
        assert!(!is_valid_email("bob example@x.com"));
        assert!(!is_valid_email(&format!("{}@example.com", "a".repeat(250))));
    }

    #[test]
    fn domains() {
        assert!(is_valid_domain("example.com"));
        assert!(is_valid_domain("corp.example.co.uk"));
        assert!(!is_valid_domain("example"));
        assert!(!is_valid_domain("-bad.com"));
    }

    #[test]
    fn sanitize_trims_and_bounds() {
        assert_eq!(sanitize("  hi  "), "hi");
        assert_eq!(sanitize(&"x".repeat(2000)).len(), MAX_INPUT_LEN);
    }

    #[test]
    fn parses_local_and_wire_names() {
        assert_eq!("user".parse::<SubjectKind>().unwrap(), SubjectKind::Individual);
        assert_eq!("individual".parse::<SubjectKind>().unwrap(), SubjectKind::Individual);
        assert_eq!("writer".parse::<AccessLevel>().unwrap(), AccessLevel::Editor);
        assert_eq!("viewer".parse::<AccessLevel>().unwrap(), AccessLevel::Viewer);
        assert!("superuser".parse::<AccessLevel>().is_err());
        assert!("robot".parse::<SubjectKind>().is_err());
    }

    #[test]
    fn grant_requires_matching_identity() {
        let err = Grant::parse(Some("user"), Some("reader"), None, Some("example.com")).unwrap_err();
        assert_eq!(err.to_string(), "Email address is required for user/group permissions");

        let err = Grant::parse(Some("domain"), Some("reader"), None, None).unwrap_err();
        assert_eq!(err.to_string(), "Domain is required for domain permissions");

        let err = Grant::parse(Some("group"), Some("reader"), Some("not-an-email"), None).unwrap_err();
        assert_eq!(err.to_string(), "Invalid email address");

        let err = Grant::parse(None, Some("reader"), None, None).unwrap_err();
        assert_eq!(err.to_string(), "Type and role are required");

        let grant = Grant::parse(Some("anyone"), Some("reader"), Some("ignored@x.com"), None).unwrap();
        assert_eq!(grant.subject_identity(), None);

        let grant = Grant::parse(Some("user"), Some("commenter"), Some("  Bob@Example.com "), None).unwrap();
        assert_eq!(grant.subject_identity(), Some("Bob@Example.com"));
        assert_eq!(grant.access_level(), AccessLevel::Commenter);
    }

    #[test]
    fn batch_file_ids_reject_any_bad_id() {
        assert!(super::file_ids(&["aaaaaaaaaaaa", "bbbbbbbbbbbb"]).is_ok());
        let err = super::file_ids(&["aaaaaaaaaaaa", "bad id"]).unwrap_err();
        assert_eq!(err.to_string(), "Invalid file ID: bad id");
        assert!(super::file_ids::<&str>(&[]).is_err());
    }
}
