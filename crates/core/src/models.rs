use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubjectKind {
    Individual,
    Group,
    OrganizationDomain,
    AnyoneWithLink,
}

impl SubjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SubjectKind::Individual => "individual",
            SubjectKind::Group => "group",
            SubjectKind::OrganizationDomain => "organizationDomain",
            SubjectKind::AnyoneWithLink => "anyoneWithLink",
        }
    }

    /// Individuals and groups are addressed by email.
    pub fn uses_email(self) -> bool {
        matches!(self, SubjectKind::Individual | SubjectKind::Group)
    }
}

/// Listed from most to least privileged, but never compared as a lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AccessLevel {
    Owner,
    Organizer,
    FileOrganizer,
    Editor,
    Commenter,
    Viewer,
}

impl AccessLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AccessLevel::Owner => "owner",
            AccessLevel::Organizer => "organizer",
            AccessLevel::FileOrganizer => "fileOrganizer",
            AccessLevel::Editor => "editor",
            AccessLevel::Commenter => "commenter",
            AccessLevel::Viewer => "viewer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    pub id: String,
    pub subject_kind: SubjectKind,
    pub access_level: AccessLevel,
    pub subject_identity: Option<String>,
    pub display_name: Option<String>,
    pub expires_at: Option<String>,
    pub is_deleted_subject: bool,
}

impl AccessEntry {
    pub fn is_owner(&self) -> bool {
        self.access_level == AccessLevel::Owner
    }

    /// Case-insensitive match against the subject's email or domain.
    pub fn matches_subject(&self, identity: &str) -> bool {
        self.subject_identity
            .as_deref()
            .map(|own| own.eq_ignore_ascii_case(identity.trim()))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub is_container: bool,
    pub parent_id: Option<String>,
    /// Derived from the parent chain; empty until paths are resolved.
    #[serde(default)]
    pub path: String,
    pub is_shared: bool,
    pub access_entries: Vec<AccessEntry>,
    pub external_link: Option<String>,
    pub last_modified: Option<String>,
    pub size_bytes: Option<String>,
    pub owner_identity: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingSnapshot {
    pub owner_account_key: String,
    pub records: Vec<FileRecord>,
    pub record_count: usize,
    pub captured_at: DateTime<Utc>,
    pub is_complete: bool,
    /// Set when the safety ceiling cut the run short.
    pub truncated: bool,
}

impl MappingSnapshot {
    pub fn new(owner_account_key: impl Into<String>, records: Vec<FileRecord>, truncated: bool) -> Self {
        Self {
            owner_account_key: owner_account_key.into(),
            record_count: records.len(),
            records,
            captured_at: Utc::now(),
            is_complete: true,
            truncated,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.captured_at)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingProgress {
    pub current: usize,
    pub estimated_total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MappingState {
    #[default]
    Idle,
    Loading,
    Complete,
    Failed {
        message: String,
    },
}

impl MappingState {
    pub fn is_loading(&self) -> bool {
        matches!(self, MappingState::Loading)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            MappingState::Failed { message } => Some(message),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub records: Vec<FileRecord>,
    pub next_page_token: Option<String>,
}
