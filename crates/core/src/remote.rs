use std::future::Future;
use std::sync::Arc;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{MapperConfig, FOLDER_MIME_TYPE};
use crate::error::{Error, Result};
use crate::models::{AccessEntry, AccessLevel, FileRecord, ListingPage, SubjectKind};
use crate::validate::Grant;

const FILE_FIELDS: &str = "id,name,mimeType,parents,shared,webViewLink,iconLink,createdTime,modifiedTime,size,quotaBytesUsed,owners,capabilities";
const PERMISSION_FIELDS: &str =
    "id,type,role,emailAddress,displayName,photoLink,domain,deleted,expirationTime,pendingOwner";

/// One page of the remote file listing.
pub trait ListingSource: Send + Sync {
    fn fetch_page(
        &self,
        page_token: Option<&str>,
        include_access_entries: bool,
    ) -> impl Future<Output = Result<ListingPage>> + Send;
}

/// Single-entry permission calls against the remote store.
pub trait PermissionApi: Send + Sync {
    fn list_entries(&self, file_id: &str) -> impl Future<Output = Result<Vec<AccessEntry>>> + Send;

    fn create_entry(
        &self,
        file_id: &str,
        grant: &Grant,
    ) -> impl Future<Output = Result<AccessEntry>> + Send;

    fn delete_entry(&self, file_id: &str, entry_id: &str)
        -> impl Future<Output = Result<()>> + Send;
}

impl<T: ListingSource + ?Sized> ListingSource for Arc<T> {
    async fn fetch_page(
        &self,
        page_token: Option<&str>,
        include_access_entries: bool,
    ) -> Result<ListingPage> {
        (**self).fetch_page(page_token, include_access_entries).await
    }
}

impl<T: PermissionApi + ?Sized> PermissionApi for Arc<T> {
    async fn list_entries(&self, file_id: &str) -> Result<Vec<AccessEntry>> {
        (**self).list_entries(file_id).await
    }

    async fn create_entry(&self, file_id: &str, grant: &Grant) -> Result<AccessEntry> {
        (**self).create_entry(file_id, grant).await
    }

    async fn delete_entry(&self, file_id: &str, entry_id: &str) -> Result<()> {
        (**self).delete_entry(file_id, entry_id).await
    }
}

/// Bearer credential handed over by the session layer.
#[derive(Clone)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            None
        } else {
            Some(Self(token))
        }
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AccessToken(..)")
    }
}

#[derive(Clone)]
pub struct DriveClient {
    client: Client,
    base: String,
    page_size: u32,
    token: Option<AccessToken>,
}

impl DriveClient {
    pub fn new(config: &MapperConfig, token: Option<AccessToken>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("sharescope/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base: config.api_base.trim_end_matches('/').to_string(),
            page_size: config.batch_size,
            token,
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        let token = self.token.as_ref().ok_or(Error::Unauthorized)?;
        Ok(builder.bearer_auth(&token.0))
    }

    fn files_url(&self) -> String {
        format!("{}/files", self.base)
    }

    fn permissions_url(&self, file_id: &str) -> String {
        format!("{}/files/{}/permissions", self.base, file_id)
    }
}

impl ListingSource for DriveClient {
    async fn fetch_page(
        &self,
        page_token: Option<&str>,
        include_access_entries: bool,
    ) -> Result<ListingPage> {
        let fields = if include_access_entries {
            format!("nextPageToken,files({FILE_FIELDS},permissions,permissionIds)")
        } else {
            format!("nextPageToken,files({FILE_FIELDS})")
        };
        let page_size = self.page_size.to_string();
        let mut query: Vec<(&str, &str)> = vec![
            ("pageSize", page_size.as_str()),
            ("fields", fields.as_str()),
            ("q", "trashed=false"),
            ("orderBy", "folder,name"),
            ("supportsAllDrives", "true"),
            ("includeItemsFromAllDrives", "true"),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }

        let request = self.authorized(self.client.get(self.files_url()).query(&query))?;
        let response = check(request.send().await?).await?;
        let raw: RawFileList = response.json().await?;
        debug!(
            files = raw.files.len(),
            has_more = raw.next_page_token.is_some(),
            "fetched listing page"
        );

        Ok(ListingPage {
            records: raw.files.into_iter().map(RawFile::into_record).collect(),
            next_page_token: raw.next_page_token.filter(|t| !t.is_empty()),
        })
    }
}

impl PermissionApi for DriveClient {
    async fn list_entries(&self, file_id: &str) -> Result<Vec<AccessEntry>> {
        let fields = format!("permissions({PERMISSION_FIELDS})");
        let request = self.authorized(
            self.client
                .get(self.permissions_url(file_id))
                .query(&[("fields", fields.as_str()), ("supportsAllDrives", "true")]),
        )?;
        let response = check(request.send().await?).await?;
        let raw: RawPermissionList = response.json().await?;
        Ok(raw
            .permissions
            .into_iter()
            .map(RawPermission::into_entry)
            .collect())
    }

    async fn create_entry(&self, file_id: &str, grant: &Grant) -> Result<AccessEntry> {
        let body = NewPermissionBody::from(grant);
        let request = self.authorized(
            self.client
                .post(self.permissions_url(file_id))
                .query(&[
                    ("sendNotificationEmail", "false"),
                    ("supportsAllDrives", "true"),
                    ("fields", PERMISSION_FIELDS),
                ])
                .json(&body),
        )?;
        let response = check(request.send().await?).await?;
        let raw: RawPermission = response.json().await?;
        Ok(raw.into_entry())
    }

    async fn delete_entry(&self, file_id: &str, entry_id: &str) -> Result<()> {
        let url = format!("{}/{}", self.permissions_url(file_id), entry_id);
        let request = self.authorized(
            self.client
                .delete(url)
                .query(&[("supportsAllDrives", "true")]),
        )?;
        check(request.send().await?).await?;
        Ok(())
    }
}

/// Maps a non-success response onto a typed error, keeping the remote message.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(Error::Unauthorized);
    }
    let body = response.text().await.unwrap_or_default();
    Err(remote_error(status, &body))
}

pub(crate) fn remote_error(status: StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<RawErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .and_then(|e| e.message)
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| match status.canonical_reason() {
            Some(reason) => format!("API request failed: {} {reason}", status.as_u16()),
            None => format!("API request failed: {}", status.as_u16()),
        });
    Error::Remote {
        status: status.as_u16(),
        message,
    }
}

#[derive(Debug, Deserialize)]
struct RawErrorBody {
    error: Option<RawErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct RawErrorDetail {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFileList {
    #[serde(default)]
    files: Vec<RawFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    owners: Vec<RawUser>,
    #[serde(default)]
    permissions: Vec<RawPermission>,
    #[serde(default)]
    shared: bool,
    web_view_link: Option<String>,
    modified_time: Option<String>,
    size: Option<String>,
    quota_bytes_used: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUser {
    email_address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPermissionList {
    #[serde(default)]
    permissions: Vec<RawPermission>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawPermission {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    role: String,
    email_address: Option<String>,
    display_name: Option<String>,
    domain: Option<String>,
    #[serde(default)]
    deleted: bool,
    expiration_time: Option<String>,
}

impl RawFile {
    pub(crate) fn into_record(self) -> FileRecord {
        FileRecord {
            is_container: self.mime_type == FOLDER_MIME_TYPE,
            parent_id: self.parents.into_iter().next(),
            path: String::new(),
            is_shared: self.shared,
            access_entries: self
                .permissions
                .into_iter()
                .map(RawPermission::into_entry)
                .collect(),
            external_link: self.web_view_link.filter(|link| is_https_link(link)),
            last_modified: self.modified_time,
            size_bytes: self.quota_bytes_used.or(self.size),
            owner_identity: self.owners.into_iter().find_map(|o| o.email_address),
            id: self.id,
            name: self.name,
            mime_type: self.mime_type,
        }
    }
}

/// Only absolute https links are kept for display.
fn is_https_link(link: &str) -> bool {
    link.get(..8)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https://"))
        && link.len() > 8
}

impl RawPermission {
    pub(crate) fn into_entry(self) -> AccessEntry {
        let subject_kind = subject_kind_from_wire(&self.kind).unwrap_or(SubjectKind::AnyoneWithLink);
        let subject_identity = match subject_kind {
            SubjectKind::Individual | SubjectKind::Group => self.email_address,
            SubjectKind::OrganizationDomain => self.domain,
            SubjectKind::AnyoneWithLink => None,
        };
        AccessEntry {
            id: self.id,
            subject_kind,
            access_level: access_level_from_wire(&self.role).unwrap_or(AccessLevel::Viewer),
            subject_identity,
            display_name: self.display_name,
            expires_at: self.expiration_time,
            is_deleted_subject: self.deleted,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NewPermissionBody<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    role: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    email_address: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    domain: Option<&'a str>,
}

impl<'a> From<&'a Grant> for NewPermissionBody<'a> {
    fn from(grant: &'a Grant) -> Self {
        let identity = grant.subject_identity();
        Self {
            kind: subject_kind_to_wire(grant.subject_kind()),
            role: access_level_to_wire(grant.access_level()),
            email_address: identity.filter(|_| grant.subject_kind().uses_email()),
            domain: identity.filter(|_| grant.subject_kind() == SubjectKind::OrganizationDomain),
        }
    }
}

pub fn subject_kind_from_wire(s: &str) -> Option<SubjectKind> {
    match s {
        "user" => Some(SubjectKind::Individual),
        "group" => Some(SubjectKind::Group),
        "domain" => Some(SubjectKind::OrganizationDomain),
        "anyone" => Some(SubjectKind::AnyoneWithLink),
        _ => None,
    }
}

pub fn subject_kind_to_wire(kind: SubjectKind) -> &'static str {
    match kind {
        SubjectKind::Individual => "user",
        SubjectKind::Group => "group",
        SubjectKind::OrganizationDomain => "domain",
        SubjectKind::AnyoneWithLink => "anyone",
    }
}

pub fn access_level_from_wire(s: &str) -> Option<AccessLevel> {
    match s {
        "owner" => Some(AccessLevel::Owner),
        "organizer" => Some(AccessLevel::Organizer),
        "fileOrganizer" => Some(AccessLevel::FileOrganizer),
        "writer" => Some(AccessLevel::Editor),
        "commenter" => Some(AccessLevel::Commenter),
        "reader" => Some(AccessLevel::Viewer),
        _ => None,
    }
}

pub fn access_level_to_wire(level: AccessLevel) -> &'static str {
    match level {
        AccessLevel::Owner => "owner",
        AccessLevel::Organizer => "organizer",
        AccessLevel::FileOrganizer => "fileOrganizer",
        AccessLevel::Editor => "writer",
        AccessLevel::Commenter => "commenter",
        AccessLevel::Viewer => "reader",
    }
}
