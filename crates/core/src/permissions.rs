use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::models::AccessEntry;
use crate::remote::PermissionApi;
use crate::validate::{self, Grant};

/// What a successful per-file operation changed, for the in-memory collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryChange {
    Added(AccessEntry),
    Removed { entry_id: String },
}

impl EntryChange {
    /// Applies the change to a copy of `entries`. Adding an id that is already
    /// present replaces that entry in place.
    pub fn apply_to(&self, entries: &[AccessEntry]) -> Vec<AccessEntry> {
        match self {
            EntryChange::Added(entry) => {
                let mut out = entries.to_vec();
                match out.iter_mut().find(|e| e.id == entry.id) {
                    Some(existing) => *existing = entry.clone(),
                    None => out.push(entry.clone()),
                }
                out
            }
            EntryChange::Removed { entry_id } => entries
                .iter()
                .filter(|e| &e.id != entry_id)
                .cloned()
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkFileResult {
    pub file_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    pub change: Option<EntryChange>,
}

impl BulkFileResult {
    fn ok(file_id: &str, change: EntryChange) -> Self {
        Self {
            file_id: file_id.to_string(),
            success: true,
            error: None,
            change: Some(change),
        }
    }

    fn failed(file_id: &str, error: impl Into<String>) -> Self {
        Self {
            file_id: file_id.to_string(),
            success: false,
            error: Some(error.into()),
            change: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    pub results: Vec<BulkFileResult>,
    pub summary: BulkSummary,
}

impl BulkOutcome {
    pub fn from_results(results: Vec<BulkFileResult>) -> Self {
        let success = results.iter().filter(|r| r.success).count();
        let summary = BulkSummary {
            total: results.len(),
            success,
            failed: results.len() - success,
        };
        Self { results, summary }
    }
}

#[derive(Debug, Clone)]
pub enum BulkAction {
    Add(Grant),
    Remove { subject_identity: String },
}

/// Validated single and bulk edits to access entries.
pub struct PermissionService<A> {
    api: A,
}

impl<A: PermissionApi> PermissionService<A> {
    pub fn new(api: A) -> Self {
        Self { api }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub async fn list_entries(&self, file_id: &str) -> Result<Vec<AccessEntry>> {
        let file_id = validate::file_id(file_id)?;
        self.api.list_entries(file_id).await
    }

    pub async fn create_entry(&self, file_id: &str, grant: &Grant) -> Result<AccessEntry> {
        let file_id = validate::file_id(file_id)?;
        let entry = self.api.create_entry(file_id, grant).await?;
        info!(
            file = file_id,
            entry = %entry.id,
            kind = grant.subject_kind().as_str(),
            level = grant.access_level().as_str(),
            "access entry created"
        );
        Ok(entry)
    }

    /// Removes one entry by id. Owner entries are never removed.
    pub async fn delete_entry(&self, file_id: &str, entry_id: &str) -> Result<()> {
        let file_id = validate::file_id(file_id)?;
        let entry_id = validate::entry_id(entry_id)?;

        let entries = self.api.list_entries(file_id).await?;
        let Some(entry) = entries.iter().find(|e| e.id == entry_id) else {
            return Err(Error::NotFound(format!("permission {entry_id} on {file_id}")));
        };
        if entry.is_owner() {
            return Err(Error::validation("The owner entry cannot be removed"));
        }

        self.api.delete_entry(file_id, entry_id).await?;
        info!(file = file_id, entry = entry_id, "access entry removed");
        Ok(())
    }

    pub async fn bulk(&self, file_ids: &[String], action: &BulkAction) -> Result<BulkOutcome> {
        match action {
            BulkAction::Add(grant) => self.bulk_add(file_ids, grant).await,
            BulkAction::Remove { subject_identity } => {
                self.bulk_remove(file_ids, subject_identity).await
            }
        }
    }

    /// Adds the same grant to every file. Input is checked before any remote call;
    /// after that each file succeeds or fails on its own.
    pub async fn bulk_add(&self, file_ids: &[String], grant: &Grant) -> Result<BulkOutcome> {
        validate::file_ids(file_ids)?;

        let mut results = Vec::with_capacity(file_ids.len());
        for file_id in file_ids {
            let result = match self.api.create_entry(file_id, grant).await {
                Ok(entry) => BulkFileResult::ok(file_id, EntryChange::Added(entry)),
                Err(err) => {
                    warn!(file = %file_id, error = %err, "bulk add failed for file");
                    BulkFileResult::failed(file_id, failure_message(&err, "Failed to add permission"))
                }
            };
            results.push(result);
        }

        let outcome = BulkOutcome::from_results(results);
        info!(
            total = outcome.summary.total,
            success = outcome.summary.success,
            failed = outcome.summary.failed,
            "bulk add finished"
        );
        Ok(outcome)
    }

    /// Removes the entry whose subject matches `subject_identity` (ignoring case)
    /// from every file.
    pub async fn bulk_remove(&self, file_ids: &[String], subject_identity: &str) -> Result<BulkOutcome> {
        validate::file_ids(file_ids)?;
        if validate::sanitize(subject_identity).is_empty() {
            return Err(Error::validation("Email address is required for remove action"));
        }
        let email = validate::email(subject_identity)?;

        let mut results = Vec::with_capacity(file_ids.len());
        for file_id in file_ids {
            let result = self.remove_one(file_id, email).await;
            if let Some(err) = &result.error {
                warn!(file = %file_id, error = %err, "bulk remove failed for file");
            }
            results.push(result);
        }

        let outcome = BulkOutcome::from_results(results);
        info!(
            total = outcome.summary.total,
            success = outcome.summary.success,
            failed = outcome.summary.failed,
            "bulk remove finished"
        );
        Ok(outcome)
    }

    async fn remove_one(&self, file_id: &str, email: &str) -> BulkFileResult {
        let entries = match self.api.list_entries(file_id).await {
            Ok(entries) => entries,
            Err(err) => {
                return BulkFileResult::failed(
                    file_id,
                    failure_message(&err, "Failed to fetch permissions"),
                )
            }
        };

        let Some(entry) = entries.iter().find(|e| e.matches_subject(email)) else {
            return BulkFileResult::failed(file_id, "Permission not found");
        };
        if entry.is_owner() {
            return BulkFileResult::failed(file_id, "The owner entry cannot be removed");
        }

        match self.api.delete_entry(file_id, &entry.id).await {
            Ok(()) => BulkFileResult::ok(
                file_id,
                EntryChange::Removed {
                    entry_id: entry.id.clone(),
                },
            ),
            Err(err) => {
                BulkFileResult::failed(file_id, failure_message(&err, "Failed to delete permission"))
            }
        }
    }
}

fn failure_message(err: &Error, fallback: &str) -> String {
    match err {
        Error::Remote { message, .. } if !message.is_empty() => message.clone(),
        Error::Unauthorized => "Unauthorized".to_string(),
        _ => fallback.to_string(),
    }
}
