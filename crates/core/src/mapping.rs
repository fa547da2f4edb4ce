//! Mapping runs: paginate the remote listing into a complete snapshot.
//!
//! A session starts from the stored snapshot when one is complete and fresh.
//! Otherwise the stored snapshot is dropped, pages are pulled until the listing
//! runs out or the safety ceiling is reached, paths are resolved over the whole
//! set, and the result is written back as the new snapshot.
//!
//! Permission edits made afterwards only touch the in-memory collection. The
//! stored snapshot is rewritten by the next full run, not per edit.

use tracing::{debug, info, warn};

use crate::config::MapperConfig;
use crate::error::{Error, Result};
use crate::models::{AccessEntry, FileRecord, MappingProgress, MappingSnapshot, MappingState};
use crate::paths::resolve_paths;
use crate::remote::ListingSource;
use crate::store::{snapshot_is_stale, SnapshotStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingOutcome {
    /// Served from the stored snapshot; no remote calls were made.
    Cached,
    /// A full run finished and was persisted.
    Mapped { truncated: bool },
}

pub struct Mapper<L, S> {
    source: L,
    store: S,
    config: MapperConfig,
    state: MappingState,
    records: Vec<FileRecord>,
    progress: MappingProgress,
    truncated: bool,
}

impl<L, S> Mapper<L, S>
where
    L: ListingSource,
    S: SnapshotStore,
{
    pub fn new(source: L, store: S, config: MapperConfig) -> Self {
        Self {
            source,
            store,
            config,
            state: MappingState::Idle,
            records: Vec::new(),
            progress: MappingProgress::default(),
            truncated: false,
        }
    }

    pub fn state(&self) -> &MappingState {
        &self.state
    }

    pub fn records(&self) -> &[FileRecord] {
        &self.records
    }

    pub fn record(&self, file_id: &str) -> Option<&FileRecord> {
        self.records.iter().find(|r| r.id == file_id)
    }

    pub fn progress(&self) -> MappingProgress {
        self.progress
    }

    /// True when the last run stopped at the safety ceiling.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub async fn start_mapping(&mut self, account_key: &str) -> Result<MappingOutcome> {
        self.start_mapping_with_progress(account_key, |_| {}).await
    }

    pub async fn start_mapping_with_progress<F>(
        &mut self,
        account_key: &str,
        on_progress: F,
    ) -> Result<MappingOutcome>
    where
        F: FnMut(&MappingProgress),
    {
        if self.load_cached(account_key) {
            return Ok(MappingOutcome::Cached);
        }
        self.run(account_key, on_progress).await
    }

    pub async fn remap(&mut self, account_key: &str) -> Result<MappingOutcome> {
        self.remap_with_progress(account_key, |_| {}).await
    }

    /// Runs a full mapping regardless of what the store holds.
    pub async fn remap_with_progress<F>(
        &mut self,
        account_key: &str,
        on_progress: F,
    ) -> Result<MappingOutcome>
    where
        F: FnMut(&MappingProgress),
    {
        self.run(account_key, on_progress).await
    }

    /// Replaces the access entries of one in-memory record.
    ///
    /// Returns false, leaving everything untouched, when the id is unknown.
    pub fn apply_permission_mutation(&mut self, file_id: &str, entries: Vec<AccessEntry>) -> bool {
        match self.records.iter_mut().find(|r| r.id == file_id) {
            Some(record) => {
                record.access_entries = entries;
                true
            }
            None => false,
        }
    }

    fn load_cached(&mut self, account_key: &str) -> bool {
        let snapshot = match self.store.load(account_key) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return false,
            Err(err) => {
                warn!(account = account_key, error = %err, "could not read stored snapshot");
                return false;
            }
        };

        if !snapshot.is_complete {
            debug!(account = account_key, "stored snapshot is incomplete");
            return false;
        }
        if snapshot_is_stale(&snapshot, self.config.max_age) {
            debug!(account = account_key, captured_at = %snapshot.captured_at, "stored snapshot is stale");
            return false;
        }

        info!(
            account = account_key,
            records = snapshot.records.len(),
            "loaded mapping from stored snapshot"
        );
        let count = snapshot.records.len();
        self.records = snapshot.records;
        self.truncated = snapshot.truncated;
        self.progress = MappingProgress {
            current: count,
            estimated_total: count,
        };
        self.state = MappingState::Complete;
        true
    }

    async fn run<F>(&mut self, account_key: &str, mut on_progress: F) -> Result<MappingOutcome>
    where
        F: FnMut(&MappingProgress),
    {
        self.state = MappingState::Loading;
        self.records.clear();
        self.truncated = false;
        self.progress = MappingProgress::default();
        on_progress(&self.progress);
        info!(account = account_key, "starting mapping run");

        match self.paginate(account_key, &mut on_progress).await {
            Ok(outcome) => {
                self.state = MappingState::Complete;
                Ok(outcome)
            }
            Err(err) => {
                warn!(
                    account = account_key,
                    records = self.records.len(),
                    error = %err,
                    "mapping run failed"
                );
                self.state = MappingState::Failed {
                    message: err.to_string(),
                };
                Err(err)
            }
        }
    }

    async fn paginate<F>(&mut self, account_key: &str, on_progress: &mut F) -> Result<MappingOutcome>
    where
        F: FnMut(&MappingProgress),
    {
        self.store.clear(account_key)?;

        let ceiling = self.config.max_records;
        let mut page_token: Option<String> = None;
        loop {
            let fetch = self.source.fetch_page(page_token.as_deref(), true);
            let page = tokio::time::timeout(self.config.page_timeout, fetch)
                .await
                .map_err(|_| Error::Timeout(self.config.page_timeout))??;

            self.records.extend(page.records);
            page_token = page.next_page_token;

            if self.records.len() >= ceiling {
                self.truncated = page_token.is_some() || self.records.len() > ceiling;
                self.records.truncate(ceiling);
            }
            let has_more = page_token.is_some() && self.records.len() < ceiling;

            self.progress = MappingProgress {
                current: self.records.len(),
                estimated_total: self.records.len()
                    + if has_more {
                        self.config.batch_size as usize
                    } else {
                        0
                    },
            };
            debug!(
                current = self.progress.current,
                has_more, "mapping page accumulated"
            );
            on_progress(&self.progress);

            if !has_more {
                break;
            }
        }

        if self.truncated {
            warn!(
                account = account_key,
                ceiling, "mapping stopped at the safety ceiling"
            );
        }

        self.records = resolve_paths(std::mem::take(&mut self.records));
        let snapshot = MappingSnapshot::new(account_key, self.records.clone(), self.truncated);
        self.store.save(&snapshot)?;

        info!(
            account = account_key,
            records = snapshot.record_count,
            truncated = snapshot.truncated,
            "mapping run complete"
        );
        Ok(MappingOutcome::Mapped {
            truncated: self.truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccessLevel, ListingPage, SubjectKind};
    use crate::store::MemorySnapshotStore;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    enum Step {
        Page(ListingPage),
        Fail(u16, &'static str),
        Hang,
    }

    #[derive(Default)]
    struct ScriptedSource {
        steps: Mutex<VecDeque<Step>>,
        calls: AtomicUsize,
        tokens_seen: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedSource {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ListingSource for ScriptedSource {
        async fn fetch_page(
            &self,
            page_token: Option<&str>,
            _include_access_entries: bool,
        ) -> Result<ListingPage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tokens_seen
                .lock()
                .unwrap()
                .push(page_token.map(str::to_string));
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Step::Page(page)) => Ok(page),
                Some(Step::Fail(status, message)) => Err(Error::Remote {
                    status,
                    message: message.to_string(),
                }),
                Some(Step::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(ListingPage::default())
                }
                None => panic!("listing called more times than scripted"),
            }
        }
    }

    fn rec(id: &str, parent: Option<&str>) -> FileRecord {
        FileRecord {
            id: id.to_string(),
            name: id.to_uppercase(),
            mime_type: "text/plain".to_string(),
            is_container: false,
            parent_id: parent.map(str::to_string),
            path: String::new(),
            is_shared: false,
            access_entries: Vec::new(),
            external_link: None,
            last_modified: None,
            size_bytes: None,
            owner_identity: None,
        }
    }

    fn page(prefix: &str, size: usize, next: Option<&str>) -> Step {
        Step::Page(ListingPage {
            records: (0..size).map(|i| rec(&format!("{prefix}{i}"), None)).collect(),
            next_page_token: next.map(str::to_string),
        })
    }

    fn config(max_records: usize) -> MapperConfig {
        MapperConfig {
            batch_size: 3,
            max_records,
            ..MapperConfig::default()
        }
    }

    fn ids(records: &[FileRecord]) -> Vec<&str> {
        records.iter().map(|r| r.id.as_str()).collect()
    }

    const ACCOUNT: &str = "me@example.com";

    #[tokio::test]
    async fn full_run_concatenates_pages_in_order() {
        let source = Arc::new(ScriptedSource::new(vec![
            page("a", 3, Some("t1")),
            page("b", 3, Some("t2")),
            page("c", 2, None),
        ]));
        let store = Arc::new(MemorySnapshotStore::new());
        let mut mapper = Mapper::new(source.clone(), store.clone(), config(1000));

        let mut seen = Vec::new();
        let outcome = mapper
            .start_mapping_with_progress(ACCOUNT, |p| seen.push(*p))
            .await
            .unwrap();

        assert_eq!(outcome, MappingOutcome::Mapped { truncated: false });
        assert_eq!(mapper.state(), &MappingState::Complete);
        assert_eq!(
            ids(mapper.records()),
            ["a0", "a1", "a2", "b0", "b1", "b2", "c0", "c1"]
        );
        assert_eq!(source.calls(), 3);
        assert_eq!(
            *source.tokens_seen.lock().unwrap(),
            vec![None, Some("t1".to_string()), Some("t2".to_string())]
        );

        let stored = store.load(ACCOUNT).unwrap().unwrap();
        assert!(stored.is_complete);
        assert!(!stored.truncated);
        assert_eq!(stored.record_count, 8);
        assert_eq!(stored.records, mapper.records());

        let last = seen.last().unwrap();
        assert_eq!(last.current, 8);
        assert_eq!(last.estimated_total, 8);
        assert_eq!(seen[1], MappingProgress { current: 3, estimated_total: 6 });
    }

    #[tokio::test]
    async fn paths_are_resolved_across_pages() {
        let source = ScriptedSource::new(vec![
            Step::Page(ListingPage {
                records: vec![rec("child", Some("parent"))],
                next_page_token: Some("t1".into()),
            }),
            Step::Page(ListingPage {
                records: vec![rec("parent", Some("elsewhere"))],
                next_page_token: None,
            }),
        ]);
        let mut mapper = Mapper::new(source, MemorySnapshotStore::new(), config(1000));
        mapper.start_mapping(ACCOUNT).await.unwrap();

        assert_eq!(mapper.record("child").unwrap().path, "PARENT/CHILD");
        assert_eq!(mapper.record("parent").unwrap().path, "PARENT");
    }

    #[tokio::test]
    async fn safety_ceiling_completes_with_truncation_flag() {
        let source = Arc::new(ScriptedSource::new(vec![
            page("a", 3, Some("t1")),
            page("b", 3, Some("t2")),
            page("c", 3, Some("t3")),
        ]));
        let store = Arc::new(MemorySnapshotStore::new());
        let mut mapper = Mapper::new(source.clone(), store.clone(), config(5));

        let outcome = mapper.start_mapping(ACCOUNT).await.unwrap();

        assert_eq!(outcome, MappingOutcome::Mapped { truncated: true });
        assert_eq!(mapper.state(), &MappingState::Complete);
        assert!(mapper.is_truncated());
        assert_eq!(mapper.records().len(), 5);
        assert_eq!(source.calls(), 2);

        let stored = store.load(ACCOUNT).unwrap().unwrap();
        assert!(stored.is_complete);
        assert!(stored.truncated);
        assert_eq!(stored.record_count, 5);
    }

    #[tokio::test]
    async fn exact_fit_at_ceiling_with_no_more_pages_is_not_truncated() {
        let source = ScriptedSource::new(vec![page("a", 3, Some("t1")), page("b", 3, None)]);
        let mut mapper = Mapper::new(source, MemorySnapshotStore::new(), config(6));
        let outcome = mapper.start_mapping(ACCOUNT).await.unwrap();
        assert_eq!(outcome, MappingOutcome::Mapped { truncated: false });
        assert_eq!(mapper.records().len(), 6);
    }

    #[tokio::test]
    async fn fresh_snapshot_skips_the_network() {
        let store = Arc::new(MemorySnapshotStore::new());
        let mut stored = vec![rec("x", None), rec("y", Some("x"))];
        stored[0].path = "X".into();
        stored[1].path = "X/Y".into();
        store
            .save(&MappingSnapshot::new(ACCOUNT, stored.clone(), false))
            .unwrap();

        let source = Arc::new(ScriptedSource::new(vec![]));
        let mut mapper = Mapper::new(source.clone(), store.clone(), config(1000));
        let outcome = mapper.start_mapping(ACCOUNT).await.unwrap();

        assert_eq!(outcome, MappingOutcome::Cached);
        assert_eq!(source.calls(), 0);
        assert_eq!(mapper.records(), stored.as_slice());
        assert_eq!(mapper.state(), &MappingState::Complete);
        assert_eq!(mapper.progress(), MappingProgress { current: 2, estimated_total: 2 });
    }

    #[tokio::test]
    async fn stale_or_incomplete_snapshot_triggers_a_run() {
        let store = Arc::new(MemorySnapshotStore::new());
        let mut old = MappingSnapshot::new(ACCOUNT, vec![rec("old", None)], false);
        old.captured_at = chrono::Utc::now() - chrono::Duration::days(2);
        store.save(&old).unwrap();

        let source = Arc::new(ScriptedSource::new(vec![page("n", 1, None)]));
        let mut mapper = Mapper::new(source.clone(), store.clone(), config(1000));
        assert!(matches!(
            mapper.start_mapping(ACCOUNT).await.unwrap(),
            MappingOutcome::Mapped { .. }
        ));
        assert_eq!(ids(mapper.records()), ["n0"]);

        let mut partial = MappingSnapshot::new(ACCOUNT, vec![rec("p", None)], false);
        partial.is_complete = false;
        store.save(&partial).unwrap();
        let source = Arc::new(ScriptedSource::new(vec![page("m", 1, None)]));
        let mut mapper = Mapper::new(source.clone(), store.clone(), config(1000));
        mapper.start_mapping(ACCOUNT).await.unwrap();
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn remap_ignores_fresh_snapshot() {
        let store = Arc::new(MemorySnapshotStore::new());
        store
            .save(&MappingSnapshot::new(ACCOUNT, vec![rec("cached", None)], false))
            .unwrap();
        let source = Arc::new(ScriptedSource::new(vec![page("r", 2, None)]));
        let mut mapper = Mapper::new(source.clone(), store.clone(), config(1000));

        mapper.remap(ACCOUNT).await.unwrap();

        assert_eq!(source.calls(), 1);
        assert_eq!(ids(mapper.records()), ["r0", "r1"]);
        assert_eq!(ids(&store.load(ACCOUNT).unwrap().unwrap().records), ["r0", "r1"]);
    }

    #[tokio::test]
    async fn failure_mid_run_keeps_partial_records_unpersisted() {
        let store = Arc::new(MemorySnapshotStore::new());
        store
            .save(&MappingSnapshot::new(ACCOUNT, vec![rec("previous", None)], false))
            .unwrap();
        let source = Arc::new(ScriptedSource::new(vec![
            page("a", 100, Some("t1")),
            Step::Fail(500, "Backend Error"),
        ]));
        let mut mapper = Mapper::new(
            source.clone(),
            store.clone(),
            MapperConfig {
                batch_size: 100,
                ..MapperConfig::default()
            },
        );

        let err = mapper.remap(ACCOUNT).await.unwrap_err();

        assert_eq!(err.to_string(), "Backend Error");
        assert_eq!(
            mapper.state(),
            &MappingState::Failed {
                message: "Backend Error".to_string()
            }
        );
        assert_eq!(mapper.records().len(), 100);
        assert_eq!(mapper.progress(), MappingProgress { current: 100, estimated_total: 200 });
        assert!(store.load(ACCOUNT).unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_after_failure_recovers() {
        let source = Arc::new(ScriptedSource::new(vec![
            Step::Fail(403, "Rate limit exceeded"),
            page("a", 2, None),
        ]));
        let mut mapper = Mapper::new(source.clone(), MemorySnapshotStore::new(), config(1000));

        assert!(mapper.start_mapping(ACCOUNT).await.is_err());
        assert_eq!(mapper.state().error(), Some("Rate limit exceeded"));

        mapper.remap(ACCOUNT).await.unwrap();
        assert_eq!(mapper.state(), &MappingState::Complete);
        assert_eq!(mapper.records().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_page_times_out() {
        let source = ScriptedSource::new(vec![page("a", 3, Some("t1")), Step::Hang]);
        let mut mapper = Mapper::new(
            source,
            MemorySnapshotStore::new(),
            MapperConfig {
                page_timeout: Duration::from_secs(5),
                ..config(1000)
            },
        );

        let err = mapper.start_mapping(ACCOUNT).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(mapper.state().error().is_some());
        assert_eq!(mapper.records().len(), 3);
    }

    #[tokio::test]
    async fn permission_mutation_touches_only_the_target() {
        let source = ScriptedSource::new(vec![page("f", 3, None)]);
        let mut mapper = Mapper::new(source, MemorySnapshotStore::new(), config(1000));
        mapper.start_mapping(ACCOUNT).await.unwrap();
        let before = mapper.records().to_vec();

        let entry = AccessEntry {
            id: "perm-new".into(),
            subject_kind: SubjectKind::Group,
            access_level: AccessLevel::Commenter,
            subject_identity: Some("team@example.com".into()),
            display_name: None,
            expires_at: None,
            is_deleted_subject: false,
        };
        assert!(mapper.apply_permission_mutation("f1", vec![entry.clone()]));

        let after = mapper.records();
        assert_eq!(after[0], before[0]);
        assert_eq!(after[2], before[2]);
        assert_eq!(after[1].access_entries, vec![entry]);
        assert_eq!(after[1].path, before[1].path);
    }

    #[tokio::test]
    async fn permission_mutation_on_unknown_id_is_a_noop() {
        let source = ScriptedSource::new(vec![page("f", 2, None)]);
        let store = Arc::new(MemorySnapshotStore::new());
        let mut mapper = Mapper::new(source, store.clone(), config(1000));
        mapper.start_mapping(ACCOUNT).await.unwrap();
        let before = mapper.records().to_vec();

        assert!(!mapper.apply_permission_mutation("missing", Vec::new()));
        assert_eq!(mapper.records(), before.as_slice());
    }

    #[tokio::test]
    async fn permission_mutation_does_not_touch_the_store() {
        let source = ScriptedSource::new(vec![page("f", 2, None)]);
        let store = Arc::new(MemorySnapshotStore::new());
        let mut mapper = Mapper::new(source, store.clone(), config(1000));
        mapper.start_mapping(ACCOUNT).await.unwrap();

        mapper.apply_permission_mutation("f0", Vec::new());
        let mut with_entry = mapper.records()[1].clone();
        with_entry.access_entries.push(AccessEntry {
            id: "anyoneWithLink".into(),
            subject_kind: SubjectKind::AnyoneWithLink,
            access_level: AccessLevel::Viewer,
            subject_identity: None,
            display_name: None,
            expires_at: None,
            is_deleted_subject: false,
        });
        mapper.apply_permission_mutation("f1", with_entry.access_entries.clone());

        let stored = store.load(ACCOUNT).unwrap().unwrap();
        assert!(stored.records[1].access_entries.is_empty());
        assert_eq!(mapper.records()[1].access_entries.len(), 1);
    }
}
