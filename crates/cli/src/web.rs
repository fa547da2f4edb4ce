use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sharescope_core::config::ConfigStatus;
use sharescope_core::db::SqliteSnapshotStore;
use sharescope_core::mapping::{Mapper, MappingOutcome};
use sharescope_core::models::{AccessEntry, FileRecord, MappingProgress, MappingState};
use sharescope_core::permissions::{BulkAction, BulkOutcome, EntryChange, PermissionService};
use sharescope_core::remote::DriveClient;
use sharescope_core::validate::Grant;
use sharescope_core::{Error, Result};
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::settings::Settings;

type DriveMapper = Mapper<DriveClient, SqliteSnapshotStore>;

pub fn run_web_server(settings: Settings) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(Error::Io)?;
    runtime.block_on(run_web_server_async(settings))
}

async fn run_web_server_async(settings: Settings) -> Result<()> {
    let client = DriveClient::new(&settings.mapper, settings.token.clone())?;
    let store = SqliteSnapshotStore::open(&settings.db_path)?;
    let state = Arc::new(AppState::new(
        settings.account.clone(),
        settings.status(),
        Mapper::new(client.clone(), store, settings.mapper.clone()),
        PermissionService::new(client),
    ));

    if state.config_status.configured() {
        spawn_mapping(state.clone(), false);
    } else {
        warn!("no access token or account configured; mapping is disabled until restart");
    }

    let app = Router::new()
        .route("/", get(ui_index))
        .route("/events", get(sse_events))
        .route("/api/config/status", get(config_status_handler))
        .route("/api/session", get(session_handler))
        .route("/api/files", get(list_files_handler))
        .route("/api/remap", post(remap_handler))
        .route(
            "/api/files/:id/permissions",
            get(list_permissions_handler).post(create_permission_handler),
        )
        .route(
            "/api/files/:id/permissions/:entry_id",
            delete(delete_permission_handler),
        )
        .route("/api/permissions/bulk", post(bulk_handler))
        .with_state(state);

    let addr = ([127, 0, 0, 1], settings.port).into();
    info!("sharescope dashboard listening on http://127.0.0.1:{}/", settings.port);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|err| Error::InvalidArgument(format!("server error: {err}")))?;

    Ok(())
}

struct AppState {
    account: Option<String>,
    config_status: ConfigStatus,
    mapper: Mutex<DriveMapper>,
    permissions: PermissionService<DriveClient>,
    session: std::sync::Mutex<SessionStatus>,
    events_tx: broadcast::Sender<ServerEvent>,
}

/// Readable while a run holds the mapper lock.
#[derive(Clone, Default)]
struct SessionStatus {
    state: MappingState,
    progress: MappingProgress,
    record_count: usize,
    truncated: bool,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerEvent {
    MappingStarted,
    MappingProgress { progress: MappingProgress },
    MappingDone { record_count: usize, truncated: bool, cached: bool },
    MappingFailed { message: String },
    PermissionsUpdated { file_ids: Vec<String> },
}

#[derive(Serialize)]
struct SessionDto {
    account: Option<String>,
    state: &'static str,
    error: Option<String>,
    progress: MappingProgress,
    record_count: usize,
    truncated: bool,
    elapsed_secs: Option<u64>,
}

#[derive(Default, Deserialize)]
struct FilesQuery {
    q: Option<String>,
    shared: Option<bool>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Serialize)]
struct FilesResponse<'a> {
    total: usize,
    files: Vec<&'a FileRecord>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantBody {
    #[serde(rename = "type")]
    kind: Option<String>,
    role: Option<String>,
    email_address: Option<String>,
    domain: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkBody {
    action: Option<String>,
    #[serde(default)]
    file_ids: Vec<String>,
    #[serde(flatten)]
    grant: GrantBody,
}

async fn ui_index() -> Html<&'static str> {
    Html(UI_HTML)
}

async fn sse_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = state.events_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(event) => {
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(_) => return None,
            };
            Some(Ok(Event::default().data(payload)))
        }
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(10)))
}

async fn config_status_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let status = state.config_status;
    Json(json!({
        "configured": status.configured(),
        "missing": {
            "SHARESCOPE_ACCESS_TOKEN": !status.has_token,
            "SHARESCOPE_ACCOUNT": !status.has_account,
        }
    }))
}

async fn session_handler(State(state): State<Arc<AppState>>) -> Json<SessionDto> {
    let session = state.session_snapshot();
    Json(SessionDto {
        account: state.account.clone(),
        state: state_label(&session.state),
        error: session.state.error().map(str::to_string),
        progress: session.progress,
        record_count: session.record_count,
        truncated: session.truncated,
        elapsed_secs: session.started_at.map(|start| {
            session
                .finished_at
                .unwrap_or_else(Instant::now)
                .duration_since(start)
                .as_secs()
        }),
    })
}

async fn list_files_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FilesQuery>,
) -> Response {
    if state.is_mapping() {
        return busy();
    }
    let mapper = state.mapper.lock().await;

    let needle = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_lowercase);
    let matching: Vec<&FileRecord> = mapper
        .records()
        .iter()
        .filter(|r| query.shared.map_or(true, |shared| r.is_shared == shared))
        .filter(|r| {
            needle
                .as_deref()
                .map_or(true, |n| r.path.to_lowercase().contains(n))
        })
        .collect();

    let limit = query.limit.unwrap_or(500).clamp(1, 5000);
    let offset = query.offset.unwrap_or(0);
    let total = matching.len();
    let files = matching.into_iter().skip(offset).take(limit).collect();
    Json(FilesResponse { total, files }).into_response()
}

async fn remap_handler(State(state): State<Arc<AppState>>) -> Response {
    if let Err(resp) = state.authorize() {
        return resp;
    }
    if !spawn_mapping(state, true) {
        return busy();
    }
    (StatusCode::ACCEPTED, Json(json!({ "started": true }))).into_response()
}

async fn list_permissions_handler(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
) -> Response {
    if let Err(resp) = state.authorize() {
        return resp;
    }
    match state.permissions.list_entries(&file_id).await {
        Ok(entries) => {
            state.apply_entries(&file_id, entries.clone()).await;
            Json(json!({ "permissions": entries })).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn create_permission_handler(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<String>,
    Json(body): Json<GrantBody>,
) -> Response {
    if let Err(resp) = state.authorize() {
        return resp;
    }
    let grant = match body.to_grant() {
        Ok(grant) => grant,
        Err(err) => return error_response(err),
    };
    match state.permissions.create_entry(&file_id, &grant).await {
        Ok(entry) => {
            state
                .apply_change(&file_id, &EntryChange::Added(entry.clone()))
                .await;
            state.notify_updated(vec![file_id]);
            Json(json!({ "permission": entry })).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn delete_permission_handler(
    State(state): State<Arc<AppState>>,
    Path((file_id, entry_id)): Path<(String, String)>,
) -> Response {
    if let Err(resp) = state.authorize() {
        return resp;
    }
    match state.permissions.delete_entry(&file_id, &entry_id).await {
        Ok(()) => {
            state
                .apply_change(&file_id, &EntryChange::Removed { entry_id })
                .await;
            state.notify_updated(vec![file_id]);
            Json(json!({ "success": true })).into_response()
        }
        Err(err) => error_response(err),
    }
}

async fn bulk_handler(State(state): State<Arc<AppState>>, Json(body): Json<BulkBody>) -> Response {
    if let Err(resp) = state.authorize() {
        return resp;
    }
    let action = match body.to_action() {
        Ok(action) => action,
        Err(err) => return error_response(err),
    };
    match state.permissions.bulk(&body.file_ids, &action).await {
        Ok(outcome) => {
            let touched = state.apply_outcome(&outcome).await;
            if !touched.is_empty() {
                state.notify_updated(touched);
            }
            Json(outcome).into_response()
        }
        Err(err) => error_response(err),
    }
}

impl GrantBody {
    fn to_grant(&self) -> Result<Grant> {
        Grant::parse(
            self.kind.as_deref(),
            self.role.as_deref(),
            self.email_address.as_deref(),
            self.domain.as_deref(),
        )
    }
}

impl BulkBody {
    fn to_action(&self) -> Result<BulkAction> {
        match self.action.as_deref().map(str::trim) {
            Some("add") => Ok(BulkAction::Add(self.grant.to_grant()?)),
            Some("remove") => Ok(BulkAction::Remove {
                subject_identity: self.grant.email_address.clone().unwrap_or_default(),
            }),
            _ => Err(Error::Validation("Invalid action".to_string())),
        }
    }
}

impl AppState {
    fn new(
        account: Option<String>,
        config_status: ConfigStatus,
        mapper: DriveMapper,
        permissions: PermissionService<DriveClient>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(200);
        Self {
            account,
            config_status,
            mapper: Mutex::new(mapper),
            permissions,
            session: std::sync::Mutex::new(SessionStatus::default()),
            events_tx,
        }
    }

    fn authorize(&self) -> std::result::Result<(), Response> {
        if self.config_status.has_token && self.account.is_some() {
            Ok(())
        } else {
            Err(error_response(Error::Unauthorized))
        }
    }

    fn session_snapshot(&self) -> SessionStatus {
        self.session
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    fn update_session<F>(&self, f: F)
    where
        F: FnOnce(&mut SessionStatus),
    {
        let mut guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    /// Marks a run as started unless one is already in flight.
    fn begin_run(&self) -> bool {
        let mut guard = self.session.lock().unwrap_or_else(|e| e.into_inner());
        if guard.state.is_loading() {
            return false;
        }
        guard.state = MappingState::Loading;
        guard.progress = MappingProgress::default();
        guard.started_at = Some(Instant::now());
        guard.finished_at = None;
        true
    }

    fn is_mapping(&self) -> bool {
        self.session
            .lock()
            .map(|s| s.state.is_loading())
            .unwrap_or_else(|e| e.into_inner().state.is_loading())
    }

    /// Replaces one record's entries with what the remote just reported.
    /// Skipped while a run is loading, since the run replaces the collection.
    async fn apply_entries(&self, file_id: &str, entries: Vec<AccessEntry>) -> bool {
        if self.is_mapping() {
            info!(file = file_id, "mapping in flight; collection will come from the run");
            return false;
        }
        let applied = self
            .mapper
            .lock()
            .await
            .apply_permission_mutation(file_id, entries);
        if !applied {
            warn!(file = file_id, "file is not in the mapped collection");
        }
        applied
    }

    async fn apply_change(&self, file_id: &str, change: &EntryChange) -> bool {
        if self.is_mapping() {
            info!(file = file_id, "mapping in flight; collection will come from the run");
            return false;
        }
        let mut mapper = self.mapper.lock().await;
        let Some(current) = mapper.record(file_id).map(|r| r.access_entries.clone()) else {
            warn!(file = file_id, "file is not in the mapped collection");
            return false;
        };
        mapper.apply_permission_mutation(file_id, change.apply_to(&current))
    }

    /// Applies every successful per-file change; returns the files touched.
    async fn apply_outcome(&self, outcome: &BulkOutcome) -> Vec<String> {
        let mut touched = Vec::new();
        for result in &outcome.results {
            if let Some(change) = &result.change {
                self.apply_change(&result.file_id, change).await;
                touched.push(result.file_id.clone());
            }
        }
        touched
    }

    fn notify_updated(&self, file_ids: Vec<String>) {
        let _ = self
            .events_tx
            .send(ServerEvent::PermissionsUpdated { file_ids });
    }
}

/// Starts a mapping run in the background. Returns false when one is running.
fn spawn_mapping(state: Arc<AppState>, force: bool) -> bool {
    let Some(account) = state.account.clone() else {
        return false;
    };
    if !state.begin_run() {
        return false;
    }
    let _ = state.events_tx.send(ServerEvent::MappingStarted);

    tokio::spawn(async move {
        let mut mapper = state.mapper.lock().await;
        let progress_state = state.clone();
        let on_progress = move |progress: &MappingProgress| {
            progress_state.update_session(|s| s.progress = *progress);
            let _ = progress_state.events_tx.send(ServerEvent::MappingProgress {
                progress: *progress,
            });
        };

        let result = if force {
            mapper.remap_with_progress(&account, on_progress).await
        } else {
            mapper.start_mapping_with_progress(&account, on_progress).await
        };

        let mapper_state = mapper.state().clone();
        let progress = mapper.progress();
        let record_count = mapper.records().len();
        let truncated = mapper.is_truncated();
        drop(mapper);

        state.update_session(|s| {
            s.state = mapper_state;
            s.progress = progress;
            s.record_count = record_count;
            s.truncated = truncated;
            s.finished_at = Some(Instant::now());
        });

        let event = match result {
            Ok(outcome) => ServerEvent::MappingDone {
                record_count,
                truncated,
                cached: matches!(outcome, MappingOutcome::Cached),
            },
            Err(err) => ServerEvent::MappingFailed {
                message: err.to_string(),
            },
        };
        let _ = state.events_tx.send(event);
    });

    true
}

fn state_label(state: &MappingState) -> &'static str {
    match state {
        MappingState::Idle => "idle",
        MappingState::Loading => "loading",
        MappingState::Complete => "complete",
        MappingState::Failed { .. } => "failed",
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Unauthorized => StatusCode::UNAUTHORIZED,
        Error::Validation(_) | Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Remote { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: Error) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(error = %err, "request failed");
    }
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

fn busy() -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({ "error": "Mapping in progress" })),
    )
        .into_response()
}

const UI_HTML: &str = r##"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <title>sharescope</title>
  <style>
    body { font-family: system-ui, sans-serif; margin: 24px; background: #f9fafb; color: #111; }
    h1 { margin-bottom: 4px; }
    fieldset { border: 1px solid #ddd; padding: 16px; border-radius: 8px; background: #fff; margin-bottom: 16px; }
    label { display: inline-block; margin: 6px 12px 6px 0; font-weight: 600; }
    input[type=text], select { padding: 6px 8px; }
    button { padding: 6px 12px; }
    table { border-collapse: collapse; width: 100%; margin-top: 12px; background: #fff; }
    th, td { border: 1px solid #e3e3e3; padding: 6px 8px; text-align: left; font-size: 14px; vertical-align: top; }
    .muted { color: #555; font-size: 13px; }
    .error { color: #b91c1c; }
    .entry { display: inline-block; margin: 2px 6px 2px 0; padding: 2px 6px; border-radius: 4px; background: #eef2ff; }
    .entry button { padding: 0 4px; margin-left: 4px; }
  </style>
</head>
<body>
  <h1>sharescope</h1>
  <p class="muted">Every file and folder in the account with its sharing entries. Edits apply immediately; the stored snapshot refreshes on remap.</p>

  <fieldset>
    <legend>Mapping</legend>
    <div id="session" class="muted">loading...</div>
    <button id="remap">Remap</button>
  </fieldset>

  <fieldset>
    <legend>Bulk change for selected files</legend>
    <label>Action
      <select id="bulk-action"><option value="add">Add</option><option value="remove">Remove</option></select>
    </label>
    <label>Type
      <select id="bulk-type">
        <option value="individual">User</option><option value="group">Group</option>
        <option value="organizationDomain">Domain</option><option value="anyoneWithLink">Anyone</option>
      </select>
    </label>
    <label>Role
      <select id="bulk-role">
        <option value="viewer">Viewer</option><option value="commenter">Commenter</option><option value="editor">Editor</option>
      </select>
    </label>
    <label>Email / domain <input type="text" id="bulk-subject" placeholder="person@example.com"></label>
    <button id="bulk-apply">Apply</button>
    <div id="bulk-result" class="muted"></div>
  </fieldset>

  <label>Filter <input type="text" id="filter" placeholder="path contains..."></label>
  <label><input type="checkbox" id="shared-only"> Shared only</label>
  <table id="files-table">
    <thead><tr><th></th><th>Path</th><th>Kind</th><th>Owner</th><th>Access</th></tr></thead>
    <tbody></tbody>
  </table>

<script>
const filesBody = document.querySelector('#files-table tbody');
const sessionEl = document.querySelector('#session');
const remapBtn = document.querySelector('#remap');
const selected = new Set();

async function loadSession() {
  const res = await fetch('/api/session');
  const s = await res.json();
  renderSession(s.state, s.progress, s.record_count, s.truncated, s.error);
}

function el(tag, text, className) {
  const node = document.createElement(tag);
  if (text !== undefined && text !== null) node.textContent = String(text);
  if (className) node.className = className;
  return node;
}

function safeLink(link) {
  try {
    const url = new URL(link);
    return url.protocol === 'https:' ? url.href : null;
  } catch (_) {
    return null;
  }
}

function renderSession(state, progress, count, truncated, error) {
  let text = `${state}: ${progress.current}/${progress.estimated_total}`;
  if (state === 'complete') text = `complete: ${count} items${truncated ? ' (stopped at the safety ceiling)' : ''}`;
  sessionEl.replaceChildren(error ? el('span', `failed: ${error}`, 'error') : document.createTextNode(text));
  remapBtn.disabled = state === 'loading';
}

function entryChip(file, entry) {
  const chip = el('span', `${entry.subject_identity || entry.subject_kind}: ${entry.access_level}`, 'entry');
  if (entry.access_level !== 'owner') {
    const remove = el('button', 'x');
    remove.addEventListener('click', async () => {
      await fetch(`/api/files/${encodeURIComponent(file.id)}/permissions/${encodeURIComponent(entry.id)}`, { method: 'DELETE' });
    });
    chip.appendChild(remove);
  }
  return chip;
}

function renderFiles(files) {
  const rows = files.map(f => {
    const row = el('tr');

    const pick = document.createElement('input');
    pick.type = 'checkbox';
    pick.checked = selected.has(f.id);
    pick.addEventListener('change', () => pick.checked ? selected.add(f.id) : selected.delete(f.id));
    row.appendChild(el('td')).appendChild(pick);

    const pathCell = el('td');
    const href = f.external_link ? safeLink(f.external_link) : null;
    if (href) {
      const link = el('a', f.path);
      link.href = href;
      link.target = '_blank';
      link.rel = 'noopener noreferrer';
      pathCell.appendChild(link);
    } else {
      pathCell.textContent = f.path;
    }
    row.appendChild(pathCell);

    row.appendChild(el('td', f.is_container ? 'folder' : 'file'));
    row.appendChild(el('td', f.owner_identity || '-'));

    const access = el('td', f.access_entries.length ? null : '-');
    f.access_entries.forEach(e => access.appendChild(entryChip(f, e)));
    row.appendChild(access);
    return row;
  });
  filesBody.replaceChildren(...rows);
}

remapBtn.addEventListener('click', async () => {
  remapBtn.disabled = true;
  await fetch('/api/remap', { method: 'POST' });
});

document.querySelector('#bulk-apply').addEventListener('click', async () => {
  const subject = document.querySelector('#bulk-subject').value.trim();
  const type = document.querySelector('#bulk-type').value;
  const body = {
    action: document.querySelector('#bulk-action').value,
    fileIds: [...selected],
    type,
    role: document.querySelector('#bulk-role').value,
  };
  if (type === 'organizationDomain') body.domain = subject; else body.emailAddress = subject;
  const res = await fetch('/api/permissions/bulk', { method: 'POST', headers: { 'Content-Type': 'application/json' }, body: JSON.stringify(body) });
  const data = await res.json();
  document.querySelector('#bulk-result').textContent = data.summary
    ? `${data.summary.success}/${data.summary.total} succeeded, ${data.summary.failed} failed`
    : data.error;
});

document.querySelector('#filter').addEventListener('input', loadFiles);
document.querySelector('#shared-only').addEventListener('change', loadFiles);

const source = new EventSource('/events');
source.onmessage = (event) => {
  try {
    const payload = JSON.parse(event.data);
    if (payload.type === 'mapping_progress') {
      renderSession('loading', payload.progress, payload.progress.current, false, null);
      return;
    }
    if (payload.type === 'mapping_done' || payload.type === 'permissions_updated') loadFiles();
    loadSession();
  } catch (err) {
    console.error(err);
  }
};

loadSession();
loadFiles();
</script>
</body>
</html>"##;
