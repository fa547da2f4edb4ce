mod settings;
mod web;

use sharescope_core::db::SqliteSnapshotStore;
use sharescope_core::mapping::{Mapper, MappingOutcome};
use sharescope_core::remote::DriveClient;
use sharescope_core::store::SnapshotStore;
use sharescope_core::{Error, Result};
use tracing_subscriber::EnvFilter;

use crate::settings::Settings;

fn main() {
    init_logging();
    if let Err(err) = real_main() {
        eprintln!("error: {err}");
        std::process::exit(2);
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn real_main() -> Result<()> {
    let mut args = std::env::args().skip(1);
    let Some(cmd) = args.next() else {
        print_help();
        return Ok(());
    };

    match cmd.as_str() {
        "--help" | "-h" | "help" => {
            print_help();
            Ok(())
        }
        "map" => {
            let settings = Settings::from_args(args)?;
            run_map(&settings)
        }
        "status" => {
            let settings = Settings::from_args(args)?;
            run_status(&settings)
        }
        "clear" => {
            let settings = Settings::from_args(args)?;
            let account = settings.require_account()?;
            let store = SqliteSnapshotStore::open(&settings.db_path)?;
            store.clear(account)?;
            println!("cleared snapshot for {account}");
            Ok(())
        }
        "web" => {
            let settings = Settings::from_args(args)?;
            web::run_web_server(settings)
        }
        _ => Err(Error::InvalidArgument(format!("unknown command: {cmd}"))),
    }
}

fn run_map(settings: &Settings) -> Result<()> {
    let account = settings.require_account()?;
    let token = settings.token.clone().ok_or(Error::Unauthorized)?;
    let client = DriveClient::new(&settings.mapper, Some(token))?;
    let store = SqliteSnapshotStore::open(&settings.db_path)?;
    let mut mapper = Mapper::new(client, store, settings.mapper.clone());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(Error::Io)?;

    let outcome = runtime.block_on(async {
        let on_progress = |p: &sharescope_core::MappingProgress| {
            eprint!("\rmapped {} (est. {})", p.current, p.estimated_total);
        };
        if settings.remap {
            mapper.remap_with_progress(account, on_progress).await
        } else {
            mapper.start_mapping_with_progress(account, on_progress).await
        }
    });
    eprintln!();
    let outcome = outcome?;

    let source = match outcome {
        MappingOutcome::Cached => "stored snapshot",
        MappingOutcome::Mapped { .. } => "remote listing",
    };
    let records = mapper.records();
    let folders = records.iter().filter(|r| r.is_container).count();
    let shared = records.iter().filter(|r| r.is_shared).count();
    println!(
        "records: {}, folders: {folders}, shared: {shared}, truncated: {}, source: {source}",
        records.len(),
        mapper.is_truncated()
    );
    Ok(())
}

fn run_status(settings: &Settings) -> Result<()> {
    let store = SqliteSnapshotStore::open(&settings.db_path)?;
    let Some(account) = settings.account.as_deref() else {
        let accounts = store.list_accounts()?;
        if accounts.is_empty() {
            println!("no snapshots stored in {}", settings.db_path.display());
        }
        for account in accounts {
            println!("{account}");
        }
        return Ok(());
    };
    let Some(snapshot) = store.load(account)? else {
        println!("no snapshot stored for {account}");
        return Ok(());
    };
    let stale = sharescope_core::store::snapshot_is_stale(&snapshot, settings.mapper.max_age);
    println!(
        "account: {}\ncaptured_at: {}\nrecords: {}\ncomplete: {}\ntruncated: {}\nstale: {stale}",
        snapshot.owner_account_key,
        snapshot.captured_at.to_rfc3339(),
        snapshot.record_count,
        snapshot.is_complete,
        snapshot.truncated
    );
    Ok(())
}

fn print_help() {
    println!(
        r#"sharescope

USAGE:
  sharescope map    [--account <key>] [--token <bearer>] [--db <sqlite_path>] [--remap]
  sharescope status [--account <key>] [--db <sqlite_path>]   (lists stored accounts without --account)
  sharescope clear  [--account <key>] [--db <sqlite_path>]
  sharescope web    [--port <port>] [--account <key>] [--token <bearer>] [--db <sqlite_path>]

OPTIONS:
  --max-records <n>   Safety ceiling for one mapping run (env: SHARESCOPE_MAX_RECORDS)
  --batch-size <n>    Records requested per page (env: SHARESCOPE_BATCH_SIZE)

ENVIRONMENT:
  SHARESCOPE_ACCOUNT, SHARESCOPE_ACCESS_TOKEN, SHARESCOPE_DB,
  SHARESCOPE_MAX_AGE_SECS, SHARESCOPE_PAGE_TIMEOUT_SECS, SHARESCOPE_API_BASE,
  RUST_LOG (default: info)

NOTES:
  - Snapshots are stored per account in one SQLite database.
  - Permission edits update the in-memory view only; run a remap to refresh the snapshot.
"#
    );
}
