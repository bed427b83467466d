pub mod configure;
pub mod import;
pub mod run_state;
pub mod schedule;
pub mod validate;

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tracing::info;

use crate::cli::StoreArgs;
use crate::model::HostLimits;
use crate::service::{ImportService, Request, Response};
use crate::store::Store;

const DEFAULT_ACTOR: &str = "operator";

pub(crate) fn db_path(args: &StoreArgs) -> PathBuf {
    args.db_path
        .clone()
        .unwrap_or_else(|| args.cache_root.join("csv_import.sqlite"))
}

pub(crate) fn open_store(args: &StoreArgs) -> Result<Store> {
    let path = db_path(args);
    let store = Store::open(&path)?;
    info!(db_path = %path.display(), "opened import store");
    Ok(store)
}

pub(crate) fn actor(args: &StoreArgs) -> String {
    args.actor
        .clone()
        .or_else(|| std::env::var("USER").ok())
        .map(|actor| actor.trim().to_string())
        .filter(|actor| !actor.is_empty())
        .unwrap_or_else(|| DEFAULT_ACTOR.to_string())
}

pub(crate) fn open_service(args: &StoreArgs) -> Result<ImportService> {
    let store = open_store(args)?;
    let limits = HostLimits {
        max_memory_mb: args.host_max_memory_mb,
        max_execution_secs: args.host_max_execution_secs,
    };
    ImportService::open(store, limits, &actor(args))
}

/// Handles one request and prints its envelope to stdout. A failed envelope
/// still prints, then turns into an error so the process exits non-zero.
pub(crate) fn dispatch(args: &StoreArgs, request: Request) -> Result<()> {
    let service = open_service(args)?;
    emit(&service.handle(request))
}

pub(crate) fn emit(response: &Response) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());
    serde_json::to_writer_pretty(&mut output, response)
        .context("failed to serialize response json")?;
    writeln!(output)?;
    output.flush()?;

    if !response.success {
        match &response.error {
            Some(error) => bail!("{}: {}", error.kind, error.message),
            None => bail!("request completed with a failing outcome"),
        }
    }
    Ok(())
}
