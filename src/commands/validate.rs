use anyhow::Result;
use tracing::info;

use crate::cli::ValidateArgs;
use crate::commands::dispatch;
use crate::service::Request;

pub fn run(args: ValidateArgs) -> Result<()> {
    info!(target_kind = ?args.target, "validation requested");
    dispatch(&args.store, Request::Validate {
        target: args.target,
    })
}
