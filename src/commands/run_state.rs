use anyhow::Result;

use crate::cli::{ProgressArgs, StoreArgs};
use crate::commands::dispatch;
use crate::service::Request;

pub fn progress(args: ProgressArgs) -> Result<()> {
    let request = if args.extended {
        Request::GetProgressExtended
    } else {
        Request::GetProgress
    };
    dispatch(&args.store, request)
}

pub fn cancel(args: StoreArgs) -> Result<()> {
    dispatch(&args, Request::CancelImport)
}

pub fn reset(args: StoreArgs) -> Result<()> {
    dispatch(&args, Request::EmergencyReset)
}

pub fn health(args: StoreArgs) -> Result<()> {
    dispatch(&args, Request::Health)
}
