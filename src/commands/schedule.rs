use anyhow::Result;

use crate::cli::{ScheduleArgs, StoreArgs};
use crate::commands::dispatch;
use crate::service::Request;

pub fn schedule(args: ScheduleArgs) -> Result<()> {
    dispatch(&args.store, Request::Schedule {
        frequency: args.frequency,
        source: args.source,
    })
}

pub fn unschedule(args: StoreArgs) -> Result<()> {
    dispatch(&args, Request::Unschedule)
}

pub fn status(args: StoreArgs) -> Result<()> {
    dispatch(&args, Request::SchedulerStatus)
}

pub fn self_test(args: StoreArgs) -> Result<()> {
    dispatch(&args, Request::SchedulerTest)
}

pub fn debug(args: StoreArgs) -> Result<()> {
    dispatch(&args, Request::SchedulerDebug)
}

pub fn tick(args: StoreArgs) -> Result<()> {
    dispatch(&args, Request::Tick)
}
