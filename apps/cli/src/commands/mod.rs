//! Command implementations for the Distill CLI.

pub mod evaluate;
pub mod generate;
pub mod metrics;
pub mod pipeline;
pub mod prepare;
pub mod train;

use crate::progress::BarProgressSink;
use distill_training::{NullProgressSink, ProgressSink};
use std::sync::Arc;

/// Progress bars for humans; nothing when stdout carries JSON.
pub(crate) fn progress_sink(json: bool) -> Arc<dyn ProgressSink> {
    if json { Arc::new(NullProgressSink) } else { Arc::new(BarProgressSink::default()) }
}

pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
