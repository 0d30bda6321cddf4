//! Lazy, windowed mapping over unbounded inputs

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

use crate::core::errors::{PoolError, Result};
use crate::pool::pool::PoolShared;
use crate::protocol::packet::{FuncRef, MapMode};

/// Results of `imap`/`imap_unordered`, in input order
pub type ResultStream = BoxStream<'static, Result<Value>>;

struct Window {
    shared: Arc<PoolShared>,
    func: FuncRef,
    source: Box<dyn Iterator<Item = Value> + Send>,
    chunksize: usize,
    window: usize,
    failed: bool,
}

/// Pull `chunksize * parallel_calls` elements at a time from `source`, map
/// each window as one call and yield its results. The first failing window
/// yields its error and ends the stream.
pub(crate) fn windowed(
    shared: Arc<PoolShared>,
    func: FuncRef,
    source: Box<dyn Iterator<Item = Value> + Send>,
    chunksize: usize,
    parallel_calls: usize,
) -> ResultStream {
    let chunksize = chunksize.max(1);
    let state = Window {
        shared,
        func,
        source,
        chunksize,
        window: chunksize.saturating_mul(parallel_calls.max(1)),
        failed: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.failed {
            return None;
        }
        let batch: Vec<Value> = state.source.by_ref().take(state.window).collect();
        if batch.is_empty() {
            return None;
        }
        let outcome = state
            .shared
            .run_call(state.func.clone(), batch, Some(state.chunksize), MapMode::Elementwise)
            .await;
        let items = match outcome {
            Ok(values) => {
                stream::iter(values.into_iter().map(Ok::<Value, PoolError>)).left_stream()
            }
            Err(e) => {
                state.failed = true;
                stream::once(futures::future::ready(Err(e))).right_stream()
            }
        };
        Some((items, state))
    })
    .flatten()
    .boxed()
}
