//! Client-facing pool
//!
//! A `Pool` splits a call into chunks, sends them through an acquired
//! coordinator and reassembles the replies in input order. By default it
//! also runs an executor attached to the same coordinator, so a single
//! process is a working cluster.
//!
//! Replies from every call share the coordinator's result channel. A
//! collector task reads that channel and routes each reply to its call by
//! call id; replies for calls nobody waits on any more are discarded.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::coord::coordinator::{Coordinator, CoordinatorLease};
use crate::coord::registry::CoordinatorRegistry;
use crate::core::errors::{PoolError, Result};
use crate::executor::executor::Executor;
use crate::executor::functions::FunctionRegistry;
use crate::pool::asyncwrap::{AsyncResult, Callbacks};
use crate::pool::imap::{self, ResultStream};
use crate::pool::lifecycle::{Lifecycle, PoolState};
use crate::protocol::packet::{DataPacket, FuncRef, MapMode, PoolConfig, ResultPacket};

/// Builder for a `Pool`
#[derive(Default)]
pub struct PoolOptions {
    processes: Option<usize>,
    initializer: Option<FuncRef>,
    initargs: Vec<Value>,
    maxtasksperchild: Option<usize>,
    coordinator: Option<Arc<Coordinator>>,
    coordinators: Option<CoordinatorRegistry>,
    functions: Option<FunctionRegistry>,
    detached: bool,
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Worker count of the attached executor, and the divisor for the
    /// default chunk size. Defaults to the number of CPUs.
    pub fn processes(mut self, processes: usize) -> Self {
        self.processes = Some(processes);
        self
    }

    /// Function every executor worker runs once when it starts
    pub fn initializer(mut self, initializer: impl Into<FuncRef>) -> Self {
        self.initializer = Some(initializer.into());
        self
    }

    pub fn initargs(mut self, initargs: Vec<Value>) -> Self {
        self.initargs = initargs;
        self
    }

    /// Retire executor workers after this many tasks
    pub fn maxtasksperchild(mut self, tasks: usize) -> Self {
        self.maxtasksperchild = Some(tasks);
        self
    }

    /// Use this coordinator instead of the default one
    pub fn coordinator(mut self, coordinator: Arc<Coordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Look the default coordinator up here instead of the process-wide registry
    pub fn coordinators(mut self, registry: CoordinatorRegistry) -> Self {
        self.coordinators = Some(registry);
        self
    }

    /// Functions available to the attached executor; defaults to the
    /// process-wide registry
    pub fn functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = Some(functions);
        self
    }

    /// Do not start an executor in this process; remote executors do all work
    pub fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    pub fn build(self) -> Result<Pool> {
        Pool::with_options(self)
    }
}

/// State shared by a pool, its collector task and its streams
pub(crate) struct PoolShared {
    id: Uuid,
    processes: usize,
    config: PoolConfig,
    coordinator: Arc<Coordinator>,
    lease: Mutex<Option<CoordinatorLease>>,
    lifecycle: Arc<Lifecycle>,
    pending: DashMap<u64, mpsc::UnboundedSender<ResultPacket>>,
    handles: DashMap<Uuid, watch::Receiver<bool>>,
    executor: Mutex<Option<Arc<Executor>>>,
    stop: watch::Sender<bool>,
}

impl PoolShared {
    fn ensure_open(&self) -> Result<()> {
        match self.lifecycle.state() {
            PoolState::Open => Ok(()),
            state => Err(PoolError::usage(format!("pool is {state}; no new calls are accepted"))),
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.lifecycle.is_terminated() {
            return Err(PoolError::shutdown("pool"));
        }
        Ok(())
    }

    /// Split `items`, send the chunks and wait for every reply
    pub(crate) async fn run_call(
        &self,
        func: FuncRef,
        items: Vec<Value>,
        chunksize: Option<usize>,
        mode: MapMode,
    ) -> Result<Vec<Value>> {
        self.ensure_alive()?;
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let chunksize = chunksize.unwrap_or(items.len() / self.processes).max(1);
        let chunks = split_chunks(items, chunksize);
        let expected = chunks.len();

        let call = self.coordinator.next_call_id();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.insert(call, tx);
        let _pending = PendingCall {
            pending: &self.pending,
            call,
        };
        // terminate() flips the state before the collector clears `pending`
        self.ensure_alive()?;

        debug!(
            pool = %self.id,
            call,
            function = %func,
            chunks = expected,
            chunksize,
            "dispatching call"
        );
        let mut stop = self.stop.subscribe();
        for (id, chunk) in chunks.into_iter().enumerate() {
            let packet = DataPacket {
                call,
                id,
                func: func.clone(),
                chunk,
                mode,
                config: self.config.clone(),
            };
            // a full work queue must not outlive terminate()
            tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => return Err(PoolError::shutdown("pool")),
                sent = self.coordinator.send_work(packet) => sent?,
            }
        }

        // a chunk whose executor left right after replying is delivered
        // again, so the same id can answer twice
        let mut replies: Vec<Option<ResultPacket>> = (0..expected).map(|_| None).collect();
        let mut received = 0;
        while received < expected {
            let Some(reply) = rx.recv().await else {
                return Err(PoolError::shutdown("pool"));
            };
            match replies.get_mut(reply.id) {
                Some(slot) if slot.is_none() => {
                    *slot = Some(reply);
                    received += 1;
                }
                Some(_) => {
                    debug!(pool = %self.id, call, id = reply.id, "dropping duplicate result")
                }
                None => {
                    warn!(pool = %self.id, call, id = reply.id, "result for an unknown chunk")
                }
            }
        }
        reassemble(replies.into_iter().flatten().collect())
    }

    fn track(&self, settled: (Uuid, watch::Receiver<bool>)) {
        self.handles.retain(|_, rx| !*rx.borrow());
        self.handles.insert(settled.0, settled.1);
    }
}

/// Removes a call's reply route when the caller stops waiting
struct PendingCall<'a> {
    pending: &'a DashMap<u64, mpsc::UnboundedSender<ResultPacket>>,
    call: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.call);
    }
}

/// Split into chunks of `size`, the last one possibly shorter
fn split_chunks(items: Vec<Value>, size: usize) -> Vec<Vec<Value>> {
    let mut chunks = Vec::with_capacity(items.len().div_ceil(size));
    let mut items = items.into_iter().peekable();
    while items.peek().is_some() {
        chunks.push(items.by_ref().take(size).collect());
    }
    chunks
}

/// Order replies by chunk id and flatten them; the lowest-id error wins
fn reassemble(mut replies: Vec<ResultPacket>) -> Result<Vec<Value>> {
    replies.sort_by_key(|reply| reply.id);
    let mut values = Vec::new();
    for reply in replies {
        match reply.result {
            Ok(chunk) => values.extend(chunk),
            Err(e) => return Err(PoolError::Remote(e)),
        }
    }
    Ok(values)
}

/// Positional arguments for `apply`; keyword values follow the positional
/// ones in key order
fn apply_arguments(args: Value, kwds: Option<Map<String, Value>>) -> Result<Value> {
    let mut args = match args {
        Value::Array(args) => args,
        other => {
            return Err(PoolError::type_error(format!(
                "apply() arguments must be a list, got {other}"
            )))
        }
    };
    if let Some(kwds) = kwds {
        args.extend(kwds.into_iter().map(|(_, value)| value));
    }
    Ok(Value::Array(args))
}

async fn collect_results(shared: Arc<PoolShared>, mut stop: watch::Receiver<bool>) {
    loop {
        // stop first, so a terminated pool never swallows its successor's results
        let received = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            received = shared.coordinator.receive_result() => received,
        };
        match received {
            Ok(reply) => match shared.pending.get(&reply.call) {
                Some(route) => {
                    let _ = route.send(reply);
                }
                None => warn!(
                    pool = %shared.id,
                    call = reply.call,
                    id = reply.id,
                    "discarding result of an abandoned call"
                ),
            },
            Err(e) if e.is_shutdown() => break,
            Err(e) => {
                error!(pool = %shared.id, error = %e, "result collector failed");
                break;
            }
        }
    }
    // waking every waiter with a shutdown error
    shared.pending.clear();
    debug!(pool = %shared.id, "result collector stopped");
}

/// A distributed worker pool
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Pool on the default coordinator with default options
    pub fn new() -> Result<Self> {
        Self::with_options(PoolOptions::default())
    }

    pub fn builder() -> PoolOptions {
        PoolOptions::new()
    }

    pub fn with_options(options: PoolOptions) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| PoolError::usage("a Pool must be created inside a Tokio runtime"))?;
        let processes = options.processes.unwrap_or_else(num_cpus::get);
        if processes == 0 {
            return Err(PoolError::configuration_field(
                "processes must be at least 1",
                "processes",
            ));
        }

        let coordinator = match options.coordinator {
            Some(coordinator) => coordinator,
            None => options
                .coordinators
                .unwrap_or_else(CoordinatorRegistry::global)
                .current()?,
        };
        let lease = coordinator.acquire()?;

        let (stop, stop_rx) = watch::channel(false);
        let shared = Arc::new(PoolShared {
            id: Uuid::new_v4(),
            processes,
            config: PoolConfig {
                initializer: options.initializer,
                initargs: options.initargs,
                maxtasksperchild: options.maxtasksperchild,
            },
            coordinator: coordinator.clone(),
            lease: Mutex::new(Some(lease)),
            lifecycle: Arc::new(Lifecycle::new()),
            pending: DashMap::new(),
            handles: DashMap::new(),
            executor: Mutex::new(None),
            stop,
        });
        runtime.spawn(collect_results(shared.clone(), stop_rx));

        if !options.detached {
            let (work, result) = coordinator.connect_addrs();
            let mut cluster = coordinator.config().clone();
            cluster.work_address = work;
            cluster.result_address = result;
            let functions = options.functions.unwrap_or_else(FunctionRegistry::global);
            let executor = Arc::new(Executor::new(cluster, processes, functions));
            let serving = executor.clone();
            runtime.spawn(async move {
                if let Err(e) = serving.start().await {
                    error!(executor = %serving.id(), error = %e, "attached executor failed");
                }
            });
            *shared.executor.lock() = Some(executor);
        }

        info!(
            pool = %shared.id,
            coordinator = %coordinator.id(),
            processes,
            attached = !options.detached,
            "pool started"
        );
        Ok(Self { shared })
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn processes(&self) -> usize {
        self.shared.processes
    }

    pub fn state(&self) -> PoolState {
        self.shared.lifecycle.state()
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.shared.coordinator
    }

    /// The executor running in this process, if any
    pub fn executor(&self) -> Option<Arc<Executor>> {
        self.shared.executor.lock().clone()
    }

    /// Apply `func` to every element; results keep input order.
    ///
    /// `chunksize` defaults to `len / processes` (at least 1).
    pub async fn map<F, I>(
        &self,
        func: F,
        iterable: I,
        chunksize: Option<usize>,
    ) -> Result<Vec<Value>>
    where
        F: Into<FuncRef>,
        I: IntoIterator<Item = Value>,
    {
        self.shared.ensure_open()?;
        self.shared
            .run_call(func.into(), iterable.into_iter().collect(), chunksize, MapMode::Elementwise)
            .await
    }

    /// Like `map`, but each element is an argument list
    pub async fn starmap<F, I>(
        &self,
        func: F,
        iterable: I,
        chunksize: Option<usize>,
    ) -> Result<Vec<Value>>
    where
        F: Into<FuncRef>,
        I: IntoIterator<Item = Value>,
    {
        self.shared.ensure_open()?;
        self.shared
            .run_call(func.into(), iterable.into_iter().collect(), chunksize, MapMode::Unpack)
            .await
    }

    /// Call `func` once with `args`, which must be a list
    pub async fn apply<F>(
        &self,
        func: F,
        args: Value,
        kwds: Option<Map<String, Value>>,
    ) -> Result<Value>
    where
        F: Into<FuncRef>,
    {
        self.shared.ensure_open()?;
        let args = apply_arguments(args, kwds)?;
        let mut values = self
            .shared
            .run_call(func.into(), vec![args], Some(1), MapMode::Unpack)
            .await?;
        values
            .pop()
            .ok_or_else(|| PoolError::internal("apply() call returned no value"))
    }

    pub fn map_async<F, I>(
        &self,
        func: F,
        iterable: I,
        chunksize: Option<usize>,
    ) -> Result<AsyncResult<Vec<Value>>>
    where
        F: Into<FuncRef>,
        I: IntoIterator<Item = Value>,
    {
        self.map_async_with(func, iterable, chunksize, Callbacks::new())
    }

    /// `map` on a background task; one of `callbacks` fires on completion
    pub fn map_async_with<F, I>(
        &self,
        func: F,
        iterable: I,
        chunksize: Option<usize>,
        callbacks: Callbacks<Vec<Value>>,
    ) -> Result<AsyncResult<Vec<Value>>>
    where
        F: Into<FuncRef>,
        I: IntoIterator<Item = Value>,
    {
        self.spawn_call(
            func.into(),
            iterable.into_iter().collect(),
            chunksize,
            MapMode::Elementwise,
            callbacks,
        )
    }

    pub fn starmap_async<F, I>(
        &self,
        func: F,
        iterable: I,
        chunksize: Option<usize>,
    ) -> Result<AsyncResult<Vec<Value>>>
    where
        F: Into<FuncRef>,
        I: IntoIterator<Item = Value>,
    {
        self.starmap_async_with(func, iterable, chunksize, Callbacks::new())
    }

    pub fn starmap_async_with<F, I>(
        &self,
        func: F,
        iterable: I,
        chunksize: Option<usize>,
        callbacks: Callbacks<Vec<Value>>,
    ) -> Result<AsyncResult<Vec<Value>>>
    where
        F: Into<FuncRef>,
        I: IntoIterator<Item = Value>,
    {
        self.spawn_call(
            func.into(),
            iterable.into_iter().collect(),
            chunksize,
            MapMode::Unpack,
            callbacks,
        )
    }

    pub fn apply_async<F>(
        &self,
        func: F,
        args: Value,
        kwds: Option<Map<String, Value>>,
    ) -> Result<AsyncResult<Value>>
    where
        F: Into<FuncRef>,
    {
        self.apply_async_with(func, args, kwds, Callbacks::new())
    }

    pub fn apply_async_with<F>(
        &self,
        func: F,
        args: Value,
        kwds: Option<Map<String, Value>>,
        callbacks: Callbacks<Value>,
    ) -> Result<AsyncResult<Value>>
    where
        F: Into<FuncRef>,
    {
        self.shared.ensure_open()?;
        let args = apply_arguments(args, kwds)?;
        let shared = self.shared.clone();
        let func = func.into();
        let handle = AsyncResult::spawn(
            self.shared.lifecycle.clone(),
            async move {
                let mut values = shared.run_call(func, vec![args], Some(1), MapMode::Unpack).await?;
                values
                    .pop()
                    .ok_or_else(|| PoolError::internal("apply() call returned no value"))
            },
            callbacks,
        );
        self.shared.track((handle.id(), handle.settled()));
        Ok(handle)
    }

    fn spawn_call(
        &self,
        func: FuncRef,
        items: Vec<Value>,
        chunksize: Option<usize>,
        mode: MapMode,
        callbacks: Callbacks<Vec<Value>>,
    ) -> Result<AsyncResult<Vec<Value>>> {
        self.shared.ensure_open()?;
        let shared = self.shared.clone();
        let handle = AsyncResult::spawn(
            self.shared.lifecycle.clone(),
            async move { shared.run_call(func, items, chunksize, mode).await },
            callbacks,
        );
        self.shared.track((handle.id(), handle.settled()));
        Ok(handle)
    }

    /// Lazily map an iterator that may be unbounded.
    ///
    /// Elements are pulled `chunksize * parallel_calls` at a time and each
    /// window is mapped as one call, so memory stays bounded. Results come
    /// out in input order.
    pub fn imap<F, I>(
        &self,
        func: F,
        iterable: I,
        chunksize: usize,
        parallel_calls: usize,
    ) -> Result<ResultStream>
    where
        F: Into<FuncRef>,
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        self.shared.ensure_open()?;
        Ok(imap::windowed(
            self.shared.clone(),
            func.into(),
            Box::new(iterable.into_iter()),
            chunksize,
            parallel_calls,
        ))
    }

    /// Same as `imap`; results are still yielded in input order
    pub fn imap_unordered<F, I>(
        &self,
        func: F,
        iterable: I,
        chunksize: usize,
        parallel_calls: usize,
    ) -> Result<ResultStream>
    where
        F: Into<FuncRef>,
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        self.imap(func, iterable, chunksize, parallel_calls)
    }

    /// Refuse new calls; calls already submitted run to completion
    pub fn close(&self) -> Result<()> {
        if !self.shared.lifecycle.close() {
            return Err(PoolError::usage(format!(
                "cannot close a pool that is {}",
                self.state()
            )));
        }
        info!(pool = %self.shared.id, "pool closed");
        Ok(())
    }

    /// Stop the attached executor and the result collector and release the
    /// coordinator. Outstanding handles become unusable.
    pub fn terminate(&self) -> Result<()> {
        if !self.shared.lifecycle.terminate() {
            return Err(PoolError::usage("pool is already terminated"));
        }
        if let Some(executor) = self.shared.executor.lock().take() {
            executor.close();
        }
        self.shared.stop.send_replace(true);
        drop(self.shared.lease.lock().take());
        info!(pool = %self.shared.id, "pool terminated");
        Ok(())
    }

    /// Wait for every outstanding async handle to settle; requires `close`
    /// or `terminate` first
    pub async fn join(&self) -> Result<()> {
        if self.state() == PoolState::Open {
            return Err(PoolError::usage("call close() or terminate() before join()"));
        }
        let outstanding: Vec<(Uuid, watch::Receiver<bool>)> = self
            .shared
            .handles
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        for (id, mut settled) in outstanding {
            let _ = settled.wait_for(|settled| *settled).await;
            self.shared.handles.remove(&id);
        }
        debug!(pool = %self.shared.id, "pool joined");
        Ok(())
    }

    /// Like `join`, bounded by `timeout`
    pub async fn join_timeout(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.join())
            .await
            .map_err(|_| PoolError::timeout("Pool::join", timeout))?
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if !self.shared.lifecycle.is_terminated() {
            let _ = self.terminate();
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.shared.id)
            .field("processes", &self.shared.processes)
            .field("state", &self.state())
            .field("coordinator", &self.shared.coordinator.id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::{RemoteError, RemoteErrorKind};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn chunks_cover_input_in_order() {
        let items: Vec<Value> = (0..7).map(|i| json!(i)).collect();
        let chunks = split_chunks(items, 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], vec![json!(6)]);

        let one = split_chunks(vec![json!(1)], 5);
        assert_eq!(one, vec![vec![json!(1)]]);
    }

    #[test]
    fn reassembly_orders_by_chunk_and_raises_first_error() {
        let replies = vec![
            ResultPacket::new(0, 1, Ok(vec![json!(3), json!(4)])),
            ResultPacket::new(0, 0, Ok(vec![json!(1), json!(2)])),
        ];
        assert_eq!(
            reassemble(replies).unwrap(),
            vec![json!(1), json!(2), json!(3), json!(4)]
        );

        let replies = vec![
            ResultPacket::new(0, 2, Err(RemoteError::new(RemoteErrorKind::User, "f", "late"))),
            ResultPacket::new(0, 0, Ok(vec![json!(1)])),
            ResultPacket::new(0, 1, Err(RemoteError::new(RemoteErrorKind::User, "f", "early"))),
        ];
        match reassemble(replies) {
            Err(PoolError::Remote(e)) => assert_eq!(e.message, "early"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn apply_requires_a_list() {
        assert!(matches!(apply_arguments(json!(3), None), Err(PoolError::Type { .. })));

        let mut kwds = Map::new();
        kwds.insert("scale".into(), json!(2));
        kwds.insert("offset".into(), json!(5));
        assert_eq!(
            apply_arguments(json!([1]), Some(kwds)).unwrap(),
            json!([1, 5, 2])
        );
    }

    #[test]
    fn pool_needs_a_runtime() {
        let err = Pool::new().unwrap_err();
        assert!(err.is_usage());
    }

    #[tokio::test]
    async fn pool_needs_a_coordinator() {
        let err = Pool::builder()
            .coordinators(CoordinatorRegistry::new())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("make_coordinator() has not been called yet"));
    }
}
