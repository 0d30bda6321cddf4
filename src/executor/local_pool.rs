//! Thread-backed local execution pool
//!
//! Runs user callables on a fixed number of worker threads fed through a
//! crossbeam channel. Each worker runs the initializer once when it starts
//! and, when `maxtasksperchild` is set, retires after that many tasks and is
//! replaced by a fresh worker. Dropping the pool closes the job channel and
//! joins every worker.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::core::errors::{RemoteError, RemoteErrorKind};
use crate::executor::functions::{FunctionRegistry, RemoteFn};
use crate::protocol::packet::{ChunkOutcome, MapMode, PoolConfig};

/// Per-worker setup call
#[derive(Clone)]
pub struct Initializer {
    name: String,
    func: Option<Arc<dyn RemoteFn>>,
    args: Vec<Value>,
}

impl Initializer {
    pub fn new(func: Arc<dyn RemoteFn>, args: Vec<Value>) -> Self {
        Self {
            name: func.name().to_string(),
            func: Some(func),
            args,
        }
    }

    /// Resolve the initializer named by a pool configuration.
    ///
    /// An unknown name still yields an initializer; every worker then fails
    /// its tasks with `UnknownFunction` instead of running them.
    pub fn from_config(config: &PoolConfig, registry: &FunctionRegistry) -> Option<Self> {
        let func_ref = config.initializer.as_ref()?;
        let mut args = func_ref.captured.clone();
        args.extend(config.initargs.iter().cloned());
        Some(Self {
            name: func_ref.name.clone(),
            func: registry.get(&func_ref.name),
            args,
        })
    }

    fn run(&self) -> Result<(), RemoteError> {
        let func = self.func.as_ref().ok_or_else(|| {
            RemoteError::new(
                RemoteErrorKind::UnknownFunction,
                &self.name,
                "initializer is not registered on this executor",
            )
        })?;
        match catch_unwind(AssertUnwindSafe(|| func.call(self.args.clone()))) {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(RemoteError::new(
                RemoteErrorKind::Initializer,
                &self.name,
                format!("{:#}", e),
            )),
            Err(payload) => Err(RemoteError::new(
                RemoteErrorKind::Initializer,
                &self.name,
                format!("initializer panicked: {}", panic_message(payload.as_ref())),
            )),
        }
    }
}

struct Job {
    index: usize,
    func: Arc<dyn RemoteFn>,
    args: Result<Vec<Value>, String>,
    reply: Sender<(usize, Result<Value, RemoteError>)>,
}

struct WorkerShared {
    jobs: Receiver<Job>,
    initializer: Option<Initializer>,
    maxtasksperchild: Option<usize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicUsize,
    alive: AtomicUsize,
    closing: AtomicBool,
}

/// Fixed-size pool of worker threads
pub struct LocalPool {
    jobs: Option<Sender<Job>>,
    shared: Arc<WorkerShared>,
    processes: usize,
}

impl LocalPool {
    /// Start `processes` workers (at least one)
    pub fn new(
        processes: usize,
        initializer: Option<Initializer>,
        maxtasksperchild: Option<usize>,
    ) -> Self {
        let processes = processes.max(1);
        let (tx, rx) = channel::unbounded();
        let shared = Arc::new(WorkerShared {
            jobs: rx,
            initializer,
            // a limit of zero would retire workers before they run anything
            maxtasksperchild: maxtasksperchild.filter(|&n| n > 0),
            workers: Mutex::new(Vec::with_capacity(processes)),
            started: AtomicUsize::new(0),
            alive: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
        });
        for _ in 0..processes {
            spawn_worker(&shared);
        }
        debug!(processes, "local pool started");
        Self {
            jobs: Some(tx),
            shared,
            processes,
        }
    }

    /// Build a pool from a configuration triple, resolving the initializer
    /// against `registry`
    pub fn from_config(processes: usize, config: &PoolConfig, registry: &FunctionRegistry) -> Self {
        Self::new(
            processes,
            Initializer::from_config(config, registry),
            config.maxtasksperchild,
        )
    }

    pub fn processes(&self) -> usize {
        self.processes
    }

    /// Number of worker threads started so far, replacements included
    pub fn workers_started(&self) -> usize {
        self.shared.started.load(Ordering::SeqCst)
    }

    /// Worker threads that have not exited yet
    pub fn workers_alive(&self) -> usize {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// `func(x)` for every element of `chunk`, in order
    pub fn map(
        &self,
        func: Arc<dyn RemoteFn>,
        captured: &[Value],
        chunk: Vec<Value>,
    ) -> ChunkOutcome {
        self.run(MapMode::Elementwise, func, captured, chunk)
    }

    /// `func(*x)` for every argument list in `chunk`, in order
    pub fn starmap(
        &self,
        func: Arc<dyn RemoteFn>,
        captured: &[Value],
        chunk: Vec<Value>,
    ) -> ChunkOutcome {
        self.run(MapMode::Unpack, func, captured, chunk)
    }

    fn run(
        &self,
        mode: MapMode,
        func: Arc<dyn RemoteFn>,
        captured: &[Value],
        chunk: Vec<Value>,
    ) -> ChunkOutcome {
        let total = chunk.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        let jobs = self.jobs.as_ref().ok_or_else(|| {
            RemoteError::new(RemoteErrorKind::Pool, func.name(), "local pool is closed")
        })?;

        let (reply_tx, reply_rx) = channel::unbounded();
        for (index, element) in chunk.into_iter().enumerate() {
            let job = Job {
                index,
                func: func.clone(),
                args: mode.arguments(captured, element),
                reply: reply_tx.clone(),
            };
            jobs.send(job).map_err(|_| {
                RemoteError::new(RemoteErrorKind::Pool, func.name(), "local workers are gone")
            })?;
        }
        drop(reply_tx);

        let mut slots: Vec<Option<Value>> = vec![None; total];
        let mut first_error: Option<RemoteError> = None;
        for _ in 0..total {
            match reply_rx.recv() {
                Ok((index, Ok(value))) => slots[index] = Some(value),
                Ok((index, Err(e))) => {
                    // report the failure of the earliest element, like a sequential map would
                    let earlier = first_error
                        .as_ref()
                        .and_then(|cur| cur.index)
                        .map_or(true, |cur| index < cur);
                    if earlier {
                        first_error = Some(e);
                    }
                }
                Err(_) => {
                    return Err(RemoteError::new(
                        RemoteErrorKind::Pool,
                        func.name(),
                        "a worker exited without replying",
                    ))
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(slots.into_iter().flatten().collect()),
        }
    }
}

impl Drop for LocalPool {
    fn drop(&mut self) {
        // under the lock, so no retiring worker can add a replacement after
        // the join loop below has emptied the list
        {
            let _workers = self.shared.workers.lock();
            self.shared.closing.store(true, Ordering::SeqCst);
        }
        // workers leave their loop once the channel is disconnected
        self.jobs.take();
        loop {
            let handle = self.shared.workers.lock().pop();
            match handle {
                Some(handle) => {
                    if handle.join().is_err() {
                        error!("local pool worker panicked outside user code");
                    }
                }
                None => break,
            }
        }
        debug!(processes = self.processes, "local pool stopped");
    }
}

fn spawn_worker(shared: &Arc<WorkerShared>) {
    let mut workers = shared.workers.lock();
    if shared.closing.load(Ordering::SeqCst) {
        return;
    }
    let number = shared.started.fetch_add(1, Ordering::SeqCst);
    let worker_shared = shared.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("distripool-worker-{}", number))
        .spawn(move || worker_main(worker_shared, number));
    match spawned {
        Ok(handle) => {
            shared.alive.fetch_add(1, Ordering::SeqCst);
            workers.push(handle);
        }
        Err(e) => error!(worker = number, error = %e, "failed to spawn local pool worker"),
    }
}

/// Counts a worker out when its thread ends, panics included
struct Alive<'a>(&'a AtomicUsize);

impl Drop for Alive<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn worker_main(shared: Arc<WorkerShared>, number: usize) {
    let _alive = Alive(&shared.alive);
    let init_error = match &shared.initializer {
        Some(init) => match init.run() {
            Ok(()) => None,
            Err(e) => {
                warn!(worker = number, error = %e, "worker initializer failed");
                Some(e)
            }
        },
        None => None,
    };

    let mut completed = 0usize;
    while let Ok(job) = shared.jobs.recv() {
        let outcome = match &init_error {
            Some(e) => Err(e.clone().at(job.index)),
            None => run_job(&job),
        };
        // the caller may have given up on the chunk; nothing to do then
        let _ = job.reply.send((job.index, outcome));

        completed += 1;
        if let Some(limit) = shared.maxtasksperchild {
            if completed >= limit {
                debug!(worker = number, completed, "worker reached maxtasksperchild");
                spawn_worker(&shared);
                return;
            }
        }
    }
}

fn run_job(job: &Job) -> Result<Value, RemoteError> {
    let name = job.func.name();
    let args = job.args.clone().map_err(|msg| {
        RemoteError::new(RemoteErrorKind::BadArguments, name, msg).at(job.index)
    })?;
    match catch_unwind(AssertUnwindSafe(|| job.func.call(args))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(RemoteError::user(name, &e).at(job.index)),
        Err(payload) => Err(RemoteError::new(
            RemoteErrorKind::Panic,
            name,
            panic_message(payload.as_ref()),
        )
        .at(job.index)),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::functions::FnRemote;
    use crate::protocol::packet::FuncRef;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn square() -> Arc<dyn RemoteFn> {
        Arc::new(FnRemote::new("square", |args: Vec<Value>| {
            let x = args[0].as_i64().ok_or_else(|| anyhow::anyhow!("not an integer"))?;
            Ok(json!(x * x))
        }))
    }

    fn add() -> Arc<dyn RemoteFn> {
        Arc::new(FnRemote::new("add", |args: Vec<Value>| {
            let total: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(total))
        }))
    }

    #[test]
    fn map_preserves_order() {
        let pool = LocalPool::new(4, None, None);
        let chunk: Vec<Value> = (0..50).map(|i| json!(i)).collect();
        let out = pool.map(square(), &[], chunk).unwrap();
        let expected: Vec<Value> = (0..50).map(|i: i64| json!(i * i)).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn starmap_unpacks_and_prepends_captured() {
        let pool = LocalPool::new(2, None, None);
        let out = pool
            .starmap(add(), &[json!(100)], vec![json!([1, 2]), json!([3, 4])])
            .unwrap();
        assert_eq!(out, vec![json!(103), json!(107)]);

        let err = pool.starmap(add(), &[], vec![json!(1)]).unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::BadArguments);
    }

    #[test]
    fn earliest_error_wins_and_panics_are_caught() {
        let pool = LocalPool::new(3, None, None);
        let chunk = vec![json!(1), json!("a"), json!(3), json!("b")];
        let err = pool.map(square(), &[], chunk).unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::User);
        assert_eq!(err.index, Some(1));

        let boom: Arc<dyn RemoteFn> = Arc::new(FnRemote::new("boom", |_| panic!("kaboom")));
        let err = pool.map(boom, &[], vec![json!(0)]).unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Panic);
        assert!(err.message.contains("kaboom"));

        // the pool is still usable after a panic
        assert_eq!(pool.map(square(), &[], vec![json!(3)]).unwrap(), vec![json!(9)]);
    }

    #[test]
    fn initializer_runs_once_per_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let init: Arc<dyn RemoteFn> = Arc::new(FnRemote::new("init", move |args: Vec<Value>| {
            assert_eq!(args, vec![json!("cfg")]);
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }));
        let pool = LocalPool::new(3, Some(Initializer::new(init, vec![json!("cfg")])), None);
        pool.map(square(), &[], (0..10).map(|i| json!(i)).collect())
            .unwrap();
        drop(pool);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn workers_retire_after_maxtasksperchild() {
        let pool = LocalPool::new(1, None, Some(2));
        let out = pool
            .map(square(), &[], (0..6).map(|i| json!(i)).collect())
            .unwrap();
        assert_eq!(out.len(), 6);
        // one original worker plus one replacement per two tasks
        assert!(pool.workers_started() >= 3);
    }

    #[test]
    fn drop_joins_every_replacement_worker() {
        for _ in 0..20 {
            let pool = LocalPool::new(4, None, Some(1));
            pool.map(square(), &[], (0..40).map(|i| json!(i)).collect())
                .unwrap();
            assert!(pool.workers_alive() >= 1);
            let shared = pool.shared.clone();
            drop(pool);
            assert_eq!(shared.alive.load(Ordering::SeqCst), 0);
            assert!(shared.workers.lock().is_empty());
        }
    }

    #[test]
    fn unknown_initializer_fails_every_task() {
        let registry = FunctionRegistry::new();
        let config = PoolConfig {
            initializer: Some(FuncRef::new("missing_setup")),
            ..Default::default()
        };
        let pool = LocalPool::from_config(2, &config, &registry);
        let err = pool.map(square(), &[], vec![json!(2)]).unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::UnknownFunction);
        assert_eq!(err.function, "missing_setup");
    }

    #[test]
    fn failing_initializer_is_reported() {
        let init: Arc<dyn RemoteFn> =
            Arc::new(FnRemote::new("bad_init", |_| anyhow::bail!("no database")));
        let pool = LocalPool::new(1, Some(Initializer::new(init, vec![])), None);
        let err = pool.map(square(), &[], vec![json!(2)]).unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Initializer);
        assert!(err.message.contains("no database"));
    }
}
