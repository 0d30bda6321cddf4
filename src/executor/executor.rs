//! Executor - a worker node serving one coordinator
//!
//! The executor asks the coordinator's work channel for one chunk at a time,
//! runs it on a local pool and pushes the outputs back on the result
//! channel. The local pool is built from the configuration carried by the first packet
//! and rebuilt whenever a packet arrives with a different configuration.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::config::ClusterConfig;
use crate::core::errors::{PoolError, RemoteError, RemoteErrorKind, Result};
use crate::executor::functions::FunctionRegistry;
use crate::executor::local_pool::LocalPool;
use crate::protocol::codec;
use crate::protocol::packet::{DataPacket, PoolConfig, ResultPacket, WorkRequest};

/// Lifecycle of an executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Created, not connected yet
    Idle,
    /// Connected to both coordinator endpoints
    Connected,
    /// Serving work with a local pool
    Running,
    /// Closed or disconnected; terminal
    Stopped,
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutorState::Idle => "idle",
            ExecutorState::Connected => "connected",
            ExecutorState::Running => "running",
            ExecutorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A worker node attached to one coordinator
pub struct Executor {
    id: Uuid,
    config: ClusterConfig,
    processes: usize,
    functions: FunctionRegistry,
    work: AsyncMutex<Option<TcpStream>>,
    results: AsyncMutex<Option<TcpStream>>,
    shutdown: watch::Sender<bool>,
    state: Mutex<ExecutorState>,
    active: Mutex<Option<PoolConfig>>,
    pool_builds: AtomicUsize,
}

impl Executor {
    /// Create an executor for the coordinator at `config`'s addresses.
    /// No connection is made until `connect` or `start`.
    pub fn new(config: ClusterConfig, processes: usize, functions: FunctionRegistry) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            config,
            processes: processes.max(1),
            functions,
            work: AsyncMutex::new(None),
            results: AsyncMutex::new(None),
            shutdown,
            state: Mutex::new(ExecutorState::Idle),
            active: Mutex::new(None),
            pool_builds: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn processes(&self) -> usize {
        self.processes
    }

    pub fn state(&self) -> ExecutorState {
        *self.state.lock()
    }

    /// Configuration of the local pool currently (or last) in use
    pub fn active_config(&self) -> Option<PoolConfig> {
        self.active.lock().clone()
    }

    /// How many local pools this executor has built
    pub fn pool_builds(&self) -> usize {
        self.pool_builds.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Connect to both coordinator endpoints, retrying until they accept.
    ///
    /// Returns `Ok(false)` if the executor was closed while connecting.
    pub async fn connect(&self) -> Result<bool> {
        let deadline = self.config.connect_timeout().map(|t| Instant::now() + t);
        let Some(work) = self.connect_one(&self.config.work_address, deadline).await? else {
            return Ok(false);
        };
        let Some(results) = self.connect_one(&self.config.result_address, deadline).await? else {
            return Ok(false);
        };
        *self.work.lock().await = Some(work);
        *self.results.lock().await = Some(results);
        self.set_state(ExecutorState::Connected);
        info!(
            executor = %self.id,
            work = %self.config.work_address,
            result = %self.config.result_address,
            "executor connected"
        );
        Ok(true)
    }

    async fn connect_one(
        &self,
        address: &str,
        deadline: Option<Instant>,
    ) -> Result<Option<TcpStream>> {
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.config.connect_retry_interval();
        loop {
            if *shutdown.borrow() {
                return Ok(None);
            }
            match TcpStream::connect(address).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(Some(stream));
                }
                Err(e) => {
                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(PoolError::channel(
                            address,
                            format!("could not reach coordinator: {e}"),
                        ));
                    }
                    debug!(address, error = %e, "coordinator not reachable yet, retrying");
                }
            }
            tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => return Ok(None),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Serve work until the executor is closed or the coordinator goes away.
    ///
    /// Connects first if `connect` was not called.
    pub async fn start(&self) -> Result<()> {
        let connected = self.work.lock().await.is_some();
        if !connected && !self.connect().await? {
            self.set_state(ExecutorState::Stopped);
            return Ok(());
        }

        let outcome = self.work_loop().await;
        self.work.lock().await.take();
        self.results.lock().await.take();
        self.set_state(ExecutorState::Stopped);
        match &outcome {
            Ok(()) => info!(executor = %self.id, "executor stopped"),
            Err(e) => error!(executor = %self.id, error = %e, "executor failed"),
        }
        outcome
    }

    /// Signal the executor to stop; a blocked `start` returns promptly
    pub fn close(&self) {
        if !self.shutdown.send_replace(true) {
            debug!(executor = %self.id, "executor closing");
        }
    }

    async fn work_loop(&self) -> Result<()> {
        let Some(mut packet) = self.receive().await? else {
            return Ok(());
        };
        loop {
            let config = packet.config.clone();
            let pool = Arc::new(LocalPool::from_config(self.processes, &config, &self.functions));
            let builds = self.pool_builds.fetch_add(1, Ordering::SeqCst) + 1;
            *self.active.lock() = Some(config.clone());
            self.set_state(ExecutorState::Running);
            info!(
                executor = %self.id,
                processes = self.processes,
                initializer = ?config.initializer.as_ref().map(|f| f.name.as_str()),
                maxtasksperchild = ?config.maxtasksperchild,
                builds,
                "local pool ready"
            );

            let next = self.serve(&pool, &config, packet).await;
            // joining worker threads blocks
            let _ = tokio::task::spawn_blocking(move || drop(pool)).await;

            match next? {
                Some(reconfigured) => packet = reconfigured,
                None => return Ok(()),
            }
        }
    }

    /// Run packets on `pool` until one arrives with a different configuration
    async fn serve(
        &self,
        pool: &Arc<LocalPool>,
        config: &PoolConfig,
        mut packet: DataPacket,
    ) -> Result<Option<DataPacket>> {
        loop {
            let reply = self.execute(pool, packet).await;
            if !self.send(&reply).await? {
                return Ok(None);
            }
            match self.receive().await? {
                None => return Ok(None),
                Some(next) if next.config != *config => {
                    info!(executor = %self.id, "pool configuration changed, rebuilding local pool");
                    return Ok(Some(next));
                }
                Some(next) => packet = next,
            }
        }
    }

    async fn execute(&self, pool: &Arc<LocalPool>, packet: DataPacket) -> ResultPacket {
        let (call, id) = (packet.call, packet.id);
        let name = packet.func.name.clone();
        let Some(func) = self.functions.get(&name) else {
            warn!(executor = %self.id, function = %name, "unknown function requested");
            return ResultPacket::new(
                call,
                id,
                Err(RemoteError::new(
                    RemoteErrorKind::UnknownFunction,
                    &name,
                    "function is not registered on this executor",
                )),
            );
        };

        debug!(call, id, function = %name, elements = packet.chunk.len(), "running chunk");
        let strategy = packet.mode.choose_mode();
        let pool = pool.clone();
        let captured = packet.func.captured;
        let chunk = packet.chunk;
        let outcome = tokio::task::spawn_blocking(move || strategy(&pool, func, &captured, chunk))
            .await
            .unwrap_or_else(|e| {
                Err(RemoteError::new(
                    RemoteErrorKind::Panic,
                    &name,
                    format!("chunk task failed: {e}"),
                ))
            });
        if let Err(e) = &outcome {
            debug!(call, id, error = %e, "chunk failed");
        }
        self.fit(ResultPacket::new(call, id, outcome), &name)
    }

    /// Swap a reply too large for one frame for an error the caller can see
    fn fit(&self, reply: ResultPacket, function: &str) -> ResultPacket {
        match codec::ensure_fits(&reply, self.config.max_frame_bytes) {
            Ok(()) => reply,
            Err(e) => {
                warn!(
                    call = reply.call,
                    id = reply.id,
                    error = %e,
                    "chunk outputs do not fit in a frame"
                );
                ResultPacket::new(
                    reply.call,
                    reply.id,
                    Err(RemoteError::new(RemoteErrorKind::Oversize, function, e.to_string())),
                )
            }
        }
    }

    /// Ask for and read the next packet; `None` once closed or disconnected
    async fn receive(&self) -> Result<Option<DataPacket>> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(None);
        }
        let mut work = self.work.lock().await;
        let stream = work
            .as_mut()
            .ok_or_else(|| PoolError::state("executor", "executor is not connected"))?;
        let request = WorkRequest {
            executor: self.id.to_string(),
        };
        let max_frame = self.config.max_frame_bytes;
        let exchange = async move {
            codec::write_message(&mut *stream, &request, max_frame).await?;
            codec::read_message::<_, DataPacket>(&mut *stream, max_frame).await
        };
        let message = tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => return Ok(None),
            message = exchange => message?,
        };
        if message.is_none() {
            info!(executor = %self.id, "coordinator closed the work channel");
        }
        Ok(message)
    }

    /// Push a reply; `false` once closed, even mid-write
    async fn send(&self, reply: &ResultPacket) -> Result<bool> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(false);
        }
        let mut results = self.results.lock().await;
        let stream = results
            .as_mut()
            .ok_or_else(|| PoolError::state("executor", "executor is not connected"))?;
        tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => Ok(false),
            written = codec::write_message(stream, reply, self.config.max_frame_bytes) => {
                written.map(|()| true)
            }
        }
    }

    fn set_state(&self, state: ExecutorState) {
        *self.state.lock() = state;
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("id", &self.id)
            .field("work_address", &self.config.work_address)
            .field("result_address", &self.config.result_address)
            .field("processes", &self.processes)
            .field("state", &self.state())
            .finish()
    }
}

/// Create an executor for the coordinator at `addresses` using every CPU and
/// the process-wide function registry. With `start` the call serves work
/// until the executor stops.
pub async fn make_executor(addresses: (&str, &str), start: bool) -> Result<Arc<Executor>> {
    let config = ClusterConfig::with_addresses(addresses.0, addresses.1);
    let executor = Arc::new(Executor::new(config, num_cpus::get(), FunctionRegistry::global()));
    if start {
        executor.start().await?;
    }
    Ok(executor)
}
