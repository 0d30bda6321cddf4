//! Coordinator - the fan-out point of a cluster
//!
//! The coordinator binds two TCP endpoints. Executors connect to both: on the
//! work endpoint they pull `DataPacket`s, on the result endpoint they push
//! `ResultPacket`s. Inside the process the two directions are plain channels,
//! so `send_work` and `receive_result` never touch a socket directly.
//!
//! Delivery is pull based: an executor asks for one packet at a time with a
//! `WorkRequest`, and the packet it was last given stays in flight until it
//! asks again. Packets still in flight when a connection drops go back into
//! the queue.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::ClusterConfig;
use crate::core::errors::{PoolError, Result};
use crate::protocol::codec;
use crate::protocol::packet::{DataPacket, ResultPacket, WorkRequest};

/// Owner of the work-out and result-in channels of one cluster
pub struct Coordinator {
    id: Uuid,
    config: ClusterConfig,
    work_addr: SocketAddr,
    result_addr: SocketAddr,
    work_tx: mpsc::Sender<DataPacket>,
    result_rx: AsyncMutex<mpsc::Receiver<ResultPacket>>,
    acquired: AtomicBool,
    next_call: AtomicU64,
    shutdown: watch::Sender<bool>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Bind the work and result endpoints with default settings
    pub async fn bind(work_address: &str, result_address: &str) -> Result<Arc<Self>> {
        Self::bind_with(&ClusterConfig::with_addresses(work_address, result_address)).await
    }

    /// Bind the endpoints named in `config`
    pub async fn bind_with(config: &ClusterConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let work_listener = TcpListener::bind(&config.work_address).await.map_err(|e| {
            PoolError::io(format!("binding work address {}", config.work_address), e)
        })?;
        let result_listener = TcpListener::bind(&config.result_address).await.map_err(|e| {
            PoolError::io(format!("binding result address {}", config.result_address), e)
        })?;
        let work_addr = work_listener
            .local_addr()
            .map_err(|e| PoolError::io("reading work address", e))?;
        let result_addr = result_listener
            .local_addr()
            .map_err(|e| PoolError::io("reading result address", e))?;

        let (work_tx, work_rx) = mpsc::channel(config.channel_capacity);
        let (result_tx, result_rx) = mpsc::channel(config.channel_capacity);
        let (shutdown, _) = watch::channel(false);

        let work_rx = Arc::new(AsyncMutex::new(work_rx));
        let max_frame = config.max_frame_bytes;

        let work_task = tokio::spawn(accept_executors(
            work_listener,
            shutdown.subscribe(),
            {
                let work_tx = work_tx.clone();
                move |stream: TcpStream, peer: SocketAddr, shutdown: watch::Receiver<bool>| {
                    tokio::spawn(feed_executor(
                        stream,
                        peer,
                        work_rx.clone(),
                        work_tx.clone(),
                        shutdown,
                        max_frame,
                    ));
                }
            },
        ));
        let result_task = tokio::spawn(accept_executors(
            result_listener,
            shutdown.subscribe(),
            move |stream: TcpStream, peer: SocketAddr, shutdown: watch::Receiver<bool>| {
                tokio::spawn(drain_executor(
                    stream,
                    peer,
                    result_tx.clone(),
                    shutdown,
                    max_frame,
                ));
            },
        ));

        let coordinator = Arc::new(Self {
            id: Uuid::new_v4(),
            config: config.clone(),
            work_addr,
            result_addr,
            work_tx,
            result_rx: AsyncMutex::new(result_rx),
            acquired: AtomicBool::new(false),
            next_call: AtomicU64::new(0),
            shutdown,
            listeners: Mutex::new(vec![work_task, result_task]),
        });
        info!(
            coordinator = %coordinator.id,
            work = %work_addr,
            result = %result_addr,
            "coordinator bound"
        );
        Ok(coordinator)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Addresses actually bound, useful when the configuration asked for port 0
    pub fn local_addrs(&self) -> (SocketAddr, SocketAddr) {
        (self.work_addr, self.result_addr)
    }

    /// Addresses an executor on this host should connect to
    pub fn connect_addrs(&self) -> (String, String) {
        (
            connectable(self.work_addr).to_string(),
            connectable(self.result_addr).to_string(),
        )
    }

    /// Take the advisory lock; fails if another pool holds it
    pub fn acquire(self: &Arc<Self>) -> Result<CoordinatorLease> {
        if self.is_closed() {
            return Err(PoolError::state("coordinator", "coordinator is closed"));
        }
        self.acquired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                PoolError::state("coordinator", "coordinator is already acquired by another pool")
            })?;
        debug!(coordinator = %self.id, "coordinator acquired");
        Ok(CoordinatorLease {
            coordinator: self.clone(),
            released: false,
        })
    }

    /// Drop the advisory lock
    pub fn release(&self) {
        if self.acquired.swap(false, Ordering::AcqRel) {
            debug!(coordinator = %self.id, "coordinator released");
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.acquired.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Fresh id for a call; ids are never reused by this coordinator
    pub fn next_call_id(&self) -> u64 {
        self.next_call.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue a packet for the next executor that asks for work.
    ///
    /// A packet too large for one frame is refused with a channel error.
    pub async fn send_work(&self, packet: DataPacket) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(PoolError::shutdown("coordinator"));
        }
        codec::ensure_fits(&packet, self.config.max_frame_bytes)?;
        tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => Err(PoolError::shutdown("coordinator")),
            sent = self.work_tx.send(packet) => {
                sent.map_err(|_| PoolError::shutdown("coordinator"))
            }
        }
    }

    /// Wait for the next result pushed by any executor
    pub async fn receive_result(&self) -> Result<ResultPacket> {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(PoolError::shutdown("coordinator"));
        }
        let mut results = self.result_rx.lock().await;
        tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => Err(PoolError::shutdown("coordinator")),
            packet = results.recv() => packet.ok_or_else(|| PoolError::shutdown("coordinator")),
        }
    }

    /// Close both endpoints; anyone blocked in `send_work`/`receive_result`
    /// returns a shutdown error
    pub fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        for listener in self.listeners.lock().drain(..) {
            listener.abort();
        }
        info!(coordinator = %self.id, "coordinator closed");
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("id", &self.id)
            .field("work_addr", &self.work_addr)
            .field("result_addr", &self.result_addr)
            .field("acquired", &self.is_acquired())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.close();
    }
}

/// Guard for an acquired coordinator; dropping it releases the lock
pub struct CoordinatorLease {
    coordinator: Arc<Coordinator>,
    released: bool,
}

impl CoordinatorLease {
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn release(mut self) {
        self.released = true;
        self.coordinator.release();
    }
}

impl Drop for CoordinatorLease {
    fn drop(&mut self) {
        if !self.released {
            self.coordinator.release();
        }
    }
}

fn connectable(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

async fn accept_executors<F>(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    on_connect: F,
) where
    F: Fn(TcpStream, SocketAddr, watch::Receiver<bool>),
{
    loop {
        let handoff = shutdown.clone();
        tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    debug!(%peer, "executor connected");
                    on_connect(stream, peer, handoff);
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }
}

/// Hand work packets to one executor connection, one per `WorkRequest`
async fn feed_executor(
    stream: TcpStream,
    peer: SocketAddr,
    queue: Arc<AsyncMutex<mpsc::Receiver<DataPacket>>>,
    requeue: mpsc::Sender<DataPacket>,
    mut shutdown: watch::Receiver<bool>,
    max_frame: usize,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut in_flight: Option<DataPacket> = None;
    let mut peek = [0u8; 1];
    loop {
        let request = tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => return,
            request = codec::read_message::<_, WorkRequest>(&mut reader, max_frame) => request,
        };
        match request {
            Ok(Some(request)) => {
                if let Some(done) = in_flight.take() {
                    debug!(%peer, call = done.call, id = done.id, "chunk settled");
                }
                debug!(%peer, executor = %request.executor, "work requested");
            }
            Ok(None) => {
                debug!(%peer, "executor left the work channel");
                return give_back(in_flight, &requeue, &mut shutdown).await;
            }
            Err(e) => {
                warn!(%peer, error = %e, "dropping work connection");
                return give_back(in_flight, &requeue, &mut shutdown).await;
            }
        }

        // nothing else may arrive before the executor gets its packet, so a
        // readable socket means the peer hung up
        let packet = {
            let mut queue = tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => return,
                _ = reader.read(&mut peek) => {
                    debug!(%peer, "executor left the work channel");
                    return;
                }
                queue = queue.lock() => queue,
            };
            tokio::select! {
                _ = shutdown.wait_for(|closed| *closed) => return,
                _ = reader.read(&mut peek) => {
                    debug!(%peer, "executor left the work channel");
                    return;
                }
                packet = queue.recv() => match packet {
                    Some(packet) => packet,
                    None => return,
                },
            }
        };

        debug!(%peer, call = packet.call, id = packet.id, "sending chunk");
        if let Err(e) = codec::write_message(&mut writer, &packet, max_frame).await {
            warn!(
                %peer,
                error = %e,
                call = packet.call,
                id = packet.id,
                "delivery failed, requeueing chunk"
            );
            return give_back(Some(packet), &requeue, &mut shutdown).await;
        }
        in_flight = Some(packet);
    }
}

/// Put an undelivered or unfinished packet back into the queue
async fn give_back(
    packet: Option<DataPacket>,
    requeue: &mpsc::Sender<DataPacket>,
    shutdown: &mut watch::Receiver<bool>,
) {
    let Some(packet) = packet else {
        return;
    };
    debug!(call = packet.call, id = packet.id, "requeueing chunk");
    tokio::select! {
        _ = shutdown.wait_for(|closed| *closed) => {}
        _ = requeue.send(packet) => {}
    }
}

/// Forward result packets from one executor connection
async fn drain_executor(
    stream: TcpStream,
    peer: SocketAddr,
    results: mpsc::Sender<ResultPacket>,
    mut shutdown: watch::Receiver<bool>,
    max_frame: usize,
) {
    let mut stream = stream;
    loop {
        let message = tokio::select! {
            _ = shutdown.wait_for(|closed| *closed) => return,
            message = codec::read_message::<_, ResultPacket>(&mut stream, max_frame) => message,
        };
        match message {
            Ok(Some(packet)) => {
                debug!(%peer, call = packet.call, id = packet.id, "received result");
                if results.send(packet).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!(%peer, "executor left the result channel");
                return;
            }
            Err(e) => {
                warn!(%peer, error = %e, "dropping result connection");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{FuncRef, MapMode, PoolConfig};
    use serde_json::{json, Value};
    use std::time::Duration;

    async fn local() -> Arc<Coordinator> {
        Coordinator::bind("127.0.0.1:0", "127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn acquire_is_exclusive_until_released() {
        let coordinator = local().await;
        let lease = coordinator.acquire().unwrap();
        assert!(coordinator.is_acquired());
        assert!(matches!(coordinator.acquire(), Err(PoolError::State { .. })));
        drop(lease);
        assert!(!coordinator.is_acquired());
        let lease = coordinator.acquire().unwrap();
        lease.release();
        assert!(!coordinator.is_acquired());
    }

    #[tokio::test]
    async fn concurrent_acquire_has_one_winner() {
        let coordinator = local().await;
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let c = coordinator.clone();
            // winners keep their lease past the race
            tasks.push(tokio::spawn(async move { c.acquire().ok().map(std::mem::forget) }));
        }
        let winners = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(Some(()))))
            .count();
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn close_wakes_blocked_receiver() {
        let coordinator = local().await;
        let waiting = coordinator.clone();
        let receiver = tokio::spawn(async move { waiting.receive_result().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        coordinator.close();
        let outcome = tokio::time::timeout(Duration::from_secs(2), receiver)
            .await
            .expect("receiver stayed blocked")
            .unwrap();
        assert!(matches!(outcome, Err(ref e) if e.is_shutdown()));
        assert!(coordinator.is_closed());

        let packet = DataPacket {
            call: 0,
            id: 0,
            func: FuncRef::new("f"),
            chunk: vec![json!(1)],
            mode: MapMode::Elementwise,
            config: PoolConfig::default(),
        };
        assert!(coordinator.send_work(packet).await.unwrap_err().is_shutdown());
        assert!(coordinator.acquire().is_err());
    }

    #[tokio::test]
    async fn wildcard_binds_connect_over_loopback() {
        let coordinator = Coordinator::bind("0.0.0.0:0", "0.0.0.0:0").await.unwrap();
        let (work, result) = coordinator.connect_addrs();
        assert!(work.starts_with("127.0.0.1:"));
        assert!(result.starts_with("127.0.0.1:"));
        assert_ne!(work, result);
    }

    fn chunk(call: u64, chunk: Vec<Value>) -> DataPacket {
        DataPacket {
            call,
            id: 0,
            func: FuncRef::new("f"),
            chunk,
            mode: MapMode::Elementwise,
            config: PoolConfig::default(),
        }
    }

    async fn ask_for_work(stream: &mut TcpStream, executor: &str) -> DataPacket {
        let request = WorkRequest {
            executor: executor.into(),
        };
        codec::write_message(stream, &request, 1 << 20).await.unwrap();
        codec::read_message(stream, 1 << 20).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn work_is_only_sent_on_request() {
        let coordinator = local().await;
        let (work, _) = coordinator.connect_addrs();
        let mut idle = TcpStream::connect(&work).await.unwrap();
        coordinator.send_work(chunk(1, vec![json!(1)])).await.unwrap();

        // the idle connection never asked, so nothing was written to it
        let mut byte = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_millis(200), idle.read(&mut byte)).await;
        assert!(read.is_err());

        let mut busy = TcpStream::connect(&work).await.unwrap();
        let packet = ask_for_work(&mut busy, "busy").await;
        assert_eq!(packet.call, 1);
    }

    #[tokio::test]
    async fn unfinished_chunks_are_redelivered() {
        let coordinator = local().await;
        let (work, _) = coordinator.connect_addrs();
        coordinator.send_work(chunk(7, vec![json!(7)])).await.unwrap();

        let mut leaving = TcpStream::connect(&work).await.unwrap();
        let packet = ask_for_work(&mut leaving, "leaving").await;
        assert_eq!(packet.call, 7);
        drop(leaving);

        let mut staying = TcpStream::connect(&work).await.unwrap();
        let redelivered = ask_for_work(&mut staying, "staying");
        let again = tokio::time::timeout(Duration::from_secs(2), redelivered)
            .await
            .expect("chunk was not redelivered");
        assert_eq!(again, packet);
    }

    #[tokio::test]
    async fn oversized_packets_are_refused() {
        let config = ClusterConfig::builder()
            .work_address("127.0.0.1:0")
            .result_address("127.0.0.1:0")
            .max_frame_bytes(1024)
            .build()
            .unwrap();
        let coordinator = Coordinator::bind_with(&config).await.unwrap();
        let err = coordinator
            .send_work(chunk(0, vec![json!("x".repeat(4096))]))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Channel { .. }));
        coordinator.send_work(chunk(1, vec![json!(1)])).await.unwrap();
    }

    #[tokio::test]
    async fn call_ids_are_unique() {
        let coordinator = local().await;
        let a = coordinator.next_call_id();
        let b = coordinator.next_call_id();
        assert_ne!(a, b);
    }
}
