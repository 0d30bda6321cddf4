//! Pools driving executors that are not attached to them

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use distripool::{
    make_coordinator_in, remote_fn, ClusterConfig, Coordinator, CoordinatorRegistry, Executor,
    ExecutorState, FunctionRegistry, Pool, PoolError,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

static WARMED_UP: AtomicUsize = AtomicUsize::new(0);

#[remote_fn]
fn cube(x: i64) -> i64 {
    x * x * x
}

#[remote_fn]
fn warm_up(label: String) {
    assert!(!label.is_empty());
    WARMED_UP.fetch_add(1, Ordering::SeqCst);
}

fn spawn_executor(coordinator: &Coordinator, processes: usize) -> Arc<Executor> {
    let (work, result) = coordinator.connect_addrs();
    let executor = Arc::new(Executor::new(
        ClusterConfig::with_addresses(work, result),
        processes,
        FunctionRegistry::global(),
    ));
    let serving = executor.clone();
    tokio::spawn(async move { serving.start().await });
    executor
}

fn values(n: i64) -> Vec<Value> {
    (0..n).map(|i| json!(i)).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn detached_pool_uses_remote_executors() {
    let registry = CoordinatorRegistry::new();
    let coordinator = make_coordinator_in(
        &registry,
        &ClusterConfig::with_addresses("127.0.0.1:0", "127.0.0.1:0"),
    )
    .await
    .unwrap();
    let first = spawn_executor(&coordinator, 2);
    let second = spawn_executor(&coordinator, 2);

    let pool = Pool::builder()
        .processes(4)
        .coordinators(registry.clone())
        .detached()
        .build()
        .unwrap();
    assert!(pool.executor().is_none());

    let cubes = pool.map("cube", values(40), Some(2)).await.unwrap();
    let expected: Vec<Value> = (0..40).map(|i| json!(i * i * i)).collect();
    assert_eq!(cubes, expected);

    pool.terminate().unwrap();
    first.close();
    second.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn executors_connect_before_the_coordinator_exists() {
    // reserve a pair of free ports, then release them
    let reserved = Coordinator::bind("127.0.0.1:0", "127.0.0.1:0").await.unwrap();
    let (work, result) = reserved.local_addrs();
    reserved.close();
    drop(reserved);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let executor = Arc::new(Executor::new(
        ClusterConfig::with_addresses(work.to_string(), result.to_string()),
        1,
        FunctionRegistry::global(),
    ));
    let serving = executor.clone();
    tokio::spawn(async move { serving.start().await });
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(executor.state(), ExecutorState::Idle);

    let coordinator = Coordinator::bind(&work.to_string(), &result.to_string())
        .await
        .unwrap();
    let pool = Pool::builder()
        .coordinator(coordinator.clone())
        .detached()
        .build()
        .unwrap();
    let cubes = tokio::time::timeout(Duration::from_secs(10), pool.map("cube", values(3), None))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cubes, vec![json!(0), json!(1), json!(8)]);
    executor.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn executor_rebuilds_its_pool_for_a_new_configuration() {
    let coordinator = Coordinator::bind("127.0.0.1:0", "127.0.0.1:0").await.unwrap();
    let executor = spawn_executor(&coordinator, 2);

    let plain = Pool::builder()
        .coordinator(coordinator.clone())
        .detached()
        .build()
        .unwrap();
    plain.map("cube", values(4), None).await.unwrap();
    assert_eq!(executor.pool_builds(), 1);
    drop(plain);

    let warmed = Pool::builder()
        .coordinator(coordinator.clone())
        .initializer("warm_up")
        .initargs(vec![json!("cache")])
        .maxtasksperchild(3)
        .detached()
        .build()
        .unwrap();
    let cubes = warmed.map("cube", values(10), Some(1)).await.unwrap();
    assert_eq!(cubes[2], json!(8));
    assert_eq!(executor.pool_builds(), 2);

    let active = executor.active_config().unwrap();
    assert_eq!(active.initializer.unwrap().name, "warm_up");
    assert_eq!(active.maxtasksperchild, Some(3));
    assert!(WARMED_UP.load(Ordering::SeqCst) >= 1);

    executor.close();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_initializer_fails_the_call() {
    let coordinator = Coordinator::bind("127.0.0.1:0", "127.0.0.1:0").await.unwrap();
    let pool = Pool::builder()
        .processes(1)
        .coordinator(coordinator)
        .initializer("not_registered_anywhere")
        .build()
        .unwrap();
    let err = pool.map("cube", values(3), None).await.unwrap_err();
    match err {
        PoolError::Remote(remote) => {
            assert_eq!(remote.function, "not_registered_anywhere");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn closing_the_coordinator_fails_waiting_calls() {
    let coordinator = Coordinator::bind("127.0.0.1:0", "127.0.0.1:0").await.unwrap();
    // no executor: the call can only end when the coordinator goes away
    let pool = Pool::builder()
        .coordinator(coordinator.clone())
        .detached()
        .build()
        .unwrap();
    let handle = pool.map_async("cube", values(3), None).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    coordinator.close();

    let err = handle.get(Some(Duration::from_secs(5))).await.unwrap_err();
    assert!(err.is_shutdown());
}
