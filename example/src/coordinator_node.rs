//! Starts a coordinator plus a pool and runs a few calls.
//!
//! Usage: coordinator_node [cluster.yaml] [--detached]
//!
//! With `--detached` no executor runs in this process; start one or more
//! `executor_node`s pointing at the same addresses.

mod functions;

use std::time::Duration;

use anyhow::Result;
use distripool::{init_tracing, make_coordinator, Callbacks, ClusterConfig, Pool};
use futures::StreamExt;
use serde_json::json;
use tracing::{info, warn, Level};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(Level::INFO);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let detached = args.iter().any(|a| a == "--detached");
    let config = match args.iter().find(|a| !a.starts_with("--")) {
        Some(path) => ClusterConfig::from_yaml_file(path)?,
        None => ClusterConfig::default(),
    };

    let coordinator = make_coordinator(&config).await?;
    let (work, result) = coordinator.local_addrs();
    info!(%work, %result, "coordinator listening");

    let mut options = Pool::builder();
    if detached {
        options = options.detached();
    }
    let pool = options.build()?;

    let squares = pool.map("square", (0..20).map(|i| json!(i)), None).await?;
    info!(?squares, "map");

    let sums = pool
        .starmap("add", vec![json!([1, 2]), json!([3, 4]), json!([5, 6])], None)
        .await?;
    info!(?sums, "starmap");

    let seven = pool.apply("add", json!([3, 4]), None).await?;
    info!(%seven, "apply");

    match pool.map("checked_sqrt", vec![json!(4.0), json!(-1.0)], Some(1)).await {
        Ok(roots) => info!(?roots, "unexpected success"),
        Err(e) => warn!(error = %e, "remote error surfaced"),
    }

    let handle = pool.map_async_with(
        "square",
        (0..8).map(|i| json!(i)),
        Some(2),
        Callbacks::new().on_success(|values| info!(?values, "callback fired")),
    )?;
    handle.wait(Some(Duration::from_secs(10))).await?;
    info!(successful = handle.successful()?, "map_async");

    let handle = pool.starmap_async("slow_square", (0..8).map(|i| json!([i, 100])), Some(2))?;
    let values = handle.get(Some(Duration::from_secs(10))).await?;
    info!(?values, "starmap_async");

    let mut stream = pool.imap("square", (0..).map(|i| json!(i)), 4, 2)?;
    let mut first = Vec::new();
    while let Some(value) = stream.next().await {
        first.push(value?);
        if first.len() == 10 {
            break;
        }
    }
    info!(?first, "imap over an unbounded range");
    drop(stream);

    pool.close()?;
    pool.join().await?;
    pool.terminate()?;
    coordinator.close();
    Ok(())
}
