//! Serves work for a coordinator running elsewhere.
//!
//! Usage: executor_node [cluster.yaml] [processes]

mod functions;

use anyhow::Result;
use distripool::{init_tracing, ClusterConfig, Executor, FunctionRegistry};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(Level::INFO);

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => ClusterConfig::from_yaml_file(path)?,
        None => ClusterConfig::with_addresses("127.0.0.1:1337", "127.0.0.1:1338"),
    };
    let processes = match args.next() {
        Some(n) => n.parse()?,
        None => num_cpus::get(),
    };

    let functions = FunctionRegistry::global();
    info!(functions = ?functions.list(), processes, "starting executor");
    let executor = Executor::new(config, processes, functions);
    executor.start().await?;
    Ok(())
}
