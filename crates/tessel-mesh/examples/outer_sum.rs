//! Outer-product sum over two in-process workers.
//!
//! A vector `x = 0, 1, ..., n-1` is split in halves across two workers.
//! The `outer_dot` kernel runs once per (tile of x, tile of x) pair on the
//! worker owning the first tile, and the target folds the pieces with a
//! sum, so `target[i] = x[i] * Σ_j x[j]`. The same graph is then reduced
//! to a scalar.
//!
//! ```sh
//! RUST_LOG=tessel_mesh=debug cargo run --example outer_sum -p tessel-mesh
//! ```

use std::sync::Arc;

use tessel_array::ReduceOp;
use tessel_mesh::{
    ArrayGraph, Cluster, Config, Coordinator, Engine, KernelRegistry, Kwargs, Port, Worker,
};
use tracing_subscriber::EnvFilter;

const N: usize = 10;

fn main() -> Result<(), tessel_mesh::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Outer-product sum ===\n");

    let config = Config::default().with_kernel_threads(2);
    let registry = Arc::new(KernelRegistry::with_builtins());
    let workers = (0..2)
        .map(|_| Worker::bind("127.0.0.1", Port::Ephemeral, config.clone(), registry.clone()))
        .collect::<Result<Vec<_>, _>>()?;

    let mut builder = Cluster::builder();
    for worker in &workers {
        println!("worker listening on {}", worker.local_addr());
        builder = builder.worker("127.0.0.1", worker.port(), 1);
    }
    let coordinator = Coordinator::connect(config, builder.build())?;
    let mut engine = Engine::new(coordinator);

    let mut graph = ArrayGraph::new();
    let x = graph.arange(&[N], 0.0, 1.0)?;
    let dot = graph.outer(
        x,
        x,
        (0, 0),
        "outer_dot",
        Kwargs::new(),
        vec![N],
        None,
        ReduceOp::Sum,
    )?;
    let total = graph.reduce(dot, None, "sum", Kwargs::new(), ReduceOp::Sum)?;

    let target = engine.evaluate(&graph, dot)?;
    println!("\ntarget {} tiles:", target.id);
    for (extent, owner) in &target.tiles {
        println!("  {extent} on {owner}");
    }
    let values = engine.coordinator().glom(&target)?.values();
    println!("target = {values:?}");

    let sum = engine.evaluate(&graph, total)?;
    let sum = engine.coordinator().glom(&sum)?.values();
    let expected: f64 = (0..N).map(|i| i as f64).sum::<f64>().powi(2);
    println!("Σ target = {} (expected {expected})", sum[0]);

    engine.release(dot)?;
    engine.release(total)?;
    engine.coordinator().shutdown_all()?;
    for worker in &workers {
        worker.close();
    }
    println!("\nworkers shut down.");
    Ok(())
}
