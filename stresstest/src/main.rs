use std::sync::Arc;
use std::time::Duration;

use photozip::{BufferPool, Compression};
use tracing_subscriber::EnvFilter;

use crate::stresstest::perform_stresstest;
use crate::workload::Workload;

mod stresstest;
mod workload;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // skipped photos are logged at `warn`, which would drown out the report
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("error")),
        )
        .init();

    let pool = Arc::new(BufferPool::default());

    let workloads = vec![
        Workload::builder("small-photos")
            .concurrency(32)
            .size_distribution(16 * 1024, 256 * 1024) // p50 = 16K, p99 = 256K
            .build(Arc::clone(&pool)),
        Workload::builder("large-photos")
            .concurrency(8)
            .catalog(4, 10, 3)
            .size_distribution(512 * 1024, 4 * 1024 * 1024) // p50 = 512K, p99 = 4M
            .key_weights(80, 15, 5)
            .compression(Compression::Deflated)
            .build(Arc::clone(&pool)),
    ];

    let workloads = perform_stresstest(workloads, Duration::from_secs(2)).await?;

    let pool_stats = pool.stats();
    println!(
        "# Buffer pool: {} acquired, {} allocated, {} idle",
        pool_stats.acquired, pool_stats.allocated, pool_stats.idle
    );
    anyhow::ensure!(
        pool_stats.outstanding() == 0,
        "{} buffers were never released",
        pool_stats.outstanding()
    );

    for workload in &workloads {
        let stats = workload.source.stats();
        anyhow::ensure!(
            stats.opens == stats.closes && stats.sessions_opened == stats.sessions_closed,
            "workload {} leaked storage handles: {stats:?}",
            workload.config.name
        );
    }

    Ok(())
}
