use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use bytesize::ByteSize;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workload::Workload;

#[derive(Default)]
struct Totals {
    exports: u64,
    failed: u64,
    entries: u64,
    skips: u64,
    copied: u64,
    archive_bytes: u64,
}

pub async fn perform_stresstest(workloads: Vec<Workload>, duration: Duration) -> Result<Vec<Workload>> {
    // run the workloads concurrently
    let tasks: Vec<_> = workloads
        .into_iter()
        .map(|workload| {
            tokio::spawn(async move {
                let concurrency = workload.config.concurrency;
                let semaphore = Arc::new(Semaphore::new(concurrency));
                let deadline = tokio::time::Instant::now() + duration;

                let workload = Arc::new(Mutex::new(workload));
                let task_durations = Arc::new(Mutex::new(DDSketch::default()));
                let totals = Arc::new(Mutex::new(Totals::default()));

                // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
                let sleep = tokio::time::sleep_until(deadline);
                tokio::pin!(sleep);

                loop {
                    tokio::select! {
                        permit = semaphore.clone().acquire_owned() => {
                            let (tenant, exporter) = {
                                let mut workload = workload.lock().unwrap();
                                (workload.next_tenant(), Arc::clone(&workload.exporter))
                            };
                            let task_durations = Arc::clone(&task_durations);
                            let totals = Arc::clone(&totals);
                            let task_start = Instant::now();

                            let task = async move {
                                let result = exporter.export_to_vec(&tenant).await;
                                let elapsed = task_start.elapsed();

                                let mut totals = totals.lock().unwrap();
                                totals.exports += 1;
                                match result {
                                    Ok(result) => {
                                        totals.entries += result.entries_written() as u64;
                                        totals.skips += result.skips().len() as u64;
                                        totals.copied += result.bytes_copied();
                                        totals.archive_bytes += result.archive().len() as u64;
                                    }
                                    Err(err) => {
                                        eprintln!("export failed: {err}");
                                        totals.failed += 1;
                                    }
                                }
                                drop(totals);

                                task_durations.lock().unwrap().add(elapsed.as_secs_f64());
                                drop(permit);
                            };
                            tokio::spawn(task);
                        }
                        _ = &mut sleep => {
                            break;
                        }
                    }
                }

                // by acquiring *all* the permits, we wait for all outstanding tasks to finish
                let _permits = semaphore.acquire_many(concurrency as u32).await;

                let task_durations = std::mem::take(&mut *task_durations.lock().unwrap());
                let totals = std::mem::take(&mut *totals.lock().unwrap());
                let workload = Arc::try_unwrap(workload)
                    .map_err(|_| ())
                    .unwrap()
                    .into_inner()
                    .unwrap();
                (workload, task_durations, totals)
            })
        })
        .collect();

    let finished_tasks = futures_util::future::join_all(tasks).await;

    let mut workloads = Vec::with_capacity(finished_tasks.len());
    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (workload, task_durations, totals) = task?;

        let config = &workload.config;
        let exports_ps = totals.exports as f32 / duration.as_secs_f32();
        println!(
            "# Workload {i}: {} (concurrency: {}, {:?})",
            config.name, config.concurrency, config.compression
        );
        println!(
            "  {} blobs, {} stored, photo sizes {}-{}",
            config.blobs,
            ByteSize::b(config.stored_bytes),
            ByteSize::b(config.p50_size),
            ByteSize::b(config.p99_size)
        );
        println!(
            "=> {} exports ({} failed), {exports_ps:.2} exports/s",
            totals.exports, totals.failed
        );
        println!(
            "  {} entries, {} skipped, {} copied, {} archived",
            totals.entries,
            totals.skips,
            ByteSize::b(totals.copied),
            ByteSize::b(totals.archive_bytes)
        );

        let ops = task_durations.count();
        if ops > 0 {
            let avg = Duration::from_secs_f64(task_durations.sum().unwrap() / ops as f64);
            let p50 = Duration::from_secs_f64(task_durations.quantile(0.5).unwrap().unwrap());
            let p90 = Duration::from_secs_f64(task_durations.quantile(0.9).unwrap().unwrap());
            let p99 = Duration::from_secs_f64(task_durations.quantile(0.99).unwrap().unwrap());
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }

        workloads.push(workload);
    }

    Ok(workloads)
}
