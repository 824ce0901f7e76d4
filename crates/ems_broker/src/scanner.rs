//! Background queue scanner.
//!
//! Instead of walking every channel per tick, the scanner samples a
//! small random subset and processes their due in-flight and deferred
//! messages. When a quarter (configurable) of the sample had work, it
//! immediately resamples without sleeping, so hot channels get
//! revisited many times per tick while idle ones cost nothing.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::index::sample as sample_indices;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::channel::Channel;
use crate::engine::Engine;

enum ScanJob {
    Scan(Arc<Channel>),
    /// Terminates exactly one worker (pool shrink).
    Close,
}

/// Drives in-flight and deferred timeouts for the whole node. Runs
/// until the engine's shutdown signal fires.
pub async fn queue_scan_loop(engine: Arc<Engine>) {
    let opts = engine.opts();
    let interval = Duration::from_millis(opts.scan.interval_ms);
    let refresh = Duration::from_millis(opts.scan.refresh_interval_ms);

    let (work_tx, work_rx) = mpsc::channel::<ScanJob>(1);
    let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
    // workers must never block on reporting, or the dispatch loop stalls
    let (resp_tx, mut resp_rx) = mpsc::channel::<bool>(opts.scan.selection_count.max(64));

    let mut pool_size = 0usize;
    resize_pool(
        &engine,
        engine.channels().len(),
        &mut pool_size,
        &work_rx,
        &resp_tx,
        &work_tx,
    )
    .await;

    let mut work_ticker = tokio::time::interval(interval);
    work_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut refresh_ticker = tokio::time::interval(refresh);
    refresh_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut shutdown = engine.shutdown_signal();

    loop {
        tokio::select! {
            _ = work_ticker.tick() => {}
            _ = refresh_ticker.tick() => {
                resize_pool(&engine, engine.channels().len(), &mut pool_size, &work_rx, &resp_tx, &work_tx).await;
                continue;
            }
            _ = shutdown.changed() => break,
        }

        let channels = engine.channels();
        if channels.is_empty() {
            continue;
        }

        let opts = engine.opts();
        let dirty_percent = opts.scan.dirty_percent;
        let selection = opts.scan.selection_count;

        loop {
            let num = selection.min(channels.len());
            let picked = {
                let mut rng = rand::thread_rng();
                sample_indices(&mut rng, channels.len(), num)
            };
            for idx in picked.iter() {
                let _ = work_tx.send(ScanJob::Scan(Arc::clone(&channels[idx]))).await;
            }

            let mut dirty = 0usize;
            for _ in 0..num {
                if resp_rx.recv().await == Some(true) {
                    dirty += 1;
                }
            }

            if (dirty as f64) / (num as f64) <= dirty_percent {
                break;
            }
            if *shutdown.borrow() {
                break;
            }
        }

        if *shutdown.borrow() {
            break;
        }
    }
    info!("queue scanner exited");
}

/// Keep the worker pool at `min(ceil(0.25 × channels), pool_max)`,
/// never below one.
async fn resize_pool(
    engine: &Arc<Engine>,
    channel_count: usize,
    pool_size: &mut usize,
    work_rx: &Arc<tokio::sync::Mutex<mpsc::Receiver<ScanJob>>>,
    resp_tx: &mpsc::Sender<bool>,
    work_tx: &mpsc::Sender<ScanJob>,
) {
    let opts = engine.opts();
    let ideal = ((channel_count as f64 * 0.25).ceil() as usize)
        .clamp(1, opts.scan.worker_pool_max.max(1));

    if ideal == *pool_size {
        return;
    }
    debug!(from = *pool_size, to = ideal, "resizing scan worker pool");

    while *pool_size > ideal {
        let _ = work_tx.send(ScanJob::Close).await;
        *pool_size -= 1;
    }
    while *pool_size < ideal {
        let rx = Arc::clone(work_rx);
        let tx = resp_tx.clone();
        tokio::spawn(queue_scan_worker(rx, tx));
        *pool_size += 1;
    }
}

async fn queue_scan_worker(
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<ScanJob>>>,
    resp_tx: mpsc::Sender<bool>,
) {
    loop {
        let job = { work_rx.lock().await.recv().await };
        match job {
            Some(ScanJob::Scan(channel)) => {
                let now = ems_utils::time::now_ns();
                let mut dirty = channel.process_in_flight_queue(now).await;
                if channel.process_deferred_queue(now).await {
                    dirty = true;
                }
                if resp_tx.send(dirty).await.is_err() {
                    break;
                }
            }
            Some(ScanJob::Close) | None => break,
        }
    }
}
