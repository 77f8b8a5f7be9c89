use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use futures::future::join_all;
use ulid::Ulid;

use slotlease::clock::{Clock, SystemClock};
use slotlease::lease::{LeaseManager, ReleasePolicy};
use slotlease::model::Slot;
use slotlease::store::{MemoryStore, SlotStore};

const HOUR: i64 = 3_600_000; // 1 hour in ms

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn seed(store: &MemoryStore, n: usize) -> Vec<Ulid> {
    let now = SystemClock.now_ms();
    let mut ids = Vec::with_capacity(n);
    for i in 0..n {
        let id = Ulid::new();
        let start = now + (i as i64 + 1) * HOUR;
        store
            .insert_slot(Slot::open(id, "bench-tutor", start, start + HOUR, 4000))
            .await
            .unwrap();
        ids.push(id);
    }
    ids
}

fn manager(store: Arc<MemoryStore>) -> Arc<LeaseManager> {
    Arc::new(LeaseManager::new(store, Arc::new(SystemClock), ReleasePolicy::Idempotent))
}

/// One caller repeatedly holds and releases distinct slots.
async fn phase1_sequential(leases: &LeaseManager, ids: &[Ulid]) {
    let mut latencies = Vec::with_capacity(ids.len() * 2);
    let start = Instant::now();
    for id in ids {
        let id = id.to_string();
        let t = Instant::now();
        leases.acquire("bench-student", &id).await.unwrap();
        latencies.push(t.elapsed());
        let t = Instant::now();
        leases.release("bench-student", &id).await.unwrap();
        latencies.push(t.elapsed());
    }
    let elapsed = start.elapsed();
    let ops = latencies.len() as f64 / elapsed.as_secs_f64();
    println!("  {} ops in {:.2}s = {ops:.0} ops/sec", latencies.len(), elapsed.as_secs_f64());
    print_latency("op latency", &mut latencies);
}

/// Many callers race for the same small set of slots.
async fn phase2_hot_slots(leases: Arc<LeaseManager>, ids: &[Ulid]) {
    let n_tasks = 64;
    let rounds = 200;
    let granted = Arc::new(AtomicU64::new(0));
    let refused = Arc::new(AtomicU64::new(0));

    let start = Instant::now();
    let tasks = (0..n_tasks).map(|t| {
        let leases = leases.clone();
        let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let granted = granted.clone();
        let refused = refused.clone();
        tokio::spawn(async move {
            let caller = format!("student-{t}");
            let mut latencies = Vec::with_capacity(rounds);
            for r in 0..rounds {
                let id = &ids[(t + r) % ids.len()];
                let started = Instant::now();
                match leases.acquire(&caller, id).await {
                    Ok(_) => {
                        granted.fetch_add(1, Ordering::Relaxed);
                        let _ = leases.release(&caller, id).await;
                    }
                    Err(_) => {
                        refused.fetch_add(1, Ordering::Relaxed);
                    }
                }
                latencies.push(started.elapsed());
            }
            latencies
        })
    });

    let mut latencies: Vec<Duration> = join_all(tasks)
        .await
        .into_iter()
        .filter_map(Result::ok)
        .flatten()
        .collect();
    let elapsed = start.elapsed();
    println!(
        "  {n_tasks} tasks x {rounds} attempts on {} slots: {} granted, {} refused in {:.2}s",
        ids.len(),
        granted.load(Ordering::Relaxed),
        refused.load(Ordering::Relaxed),
        elapsed.as_secs_f64()
    );
    print_latency("acquire attempt latency", &mut latencies);
}

/// Journal-backed store: every grant waits on a group-committed fsync.
async fn phase3_journal(ids_per_task: usize) {
    let dir = std::env::temp_dir().join(format!("slotlease_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = Arc::new(MemoryStore::open(dir.join("slots.wal")).unwrap());
    let n_tasks = 16;
    let ids = seed(&store, n_tasks * ids_per_task).await;
    let leases = manager(store.clone());

    let start = Instant::now();
    let tasks = ids.chunks(ids_per_task).enumerate().map(|(t, chunk)| {
        let leases = leases.clone();
        let chunk: Vec<String> = chunk.iter().map(|id| id.to_string()).collect();
        tokio::spawn(async move {
            let caller = format!("student-{t}");
            let mut latencies = Vec::with_capacity(chunk.len());
            for id in &chunk {
                let started = Instant::now();
                leases.acquire(&caller, id).await.unwrap();
                latencies.push(started.elapsed());
            }
            latencies
        })
    });
    let mut latencies: Vec<Duration> = join_all(tasks)
        .await
        .into_iter()
        .filter_map(Result::ok)
        .flatten()
        .collect();
    let elapsed = start.elapsed();
    println!(
        "  {} durable grants in {:.2}s = {:.0} ops/sec",
        latencies.len(),
        elapsed.as_secs_f64(),
        latencies.len() as f64 / elapsed.as_secs_f64()
    );
    print_latency("durable acquire latency", &mut latencies);

    let t = Instant::now();
    store.compact().await.unwrap();
    println!("  compaction of {} slots: {:.2}ms", store.slot_count(), t.elapsed().as_secs_f64() * 1000.0);

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::main]
async fn main() {
    println!("=== slotlease contention benchmark ===\n");

    let store = Arc::new(MemoryStore::ephemeral());
    let ids = seed(&store, 2000).await;
    let leases = manager(store.clone());

    println!("[phase 1] sequential acquire/release");
    phase1_sequential(&leases, &ids).await;

    println!("\n[phase 2] hot slot contention");
    phase2_hot_slots(leases.clone(), &ids[..4]).await;

    println!("\n[phase 3] journal group commit");
    phase3_journal(100).await;

    println!("\n=== benchmark complete ===");
}
