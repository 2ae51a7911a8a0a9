//! Final statistics of a loopback run

use crate::remote::WorkerReport;
use crate::workload::ClientReport;
use fsrelay_volume::Volume;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Serialize)]
pub struct QueueReport {
    pub enqueued: u64,
    pub rejected: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub expired: u64,
    pub unmatched: u64,
}

#[derive(Debug, Serialize)]
pub struct ExchangeReport {
    pub round_trips: u64,
    pub requests: u64,
    pub dispatched: u64,
    pub reposts: u64,
    pub malformed: u64,
    pub idle: u64,
}

#[derive(Debug, Serialize)]
pub struct CacheReport {
    pub kind: &'static str,
    pub items: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub inserts: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub expirations: u64,
    pub overcommits: u64,
}

#[derive(Debug, Serialize)]
pub struct LoopReport {
    pub queue: QueueReport,
    pub exchange: ExchangeReport,
    pub caches: Vec<CacheReport>,
    pub remote_served: u64,
    pub workers: Vec<WorkerReport>,
    pub clients: Vec<ClientReport>,
    pub cancelled_at_shutdown: usize,
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

impl LoopReport {
    pub fn collect(
        volume: &Volume,
        remote_served: u64,
        workers: Vec<WorkerReport>,
        clients: Vec<ClientReport>,
        cancelled_at_shutdown: usize,
    ) -> Self {
        let q = volume.ioq().stats();
        let x = volume.exchange().stats();
        let caches = volume
            .caches()
            .iter()
            .map(|cache| {
                let s = cache.stats();
                CacheReport {
                    kind: cache.kind().as_str(),
                    items: cache.len(),
                    hits: load(&s.hits),
                    misses: load(&s.misses),
                    hit_ratio: s.hit_ratio(),
                    inserts: load(&s.inserts),
                    evictions: load(&s.evictions),
                    invalidations: load(&s.invalidations),
                    expirations: load(&s.expirations),
                    overcommits: load(&s.overcommits),
                }
            })
            .collect();

        Self {
            queue: QueueReport {
                enqueued: load(&q.enqueued),
                rejected: load(&q.rejected),
                completed: load(&q.completed),
                cancelled: load(&q.cancelled),
                expired: load(&q.expired),
                unmatched: load(&q.unmatched),
            },
            exchange: ExchangeReport {
                round_trips: load(&x.round_trips),
                requests: load(&x.requests),
                dispatched: load(&x.dispatched),
                reposts: load(&x.reposts),
                malformed: load(&x.malformed),
                idle: load(&x.idle),
            },
            caches,
            remote_served,
            workers,
            clients,
            cancelled_at_shutdown,
        }
    }
}
