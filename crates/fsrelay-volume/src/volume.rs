//! A mounted volume: one queue, one exchange and one cache set

use crate::node::Node;
use crate::sizing::DirSizing;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fsrelay_common::{Config, MetaKind, OwnerKey, Result};
use fsrelay_meta::{BorrowedItem, MetaCache, MetaCaches};
use fsrelay_proto::{Request, Response};
use fsrelay_transact::{Exchange, ExchangeOutcome, Ioq, Mode, SubmitTimeout};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Work done by one [`Volume::tick`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Operations completed with `Timeout`
    pub expired: usize,
    /// Cache items detached by the sweep
    pub swept: usize,
}

/// Per-volume state. Nothing here is process-global; each mount owns its
/// own queue and caches.
pub struct Volume {
    config: Config,
    ioq: Arc<Ioq>,
    exchange: Exchange,
    caches: MetaCaches,
    nodes: DashMap<String, Arc<Node>>,
    next_key: AtomicU64,
    sizing: DirSizing,
}

impl Volume {
    /// Create a volume from (normalized) configuration
    #[must_use]
    pub fn mount(config: Config) -> Self {
        let config = config.normalized();
        let ioq = Arc::new(Ioq::from_config(&config.volume));
        let exchange = Exchange::new(Arc::clone(&ioq), config.volume.transact_timeout());
        let caches = MetaCaches::from_config(&config.meta);
        let sizing = DirSizing::new(&config.volume, &config.directory);

        info!(
            "Volume mounted: capacity {}, best effort {}, transact timeout {}ms",
            config.volume.capacity,
            config.volume.best_effort_capacity,
            config.volume.transact_timeout_ms
        );
        Self {
            config,
            ioq,
            exchange,
            caches,
            nodes: DashMap::new(),
            next_key: AtomicU64::new(1),
            sizing,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn ioq(&self) -> &Arc<Ioq> {
        &self.ioq
    }

    #[must_use]
    pub const fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    #[must_use]
    pub const fn caches(&self) -> &MetaCaches {
        &self.caches
    }

    #[must_use]
    pub const fn sizing(&self) -> &DirSizing {
        &self.sizing
    }

    #[must_use]
    pub fn cache(&self, kind: MetaKind) -> Option<&MetaCache> {
        self.caches.get(kind)
    }

    /// One transact round trip on behalf of the remote
    pub fn transact(&self, inbound: &[u8], outbound: &mut [u8], mode: Mode) -> Result<ExchangeOutcome> {
        self.exchange.transact(inbound, outbound, mode)
    }

    /// Send a request to the remote and wait for the reply
    pub fn submit(&self, request: Request, timeout: SubmitTimeout) -> Result<Response> {
        self.ioq.submit(request, timeout)
    }

    fn node_name(&self, path: &str) -> String {
        if self.config.volume.case_sensitive_search {
            path.to_string()
        } else {
            path.to_uppercase()
        }
    }

    /// Open `path`, sharing the node with other opens of the same path
    pub fn open_node(&self, path: &str) -> Arc<Node> {
        match self.nodes.entry(self.node_name(path)) {
            Entry::Occupied(entry) => {
                let node = Arc::clone(entry.get());
                node.retain();
                node
            }
            Entry::Vacant(entry) => {
                let key = OwnerKey::new(self.next_key.fetch_add(1, Ordering::Relaxed));
                let node = Arc::new(Node::new(key, path.to_string()));
                debug!("opened node {key} for {path}");
                entry.insert(Arc::clone(&node));
                node
            }
        }
    }

    /// Close one open of `node`; the last close detaches its cache items
    pub fn close_node(&self, node: &Arc<Node>) {
        if !node.release() {
            return;
        }
        let removed = self
            .nodes
            .remove_if(&self.node_name(node.path()), |_, current| {
                Arc::ptr_eq(current, node) && current.open_count() == 0
            });
        if removed.is_some() {
            for kind in MetaKind::ALL {
                node.invalidate(self.caches.get(kind), kind);
            }
            debug!("closed node {}", node.key());
        }
    }

    /// Number of distinct open nodes
    #[must_use]
    pub fn open_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Borrow the cached `kind` item of `node`, if any
    #[must_use]
    pub fn try_answer_from_cache(&self, node: &Node, kind: MetaKind) -> Option<BorrowedItem> {
        node.cached(self.caches.get(kind)?, kind)
    }

    /// Forget `node`'s cached `kind` item after a change through this volume
    pub fn invalidate(&self, node: &Node, kind: MetaKind) {
        node.invalidate(self.caches.get(kind), kind);
    }

    /// Expire overdue operations and cache items
    pub fn tick(&self, now: Instant) -> TickOutcome {
        let outcome = TickOutcome {
            expired: self.ioq.remove_expired(now),
            swept: self.caches.sweep_expired(now),
        };
        if outcome != TickOutcome::default() {
            debug!(
                "tick: {} operations expired, {} cache items swept",
                outcome.expired, outcome.swept
            );
        }
        outcome
    }

    /// Refuse new work and wake waiting transactors; queued operations stay
    pub fn begin_shutdown(&self) {
        info!("Volume shutdown started");
        self.ioq.stop(false);
    }

    /// Cancel everything still queued and drop cached metadata
    pub fn finish_shutdown(&self) -> usize {
        let cancelled = self.ioq.stop(true);
        for cache in self.caches.iter() {
            cache.clear();
        }
        info!("Volume shutdown complete: {cancelled} operations cancelled");
        cancelled
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.ioq.is_stopped()
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        self.ioq.stop(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsrelay_common::{Error, OpKind};
    use fsrelay_proto::{REQUEST_HEADER_SIZE, RecordReader, RequestBuilder, ResponseBuilder};
    use std::thread;
    use std::time::Duration;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.volume.transact_timeout_ms = 1000;
        config
    }

    #[test]
    fn test_nodes_are_shared_per_path() {
        let volume = Volume::mount(test_config());
        let a = volume.open_node("/Dir");
        let b = volume.open_node("/DIR");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.open_count(), 2);

        volume.close_node(&a);
        assert_eq!(volume.open_nodes(), 1);
        volume.close_node(&b);
        assert_eq!(volume.open_nodes(), 0);

        let c = volume.open_node("/dir");
        assert_ne!(c.key(), a.key());
    }

    #[test]
    fn test_close_detaches_cache_items() {
        let volume = Volume::mount(test_config());
        let node = volume.open_node("/d");
        let cache = volume.cache(MetaKind::Security).unwrap();
        node.populate(cache, MetaKind::Security, 0, "sd".into()).unwrap();
        assert!(volume.try_answer_from_cache(&node, MetaKind::Security).is_some());

        volume.close_node(&node);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_disabled_kind_never_answers() {
        let mut config = test_config();
        config.meta.ea_timeout_ms = 0;
        let volume = Volume::mount(config);
        let node = volume.open_node("/f");
        assert!(volume.cache(MetaKind::Ea).is_none());
        assert!(volume.try_answer_from_cache(&node, MetaKind::Ea).is_none());
        volume.invalidate(&node, MetaKind::Ea);
    }

    #[test]
    fn test_submit_round_trip() {
        let volume = Arc::new(Volume::mount(test_config()));
        let caller = {
            let volume = Arc::clone(&volume);
            thread::spawn(move || {
                let request = RequestBuilder::new(OpKind::FlushBuffers).build().unwrap();
                volume.submit(request, SubmitTimeout::Default)
            })
        };

        let mut outbound = vec![0u8; 4096];
        let outcome = volume.transact(&[], &mut outbound, Mode::Batch).unwrap();
        assert_eq!(outcome.requests, 1);
        let record = RecordReader::new(&outbound[..outcome.bytes_produced], REQUEST_HEADER_SIZE)
            .next()
            .unwrap()
            .unwrap();
        let request = Request::parse(record).unwrap();

        let response = ResponseBuilder::new(request.kind(), request.hint())
            .information(7)
            .build()
            .unwrap();
        volume.transact(response.as_bytes(), &mut [], Mode::Batch).unwrap();
        assert_eq!(caller.join().unwrap().unwrap().information(), 7);
    }

    #[test]
    fn test_tick_expires_operations() {
        let volume = Volume::mount(test_config());
        let request = RequestBuilder::new(OpKind::Read).build().unwrap();
        let op = fsrelay_transact::Operation::new(request).with_deadline(Instant::now());
        let ticket = volume.ioq().enqueue(op, false).unwrap();

        let outcome = volume.tick(Instant::now() + Duration::from_millis(1));
        assert_eq!(outcome.expired, 1);
        assert_eq!(ticket.wait().unwrap_err(), Error::Timeout);
    }

    #[test]
    fn test_two_phase_shutdown() {
        let volume = Volume::mount(test_config());
        let request = RequestBuilder::new(OpKind::Read).build().unwrap();
        let ticket = volume
            .ioq()
            .enqueue(fsrelay_transact::Operation::new(request), false)
            .unwrap();

        volume.begin_shutdown();
        assert!(volume.is_stopped());
        let request = RequestBuilder::new(OpKind::Read).build().unwrap();
        assert_eq!(
            volume.submit(request, SubmitTimeout::Default).unwrap_err(),
            Error::Stopped
        );
        assert!(ticket.try_result().is_none());

        assert_eq!(volume.finish_shutdown(), 1);
        assert!(ticket.wait().unwrap_err().is_cancellation());
    }
}
