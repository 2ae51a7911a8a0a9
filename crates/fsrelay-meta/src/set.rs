//! The per-kind cache set owned by one volume

use crate::cache::MetaCache;
use fsrelay_common::MetaKind;
use fsrelay_common::config::{MetaConfig, TIMEOUT_INFINITE};
use std::time::{Duration, Instant};
use tracing::info;

/// One optional [`MetaCache`] per metadata kind.
///
/// A kind whose configured lifetime or size budget is zero has no store,
/// and every lookup for it misses.
#[derive(Debug)]
pub struct MetaCaches {
    security: Option<MetaCache>,
    dir_info: Option<MetaCache>,
    stream_info: Option<MetaCache>,
    ea: Option<MetaCache>,
}

impl MetaCaches {
    #[must_use]
    pub fn from_config(config: &MetaConfig) -> Self {
        let build = |kind: MetaKind| {
            if !config.is_enabled(kind) {
                info!("{kind} cache disabled");
                return None;
            }
            let ttl = match config.timeout_ms(kind) {
                TIMEOUT_INFINITE => None,
                ms => Some(Duration::from_millis(ms)),
            };
            Some(MetaCache::new(kind, config.capacity, config.item_size_max, ttl))
        };
        Self {
            security: build(MetaKind::Security),
            dir_info: build(MetaKind::DirInfo),
            stream_info: build(MetaKind::StreamInfo),
            ea: build(MetaKind::Ea),
        }
    }

    /// A set with every kind disabled
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            security: None,
            dir_info: None,
            stream_info: None,
            ea: None,
        }
    }

    #[must_use]
    pub const fn get(&self, kind: MetaKind) -> Option<&MetaCache> {
        match kind {
            MetaKind::Security => self.security.as_ref(),
            MetaKind::DirInfo => self.dir_info.as_ref(),
            MetaKind::StreamInfo => self.stream_info.as_ref(),
            MetaKind::Ea => self.ea.as_ref(),
        }
    }

    /// Enabled stores, in [`MetaKind::ALL`] order
    pub fn iter(&self) -> impl Iterator<Item = &MetaCache> {
        MetaKind::ALL.into_iter().filter_map(|kind| self.get(kind))
    }

    /// Sweep every store; returns the number of items detached
    pub fn sweep_expired(&self, now: Instant) -> usize {
        self.iter().map(|cache| cache.sweep_expired(now)).sum()
    }
}
