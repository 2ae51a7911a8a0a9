//! Client threads issuing file-system calls against the volume

use bytes::Bytes;
use fsrelay_common::{Error, MetaKind, Result};
use fsrelay_volume::{DirInfoClass, DirQuery, Volume, answer_names};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

const PATTERNS: [&str; 5] = ["*", "*.txt", "*.LOG", "file-000??.*", "*.cfg"];
const CLASSES: [DirInfoClass; 4] = [
    DirInfoClass::Names,
    DirInfoClass::Directory,
    DirInfoClass::FullDirectory,
    DirInfoClass::IdFullDirectory,
];
const TARGET_SIZES: [usize; 4] = [64, 512, 4096, 16384];

/// What one client did
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ClientReport {
    pub scans: u64,
    pub entries: u64,
    pub lookups: u64,
    pub not_found: u64,
    pub too_small: u64,
    pub metadata: u64,
    pub updates: u64,
    pub invalidations: u64,
    pub errors: u64,
}

/// Issue random calls until `stop` is set or the volume stops
pub fn run(client: usize, volume: &Volume, paths: &[String], files: usize, stop: &AtomicBool, seed: u64) -> ClientReport {
    let mut report = ClientReport::default();
    let mut rng = StdRng::seed_from_u64(seed);
    if paths.is_empty() {
        return report;
    }

    while !stop.load(Ordering::Relaxed) {
        let path = &paths[rng.gen_range(0..paths.len())];
        let result = match rng.gen_range(0..10) {
            0..=4 => scan(volume, path, &mut rng, &mut report),
            5 => lookup(volume, path, files, &mut rng, &mut report),
            6 | 7 => query_metadata(volume, path, &mut rng, &mut report),
            8 => update_ea(volume, path, &mut rng, &mut report),
            _ => {
                let node = volume.open_node(path);
                volume.invalidate(&node, MetaKind::DirInfo);
                volume.close_node(&node);
                report.invalidations += 1;
                Ok(())
            }
        };
        match result {
            Ok(()) => {}
            Err(e) if e.is_cancellation() => break,
            Err(e) => {
                debug!("client {client}: {path}: {e}");
                report.errors += 1;
            }
        }
    }
    report
}

fn scan(volume: &Volume, path: &str, rng: &mut StdRng, report: &mut ClientReport) -> Result<()> {
    let query = DirQuery {
        pattern: Some(PATTERNS[rng.gen_range(0..PATTERNS.len())]),
        class: CLASSES[rng.gen_range(0..CLASSES.len())],
        ..DirQuery::default()
    };
    let mut target = vec![0u8; TARGET_SIZES[rng.gen_range(0..TARGET_SIZES.len())]];
    report.scans += 1;
    read_all(volume, path, &query, &mut target, report)
}

fn lookup(volume: &Volume, path: &str, files: usize, rng: &mut StdRng, report: &mut ClientReport) -> Result<()> {
    let name = format!("FILE-{:05}.TXT", rng.gen_range(0..files.max(1)));
    let query = DirQuery {
        pattern: Some(name.as_str()),
        class: DirInfoClass::IdFullDirectory,
        ..DirQuery::default()
    };
    let mut target = vec![0u8; 1024];
    report.lookups += 1;
    read_all(volume, path, &query, &mut target, report)
}

/// Run one scan to its end, growing `target` when an entry does not fit
fn read_all(
    volume: &Volume,
    path: &str,
    query: &DirQuery<'_>,
    target: &mut Vec<u8>,
    report: &mut ClientReport,
) -> Result<()> {
    let mut handle = volume.open_directory(path);
    let result = loop {
        match volume.query_directory(&mut handle, query, target) {
            Ok(len) => report.entries += answer_names(&target[..len], query.class).len() as u64,
            Err(Error::NoMoreEntries) => break Ok(()),
            Err(Error::NoSuchEntry) => {
                report.not_found += 1;
                break Ok(());
            }
            Err(Error::BufferTooSmall { required, .. }) => {
                report.too_small += 1;
                target.resize(required.max(target.len()), 0);
            }
            Err(e) => break Err(e),
        }
    };
    volume.close_directory(handle);
    result
}

fn query_metadata(volume: &Volume, path: &str, rng: &mut StdRng, report: &mut ClientReport) -> Result<()> {
    let node = volume.open_node(path);
    let result = match rng.gen_range(0..3) {
        0 => volume.query_security(&node),
        1 => volume.query_stream_info(&node),
        _ => volume.query_ea(&node),
    };
    volume.close_node(&node);
    report.metadata += 1;
    result.map(|_| ())
}

fn update_ea(volume: &Volume, path: &str, rng: &mut StdRng, report: &mut ClientReport) -> Result<()> {
    let node = volume.open_node(path);
    let value = Bytes::from(format!("user.rev={}", rng.r#gen::<u32>()));
    let result = volume.set_ea(&node, value);
    volume.close_node(&node);
    report.updates += 1;
    result
}
