//! In-memory remote file system answering transact requests

use bytes::Bytes;
use fsrelay_common::{Error, OpKind, Result, Status};
use fsrelay_proto::{DirListingWriter, FileInfo, Request, Response, ResponseBuilder};
use fsrelay_volume::{Pattern, QUERY_MARKER_NAME, QUERY_MARKER_OFFSET, dir_order};
use parking_lot::RwLock;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

const DEFAULT_SECURITY: &[u8] = b"O:BAG:BAD:(A;;FA;;;WD)";
const DEFAULT_STREAMS: &[u8] = b"::$DATA";

#[derive(Debug, Clone)]
struct MemEntry {
    name: String,
    info: FileInfo,
}

/// Directories of generated entries plus per-path security and EAs
#[derive(Debug, Default)]
pub struct MemFs {
    /// Directory path to entries in directory order
    dirs: HashMap<String, Vec<MemEntry>>,
    security: RwLock<HashMap<String, Bytes>>,
    eas: RwLock<HashMap<String, Bytes>>,
    served: AtomicU64,
}

impl MemFs {
    /// Build `dirs` directories of `files` entries each
    pub fn generate(dirs: usize, files: usize, rng: &mut impl Rng) -> Self {
        let mut fs = Self::default();
        for d in 0..dirs {
            let mut entries = vec![
                MemEntry {
                    name: ".".into(),
                    info: directory_info(0),
                },
                MemEntry {
                    name: "..".into(),
                    info: directory_info(0),
                },
            ];
            for f in 0..files {
                let ext = ["txt", "log", "dat", "Cfg"][rng.gen_range(0..4)];
                entries.push(MemEntry {
                    name: format!("file-{f:05}.{ext}"),
                    info: FileInfo {
                        file_attributes: FileInfo::ATTRIBUTE_ARCHIVE,
                        file_size: rng.gen_range(0..1 << 20),
                        allocation_size: 4096,
                        hard_links: 1,
                        ..FileInfo::default()
                    },
                });
            }
            entries.sort_by(|a, b| dir_order(&a.name, &b.name, false));
            for (i, entry) in entries.iter_mut().enumerate() {
                entry.info.index_number = i as u64 + 1;
            }
            fs.dirs.insert(format!("/dir-{d}"), entries);
        }
        fs
    }

    /// Paths of every directory
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.dirs.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Requests answered so far
    pub fn served(&self) -> u64 {
        self.served.load(AtomicOrdering::Relaxed)
    }

    /// Answer one request
    pub fn handle(&self, request: &Request) -> Result<Response> {
        self.served.fetch_add(1, AtomicOrdering::Relaxed);
        let reply = ResponseBuilder::new(request.kind(), request.hint());
        let path = request.file_name()?;
        let result = match request.kind() {
            OpKind::QueryDirectory => self.query_directory(path, request).map(Some),
            OpKind::QuerySecurity => Ok(Some(read_blob(&self.security, path, DEFAULT_SECURITY))),
            OpKind::QueryEa => Ok(Some(read_blob(&self.eas, path, b""))),
            OpKind::QueryStreamInformation => Ok(Some(Bytes::from_static(DEFAULT_STREAMS))),
            OpKind::SetSecurity => write_blob(&self.security, path, request),
            OpKind::SetEa => write_blob(&self.eas, path, request),
            _ => Ok(None),
        };
        match result {
            Ok(Some(data)) => reply.information(data.len() as u64).field(0, data).build(),
            Ok(None) => reply.build(),
            Err(status) => reply.status(status).build(),
        }
    }

    fn query_directory(&self, path: &str, request: &Request) -> std::result::Result<Bytes, Status> {
        let Some(entries) = self.dirs.get(path) else {
            return Err(Status::OBJECT_NAME_NOT_FOUND);
        };
        let size = usize::try_from(request.param(0)).map_err(|_| Status::INVALID_PARAMETER)?;
        let pattern = request
            .field_str(0)
            .map_err(|_| Status::INVALID_PARAMETER)?
            .to_string();
        let pattern = (!pattern.is_empty()).then(|| Pattern::new(&pattern, false));

        let flags = request.param(2);
        let start = if flags & QUERY_MARKER_NAME != 0 {
            let marker = request.field_str(1).map_err(|_| Status::INVALID_PARAMETER)?;
            entries
                .iter()
                .position(|e| dir_order(&e.name, marker, false) == Ordering::Greater)
                .unwrap_or(entries.len())
        } else if flags & QUERY_MARKER_OFFSET != 0 {
            usize::try_from(request.param(1)).unwrap_or(usize::MAX)
        } else {
            0
        };

        let mut writer = DirListingWriter::new(size);
        for (i, entry) in entries.iter().enumerate().skip(start) {
            if pattern.as_ref().is_some_and(|p| !p.is_match(&entry.name)) {
                continue;
            }
            if !writer.push(&entry.info, i as u64 + 1, &entry.name) {
                if writer.is_empty() {
                    return Err(Status::BUFFER_OVERFLOW);
                }
                return Ok(writer.finish_partial());
            }
        }
        Ok(writer.finish_complete())
    }
}

fn directory_info(index: u64) -> FileInfo {
    FileInfo {
        file_attributes: FileInfo::ATTRIBUTE_DIRECTORY,
        hard_links: 1,
        index_number: index,
        ..FileInfo::default()
    }
}

fn read_blob(map: &RwLock<HashMap<String, Bytes>>, path: &str, default: &'static [u8]) -> Bytes {
    map.read()
        .get(path)
        .cloned()
        .unwrap_or_else(|| Bytes::from_static(default))
}

fn write_blob(
    map: &RwLock<HashMap<String, Bytes>>,
    path: &str,
    request: &Request,
) -> std::result::Result<Option<Bytes>, Status> {
    let data = request
        .field(0)
        .map_err(|_| Status::INVALID_PARAMETER)?;
    map.write().insert(path.to_string(), Bytes::copy_from_slice(data));
    Ok(None)
}

/// Map a failed answer onto a status reply
pub fn error_response(request: &Request, error: &Error) -> Result<Response> {
    ResponseBuilder::new(request.kind(), request.hint())
        .status(error.status())
        .build()
}
