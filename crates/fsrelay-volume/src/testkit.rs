//! In-process remote used by the volume tests

use crate::dirctl::{QUERY_MARKER_NAME, QUERY_MARKER_OFFSET};
use crate::pattern::{Pattern, dir_order};
use crate::volume::Volume;
use fsrelay_proto::{
    DirListingWriter, FileInfo, REQUEST_HEADER_SIZE, RecordReader, Request, Response, ResponseBuilder,
    align_up,
};
use fsrelay_transact::Mode;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Serves transact round trips on a thread until the volume stops
pub(crate) struct Remote {
    thread: Option<JoinHandle<()>>,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl Remote {
    pub(crate) fn spawn<F>(volume: &Arc<Volume>, reply: F) -> Self
    where
        F: Fn(&Request) -> Response + Send + 'static,
    {
        let volume = Arc::clone(volume);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);
        let thread = thread::spawn(move || {
            let mut inbound = Vec::new();
            let mut outbound = vec![0u8; 64 * 1024];
            while let Ok(outcome) = volume.transact(&inbound, &mut outbound, Mode::Batch) {
                inbound.clear();
                for record in RecordReader::new(&outbound[..outcome.bytes_produced], REQUEST_HEADER_SIZE) {
                    let request = Request::parse(record.unwrap()).unwrap();
                    inbound.resize(align_up(inbound.len()), 0);
                    inbound.extend_from_slice(reply(&request).as_bytes());
                    seen.lock().push(request);
                }
            }
        });
        Self {
            thread: Some(thread),
            requests,
        }
    }

    pub(crate) fn served(&self) -> usize {
        self.requests.lock().len()
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }

    pub(crate) fn shutdown(mut self, volume: &Volume) {
        volume.begin_shutdown();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

pub(crate) fn reply_with(request: &Request, data: &'static [u8]) -> Response {
    ResponseBuilder::new(request.kind(), request.hint())
        .field(0, data)
        .build()
        .unwrap()
}

/// Answer a directory query over `names` (already in directory order).
///
/// Entry `i` carries `i + 1` as its resume token.
pub(crate) fn list_directory(request: &Request, names: &[&str]) -> Response {
    let size = usize::try_from(request.param(0)).unwrap();
    let pattern = request
        .field_str(0)
        .ok()
        .filter(|p| !p.is_empty())
        .map(|p| Pattern::new(p, false));
    let flags = request.param(2);
    let start = if flags & QUERY_MARKER_NAME != 0 {
        let marker = request.field_str(1).unwrap();
        names
            .iter()
            .position(|name| dir_order(name, marker, false) == Ordering::Greater)
            .unwrap_or(names.len())
    } else if flags & QUERY_MARKER_OFFSET != 0 {
        usize::try_from(request.param(1)).unwrap()
    } else {
        0
    };

    let mut writer = DirListingWriter::new(size);
    let mut complete = true;
    for (i, name) in names.iter().enumerate().skip(start) {
        if pattern.as_ref().is_some_and(|p| !p.is_match(name)) {
            continue;
        }
        let info = FileInfo {
            file_size: 100,
            index_number: i as u64 + 1,
            ..FileInfo::default()
        };
        if !writer.push(&info, i as u64 + 1, name) {
            complete = false;
            break;
        }
    }
    let listing = if complete {
        writer.finish_complete()
    } else {
        writer.finish_partial()
    };
    ResponseBuilder::new(request.kind(), request.hint())
        .field(0, listing)
        .build()
        .unwrap()
}
