//! Remote transactor threads
//!
//! Each worker plays the remote side of the transport: it hands back the
//! responses to the previous batch and receives the next batch of
//! requests in the same round trip.

use crate::memfs::{MemFs, error_response};
use fsrelay_common::Error;
use fsrelay_proto::{REQUEST_HEADER_SIZE, RecordReader, Request, align_up};
use fsrelay_transact::Mode;
use fsrelay_volume::Volume;
use serde::Serialize;
use tracing::{debug, warn};

/// What one worker did before the volume stopped
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct WorkerReport {
    pub round_trips: u64,
    pub requests: u64,
    pub responses: u64,
    pub bad_records: u64,
    pub outbound_grown: u64,
}

/// Serve round trips until the volume stops
pub fn serve(worker: usize, volume: &Volume, fs: &MemFs, mode: Mode, outbound_bytes: usize) -> WorkerReport {
    let mut report = WorkerReport::default();
    let mut inbound = Vec::new();
    let mut outbound = vec![0u8; outbound_bytes];

    loop {
        let outcome = match volume.transact(&inbound, &mut outbound, mode) {
            Ok(outcome) => outcome,
            Err(Error::Stopped) => break,
            Err(Error::BufferTooSmall { required, .. }) => {
                // responses were delivered; only the request did not fit
                inbound.clear();
                let len = required.max(outbound.len() * 2);
                debug!("worker {worker}: outbound buffer grown to {len} bytes");
                outbound.resize(len, 0);
                report.outbound_grown += 1;
                continue;
            }
            Err(e) => {
                warn!("worker {worker}: transact failed: {e}");
                inbound.clear();
                continue;
            }
        };
        report.round_trips += 1;
        inbound.clear();

        for record in RecordReader::new(&outbound[..outcome.bytes_produced], REQUEST_HEADER_SIZE) {
            let request = match record.and_then(Request::parse) {
                Ok(request) => request,
                Err(e) => {
                    warn!("worker {worker}: dropping request record: {e}");
                    report.bad_records += 1;
                    continue;
                }
            };
            report.requests += 1;
            let response = fs
                .handle(&request)
                .or_else(|e| error_response(&request, &e));
            match response {
                Ok(response) => {
                    inbound.resize(align_up(inbound.len()), 0);
                    inbound.extend_from_slice(response.as_bytes());
                    report.responses += 1;
                }
                Err(e) => warn!("worker {worker}: no reply for {:?}: {e}", request.hint()),
            }
        }
    }

    debug!("worker {worker} stopped after {} round trips", report.round_trips);
    report
}
