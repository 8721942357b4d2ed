//! Transfer engine: one continuously-resubmitted USB IN bulk transfer feeds
//! the PTY master; one PTY-read-fed OUT bulk transfer drains to the device,
//! subject to single-outstanding-write backpressure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nusb::transfer::{Buffer, Bulk, In, Out};
use nusb::{Endpoint, Interface};

use crate::error::Result;
use crate::pty::PtyEndpoint;
use crate::supervisor::BridgeState;

/// Whether exactly one OUT transfer is outstanding at any moment. Touched
/// only by the PTY-reader thread (submit and wait-for-completion happen on
/// the same thread here), but kept atomic so it stays observable from tests
/// and any future cross-thread split.
pub struct TransferPair {
    pub out_in_flight: AtomicBool,
}

impl TransferPair {
    pub fn new() -> Self {
        Self {
            out_in_flight: AtomicBool::new(false),
        }
    }
}

impl Default for TransferPair {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs the IN pipeline: device -> PTY master.
///
/// Submits a chunk-sized IN transfer, waits for completion, writes the
/// received bytes to the PTY master, and resubmits, until `state` leaves
/// `Running`. A PTY write error (e.g. slave closed) is swallowed, matching
/// the original driver's `except OSError: pass`. Any transport error
/// transitions the supervisor to `Disconnected`.
pub fn run_in_pump(
    mut endpoint: Endpoint<Bulk, In>,
    pty: Arc<PtyEndpoint>,
    state: Arc<BridgeState>,
    chunk_size: usize,
) {
    endpoint.submit(endpoint.allocate(chunk_size));

    while state.is_running() {
        let completion = endpoint.wait_next_complete(Duration::from_secs(1));
        let Some(completion) = completion else {
            continue;
        };

        if !state.is_running() {
            break;
        }

        match completion.status {
            Ok(()) => {
                let data = &completion.buffer[..completion.actual_len];
                if !data.is_empty() {
                    if let Err(e) = pty.write(data) {
                        log::debug!("PTY write failed (swallowed): {e}");
                    }
                }
                endpoint.submit(completion.buffer);
            }
            Err(e) => {
                log::warn!("IN transfer failed: {e}");
                state.mark_disconnected();
                break;
            }
        }
    }

    endpoint.cancel_all();
}

/// Runs the OUT pipeline: PTY master -> device.
///
/// Blocks on a PTY read, submits one OUT transfer, and waits for it to
/// complete before reading again -- the single-in-flight backpressure
/// discipline described in the design document.
///
/// On shutdown the supervisor's stop-watcher sets `state` to not-running
/// and then closes the PTY, in that order, which turns the blocking read
/// above into an error; the error is swallowed and the loop goes back to
/// `while state.is_running()`, which is already false by then, so the pump
/// exits instead of reading again.
pub fn run_out_pump(
    interface: &Interface,
    write_ep: u8,
    pty: Arc<PtyEndpoint>,
    state: Arc<BridgeState>,
    pair: Arc<TransferPair>,
    chunk_size: usize,
) -> Result<()> {
    let mut endpoint = interface.endpoint::<Bulk, Out>(write_ep)?;

    let mut buf = vec![0u8; chunk_size];
    while state.is_running() {
        let n = match pty.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                log::debug!("PTY read failed (swallowed): {e}");
                continue;
            }
        };
        if n == 0 {
            continue;
        }

        pair.out_in_flight.store(true, Ordering::SeqCst);
        let mut transfer_buf = Buffer::new(n);
        transfer_buf.extend_from_slice(&buf[..n]);
        endpoint.submit(transfer_buf);

        let completion = endpoint.wait_next_complete(Duration::from_secs(5));
        pair.out_in_flight.store(false, Ordering::SeqCst);

        match completion {
            Some(c) => {
                if let Err(e) = c.status {
                    log::warn!("OUT transfer failed: {e}");
                    state.mark_disconnected();
                    break;
                }
            }
            None => {
                log::warn!("OUT transfer timed out");
                endpoint.cancel_all();
            }
        }
    }

    endpoint.cancel_all();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_in_flight_starts_clear() {
        let pair = TransferPair::new();
        assert!(!pair.out_in_flight.load(Ordering::SeqCst));
    }
}
