//! Lifecycle supervisor: the state machine coordinating device arrival and
//! departure, USB open/close, driver init, and PTY lifetime.
//!
//! The original design (and the distilled spec) describe a single
//! libusb-style event-pump thread that dispatches both hotplug notifications
//! and transfer completion callbacks. `nusb`'s safe API exposes hotplug as
//! its own blocking-iterable stream and bulk completions as their own
//! per-endpoint blocking waits, with no call that multiplexes both. This
//! bridge therefore runs a dedicated hotplug-watcher thread alongside the
//! IN-pump and PTY-reader, forwarding events to the supervisor over a
//! channel; every invariant on worker exit and on "IN always armed while
//! Running" holds identically. See DESIGN.md.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nusb::hotplug::HotplugEvent;
use nusb::transfer::{Bulk, In};
use nusb::{DeviceId, DeviceInfo, MaybeFuture};

use crate::driver::Driver;
use crate::error::{Error, ErrorKind, Result};
use crate::params::{DeviceAddress, SerialParams};
use crate::pty::PtyEndpoint;
use crate::transfer::{self, TransferPair};

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    WaitingForDevice = 0,
    Opening = 1,
    Running = 2,
    Disconnected = 3,
    Stopping = 4,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::WaitingForDevice,
            1 => State::Opening,
            2 => State::Running,
            3 => State::Disconnected,
            _ => State::Stopping,
        }
    }
}

/// Atomic wrapper around [`State`], shared lock-free between the supervisor
/// and worker threads. Workers observe it once per iteration and relinquish
/// on `Stopping`/`Disconnected`.
pub struct BridgeState {
    inner: AtomicU8,
}

impl BridgeState {
    fn new() -> Self {
        Self {
            inner: AtomicU8::new(State::WaitingForDevice as u8),
        }
    }

    fn set(&self, s: State) {
        self.inner.store(s as u8, Ordering::SeqCst);
    }

    fn get(&self) -> State {
        State::from_u8(self.inner.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.get() == State::Running
    }

    pub fn mark_disconnected(&self) {
        self.set(State::Disconnected);
    }
}

enum HotplugMsg {
    Connected(DeviceInfo),
    Disconnected(DeviceId),
}

/// Coordinates device arrival/departure, driver init, the transfer engine,
/// and PTY lifetime. The supervisor exclusively owns the USB session, PTY
/// endpoint, and transfer pair for their entire lifetimes; worker threads
/// hold only non-owning handles guarded by [`BridgeState`].
pub struct Supervisor {
    address: DeviceAddress,
    published_path: PathBuf,
    driver: Box<dyn Driver>,
    params: SerialParams,
    state: Arc<BridgeState>,
}

impl Supervisor {
    pub fn new(
        address: DeviceAddress,
        published_path: PathBuf,
        driver: Box<dyn Driver>,
        params: SerialParams,
    ) -> Self {
        Self {
            address,
            published_path,
            driver,
            params,
            state: Arc::new(BridgeState::new()),
        }
    }

    /// Run the bridge until `stop` is set. Returns once the PTY has been
    /// cleaned up and all workers have exited.
    ///
    /// The PTY is created once here and lives for the whole call: it
    /// survives every `Disconnected` gap untouched (symlink and fds intact,
    /// so a consumer holding the slave open sees no interruption) and is
    /// only closed on the way out, when the bridge is actually stopping.
    pub fn run(mut self, stop: Arc<AtomicBool>) -> Result<()> {
        let pty = Arc::new(PtyEndpoint::create(&self.published_path)?);

        let (tx, rx) = mpsc::channel();
        let watch = nusb::watch_devices().map_err(Error::from)?;
        let hotplug_thread = {
            let tx = tx.clone();
            thread::spawn(move || {
                for event in futures_lite::stream::block_on(watch) {
                    let msg = match event {
                        HotplugEvent::Connected(info) => HotplugMsg::Connected(info),
                        HotplugEvent::Disconnected(id) => HotplugMsg::Disconnected(id),
                    };
                    if tx.send(msg).is_err() {
                        return;
                    }
                }
            })
        };

        // Force `BridgeState` out of `Running` promptly on a stop request so
        // the IN-pump and PTY-reader, which only poll `BridgeState`, notice
        // even while blocked inside `open_and_run`. Also force-close the
        // PTY: a PTY-reader thread parked in a blocking `read` only ever
        // wakes on data or on its fd closing, and `BridgeState` alone can't
        // reach it there.
        let stop_watcher = {
            let stop = Arc::clone(&stop);
            let state = Arc::clone(&self.state);
            let pty = Arc::clone(&pty);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    thread::sleep(Duration::from_millis(200));
                }
                state.set(State::Stopping);
                pty.close();
            })
        };

        // Pick up a device already connected before the watch started.
        if let Some(info) = self.find_device()? {
            let _ = tx.send(HotplugMsg::Connected(info));
        }

        loop {
            if stop.load(Ordering::SeqCst) {
                break;
            }

            match rx.recv_timeout(Duration::from_secs(1)) {
                Ok(HotplugMsg::Connected(info)) => {
                    if info.vendor_id() == self.address.vendor_id
                        && info.product_id() == self.address.product_id
                        && self.state.get() == State::WaitingForDevice
                    {
                        self.state.set(State::Opening);
                        // open_and_run blocks this thread for the session's
                        // duration; disconnect is detected by the transfer
                        // pumps themselves, not by a queued hotplug message,
                        // so there is nothing to reconcile against `rx` here.
                        match self.open_and_run(Arc::clone(&pty), info) {
                            Ok(()) => {}
                            Err(e) => {
                                e.log_error();
                            }
                        }
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        self.state.set(State::WaitingForDevice);
                    }
                }
                Ok(HotplugMsg::Disconnected(_id)) => {}
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.state.set(State::Stopping);
        pty.close();
        drop(tx);
        let _ = hotplug_thread.join();
        let _ = stop_watcher.join();
        Ok(())
    }

    fn find_device(&self) -> Result<Option<DeviceInfo>> {
        let devices = nusb::list_devices().wait().map_err(Error::from)?;
        Ok(devices.into_iter().find(|d| {
            d.vendor_id() == self.address.vendor_id && d.product_id() == self.address.product_id
        }))
    }

    /// Opens the device, runs driver init, and runs the transfer engine
    /// against the already-open `pty` until disconnect or stop is
    /// requested.
    fn open_and_run(&mut self, pty: Arc<PtyEndpoint>, info: DeviceInfo) -> Result<()> {
        let device = info.open().wait().map_err(Error::from)?;
        let ifnum = self.driver.interface_number();
        let _ = device.detach_kernel_driver(ifnum);
        let interface = device.claim_interface(ifnum).wait().map_err(Error::from)?;

        self.driver
            .init(&interface, &self.params)
            .map_err(|e| Error::with_source(ErrorKind::Init, "driver init failed", e))?;

        let endpoints = self.driver.endpoints();
        let in_endpoint = interface.endpoint::<Bulk, In>(endpoints.read_ep)?;
        let pair = Arc::new(TransferPair::new());

        self.state.set(State::Running);
        log::info!(
            "bridge running: {} -> {}",
            self.address,
            self.published_path.display()
        );

        let in_pty = Arc::clone(&pty);
        let in_state = Arc::clone(&self.state);
        let chunk_size = endpoints.chunk_size;
        let in_thread = thread::spawn(move || {
            transfer::run_in_pump(in_endpoint, in_pty, in_state, chunk_size);
        });

        let out_result = {
            let out_pty = Arc::clone(&pty);
            let out_state = Arc::clone(&self.state);
            transfer::run_out_pump(&interface, endpoints.write_ep, out_pty, out_state, pair, chunk_size)
        };

        if self.state.get() == State::Running {
            self.state.mark_disconnected();
        }

        let _ = in_thread.join();
        out_result?;

        Ok(())
    }
}
