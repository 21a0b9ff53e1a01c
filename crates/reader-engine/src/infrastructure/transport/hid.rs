//! Raw HID transport: the pull-model backend.
//!
//! # How does a HID card reader talk? (for beginners)
//!
//! USB HID devices exchange fixed-size *reports* (64 bytes for this reader
//! family).  A device message longer than one report is split into a head
//! packet, zero or more middle packets, and a tail packet; see
//! [`reader_core::protocol::packet`] for the layout.  Nothing is pushed to
//! the host by the operating system, so the host must keep reading:
//!
//! ```text
//! hid-read-loop thread
//!  loop {
//!    read_report(timeout = 100 ms)      ── 0 bytes: nothing this time
//!    ReportAssembler::push(report)      ── Some(message) once a tail arrives
//!    decode_device_message(message)     ── DeviceMessage
//!    sink.send(message)                 ── to the EventDispatcher
//!    every liveness_interval: is the reader still enumerated?
//!  }
//! ```
//!
//! The short per-read timeout lets the loop notice a stop request quickly;
//! `disconnect` flips the loop's `running` flag and joins the thread before
//! the device handle is released, so no read ever runs against a closed
//! handle.
//!
//! # Testability
//!
//! The OS HID library sits behind [`HidBackend`] and [`HidReportDevice`].
//! Production builds use `hidapi_backend` (cargo feature `hidapi`); unit
//! tests use the `mockall`-generated `MockHidBackend` and a scripted device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use reader_core::protocol::packet::{validate_report_size, DEFAULT_REPORT_SIZE};
use reader_core::protocol::{encode_reports, ReportAssembler};
use reader_core::{decode_device_message, AmountEncoding, ConnectionState, DeviceMessage};
use tracing::{debug, error, info, warn};

use crate::application::lock;
use crate::application::transport::{
    DeviceId, DeviceInfo, DeviceTransport, EventSink, TransportError,
};

/// Report id prepended to every outbound report.
const REPORT_ID: u8 = 0x00;

/// Pause between non-blocking read attempts in [`poll_read`].
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(2);

// ── Backend seam ──────────────────────────────────────────────────────────────

/// One HID interface as reported by enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidDeviceDescriptor {
    /// Platform path used to open the device.
    pub path: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: Option<String>,
    pub product: Option<String>,
}

impl HidDeviceDescriptor {
    pub fn to_device_info(&self) -> DeviceInfo {
        DeviceInfo {
            id: DeviceId(self.path.clone()),
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            serial_number: self.serial_number.clone().unwrap_or_default(),
            product: self.product.clone().unwrap_or_default(),
        }
    }
}

/// Enumerates and opens HID devices.
#[cfg_attr(test, mockall::automock)]
pub trait HidBackend: Send + Sync {
    /// Lists interfaces with `vendor_id` (and `product_id` when given).
    fn enumerate(
        &self,
        vendor_id: u16,
        product_id: Option<u16>,
    ) -> Result<Vec<HidDeviceDescriptor>, TransportError>;

    fn open(&self, path: &str) -> Result<Box<dyn HidReportDevice>, TransportError>;
}

/// An open HID interface.
pub trait HidReportDevice: Send + Sync {
    /// Writes one report, including its leading report-id byte.
    fn write_report(&self, report: &[u8]) -> Result<usize, TransportError>;

    /// Reads one report into `buf`, waiting at most `timeout_ms`.
    /// Returns `Ok(0)` when the timeout expired with nothing to read.
    fn read_report(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, TransportError>;
}

/// Retries a non-blocking `attempt` until it yields bytes or `timeout`
/// elapses, sleeping `interval` between tries.
///
/// Backends whose handle sits behind a lock read through this so that the
/// lock is only held for one non-blocking call and writers are never queued
/// behind a whole read timeout.  Returns `Ok(0)` on timeout.
pub fn poll_read<F>(timeout: Duration, interval: Duration, mut attempt: F) -> Result<usize, TransportError>
where
    F: FnMut() -> Result<usize, TransportError>,
{
    let deadline = Instant::now() + timeout;
    loop {
        let n = attempt()?;
        if n > 0 {
            return Ok(n);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(0);
        }
        thread::sleep(interval.min(deadline - now));
    }
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// Settings for [`HidTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidTransportConfig {
    pub vendor_id: u16,
    pub product_id: Option<u16>,
    /// Preferred reader when `connect` is called without a device id.
    pub serial_number: Option<String>,
    pub report_size: usize,
    pub read_timeout: Duration,
    pub liveness_interval: Duration,
}

impl Default for HidTransportConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x0801,
            product_id: None,
            serial_number: None,
            report_size: DEFAULT_REPORT_SIZE,
            read_timeout: Duration::from_millis(100),
            liveness_interval: Duration::from_millis(2000),
        }
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

/// What the read loop shares with the transport.
#[derive(Default)]
struct Shared {
    state: Mutex<ConnectionState>,
    sink: Mutex<Option<EventSink>>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *lock(&self.state) = state;
    }

    fn emit(&self, msg: DeviceMessage) {
        match lock(&self.sink).as_ref() {
            Some(sink) => {
                if sink.send(msg).is_err() {
                    debug!("device event receiver closed");
                }
            }
            None => debug!("no subscriber; dropping {} message", msg.category()),
        }
    }
}

struct ReadLoop {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Inner {
    device: Option<Arc<dyn HidReportDevice>>,
    info: Option<DeviceInfo>,
    reader: Option<ReadLoop>,
}

// ── Transport ─────────────────────────────────────────────────────────────────

/// [`DeviceTransport`] over raw HID reports.
pub struct HidTransport {
    backend: Arc<dyn HidBackend>,
    config: HidTransportConfig,
    inner: Mutex<Inner>,
    shared: Arc<Shared>,
}

impl HidTransport {
    /// # Errors
    ///
    /// Returns [`TransportError::Protocol`] if `config.report_size` is out
    /// of range.
    pub fn new(
        backend: Arc<dyn HidBackend>,
        config: HidTransportConfig,
    ) -> Result<Self, TransportError> {
        validate_report_size(config.report_size)?;
        Ok(Self {
            backend,
            config,
            inner: Mutex::new(Inner::default()),
            shared: Arc::new(Shared::default()),
        })
    }

    pub fn config(&self) -> &HidTransportConfig {
        &self.config
    }

    fn select(
        &self,
        candidates: &[HidDeviceDescriptor],
        device: Option<&DeviceId>,
    ) -> Option<HidDeviceDescriptor> {
        let wanted = device
            .cloned()
            .or_else(|| self.config.serial_number.clone().map(DeviceId));
        match wanted {
            Some(id) => candidates
                .iter()
                .find(|d| d.to_device_info().matches(&id))
                .cloned(),
            None => candidates.first().cloned(),
        }
    }

    /// Stops and joins the read loop, then drops the handle.
    fn release(inner: &mut Inner) {
        if let Some(reader) = inner.reader.take() {
            reader.running.store(false, Ordering::Release);
            if reader.handle.join().is_err() {
                error!("HID read loop panicked");
            }
        }
        inner.device = None;
        inner.info = None;
    }

    fn spawn_read_loop(
        &self,
        device: Arc<dyn HidReportDevice>,
        path: String,
    ) -> Result<ReadLoop, TransportError> {
        let running = Arc::new(AtomicBool::new(true));
        let ctx = ReadLoopContext {
            device,
            backend: Arc::clone(&self.backend),
            shared: Arc::clone(&self.shared),
            running: Arc::clone(&running),
            path,
            vendor_id: self.config.vendor_id,
            product_id: self.config.product_id,
            report_size: self.config.report_size,
            read_timeout_ms: i32::try_from(self.config.read_timeout.as_millis())
                .unwrap_or(i32::MAX),
            liveness_interval: self.config.liveness_interval,
        };
        let handle = thread::Builder::new()
            .name("hid-read-loop".to_string())
            .spawn(move || read_loop(ctx))
            .map_err(|e| TransportError::ConnectionFailed(format!("read loop: {e}")))?;
        Ok(ReadLoop { running, handle })
    }
}

impl DeviceTransport for HidTransport {
    fn scan(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        let inner = lock(&self.inner);
        if self.shared.state() == ConnectionState::Connected {
            if let Some(info) = inner.info.as_ref() {
                debug!("scan while connected; reporting {}", info.id);
                return Ok(vec![info.clone()]);
            }
        }
        let found = self
            .backend
            .enumerate(self.config.vendor_id, self.config.product_id)?;
        Ok(found.iter().map(HidDeviceDescriptor::to_device_info).collect())
    }

    fn connect(&self, device: Option<&DeviceId>) -> Result<DeviceInfo, TransportError> {
        let mut inner = lock(&self.inner);
        if self.shared.state() == ConnectionState::Connected {
            if let Some(info) = inner.info.as_ref() {
                return Ok(info.clone());
            }
        }
        // A read loop that declared the device lost leaves its handle behind.
        Self::release(&mut inner);

        self.shared.set_state(ConnectionState::Connecting);
        let result = self
            .backend
            .enumerate(self.config.vendor_id, self.config.product_id)
            .and_then(|candidates| {
                self.select(&candidates, device)
                    .ok_or(TransportError::DeviceNotFound)
            })
            .and_then(|desc| {
                let handle: Arc<dyn HidReportDevice> = Arc::from(self.backend.open(&desc.path)?);
                Ok((desc, handle))
            })
            .and_then(|(desc, handle)| {
                let reader = self.spawn_read_loop(Arc::clone(&handle), desc.path.clone())?;
                Ok((desc, handle, reader))
            });

        match result {
            Ok((desc, handle, reader)) => {
                let info = desc.to_device_info();
                inner.device = Some(handle);
                inner.info = Some(info.clone());
                inner.reader = Some(reader);
                self.shared.set_state(ConnectionState::Connected);
                info!("HID reader {} opened ({})", info.id, info.serial_number);
                self.shared
                    .emit(DeviceMessage::ConnectionState(ConnectionState::Connected));
                Ok(info)
            }
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                warn!("HID connect failed: {e}");
                Err(e)
            }
        }
    }

    fn disconnect(&self) -> Result<(), TransportError> {
        let mut inner = lock(&self.inner);
        if inner.device.is_none() {
            return Ok(());
        }
        if self.shared.state() != ConnectionState::Connected {
            // Already reported as lost by the read loop.
            Self::release(&mut inner);
            return Ok(());
        }

        self.shared.set_state(ConnectionState::Disconnecting);
        Self::release(&mut inner);
        self.shared.set_state(ConnectionState::Disconnected);
        info!("HID reader closed");
        self.shared
            .emit(DeviceMessage::ConnectionState(ConnectionState::Disconnected));
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn send_frame(&self, frame: &[u8]) -> Result<(), TransportError> {
        let inner = lock(&self.inner);
        let device = match (self.shared.state(), inner.device.as_ref()) {
            (ConnectionState::Connected, Some(device)) => device,
            _ => return Err(TransportError::NotConnected),
        };

        let reports = encode_reports(frame, self.config.report_size)?;
        debug!(
            "HID write {} byte frame in {} report(s): {}",
            frame.len(),
            reports.len(),
            hex::encode_upper(frame)
        );
        for report in reports {
            let mut out = Vec::with_capacity(report.len() + 1);
            out.push(REPORT_ID);
            out.extend_from_slice(&report);
            device.write_report(&out)?;
        }
        Ok(())
    }

    fn subscribe(&self, sink: EventSink) {
        *lock(&self.shared.sink) = Some(sink);
    }

    fn unsubscribe(&self) {
        *lock(&self.shared.sink) = None;
    }

    fn amount_encoding(&self) -> AmountEncoding {
        AmountEncoding::MinorUnitsBcd
    }

    fn current_device(&self) -> Option<DeviceInfo> {
        if self.shared.state() != ConnectionState::Connected {
            return None;
        }
        lock(&self.inner).info.clone()
    }
}

impl Drop for HidTransport {
    fn drop(&mut self) {
        Self::release(&mut lock(&self.inner));
    }
}

// ── Read loop ─────────────────────────────────────────────────────────────────

struct ReadLoopContext {
    device: Arc<dyn HidReportDevice>,
    backend: Arc<dyn HidBackend>,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    path: String,
    vendor_id: u16,
    product_id: Option<u16>,
    report_size: usize,
    read_timeout_ms: i32,
    liveness_interval: Duration,
}

impl ReadLoopContext {
    /// `false` only when enumeration succeeds and no longer lists the path.
    fn still_attached(&self) -> bool {
        match self.backend.enumerate(self.vendor_id, self.product_id) {
            Ok(devices) => devices.iter().any(|d| d.path == self.path),
            Err(e) => {
                debug!("liveness enumeration failed: {e}");
                true
            }
        }
    }

    /// Reports the loss unless a disconnect already stopped the loop.
    fn declare_lost(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            warn!("HID reader {} is gone", self.path);
            self.shared.set_state(ConnectionState::Disconnected);
            self.shared
                .emit(DeviceMessage::ConnectionState(ConnectionState::Disconnected));
        }
    }

    fn handle_report(&self, assembler: &mut ReportAssembler, report: &[u8]) {
        match assembler.push(report) {
            Ok(Some(message)) => match decode_device_message(&message) {
                Ok(msg) => self.shared.emit(msg),
                Err(e) => warn!(
                    "undecodable device message ({e}): {}",
                    hex::encode_upper(&message)
                ),
            },
            Ok(None) => {}
            Err(e) => warn!("dropping partial HID message: {e}"),
        }
    }
}

fn read_loop(ctx: ReadLoopContext) {
    let mut buf = vec![0u8; ctx.report_size];
    let mut assembler = ReportAssembler::new();
    let mut last_check = Instant::now();
    debug!("HID read loop started for {}", ctx.path);

    while ctx.running.load(Ordering::Acquire) {
        match ctx.device.read_report(&mut buf, ctx.read_timeout_ms) {
            Ok(0) => {}
            Ok(n) => ctx.handle_report(&mut assembler, &buf[..n]),
            Err(e) => {
                warn!("HID read failed: {e}");
                last_check = Instant::now();
                if !ctx.still_attached() {
                    ctx.declare_lost();
                    break;
                }
                thread::sleep(Duration::from_millis(ctx.read_timeout_ms.max(1) as u64));
                continue;
            }
        }

        if last_check.elapsed() >= ctx.liveness_interval {
            last_check = Instant::now();
            if !ctx.still_attached() {
                ctx.declare_lost();
                break;
            }
        }
    }

    debug!("HID read loop stopped for {}", ctx.path);
}

// ── Tests ─────────────────────────────────────────────────────────────────────
