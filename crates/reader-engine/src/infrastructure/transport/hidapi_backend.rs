//! [`HidBackend`] over the system HID library (`hidapi` crate).
//!
//! Only compiled with the `hidapi` cargo feature, since it links against
//! `libhidapi` / `hid.dll` / IOKit.

use std::ffi::CString;
use std::sync::Mutex;
use std::time::Duration;

use hidapi::{HidApi, HidDevice};

use crate::application::lock;
use crate::application::transport::TransportError;
use crate::infrastructure::transport::hid::{
    poll_read, HidBackend, HidDeviceDescriptor, HidReportDevice, READ_POLL_INTERVAL,
};

/// Owns the process-wide `HidApi` context.
pub struct HidApiBackend {
    api: Mutex<HidApi>,
}

impl HidApiBackend {
    /// # Errors
    ///
    /// Returns [`TransportError::Unsupported`] when the HID library cannot
    /// be initialised.
    pub fn new() -> Result<Self, TransportError> {
        let api = HidApi::new().map_err(|e| TransportError::Unsupported(format!("hidapi: {e}")))?;
        Ok(Self {
            api: Mutex::new(api),
        })
    }
}

impl HidBackend for HidApiBackend {
    fn enumerate(
        &self,
        vendor_id: u16,
        product_id: Option<u16>,
    ) -> Result<Vec<HidDeviceDescriptor>, TransportError> {
        let mut api = lock(&self.api);
        api.refresh_devices()
            .map_err(|e| TransportError::Io(format!("HID enumeration failed: {e}")))?;

        Ok(api
            .device_list()
            .filter(|d| d.vendor_id() == vendor_id)
            .filter(|d| product_id.map_or(true, |pid| d.product_id() == pid))
            .map(|d| HidDeviceDescriptor {
                path: d.path().to_string_lossy().into_owned(),
                vendor_id: d.vendor_id(),
                product_id: d.product_id(),
                serial_number: d.serial_number().map(str::to_string),
                product: d.product_string().map(str::to_string),
            })
            .collect())
    }

    fn open(&self, path: &str) -> Result<Box<dyn HidReportDevice>, TransportError> {
        let c_path = CString::new(path)
            .map_err(|_| TransportError::ConnectionFailed(format!("invalid HID path {path:?}")))?;
        let device = lock(&self.api)
            .open_path(&c_path)
            .map_err(|e| TransportError::ConnectionFailed(format!("{path}: {e}")))?;
        Ok(Box::new(HidApiDevice {
            device: Mutex::new(device),
        }))
    }
}

/// An open `hidapi` device handle.
struct HidApiDevice {
    device: Mutex<HidDevice>,
}

impl HidReportDevice for HidApiDevice {
    fn write_report(&self, report: &[u8]) -> Result<usize, TransportError> {
        lock(&self.device)
            .write(report)
            .map_err(|e| TransportError::Io(format!("HID write failed: {e}")))
    }

    fn read_report(&self, buf: &mut [u8], timeout_ms: i32) -> Result<usize, TransportError> {
        // One non-blocking read per lock so writes interleave with the loop.
        let timeout = Duration::from_millis(u64::try_from(timeout_ms).unwrap_or(0));
        poll_read(timeout, READ_POLL_INTERVAL, || {
            lock(&self.device)
                .read_timeout(buf, 0)
                .map_err(|e| TransportError::Io(format!("HID read failed: {e}")))
        })
    }
}
