//! Reader backends.
//!
//! - **`hid`** – [`hid::HidTransport`], a pull-model transport that polls a
//!   USB HID reader from a dedicated read thread and reassembles reports into
//!   messages.  It talks to the hardware through the [`hid::HidBackend`]
//!   seam so it can be tested without a device.
//! - **`hidapi_backend`** – the `hidapi`-backed [`hid::HidBackend`]
//!   (cargo feature `hidapi`).
//! - **`mock`** – [`mock::MockTransport`], a push-model reader simulation
//!   that answers commands synchronously, the way a vendor SDK callback does.

pub mod hid;
#[cfg(feature = "hidapi")]
pub mod hidapi_backend;
pub mod mock;

pub use hid::{HidBackend, HidDeviceDescriptor, HidReportDevice, HidTransport, HidTransportConfig};
pub use mock::MockTransport;
