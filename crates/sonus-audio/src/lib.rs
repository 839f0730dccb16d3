//! sonus-audio: the output device, its backend callback contract, device
//! clock and latency estimate, and the event-delivery thread (component K
//! of the spec).

mod backend;
mod device;
mod error;
mod event;

pub use backend::{Backend, CpalBackend, ErrorSink, PeriodCallback};
pub use device::{Device, DeviceAttributes, DeviceClock};
pub use error::{DeviceError, DeviceResult};
pub use event::{Event, EventCallback, EventKind, EventThread};
