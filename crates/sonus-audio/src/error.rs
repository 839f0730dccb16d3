//! Device-layer error type (component K). Backend (`cpal`) failures are
//! wrapped here rather than leaked across the public API, matching how
//! the engine's own `SonusError` never names a backend type.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("no output device available")]
    NoDevice,

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("no supported stream configuration for the requested attributes")]
    UnsupportedConfig,

    #[error("failed to build output stream: {0}")]
    StreamBuildError(String),

    #[error("stream control error: {0}")]
    StreamError(String),

    #[error("device is not open")]
    NotOpen,

    #[error("device has been disconnected")]
    Disconnected,
}

pub type DeviceResult<T> = Result<T, DeviceError>;
