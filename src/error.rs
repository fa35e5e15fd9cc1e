use std::io;
use std::net::AddrParseError;
use std::num::ParseIntError;

pub type Result<T> = ::std::result::Result<T, Error>;

/// Every way the engine can fail, grouped by the propagation policy in the
/// design: config/device errors abort startup, everything else halts the
/// offending worker.
#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "invalid configuration: {}", reason)]
    ConfigInvalid { reason: String },

    #[fail(display = "failed to open capture device {}: {}", device, inner)]
    DeviceOpenFailed { device: String, inner: io::Error },

    #[fail(
        display = "failed to open stream {} on device {}: {}",
        stream, device, inner
    )]
    StreamOpenFailed {
        device: String,
        stream: u16,
        inner: String,
    },

    #[fail(
        display = "hardware loss counter non-zero for stream {}: lctr={}",
        stream, lctr
    )]
    HardwareLossDetected { stream: u16, lctr: u16 },

    #[fail(display = "malformed record on stream {}: {}", stream, reason)]
    WalkerMalformedRecord { stream: u16, reason: String },

    #[fail(display = "darknet filter error: {}", reason)]
    FilterError { reason: String },

    #[fail(
        display = "failed to publish datagram for stream {}: {}",
        stream, inner
    )]
    PublishSendFailed { stream: u16, inner: io::Error },

    #[fail(display = "allocation failed growing iovec pool for stream {}", stream)]
    AllocationFailed { stream: u16 },
}

impl From<ParseIntError> for Error {
    fn from(inner: ParseIntError) -> Self {
        Error::ConfigInvalid {
            reason: inner.to_string(),
        }
    }
}

impl From<AddrParseError> for Error {
    fn from(inner: AddrParseError) -> Self {
        Error::ConfigInvalid {
            reason: inner.to_string(),
        }
    }
}
