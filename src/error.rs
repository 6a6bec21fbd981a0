use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("to access device: Permission denied.")]
    PermissionDenied,
    #[error("to find a device in DFU mode.")]
    NoDevice,
    #[error("to watch for devices: libusb lacks hotplug support on this platform.")]
    HotplugUnsupported,
    #[error("because the overwrite blob was to big ({0} bytes, at most 64 allowed).")]
    OverwriteTooBig(usize),
    #[error("because the payload was to big ({0} bytes, at most 65535 allowed).")]
    PayloadTooBig(usize),
    #[error("due to an I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("due an unknown usb error: {0}")]
    UnknownUsbError(rusb::Error),
}

impl From<rusb::Error> for Error {
    fn from(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Access => Error::PermissionDenied,
            rusb::Error::NoDevice | rusb::Error::NotFound => Error::NoDevice,
            err => Error::UnknownUsbError(err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
