//! USB primitives for driving the checkm8 exploit from the host side.

use crate::{Error, Result};
use rusb::{Context, Device, DeviceHandle, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::{
    cmp,
    collections::{HashMap, VecDeque},
    sync::mpsc::{self, Receiver, Sender},
    time::Duration,
};

/// Direction bit of `bmRequestType`, set for device-to-host requests.
pub const DIR_IN: u8 = 0x80;

/// Timeout for a single control transfer flushed by [`RusbHost`].
///
/// Kept short: several requests of the exploit are expected to stall.
const TRANSFER_TIMEOUT: Duration = Duration::from_millis(100);

/// The setup phase of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl ControlRequest {
    pub const fn new(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> Self {
        ControlRequest {
            request_type,
            request,
            value,
            index,
            length,
        }
    }

    /// Returns `true` if the data phases of this request move data from
    /// the device to the host.
    #[inline(always)]
    pub fn is_in(&self) -> bool {
        self.request_type & DIR_IN != 0
    }
}

/// The parts of a device descriptor needed to recognize the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub vendor_id: u16,
    pub product_id: u16,
    /// `iSerialNumber`, zero if the device has no serial number string.
    pub serial_number_index: u8,
}

/// Attach and detach notifications, identified by device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Attached(u8),
    Detached(u8),
}

/// The host stack the exploit runs on.
///
/// Transfers are only enqueued; a host makes progress on them whenever
/// [`pump`](HostStack::pump) is called. Attach and detach notifications
/// seen while pumping are queued until [`poll_event`](HostStack::poll_event)
/// drains them, so they are never observed in the middle of a stage.
pub trait HostStack {
    /// Synchronously retrieves the device descriptor of the device at `address`.
    fn device_descriptor(&mut self, address: u8) -> Result<DeviceDescriptor>;

    /// Enqueues the setup phase of a control transfer to endpoint 0.
    fn enqueue_setup(&mut self, address: u8, request: ControlRequest);

    /// Enqueues a data phase for the most recently enqueued setup phase.
    ///
    /// For host-to-device requests the buffer is sent, otherwise it
    /// receives the data.
    fn enqueue_data(&mut self, buffer: &mut [u8]);

    /// Gives the host stack an opportunity to make progress. Never blocks.
    ///
    /// Data phases enqueued after a pump still belong to the last setup phase.
    fn pump(&mut self);

    /// Hands over every transfer enqueued so far. Called once a stage is done.
    fn flush(&mut self);

    /// Pops the oldest queued attach/detach notification.
    fn poll_event(&mut self) -> Option<DeviceEvent>;
}

/// Issues control transfers against endpoint 0 of a single device.
///
/// Nothing is pumped implicitly; the caller decides when the host stack
/// has to catch up.
pub struct Sequencer<'a, H: HostStack + ?Sized> {
    host: &'a mut H,
    address: u8,
}

impl<'a, H: HostStack + ?Sized> Sequencer<'a, H> {
    pub fn new(host: &'a mut H, address: u8) -> Self {
        Sequencer { host, address }
    }

    /// Enqueues a setup phase without any data attached.
    pub fn issue_setup(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        length: u16,
    ) {
        let request = ControlRequest::new(request_type, request, value, index, length);
        self.host.enqueue_setup(self.address, request);
    }

    /// Enqueues a data phase of up to `length` bytes of `buffer`.
    pub fn issue_data(&mut self, buffer: &mut [u8], length: usize) {
        let length = cmp::min(length, buffer.len());
        self.host.enqueue_data(&mut buffer[..length]);
    }

    pub fn pump(&mut self) {
        self.host.pump();
    }

    pub fn flush(&mut self) {
        self.host.flush();
    }
}

/// A notification forwarded from the libusb hotplug callback.
enum Notification {
    Arrived(Device<Context>),
    Left(Device<Context>),
}

struct Watcher {
    sender: Sender<Notification>,
}

impl Hotplug<Context> for Watcher {
    fn device_arrived(&mut self, device: Device<Context>) {
        let _ = self.sender.send(Notification::Arrived(device));
    }

    fn device_left(&mut self, device: Device<Context>) {
        let _ = self.sender.send(Notification::Left(device));
    }
}

/// A control transfer whose data phases are still being collected.
struct PendingTransfer {
    address: u8,
    request: ControlRequest,
    data: Vec<u8>,
}

/// A control transfer ready to be handed to libusb.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WireTransfer {
    pub address: u8,
    pub request: ControlRequest,
    /// Exactly `request.length` bytes for host-to-device requests, empty otherwise.
    pub data: Vec<u8>,
}

/// Collects the data phases of the most recent setup phase.
///
/// libusb takes `wLength` from the length of the buffer it sends, so the
/// collected data is cut or zero filled to the declared length. Data beyond
/// the declared length never reaches the device.
#[derive(Default)]
pub(crate) struct TransferAssembler {
    pending: Option<PendingTransfer>,
}

impl TransferAssembler {
    /// Starts a new transfer and returns the previous one, which is complete now.
    pub fn setup(&mut self, address: u8, request: ControlRequest) -> Option<WireTransfer> {
        let previous = self.finish();
        self.pending = Some(PendingTransfer {
            address,
            request,
            data: Vec::new(),
        });
        previous
    }

    pub fn data(&mut self, buffer: &[u8]) {
        match self.pending.as_mut() {
            Some(transfer) if !transfer.request.is_in() => transfer.data.extend_from_slice(buffer),
            Some(_) => {}
            None => debug!("Dropped", "data phase without a setup phase"),
        }
    }

    /// Completes the pending transfer, if any.
    pub fn finish(&mut self) -> Option<WireTransfer> {
        let transfer = self.pending.take()?;
        let request = transfer.request;
        let mut data = transfer.data;

        if request.is_in() {
            data.clear();
        } else {
            let length = request.length as usize;
            if data.len() > length {
                debug!(
                    "Truncated",
                    "{} surplus bytes of {:x?}",
                    data.len() - length,
                    request
                );
            }
            data.resize(length, 0);
        }

        Some(WireTransfer {
            address: transfer.address,
            request,
            data,
        })
    }
}

/// Devices known to libusb, keyed by their address.
///
/// Addresses are only unique per bus. A single device is kept per address:
/// an arrival on another bus replaces the known device, and a departure
/// only removes the device if it was on the same bus.
struct DeviceTable<D> {
    entries: HashMap<u8, (u8, D)>,
}

impl<D> DeviceTable<D> {
    fn new() -> Self {
        DeviceTable {
            entries: HashMap::new(),
        }
    }

    /// Returns the bus of a replaced device on another bus.
    fn insert(&mut self, bus: u8, address: u8, device: D) -> Option<u8> {
        match self.entries.insert(address, (bus, device)) {
            Some((previous, _)) if previous != bus => Some(previous),
            _ => None,
        }
    }

    fn remove(&mut self, bus: u8, address: u8) -> bool {
        match self.entries.get(&address) {
            Some((known, _)) if *known == bus => self.entries.remove(&address).is_some(),
            _ => false,
        }
    }

    fn get(&self, address: u8) -> Option<&D> {
        self.entries.get(&address).map(|(_, device)| device)
    }
}

/// A [`HostStack`] on top of libusb.
///
/// libusb cannot issue setup and data phases separately, so the data phases
/// of the last setup are collected and sent as one control transfer once the
/// next setup is enqueued or the host is flushed. Pumping leaves a transfer
/// in progress alone. Transfer errors are ignored.
pub struct RusbHost {
    context: Context,
    notifications: Receiver<Notification>,
    _registration: Registration<Context>,
    devices: DeviceTable<Device<Context>>,
    /// Handles are opened when the first transfer to a device is sent.
    handles: HashMap<u8, DeviceHandle<Context>>,
    events: VecDeque<DeviceEvent>,
    assembler: TransferAssembler,
}

impl RusbHost {
    /// Creates a new libusb context and starts watching for devices.
    ///
    /// Devices which are already connected are reported as attached on
    /// the first pump.
    pub fn new() -> Result<Self> {
        // Fails with an error instead of the panic `has_hotplug` raises
        // when libusb can not be initialized.
        let context = Context::new()?;
        if !rusb::has_hotplug() {
            return Err(Error::HotplugUnsupported);
        }

        let (sender, notifications) = mpsc::channel();
        let watcher: Box<dyn Hotplug<Context>> = Box::new(Watcher { sender });
        let registration = HotplugBuilder::new()
            .enumerate(true)
            .register(&context, watcher)?;

        Ok(RusbHost {
            context,
            notifications,
            _registration: registration,
            devices: DeviceTable::new(),
            handles: HashMap::new(),
            events: VecDeque::new(),
            assembler: TransferAssembler::default(),
        })
    }

    /// Returns the open handle to the device at `address`, opening it if needed.
    fn handle(&mut self, address: u8) -> Option<&DeviceHandle<Context>> {
        if !self.handles.contains_key(&address) {
            let device = self.devices.get(address)?;
            match device.open() {
                Ok(handle) => {
                    self.handles.insert(address, handle);
                }
                Err(err) => {
                    debug!("Open", "device {} failed: {}", address, err);
                    return None;
                }
            }
        }

        self.handles.get(&address)
    }

    fn send(&mut self, transfer: WireTransfer) {
        let request = transfer.request;
        let handle = match self.handle(transfer.address) {
            Some(handle) => handle,
            None => return,
        };

        let result = if request.is_in() {
            let mut buffer = vec![0; request.length as usize];
            handle.read_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                &mut buffer,
                TRANSFER_TIMEOUT,
            )
        } else {
            handle.write_control(
                request.request_type,
                request.request,
                request.value,
                request.index,
                &transfer.data,
                TRANSFER_TIMEOUT,
            )
        };

        if let Err(err) = result {
            debug!("Transfer", "{:x?} failed: {}", request, err);
        }
    }

    fn receive_notifications(&mut self) {
        while let Ok(notification) = self.notifications.try_recv() {
            match notification {
                Notification::Arrived(device) => {
                    let (bus, address) = (device.bus_number(), device.address());
                    if let Some(previous) = self.devices.insert(bus, address, device) {
                        warn!(
                            "Replaced",
                            "device at address {} on bus {} by one on bus {}",
                            address,
                            previous,
                            bus
                        );
                        self.handles.remove(&address);
                    }
                    self.events.push_back(DeviceEvent::Attached(address));
                }
                Notification::Left(device) => {
                    let (bus, address) = (device.bus_number(), device.address());
                    if self.devices.remove(bus, address) {
                        self.handles.remove(&address);
                    }
                    self.events.push_back(DeviceEvent::Detached(address));
                }
            }
        }
    }
}

impl HostStack for RusbHost {
    fn device_descriptor(&mut self, address: u8) -> Result<DeviceDescriptor> {
        let device = self.devices.get(address).ok_or(Error::NoDevice)?;
        let descriptor = device.device_descriptor()?;

        Ok(DeviceDescriptor {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            serial_number_index: descriptor.serial_number_string_index().unwrap_or(0),
        })
    }

    fn enqueue_setup(&mut self, address: u8, request: ControlRequest) {
        if let Some(transfer) = self.assembler.setup(address, request) {
            self.send(transfer);
        }
    }

    fn enqueue_data(&mut self, buffer: &mut [u8]) {
        self.assembler.data(buffer);
    }

    fn pump(&mut self) {
        if let Err(err) = self.context.handle_events(Some(Duration::from_millis(0))) {
            debug!("Events", "handling failed: {}", err);
        }
        self.receive_notifications();
    }

    fn flush(&mut self) {
        if let Some(transfer) = self.assembler.finish() {
            self.send(transfer);
        }
    }

    fn poll_event(&mut self) -> Option<DeviceEvent> {
        self.events.pop_front()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Op, RecordingHost};
    use super::*;

    #[test]
    fn test_request_direction() {
        assert!(ControlRequest::new(0x80, 6, 0x0303, 0x040A, 0x80).is_in());
        assert!(ControlRequest::new(0xA1, 3, 0, 0, 6).is_in());
        assert!(!ControlRequest::new(0x21, 1, 0, 0, 0x40).is_in());
        assert!(!ControlRequest::new(0x00, 0, 0, 0, 0x40).is_in());
    }

    #[test]
    fn test_sequencer_targets_address() {
        let mut host = RecordingHost::new();
        let mut seq = Sequencer::new(&mut host, 7);
        seq.issue_setup(0x21, 1, 0, 0, 0x40);

        assert_eq!(
            host.ops,
            [Op::Setup(7, ControlRequest::new(0x21, 1, 0, 0, 0x40))]
        );
    }

    #[test]
    fn test_sequencer_does_not_pump() {
        let mut host = RecordingHost::new();
        let mut seq = Sequencer::new(&mut host, 0);
        seq.issue_setup(0x21, 1, 0, 0, 0x40);
        seq.issue_data(&mut [0x41; 0x40], 0x40);
        assert_eq!(host.pumps(), 0);

        let mut seq = Sequencer::new(&mut host, 0);
        seq.pump();
        assert_eq!(host.pumps(), 1);
    }

    #[test]
    fn test_sequencer_data_length() {
        let mut host = RecordingHost::new();
        let mut seq = Sequencer::new(&mut host, 0);
        let mut buffer = [0x41; 0x40];
        seq.issue_data(&mut buffer, 10);
        seq.issue_data(&mut buffer, 0x100);

        assert_eq!(host.data_phases(), [&[0x41; 10][..], &[0x41; 0x40][..]]);
    }

    #[test]
    fn test_recording_host_scheduled_events() {
        let mut host = RecordingHost::new();
        host.schedule(2, DeviceEvent::Detached(1));

        host.pump();
        assert_eq!(host.poll_event(), None);
        host.pump();
        assert_eq!(host.poll_event(), Some(DeviceEvent::Detached(1)));
        assert_eq!(host.poll_event(), None);
    }

    const DNLOAD: ControlRequest = ControlRequest::new(0x21, 1, 0, 0, 150);

    #[test]
    fn test_assembler_collects_stream_across_pumps() {
        // The host is pumped between chunks; only the next setup or a
        // flush completes the transfer.
        let mut assembler = TransferAssembler::default();
        assert_eq!(assembler.setup(1, DNLOAD), None);
        assembler.data(&[0x5A; 64]);
        assembler.data(&[0x5A; 64]);
        assembler.data(&[0x5A; 22]);

        let transfer = assembler.finish().unwrap();
        assert_eq!(transfer.address, 1);
        assert_eq!(transfer.request, DNLOAD);
        assert_eq!(transfer.data, vec![0x5A; 150]);
        assert_eq!(assembler.finish(), None);
    }

    #[test]
    fn test_assembler_keeps_declared_length() {
        let mut assembler = TransferAssembler::default();
        let request = ControlRequest::new(0x21, 1, 0, 0, 0x40);
        assembler.setup(0, request);
        assembler.data(&[0x41; 0x40]);
        assembler.data(&[0x42; 0x40]);

        let transfer = assembler.setup(0, ControlRequest::new(0x21, 1, 0, 0, 0)).unwrap();
        assert_eq!(transfer.data, vec![0x41; 0x40]);

        // Nothing supplied for a zero length request, short data is zero filled.
        let transfer = assembler.setup(0, DNLOAD).unwrap();
        assert!(transfer.data.is_empty());
        assembler.data(&[0x1; 10]);
        let transfer = assembler.finish().unwrap();
        assert_eq!(transfer.data.len(), DNLOAD.length as usize);
        assert_eq!(&transfer.data[..10], &[0x1; 10]);
        assert!(transfer.data[10..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_assembler_in_request_sends_nothing() {
        let mut assembler = TransferAssembler::default();
        let request = ControlRequest::new(0xA1, 3, 0, 0, 6);
        assembler.setup(0, request);
        assembler.data(&[0xFF; 6]);

        let transfer = assembler.finish().unwrap();
        assert_eq!(transfer.request, request);
        assert!(transfer.data.is_empty());
    }

    #[test]
    fn test_assembler_drops_data_without_setup() {
        let mut assembler = TransferAssembler::default();
        assembler.data(&[0x1; 64]);
        assert_eq!(assembler.finish(), None);
    }

    #[test]
    fn test_device_table_buses() {
        let mut devices = DeviceTable::new();
        assert_eq!(devices.insert(1, 5, "first"), None);
        assert_eq!(devices.insert(1, 5, "again"), None);
        assert_eq!(devices.insert(2, 5, "second"), Some(1));
        assert_eq!(devices.get(5), Some(&"second"));

        // A departure on another bus leaves the known device alone.
        assert!(!devices.remove(1, 5));
        assert_eq!(devices.get(5), Some(&"second"));
        assert!(devices.remove(2, 5));
        assert_eq!(devices.get(5), None);
    }

    #[test]
    fn test_rusb_host_new_reports_errors() {
        // Without a usable libusb this must fail with an error, not a panic.
        if let Err(err) = RusbHost::new() {
            assert!(!err.to_string().is_empty());
        }
    }
}
