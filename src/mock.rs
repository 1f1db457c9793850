//! Recording fakes of the hardware traits for unit tests.
//!
//! Every fake pushes into one shared [`Trace`] so tests can assert the order
//! of calls across DMA, USB and RTOS.

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use usb_device::endpoint::EndpointAddress;

use crate::endpoint::{EndpointConfig, UsbSpeed};
use crate::hal::{
    AppEvents, ChannelSpec, DmaBuffer, DmaEngine, LinkPowerState, Notification, RingId, Rtos,
    TransferSize, UsbDriver, UsbStart,
};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateChannel(RingId),
    DestroyChannel(RingId),
    SetTransferSize(RingId),
    Acquire(RingId),
    Commit(RingId, usize),
    Discard(RingId),
    ResetChannel(RingId),

    UsbStart,
    UsbStop,
    RegisterDescriptors,
    Connect(bool, bool),
    ConfigureEndpoint(u8, bool),
    FlushEndpoint(u8),
    ResetEndpoint(u8),
    Nak(u8, bool),
    Stall(u8, bool, bool),
    AckSetup,
    StallEp0,
    SendEp0(Vec<u8>),
    ReceiveEp0,
    LpmEnable,
    LpmDisable,
    SetLinkPowerState(LinkPowerState),
    RemoteWakeup,
    FunctionWake,
    JumpToBooter,
    ResetDevice,
    EnterStandby,

    SetEvents(AppEvents),
    Sleep(u32),
    BusyWait(u32),
    RestartIdleTimer(u32),
    StopIdleTimer,
}

#[derive(Debug, Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<Call>>>);

impl Trace {
    fn lock(&self) -> MutexGuard<'_, Vec<Call>> {
        self.0.lock().unwrap()
    }

    pub fn push(&self, call: Call) {
        self.lock().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.lock().iter().filter(|c| pred(c)).count()
    }

    pub fn position(&self, call: &Call) -> Option<usize> {
        self.lock().iter().position(|c| c == call)
    }

    pub fn last_position(&self, call: &Call) -> Option<usize> {
        self.lock().iter().rposition(|c| c == call)
    }
}

struct MockChannel {
    spec: ChannelSpec,
    buffers: Vec<Vec<u8>>,
    /// Buffers with firmware, unused.
    free: VecDeque<usize>,
    /// Sink buffers filled by the host, with firmware.
    filled: VecDeque<(usize, usize)>,
    /// Buffers with the hardware, with their valid length.
    in_flight: VecDeque<(usize, usize)>,
    acquired: Option<usize>,
    sent: Vec<Vec<u8>>,
}

impl MockChannel {
    fn is_sink(&self) -> bool {
        self.spec.notification == Notification::Produce
    }
}

pub struct MockDma {
    trace: Trace,
    channels: BTreeMap<u8, MockChannel>,
    pub fail_create: Option<RingId>,
    pub fail_discard: bool,
    pub fail_commit: Option<RingId>,
}

impl MockDma {
    pub fn new(trace: Trace) -> Self {
        MockDma {
            trace,
            channels: BTreeMap::new(),
            fail_create: None,
            fail_discard: false,
            fail_commit: None,
        }
    }

    pub fn exists(&self, ring: RingId) -> bool {
        self.channels.contains_key(&ring.0)
    }

    pub fn spec(&self, ring: RingId) -> Option<ChannelSpec> {
        self.channels.get(&ring.0).map(|c| c.spec)
    }

    pub fn in_flight(&self, ring: RingId) -> usize {
        self.channels.get(&ring.0).map_or(0, |c| c.in_flight.len())
    }

    /// Everything committed on a source channel so far, oldest first.
    pub fn sent(&self, ring: RingId) -> Vec<Vec<u8>> {
        self.channels.get(&ring.0).map_or_else(Vec::new, |c| c.sent.clone())
    }

    /// Host sends a packet on the sink channel. False if no buffer was armed.
    pub fn host_write(&mut self, ring: RingId, data: &[u8]) -> bool {
        let Some(ch) = self.channels.get_mut(&ring.0) else {
            return false;
        };
        let Some((idx, _)) = ch.in_flight.pop_front() else {
            return false;
        };
        let len = data.len().min(ch.spec.size);
        ch.buffers[idx][..len].copy_from_slice(&data[..len]);
        ch.filled.push_back((idx, len));
        true
    }

    /// Host reads a packet from a source channel.
    pub fn host_read(&mut self, ring: RingId) -> Option<Vec<u8>> {
        let ch = self.channels.get_mut(&ring.0)?;
        let (idx, len) = ch.in_flight.pop_front()?;
        ch.free.push_back(idx);
        Some(ch.buffers[idx][..len].to_vec())
    }
}

impl DmaEngine for MockDma {
    fn create_channel(&mut self, ring: RingId, spec: &ChannelSpec) -> Result<()> {
        self.trace.push(Call::CreateChannel(ring));
        if self.fail_create == Some(ring) {
            return Err(Error::ResourceExhausted);
        }
        self.channels.insert(
            ring.0,
            MockChannel {
                spec: *spec,
                buffers: vec![vec![0; spec.size]; spec.count],
                free: (0..spec.count).collect(),
                filled: VecDeque::new(),
                in_flight: VecDeque::new(),
                acquired: None,
                sent: Vec::new(),
            },
        );
        Ok(())
    }

    fn destroy_channel(&mut self, ring: RingId) {
        self.trace.push(Call::DestroyChannel(ring));
        self.channels.remove(&ring.0);
    }

    fn set_transfer_size(&mut self, ring: RingId, _size: TransferSize) -> Result<()> {
        self.trace.push(Call::SetTransferSize(ring));
        let ch = self.channels.get_mut(&ring.0).ok_or(Error::Hardware(0x40))?;
        if ch.is_sink() {
            while let Some(idx) = ch.free.pop_front() {
                ch.in_flight.push_back((idx, 0));
            }
        }
        Ok(())
    }

    fn acquire_buffer(&mut self, ring: RingId) -> Result<DmaBuffer<'_>> {
        self.trace.push(Call::Acquire(ring));
        let ch = self.channels.get_mut(&ring.0).ok_or(Error::Hardware(0x40))?;
        let (idx, count) = if ch.is_sink() {
            *ch.filled.front().ok_or(Error::NotReady)?
        } else {
            let idx = match ch.acquired {
                Some(idx) => idx,
                None => ch.free.pop_front().ok_or(Error::NotReady)?,
            };
            (idx, 0)
        };
        ch.acquired = Some(idx);
        Ok(DmaBuffer {
            data: &mut ch.buffers[idx],
            count,
        })
    }

    fn commit_buffer(&mut self, ring: RingId, len: usize) -> Result<()> {
        self.trace.push(Call::Commit(ring, len));
        if self.fail_commit == Some(ring) {
            return Err(Error::Hardware(0x43));
        }
        let ch = self.channels.get_mut(&ring.0).ok_or(Error::Hardware(0x40))?;
        let idx = ch.acquired.take().ok_or(Error::Hardware(0x41))?;
        ch.sent.push(ch.buffers[idx][..len].to_vec());
        ch.in_flight.push_back((idx, len));
        Ok(())
    }

    fn discard_buffer(&mut self, ring: RingId) -> Result<()> {
        self.trace.push(Call::Discard(ring));
        if self.fail_discard {
            return Err(Error::Hardware(0x42));
        }
        let ch = self.channels.get_mut(&ring.0).ok_or(Error::Hardware(0x40))?;
        let (idx, _) = ch.filled.pop_front().ok_or(Error::Hardware(0x41))?;
        ch.acquired = None;
        ch.in_flight.push_back((idx, 0));
        Ok(())
    }

    fn reset_channel(&mut self, ring: RingId) -> Result<()> {
        self.trace.push(Call::ResetChannel(ring));
        let ch = self.channels.get_mut(&ring.0).ok_or(Error::Hardware(0x40))?;
        ch.free = (0..ch.spec.count).collect();
        ch.filled.clear();
        ch.in_flight.clear();
        ch.acquired = None;
        Ok(())
    }
}

pub struct MockUsb {
    trace: Trace,
    pub speed: UsbSpeed,
    pub start_result: UsbStart,
    pub link_state: LinkPowerState,
    pub ep0_out: Vec<u8>,
    pub event_log: Vec<u8>,
    pub event_log_index: u16,
    pub register_value: Option<u32>,
    pub booter_version: Option<(u8, u8, u8)>,
    pub fail_configure: bool,
    pub fail_function_wake: bool,
    pub configured: BTreeMap<u8, EndpointConfig>,
}

impl MockUsb {
    pub fn new(trace: Trace) -> Self {
        MockUsb {
            trace,
            speed: UsbSpeed::High,
            start_result: UsbStart::Started,
            link_state: LinkPowerState::U0,
            ep0_out: Vec::new(),
            event_log: Vec::new(),
            event_log_index: 0,
            register_value: None,
            booter_version: None,
            fail_configure: false,
            fail_function_wake: false,
            configured: BTreeMap::new(),
        }
    }
}

impl UsbDriver for MockUsb {
    fn start(&mut self) -> Result<UsbStart> {
        self.trace.push(Call::UsbStart);
        Ok(self.start_result)
    }

    fn stop(&mut self) -> Result<()> {
        self.trace.push(Call::UsbStop);
        Ok(())
    }

    fn register_descriptors(&mut self) -> Result<()> {
        self.trace.push(Call::RegisterDescriptors);
        Ok(())
    }

    fn connect(&mut self, connect: bool, super_speed: bool) -> Result<()> {
        self.trace.push(Call::Connect(connect, super_speed));
        Ok(())
    }

    fn speed(&self) -> UsbSpeed {
        self.speed
    }

    fn configure_endpoint(&mut self, ep: EndpointAddress, config: &EndpointConfig) -> Result<()> {
        self.trace.push(Call::ConfigureEndpoint(u8::from(ep), config.enable));
        if self.fail_configure {
            return Err(Error::Hardware(0x45));
        }
        self.configured.insert(u8::from(ep), *config);
        Ok(())
    }

    fn flush_endpoint(&mut self, ep: EndpointAddress) -> Result<()> {
        self.trace.push(Call::FlushEndpoint(u8::from(ep)));
        Ok(())
    }

    fn reset_endpoint(&mut self, ep: EndpointAddress) -> Result<()> {
        self.trace.push(Call::ResetEndpoint(u8::from(ep)));
        Ok(())
    }

    fn set_endpoint_nak(&mut self, ep: EndpointAddress, nak: bool) -> Result<()> {
        self.trace.push(Call::Nak(u8::from(ep), nak));
        Ok(())
    }

    fn stall(&mut self, ep: EndpointAddress, stall: bool, toggle: bool) -> Result<()> {
        self.trace.push(Call::Stall(u8::from(ep), stall, toggle));
        Ok(())
    }

    fn ack_setup(&mut self) {
        self.trace.push(Call::AckSetup);
    }

    fn stall_ep0(&mut self) {
        self.trace.push(Call::StallEp0);
    }

    fn send_ep0_data(&mut self, data: &[u8]) -> Result<()> {
        self.trace.push(Call::SendEp0(data.to_vec()));
        Ok(())
    }

    fn receive_ep0_data(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.trace.push(Call::ReceiveEp0);
        let len = self.ep0_out.len().min(buf.len());
        buf[..len].copy_from_slice(&self.ep0_out[..len]);
        Ok(len)
    }

    fn lpm_enable(&mut self) {
        self.trace.push(Call::LpmEnable);
    }

    fn lpm_disable(&mut self) {
        self.trace.push(Call::LpmDisable);
    }

    fn link_power_state(&self) -> Result<LinkPowerState> {
        Ok(self.link_state)
    }

    fn set_link_power_state(&mut self, state: LinkPowerState) -> Result<()> {
        self.trace.push(Call::SetLinkPowerState(state));
        self.link_state = state;
        Ok(())
    }

    fn remote_wakeup(&mut self) -> Result<()> {
        self.trace.push(Call::RemoteWakeup);
        Ok(())
    }

    fn function_wake(&mut self) -> Result<()> {
        self.trace.push(Call::FunctionWake);
        if self.fail_function_wake {
            return Err(Error::Hardware(0x46));
        }
        Ok(())
    }

    fn event_log(&self) -> &[u8] {
        &self.event_log
    }

    fn event_log_index(&self) -> u16 {
        self.event_log_index
    }

    fn read_register(&self, _address: u32) -> Result<u32> {
        self.register_value.ok_or(Error::Hardware(0x47))
    }

    fn booter_version(&self) -> Result<(u8, u8, u8)> {
        self.booter_version.ok_or(Error::Hardware(0x48))
    }

    fn jump_to_booter(&mut self) -> Error {
        self.trace.push(Call::JumpToBooter);
        Error::Hardware(0x49)
    }

    fn reset_device(&mut self) -> Error {
        self.trace.push(Call::ResetDevice);
        Error::Hardware(0x4a)
    }

    fn enter_standby(&mut self) -> Error {
        self.trace.push(Call::EnterStandby);
        Error::Hardware(0x4b)
    }
}

/// Parks the next `sleep_ms` caller until the test lets it go.
struct SleepGate {
    entered: Sender<u32>,
    resume: Receiver<()>,
}

pub struct MockRtos {
    trace: Trace,
    /// Events handed out by the next `wait_events`.
    pending: Mutex<AppEvents>,
    gate: Mutex<Option<SleepGate>>,
}

impl MockRtos {
    pub fn new(trace: Trace) -> Self {
        MockRtos {
            trace,
            pending: Mutex::new(AppEvents::empty()),
            gate: Mutex::new(None),
        }
    }

    /// Raise events without recording a call.
    pub fn post(&self, events: AppEvents) {
        *self.pending.lock().unwrap() |= events;
    }

    pub fn pending(&self) -> AppEvents {
        *self.pending.lock().unwrap()
    }

    /// The next `sleep_ms` reports its duration on `entered` and blocks
    /// until `resume` receives.
    pub fn park_next_sleep(&self, entered: Sender<u32>, resume: Receiver<()>) {
        *self.gate.lock().unwrap() = Some(SleepGate { entered, resume });
    }
}

impl Rtos for MockRtos {
    fn set_events(&self, events: AppEvents) {
        self.trace.push(Call::SetEvents(events));
        self.post(events);
    }

    fn wait_events(&self, mask: AppEvents, _timeout_ms: u32) -> AppEvents {
        let mut pending = self.pending.lock().unwrap();
        let events = *pending & mask;
        pending.remove(events);
        events
    }

    fn sleep_ms(&self, ms: u32) {
        self.trace.push(Call::Sleep(ms));
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.entered.send(ms);
            let _ = gate.resume.recv();
        }
    }

    fn busy_wait_us(&self, us: u32) {
        self.trace.push(Call::BusyWait(us));
    }

    fn restart_idle_timer(&self, ms: u32) {
        self.trace.push(Call::RestartIdleTimer(ms));
    }

    fn stop_idle_timer(&self) {
        self.trace.push(Call::StopIdleTimer);
    }

    fn halt(&self, error: Error) -> ! {
        panic!("halted: {}", error);
    }
}
