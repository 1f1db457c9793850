use core::sync::atomic::{AtomicBool, Ordering};

use spin::{Mutex, MutexGuard};
use usb_device::control::{Recipient, Request, RequestType};
use usb_device::endpoint::EndpointAddress;

use crate::channel::ChannelManager;
use crate::config::Config;
use crate::control::{ControlRequestContext, SetupData, EP0_BUFFER_SIZE, FEATURE_FUNCTION_SUSPEND};
use crate::dispatch::{CompletionDispatcher, DmaEvent, TransferObserver};
use crate::endpoint::{EndpointConfig, UsbSpeed};
use crate::hal::{AppEvents, DmaEngine, LinkPowerState, RingId, Rtos, UsbDriver, UsbStart};
use crate::power::PowerState;
use crate::{Error, Result};

/// Data path state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No rings, endpoints disabled.
    Disabled,
    /// Rings provisioned and armed.
    Configured,
    /// Configured, but the host suspended the function.
    Suspended,
}

/// Bus level events delivered by the USB driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbEvent {
    /// Pins connected.
    Connect,
    /// Host disconnected.
    Disconnect,
    /// Bus reset.
    Reset,
    /// Host selected a configuration.
    SetConfiguration,
    /// Bus suspended.
    Suspend,
    /// Bus resumed.
    Resume,
    /// An EP0 status phase completed.
    Ep0StatusComplete,
    /// VBus went away.
    VbusRemoved,
}

/// Per-endpoint events delivered by the USB driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointEvent {
    /// The link layer gave up retrying a super speed transfer.
    SuperSpeedRetry,
    /// Anything else. Ignored.
    Other,
}

/// The part of the device both contexts mutate: hardware handles, rings
/// and the completion totals.
///
/// Lives behind the lock in [`SourceSink`]. Nothing done while holding it
/// blocks.
pub struct DataPath<D, U, O = ()> {
    pub(crate) dma: D,
    pub(crate) usb: U,
    pub(crate) state: DeviceState,
    pub(crate) channels: ChannelManager,
    pub(crate) dispatcher: CompletionDispatcher<O>,
    pub(crate) ep0_buffer: [u8; EP0_BUFFER_SIZE],
    pub(crate) log_index: u16,
}

impl<D: DmaEngine, U: UsbDriver, O: TransferObserver> DataPath<D, U, O> {
    fn new(config: Config, dma: D, usb: U, observer: O) -> Self {
        DataPath {
            dma,
            usb,
            state: DeviceState::Disabled,
            channels: ChannelManager::new(config),
            dispatcher: CompletionDispatcher::new(observer),
            ep0_buffer: [0; EP0_BUFFER_SIZE],
            log_index: 0,
        }
    }

    /// Disabled to Configured. Endpoint programming failures are returned;
    /// a ring provisioning failure leaves the path Disabled until the next
    /// configuration.
    fn start(&mut self, config: &Config) -> Result<()> {
        let speed = self.usb.speed();
        let packet_size = speed.max_packet_size()?;
        self.enable_endpoints(config, speed)?;

        if let Err(err) = self
            .channels
            .setup_channels(&mut self.dma, packet_size, speed)
        {
            log::error!("data path not started: {}", err);
            return self.disable_endpoints();
        }
        self.channels.start_transfers(&mut self.dma)?;
        self.channels.preload(&mut self.dma)?;

        self.state = DeviceState::Configured;
        log::info!("data path active, {:?} speed, {} byte packets", speed, packet_size);
        Ok(())
    }

    /// Configured (or Suspended) to Disabled.
    fn stop(&mut self) -> Result<()> {
        self.state = DeviceState::Disabled;
        self.channels.teardown_channels(&mut self.dma);
        self.disable_endpoints()?;
        log::info!("data path stopped");
        Ok(())
    }

    fn enable_endpoints(&mut self, config: &Config, speed: UsbSpeed) -> Result<()> {
        let ep_config = EndpointConfig::bulk(speed, config.burst_length)?;
        ep_config.check(speed)?;
        for ep in self.channels.endpoints() {
            self.usb.configure_endpoint(ep, &ep_config)?;
        }
        for ep in self.channels.endpoints() {
            self.usb.flush_endpoint(ep)?;
        }
        Ok(())
    }

    fn disable_endpoints(&mut self) -> Result<()> {
        for ep in self.channels.endpoints() {
            self.usb.flush_endpoint(ep)?;
        }
        for ep in self.channels.endpoints() {
            self.usb.configure_endpoint(ep, &EndpointConfig::disabled())?;
        }
        Ok(())
    }

    /// Bring one endpoint and its ring back from a halt. Other rings keep running.
    fn recover_endpoint<R: Rtos>(
        &mut self,
        rtos: &R,
        settle_us: u32,
        ep: EndpointAddress,
        id: RingId,
    ) -> Result<()> {
        self.usb.set_endpoint_nak(ep, true)?;
        rtos.busy_wait_us(settle_us);

        let ring = self.channels.ring_mut(id)?;
        ring.reset(&mut self.dma)?;
        self.usb.flush_endpoint(ep)?;
        self.usb.reset_endpoint(ep)?;
        self.usb.set_endpoint_nak(ep, false)?;
        ring.arm(&mut self.dma)?;
        self.usb.stall(ep, false, true)?;
        self.usb.ack_setup();

        if ring.is_source() {
            ring.preload(&mut self.dma)?;
        }
        Ok(())
    }

    pub(crate) fn send_ep0(&mut self, data: &[u8]) {
        if let Err(err) = self.usb.send_ep0_data(data) {
            log::warn!("EP0 data phase failed: {}", err);
        }
    }

    /// Data path state.
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Whether rings exist and endpoints are armed.
    pub fn is_active(&self) -> bool {
        self.state != DeviceState::Disabled
    }

    /// Rings of the current configuration.
    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    /// Completion totals and the observer.
    pub fn dispatcher(&self) -> &CompletionDispatcher<O> {
        &self.dispatcher
    }

    /// DMA engine.
    pub fn dma(&self) -> &D {
        &self.dma
    }

    /// DMA engine.
    pub fn dma_mut(&mut self) -> &mut D {
        &mut self.dma
    }

    /// USB driver.
    pub fn usb(&self) -> &U {
        &self.usb
    }

    /// USB driver.
    pub fn usb_mut(&mut self) -> &mut U {
        &mut self.usb
    }
}

/// Vendor bulk source/sink device.
///
/// Shared by the two execution contexts through `&self`. The platform glue
/// forwards hardware callbacks to the `on_*` methods and runs
/// [`run`](SourceSink::run) on the application thread.
///
/// The callbacks take the [`DataPath`] lock for the few driver calls they
/// make. The application thread takes it only inside
/// [`Rtos::critical_section`] and never while sleeping or waiting for
/// events, so a callback is never held up by a blocked thread.
pub struct SourceSink<D, U, R, O = ()> {
    pub(crate) rtos: R,
    pub(crate) config: Config,
    pub(crate) path: Mutex<DataPath<D, U, O>>,
    pub(crate) control: ControlRequestContext,
    pub(crate) power: PowerState,
    pub(crate) transfer_started: AtomicBool,
    pub(crate) flush_consumer: AtomicBool,
}

impl<D: DmaEngine, U: UsbDriver, R: Rtos> SourceSink<D, U, R> {
    /// Create the device. Nothing touches the hardware until [`init`](Self::init).
    pub fn new(config: Config, dma: D, usb: U, rtos: R) -> Result<Self> {
        Self::with_observer(config, dma, usb, rtos, ())
    }
}

impl<D: DmaEngine, U: UsbDriver, R: Rtos, O: TransferObserver> SourceSink<D, U, R, O> {
    /// Create the device with an observer of every completion.
    pub fn with_observer(config: Config, dma: D, usb: U, rtos: R, observer: O) -> Result<Self> {
        config.validate()?;
        Ok(SourceSink {
            rtos,
            config,
            path: Mutex::new(DataPath::new(config, dma, usb, observer)),
            control: ControlRequestContext::new(),
            power: PowerState::new(),
            transfer_started: AtomicBool::new(false),
            flush_consumer: AtomicBool::new(false),
        })
    }

    /// Run `f` on the data path from the application thread.
    pub(crate) fn with_path<T>(&self, f: impl FnOnce(&mut DataPath<D, U, O>) -> T) -> T {
        self.rtos.critical_section(|| f(&mut *self.path.lock()))
    }

    /// Start the USB stack and connect to the host. Application thread.
    pub fn init(&self) {
        let start = self.with_path(|path| -> Result<UsbStart> {
            let start = path.usb.start()?;
            path.usb.register_descriptors()?;
            Ok(start)
        });
        let start = match start {
            Ok(start) => start,
            Err(err) => self.fatal(err),
        };

        match start {
            UsbStart::AlreadyEnumerated => {
                log::info!("already enumerated, starting data path");
                self.with_path(|path| self.start_data_path(path));
            }
            UsbStart::Started => {
                if let Err(err) = self.with_path(|path| path.usb.connect(true, true)) {
                    self.fatal(err);
                }
                log::info!("USB connected");
            }
        }
    }

    /// Stop the data path, disconnect and stop the USB stack. Application thread.
    pub fn deinit(&self) {
        let res = self.with_path(|path| {
            self.stop_if_active(path);
            path.usb.connect(false, true)
        });
        if let Err(err) = res {
            self.fatal(err);
        }
        self.rtos.sleep_ms(1000);
        if let Err(err) = self.with_path(|path| path.usb.stop()) {
            self.fatal(err);
        }
        self.rtos.sleep_ms(1000);
        log::info!("USB stopped");
    }

    /// Handle a bus level event.
    pub fn on_usb_event(&self, event: UsbEvent) {
        log::debug!("usb event {:?}", event);
        match event {
            UsbEvent::SetConfiguration => {
                let mut path = self.path.lock();
                self.stop_if_active(&mut path);
                self.start_data_path(&mut path);
            }
            UsbEvent::Reset | UsbEvent::Disconnect => {
                self.power.set_force_link_u2(false);
                self.stop_if_active(&mut self.path.lock());
                self.transfer_started.store(false, Ordering::Relaxed);
            }
            UsbEvent::Ep0StatusComplete => self.control.note_status_complete(),
            UsbEvent::VbusRemoved => {
                if self.power.on_vbus_removed() {
                    log::info!("VBus removed, standby pending");
                }
            }
            UsbEvent::Connect | UsbEvent::Suspend | UsbEvent::Resume => {}
        }
    }

    /// Handle a setup packet the USB driver did not handle itself.
    ///
    /// Returns whether the request was taken. Vendor requests are only
    /// queued here and run later on the application thread.
    pub fn on_setup(&self, setup: SetupData) -> bool {
        let req = setup.request();

        match (req.request_type, req.recipient) {
            (RequestType::Standard, Recipient::Interface)
                if (req.request == Request::SET_FEATURE
                    || req.request == Request::CLEAR_FEATURE)
                    && req.value == FEATURE_FUNCTION_SUSPEND =>
            {
                self.function_suspend(req.request == Request::SET_FEATURE);
                true
            }
            (RequestType::Standard, Recipient::Endpoint)
                if req.request == Request::CLEAR_FEATURE
                    && req.value == Request::FEATURE_ENDPOINT_HALT =>
            {
                self.clear_halt(EndpointAddress::from(req.index as u8))
            }
            (RequestType::Vendor, Recipient::Device) => {
                self.control.store(setup);
                self.rtos.set_events(AppEvents::CONTROL_TASK);
                true
            }
            _ => false,
        }
    }

    /// Handle an endpoint event.
    pub fn on_endpoint_event(&self, ep: EndpointAddress, event: EndpointEvent) {
        if event == EndpointEvent::SuperSpeedRetry {
            log::debug!("ep {:#04x}: retry limit, flush pending", u8::from(ep));
            self.flush_consumer.store(true, Ordering::Release);
        }
    }

    /// Handle a DMA completion on `ring`.
    pub fn on_dma_event(&self, ring: RingId, event: DmaEvent) {
        self.transfer_started.store(true, Ordering::Relaxed);
        {
            let mut guard = self.path.lock();
            let path = &mut *guard;
            if let Err(err) = path
                .dispatcher
                .handle(&mut path.channels, &mut path.dma, ring, event)
            {
                log::warn!("ring {}: {:?} dropped: {}", ring.0, event, err);
            }

            // data is moving, keep the link in U0 for a while
            path.usb.lpm_disable();
        }
        self.rtos.restart_idle_timer(self.config.lpm_timeout_ms);
    }

    /// The idle timer expired without a completion.
    pub fn on_idle_timeout(&self) {
        self.path.lock().usb.lpm_enable();
    }

    /// The host asks to enter a low power link state. Always accepted.
    pub fn on_lpm_request(&self, _state: LinkPowerState) -> bool {
        true
    }

    fn function_suspend(&self, suspend: bool) {
        let mut path = self.path.lock();
        if !path.is_active() {
            log::warn!("function suspend while not configured");
            path.usb.stall_ep0();
            return;
        }
        path.usb.ack_setup();

        // one interface only, the link may go to U2 as soon as it is suspended
        if suspend {
            self.transfer_started.store(false, Ordering::Relaxed);
            self.power.set_force_link_u2(true);
            path.state = DeviceState::Suspended;
        } else {
            self.power.set_force_link_u2(false);
            path.state = DeviceState::Configured;
        }
    }

    fn clear_halt(&self, ep: EndpointAddress) -> bool {
        let mut path = self.path.lock();
        if !path.is_active() {
            return false;
        }
        let Some(ring) = path.channels.ring_for_endpoint(ep) else {
            return false;
        };
        if let Err(err) = path.recover_endpoint(&self.rtos, self.config.halt_settle_us, ep, ring) {
            self.fatal(err);
        }
        log::info!("ep {:#04x}: halt cleared", u8::from(ep));
        true
    }

    pub(crate) fn start_data_path(&self, path: &mut DataPath<D, U, O>) {
        if let Err(err) = path.start(&self.config) {
            self.fatal(err);
        }
    }

    pub(crate) fn stop_if_active(&self, path: &mut DataPath<D, U, O>) {
        if !path.is_active() {
            return;
        }
        // nothing left to keep the link awake for
        self.rtos.stop_idle_timer();
        if let Err(err) = path.stop() {
            self.fatal(err);
        }
    }

    pub(crate) fn fatal(&self, err: Error) -> ! {
        self.rtos.halt(err)
    }

    /// Lock the data path.
    ///
    /// Callbacks arriving meanwhile spin on the lock, so keep the guard
    /// short lived and never hold it across a blocking call.
    pub fn data_path(&self) -> MutexGuard<'_, DataPath<D, U, O>> {
        self.path.lock()
    }

    /// Data path state.
    pub fn state(&self) -> DeviceState {
        self.path.lock().state
    }

    /// Whether rings exist and endpoints are armed.
    pub fn is_active(&self) -> bool {
        self.path.lock().is_active()
    }

    /// Whether a completion was seen since the last enumeration or suspend.
    pub fn transfer_started(&self) -> bool {
        self.transfer_started.load(Ordering::Relaxed)
    }

    /// Firmware configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Power flags.
    pub fn power(&self) -> &PowerState {
        &self.power
    }

    /// Control request handoff.
    pub fn control(&self) -> &ControlRequestContext {
        &self.control
    }

    /// RTOS.
    pub fn rtos(&self) -> &R {
        &self.rtos
    }
}
