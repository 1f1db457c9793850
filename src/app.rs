//! Application thread: deferred control requests and housekeeping.
//!
//! Sleeps and event waits happen with the data path unlocked; each driver
//! call sequence in between takes the lock through
//! [`Rtos::critical_section`].

use core::sync::atomic::Ordering;

use heapless::Vec;

use crate::control::{SetupData, VendorRequest, EP0_BUFFER_SIZE};
use crate::device::SourceSink;
use crate::dispatch::TransferObserver;
use crate::endpoint::UsbSpeed;
use crate::hal::{AppEvents, DmaEngine, LinkPowerState, Rtos, UsbDriver};
use crate::Result;

/// Largest slice of the driver event log one vendor read returns.
pub const MAX_LOG_READ: usize = 512;

const ECHO_TAG: [u8; 2] = [1, 5];

impl<D: DmaEngine, U: UsbDriver, R: Rtos, O: TransferObserver> SourceSink<D, U, R, O> {
    /// Run the application loop forever.
    pub fn run(&self) -> ! {
        loop {
            self.run_once();
        }
    }

    /// One pass of the application loop.
    pub fn run_once(&self) {
        let events = self.rtos.wait_events(
            AppEvents::CONTROL_TASK | AppEvents::HOST_WAKE_TASK,
            self.config.event_wait_ms,
        );

        if events.contains(AppEvents::HOST_WAKE_TASK) {
            self.wake_host();
        }
        if events.contains(AppEvents::CONTROL_TASK) {
            if let Some(setup) = self.control.take() {
                self.handle_vendor_request(setup);
            }
        }

        if self.flush_consumer.load(Ordering::Acquire) {
            self.flush_consumer.store(false, Ordering::Relaxed);
            // stalled so the host resets the pipe
            let ep = self.config.consumer_ep;
            if let Err(err) = self.with_path(|path| path.usb.stall(ep, true, false)) {
                self.fatal(err);
            }
        }

        self.push_link_to_u2();

        if self.power.take_standby_trigger() {
            self.enter_standby();
        } else {
            self.drain_event_log();
        }
    }

    fn wake_host(&self) {
        self.rtos.sleep_ms(1000);
        let res = self.with_path(|path| {
            if path.usb.speed() == UsbSpeed::Super {
                path.usb.function_wake()
            } else {
                path.usb.remote_wakeup()
            }
        });
        match res {
            Ok(()) => log::info!("host wakeup signalled"),
            Err(err) => log::warn!("host wakeup failed: {}", err),
        }
    }

    fn push_link_to_u2(&self) {
        while self.power.force_link_u2() {
            let res = self.with_path(|path| match path.usb.link_power_state() {
                Ok(LinkPowerState::U0) => Some(path.usb.set_link_power_state(LinkPowerState::U2)),
                _ => None,
            });
            match res {
                Some(Ok(())) => self.rtos.sleep_ms(5),
                Some(Err(err)) => {
                    log::warn!("U2 request failed: {}", err);
                    break;
                }
                None => break,
            }
        }
    }

    fn enter_standby(&self) -> ! {
        log::info!("entering standby");
        let res = self.with_path(|path| -> Result<()> {
            path.usb.connect(false, true)?;
            path.usb.stop()
        });
        if let Err(err) = res {
            self.fatal(err);
        }
        self.rtos.sleep_ms(self.config.standby_settle_ms);
        let err = self.with_path(|path| path.usb.enter_standby());
        self.fatal(err)
    }

    /// Emit every driver log byte written since the last call. Returns how many.
    pub(crate) fn drain_event_log(&self) -> usize {
        self.with_path(|path| {
            let current = path.usb.event_log_index();
            let log = path.usb.event_log();
            if usize::from(current) >= log.len() {
                if !log.is_empty() {
                    log::warn!("usb log index {} out of range", current);
                }
                path.log_index = 0;
                return 0;
            }

            let mut index = path.log_index;
            if usize::from(index) >= log.len() {
                index = 0;
            }
            let mut drained = 0;
            while index != current {
                log::debug!("usb log: {:#04x}", log[usize::from(index)]);
                drained += 1;
                index += 1;
                if usize::from(index) == log.len() {
                    index = 0;
                }
            }
            path.log_index = current;
            drained
        })
    }

    fn handle_vendor_request(&self, setup: SetupData) {
        let req = setup.request();
        log::debug!(
            "vendor request {:#04x} value {:#06x} index {:#06x} length {}",
            req.request,
            req.value,
            req.index,
            req.length
        );

        let Some(cmd) = VendorRequest::from_code(req.request) else {
            log::warn!("unknown vendor request {:#04x}", req.request);
            self.stall_ep0();
            return;
        };
        let length = usize::from(req.length);

        match cmd {
            VendorRequest::Echo => {
                let n = self.control.next_counter();
                let reply = [n, !n, ECHO_TAG[0], ECHO_TAG[1]];
                self.send_ep0(&reply[..length.min(reply.len())]);
            }
            VendorRequest::HostWake => {
                self.ack_setup();
                self.rtos.set_events(AppEvents::HOST_WAKE_TASK);
            }
            VendorRequest::StatusCount => {
                let count = self.control.status_count().to_le_bytes();
                self.send_ep0(&count[..length.min(count.len())]);
            }
            VendorRequest::Delay => {
                self.rtos.sleep_ms(5);
                self.ack_setup();
            }
            VendorRequest::DataOut => {
                let len = length.min(EP0_BUFFER_SIZE);
                let res =
                    self.with_path(|path| path.usb.receive_ep0_data(&mut path.ep0_buffer[..len]));
                match res {
                    Ok(n) => log::debug!("dropped {} bytes of EP0 data", n),
                    Err(err) => log::warn!("EP0 data phase failed: {}", err),
                }
            }
            VendorRequest::LogIndex => {
                if length == 2 {
                    let index = self.with_path(|path| path.usb.event_log_index());
                    self.send_ep0(&index.to_le_bytes());
                } else {
                    self.stall_ep0();
                }
            }
            VendorRequest::LogRead => {
                if length == 0 {
                    self.ack_setup();
                } else {
                    self.with_path(|path| {
                        let log = path.usb.event_log();
                        let len = length.min(log.len()).min(MAX_LOG_READ);
                        let mut reply: Vec<u8, MAX_LOG_READ> = Vec::new();
                        // bounded by the capacity above
                        let _ = reply.extend_from_slice(&log[..len]);
                        path.send_ep0(&reply);
                    });
                }
            }
            VendorRequest::ReadRegister => {
                let address = u32::from(req.value) << 16 | u32::from(req.index);
                match self.with_path(|path| path.usb.read_register(address)) {
                    Ok(value) => {
                        let value = value.to_le_bytes();
                        self.send_ep0(&value[..length.min(value.len())]);
                    }
                    Err(err) => {
                        log::warn!("register {:#010x} read failed: {}", address, err);
                        self.stall_ep0();
                    }
                }
            }
            VendorRequest::BooterVersion => match self.with_path(|path| path.usb.booter_version()) {
                Ok((major, minor, patch)) => {
                    let version = [major, minor, patch];
                    self.send_ep0(&version[..length.min(version.len())]);
                }
                Err(err) => {
                    log::warn!("boot firmware version unavailable: {}", err);
                    self.stall_ep0();
                }
            },
            VendorRequest::JumpToBooter => {
                self.ack_setup();
                self.rtos.sleep_ms(10);
                log::info!("jumping to boot firmware");
                let err = self.with_path(|path| {
                    self.stop_if_active(path);
                    path.usb.jump_to_booter()
                });
                self.fatal(err);
            }
            VendorRequest::ForceUsb2 => {
                self.ack_setup();
                self.rtos.sleep_ms(1000);
                self.with_path(|path| self.stop_if_active(path));
                if let Err(err) = self.reconnect(100, false) {
                    self.fatal(err);
                }
            }
            VendorRequest::ForceUsb3 => {
                self.ack_setup();
                self.rtos.sleep_ms(100);
                self.with_path(|path| self.stop_if_active(path));
                if let Err(err) = self.reconnect(10, true) {
                    self.fatal(err);
                }
            }
            VendorRequest::RestartStack => {
                self.ack_setup();
                self.rtos.sleep_ms(100);
                self.deinit();
                self.init();
            }
            VendorRequest::Reset => {
                self.ack_setup();
                self.rtos.sleep_ms(2000);
                let res = self.with_path(|path| {
                    self.stop_if_active(path);
                    path.usb.connect(false, true)
                });
                if let Err(err) = res {
                    self.fatal(err);
                }
                self.rtos.sleep_ms(1000);
                log::info!("resetting device");
                let err = self.with_path(|path| path.usb.reset_device());
                self.fatal(err);
            }
            VendorRequest::ArmStandby => {
                self.power.arm_standby();
                self.ack_setup();
            }
        }
    }

    fn ack_setup(&self) {
        self.with_path(|path| path.usb.ack_setup());
    }

    fn stall_ep0(&self) {
        self.with_path(|path| path.usb.stall_ep0());
    }

    fn send_ep0(&self, data: &[u8]) {
        self.with_path(|path| path.send_ep0(data));
    }

    fn reconnect(&self, gap_ms: u32, super_speed: bool) -> Result<()> {
        self.with_path(|path| path.usb.connect(false, true))?;
        self.rtos.sleep_ms(gap_ms);
        self.with_path(|path| path.usb.connect(true, super_speed))
    }
}
