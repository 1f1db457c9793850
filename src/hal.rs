//! Hardware collaborators.
//!
//! The firmware core never touches registers. The platform glue implements
//! these traits on top of the vendor SDK (DMA channels, the USB block, and
//! the RTOS) and forwards hardware callbacks into
//! [`SourceSink`](crate::SourceSink).

use bitflags::bitflags;
use usb_device::endpoint::EndpointAddress;

use crate::endpoint::{EndpointConfig, Socket, UsbSpeed};
use crate::Error;
use crate::Result;

/// Opaque identifier of one buffer ring and its DMA channel.
///
/// Completion callbacks carry this instead of a pointer back to the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RingId(pub u8);

/// Completion notification requested from a DMA channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// A buffer was filled by the producer socket.
    Produce,
    /// A buffer was drained by the consumer socket.
    Consume,
}

/// Parameters of one DMA channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSpec {
    /// Buffer size in bytes.
    pub size: usize,
    /// Number of buffers.
    pub count: usize,
    /// Side the data comes from.
    pub producer: Socket,
    /// Side the data goes to.
    pub consumer: Socket,
    /// Completion events to deliver.
    pub notification: Notification,
}

/// Transfer count armed on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSize {
    /// Run until explicitly stopped.
    Infinite,
    /// Stop after this many bytes.
    Bytes(u32),
}

/// A DMA buffer handed to firmware.
pub struct DmaBuffer<'a> {
    /// Whole buffer memory. Its length is the buffer capacity.
    pub data: &'a mut [u8],
    /// Number of valid bytes written by the producer.
    pub count: usize,
}

/// DMA engine of the controller.
///
/// None of these calls may block: they run from the completion context.
pub trait DmaEngine {
    /// Create the channel for `ring` and allocate its buffers.
    ///
    /// Returns [`Error::ResourceExhausted`] when the buffer memory cannot be allocated.
    fn create_channel(&mut self, ring: RingId, spec: &ChannelSpec) -> Result<()>;

    /// Destroy the channel and free its buffers. Destroying an unknown channel is a no-op.
    fn destroy_channel(&mut self, ring: RingId);

    /// Arm the channel for `size` bytes.
    fn set_transfer_size(&mut self, ring: RingId, size: TransferSize) -> Result<()>;

    /// Get the next free (source) or filled (sink) buffer without waiting.
    ///
    /// Returns [`Error::NotReady`] when none is available.
    fn acquire_buffer(&mut self, ring: RingId) -> Result<DmaBuffer<'_>>;

    /// Hand the last acquired buffer to the consumer socket with `len` valid bytes.
    fn commit_buffer(&mut self, ring: RingId, len: usize) -> Result<()>;

    /// Return the oldest filled buffer to the producer socket unread.
    fn discard_buffer(&mut self, ring: RingId) -> Result<()>;

    /// Abort every in-flight buffer and return the channel to its initial state.
    fn reset_channel(&mut self, ring: RingId) -> Result<()>;
}

/// Outcome of starting the USB stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbStart {
    /// Stack started, the device still has to connect.
    Started,
    /// A previous firmware stage left the device enumerated and configured.
    AlreadyEnumerated,
}

/// USB 3 link power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPowerState {
    /// Active.
    U0,
    /// Fast-exit idle.
    U1,
    /// Deeper idle.
    U2,
    /// Suspend.
    U3,
    /// USB 2 link, no U states.
    Compliance,
}

/// USB block of the controller.
pub trait UsbDriver {
    /// Start the USB stack.
    fn start(&mut self) -> Result<UsbStart>;
    /// Stop the USB stack.
    fn stop(&mut self) -> Result<()>;
    /// Register the enumeration descriptors for every speed.
    fn register_descriptors(&mut self) -> Result<()>;
    /// Connect or disconnect the pins, optionally with super speed enabled.
    fn connect(&mut self, connect: bool, super_speed: bool) -> Result<()>;
    /// Currently negotiated bus speed.
    fn speed(&self) -> UsbSpeed;

    /// Program an endpoint.
    fn configure_endpoint(&mut self, ep: EndpointAddress, config: &EndpointConfig) -> Result<()>;
    /// Drop whatever the endpoint memory holds.
    fn flush_endpoint(&mut self, ep: EndpointAddress) -> Result<()>;
    /// Reset endpoint sequence state.
    fn reset_endpoint(&mut self, ep: EndpointAddress) -> Result<()>;
    /// NAK (or stop NAKing) every host access to the endpoint.
    fn set_endpoint_nak(&mut self, ep: EndpointAddress, nak: bool) -> Result<()>;
    /// Set or clear the stall condition, optionally resetting the data toggle.
    fn stall(&mut self, ep: EndpointAddress, stall: bool, toggle: bool) -> Result<()>;

    /// Complete a control request without data phase.
    fn ack_setup(&mut self);
    /// Reject the current control request.
    fn stall_ep0(&mut self);
    /// Send the IN data phase of the current control request.
    fn send_ep0_data(&mut self, data: &[u8]) -> Result<()>;
    /// Receive the OUT data phase of the current control request.
    fn receive_ep0_data(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Allow link power management transitions.
    fn lpm_enable(&mut self);
    /// Keep the link in U0.
    fn lpm_disable(&mut self);
    /// Read the current link power state.
    fn link_power_state(&self) -> Result<LinkPowerState>;
    /// Request a link power state.
    fn set_link_power_state(&mut self, state: LinkPowerState) -> Result<()>;
    /// Signal remote wakeup on a USB 2 link.
    fn remote_wakeup(&mut self) -> Result<()>;
    /// Send a function wake device notification on a USB 3 link.
    fn function_wake(&mut self) -> Result<()>;

    /// Driver event log. Empty if no log buffer was registered.
    fn event_log(&self) -> &[u8];
    /// Index the driver will write the next log byte at.
    fn event_log_index(&self) -> u16;

    /// Read one device register.
    fn read_register(&self, address: u32) -> Result<u32>;
    /// Version of the boot firmware (major, minor, patch).
    fn booter_version(&self) -> Result<(u8, u8, u8)>;

    /// Hand control back to the boot firmware. Only returns on failure.
    fn jump_to_booter(&mut self) -> Error;
    /// Reset the device. Only returns on failure.
    fn reset_device(&mut self) -> Error;
    /// Enter standby until VBus returns. Only returns on failure.
    fn enter_standby(&mut self) -> Error;
}

bitflags! {
    /// Events the application thread waits on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AppEvents: u32 {
        /// A vendor control request is pending.
        const CONTROL_TASK = 1 << 0;
        /// Remote wakeup should be attempted.
        const HOST_WAKE_TASK = 1 << 1;
    }
}

/// Scheduling primitives of the RTOS.
///
/// Shared by the application thread and the callback context, so every
/// method takes `&self`.
///
/// # Example
///
/// A bounded busy wait on a Cortex-M core clocked at 200 MHz:
///
/// ```no_run
/// fn busy_wait_us(us: u32) {
///     cortex_m::asm::delay(us * 200);
/// }
/// # busy_wait_us(125);
/// ```
pub trait Rtos {
    /// OR `events` into the application event group.
    fn set_events(&self, events: AppEvents);
    /// Wait until any of `mask` is set or `timeout_ms` passes; return and clear what was set.
    fn wait_events(&self, mask: AppEvents, timeout_ms: u32) -> AppEvents;
    /// Put the calling thread to sleep.
    fn sleep_ms(&self, ms: u32);
    /// Spin for a short, fixed time.
    fn busy_wait_us(&self, us: u32);
    /// (Re)start the one-shot idle timer.
    fn restart_idle_timer(&self, ms: u32);
    /// Stop the idle timer.
    fn stop_idle_timer(&self);

    /// Run `f` with DMA and USB callbacks held off.
    ///
    /// The application thread takes the data path lock only inside this,
    /// so a callback never spins on a lock owned by the thread it
    /// preempted. `f` never blocks. The default runs `f` directly, which
    /// is enough when callbacks are delivered on a thread that the RTOS
    /// time-slices with the application thread.
    ///
    /// ```no_run
    /// fn critical_section<T>(f: impl FnOnce() -> T) -> T {
    ///     cortex_m::interrupt::free(|_| f())
    /// }
    /// # critical_section(|| ());
    /// ```
    fn critical_section<T>(&self, f: impl FnOnce() -> T) -> T {
        f()
    }

    /// Stop making progress after an unrecoverable error.
    fn halt(&self, error: Error) -> ! {
        log::error!("halting: {}", error);
        loop {
            self.sleep_ms(100);
        }
    }
}
