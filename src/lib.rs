#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

//! Vendor bulk source/sink USB device
//!
//! The device exposes one bulk OUT endpoint that accepts and drops
//! everything the host sends (the sink) and one or more bulk IN endpoints
//! that always have data ready (the sources). Data moves through fixed
//! size DMA buffer rings between the USB sockets and memory, without
//! copies on the steady-state path.
//!
//! The crate contains the buffer ring engine and the control state machine
//! around it:
//! * [`BufferRing`]: one fixed pool of DMA buffers on one channel
//! * [`ChannelManager`]: provisions the rings for the negotiated speed,
//!   all or nothing
//! * [`CompletionDispatcher`]: turns DMA completions into discard or
//!   refill actions
//! * [`SourceSink`]: the device itself; handles configuration, reset,
//!   endpoint halt recovery, function suspend and vendor requests, and
//!   runs the application loop
//!
//! Hardware access goes through the [`DmaEngine`], [`UsbDriver`] and
//! [`Rtos`] traits which the platform glue must implement. Hardware
//! callbacks are forwarded to the `on_*` methods of [`SourceSink`] and
//! [`SourceSink::run`] is called from the application thread. Both sides
//! share the device by reference; the rings and hardware handles sit in a
//! [`DataPath`] behind a spin lock that is never held while blocking.
//!
//! Logging goes through the `log` facade; no logger is installed here.

/// Application loop and vendor requests
mod app;
/// Provisioning of buffer rings
pub mod channel;
/// Firmware tunables
pub mod config;
/// Setup packets and control request handoff
pub mod control;
/// Device state machine
pub mod device;
/// DMA completion handling
pub mod dispatch;
/// Endpoint and speed parameters
pub mod endpoint;
/// Crate error type
pub mod error;
/// Hardware collaborators
pub mod hal;
/// Power management flags
pub mod power;
/// DMA buffer ring
pub mod ring;

#[cfg(test)]
mod mock;

pub use crate::app::MAX_LOG_READ;
pub use crate::channel::ChannelManager;
pub use crate::config::{Config, Layout};
pub use crate::control::{ControlRequestContext, SetupData, VendorRequest};
pub use crate::device::{DataPath, DeviceState, EndpointEvent, SourceSink, UsbEvent};
pub use crate::dispatch::{CompletionDispatcher, DmaEvent, TransferObserver};
pub use crate::endpoint::{EndpointConfig, Socket, UsbSpeed};
pub use crate::error::{Error, Result};
pub use crate::hal::{
    AppEvents, ChannelSpec, DmaBuffer, DmaEngine, LinkPowerState, Notification, RingId, Rtos,
    TransferSize, UsbDriver, UsbStart,
};
pub use crate::power::PowerState;
pub use crate::ring::{BufferRing, RingRole, RingStats};
