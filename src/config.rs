use usb_device::endpoint::EndpointAddress;

use crate::dispatch::ECHO_CAPACITY;
use crate::endpoint::PACKET_SIZE_SUPER_SPEED;
use crate::{Error, Result};

/// Which rings the device provisions on configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One sink ring (OUT) and one pattern source ring (IN).
    SourceSink,
    /// Sink ring plus a control echo ring and the "data" and "event" literal rings.
    /// Every packet received on the sink fans out to all three IN rings.
    CommandStreams,
}

/// Firmware tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Ring provisioning.
    pub layout: Layout,
    /// Packets per burst at super speed.
    pub burst_length: u8,
    /// Buffer size multiplier applied on top of packet size and burst.
    pub size_multiplier: u16,
    /// Buffers per sink and pattern ring.
    pub buffer_count: u16,
    /// Buffers per auxiliary literal ring.
    pub aux_buffer_count: u16,
    /// Byte the pattern source ring is filled with.
    pub pattern: u8,

    /// Bulk OUT endpoint feeding the sink ring.
    pub producer_ep: EndpointAddress,
    /// Bulk IN endpoint of the pattern (control echo) ring.
    pub consumer_ep: EndpointAddress,
    /// Bulk IN endpoint of the "data" ring.
    pub data_ep: EndpointAddress,
    /// Bulk IN endpoint of the "event" ring.
    pub event_ep: EndpointAddress,
    /// USB producer socket wired to `producer_ep`.
    pub producer_socket: u8,
    /// USB consumer socket wired to `consumer_ep`.
    pub consumer_socket: u8,
    /// USB consumer socket wired to `data_ep`.
    pub data_socket: u8,
    /// USB consumer socket wired to `event_ep`.
    pub event_socket: u8,

    /// Application event wait timeout.
    pub event_wait_ms: u32,
    /// Idle time after the last completion before LPM is allowed again.
    pub lpm_timeout_ms: u32,
    /// Settle time between NAKing an endpoint and resetting its ring.
    pub halt_settle_us: u32,
    /// Time VBus gets to settle before entering standby.
    pub standby_settle_ms: u32,
}

impl Config {
    /// Defaults for parts with the full 512 KiB of DMA buffer space.
    pub fn new() -> Self {
        Config {
            layout: Layout::SourceSink,
            burst_length: 16,
            size_multiplier: 2,
            buffer_count: 3,
            aux_buffer_count: 2,
            pattern: 0xaa,

            producer_ep: EndpointAddress::from(0x01),
            consumer_ep: EndpointAddress::from(0x81),
            data_ep: EndpointAddress::from(0x82),
            event_ep: EndpointAddress::from(0x83),
            producer_socket: 1,
            consumer_socket: 1,
            data_socket: 2,
            event_socket: 3,

            event_wait_ms: 10,
            lpm_timeout_ms: 100,
            halt_settle_us: 125,
            standby_settle_ms: 1000,
        }
    }

    /// Defaults for the 256 KiB parts with less DMA buffer space.
    pub fn small_memory() -> Self {
        let mut config = Self::new();
        config.burst_length = 4;
        config.size_multiplier = 1;
        config.buffer_count = 2;
        config
    }

    /// Same config with a different ring layout.
    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    /// Largest ring buffer this config can produce, at super speed.
    pub fn max_buffer_size(&self) -> usize {
        PACKET_SIZE_SUPER_SPEED as usize * self.burst_length as usize * self.size_multiplier as usize
    }

    /// Reject values the hardware cannot be programmed with.
    pub fn validate(&self) -> Result<()> {
        if !(1..=16).contains(&self.burst_length) {
            return Err(Error::InvalidConfig("burst length must be 1..=16"));
        }
        if self.size_multiplier == 0 {
            return Err(Error::InvalidConfig("size multiplier must be non-zero"));
        }
        if self.layout == Layout::CommandStreams && self.max_buffer_size() > ECHO_CAPACITY {
            return Err(Error::InvalidConfig("buffers too large to echo commands"));
        }
        if self.buffer_count == 0 || self.aux_buffer_count == 0 {
            return Err(Error::InvalidConfig("buffer count must be non-zero"));
        }
        if !self.producer_ep.is_out() {
            return Err(Error::InvalidConfig("producer endpoint must be OUT"));
        }
        if !(self.consumer_ep.is_in() && self.data_ep.is_in() && self.event_ep.is_in()) {
            return Err(Error::InvalidConfig("source endpoints must be IN"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
