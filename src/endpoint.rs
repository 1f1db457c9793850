use usb_device::endpoint::EndpointType;

use crate::{Error, Result};

/// Bulk max-packet-size at full speed.
pub const PACKET_SIZE_FULL_SPEED: u16 = 64;
/// Bulk max-packet-size at high speed.
pub const PACKET_SIZE_HIGH_SPEED: u16 = 512;
/// Bulk max-packet-size at super speed.
pub const PACKET_SIZE_SUPER_SPEED: u16 = 1024;

/// Bus speed negotiated with the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    /// Not connected, or the controller could not tell.
    Unknown,
    /// USB 1.1, 12 Mbps.
    Full,
    /// USB 2.0, 480 Mbps.
    High,
    /// USB 3.0, 5 Gbps.
    Super,
}

impl UsbSpeed {
    /// Bulk max-packet-size for this speed.
    pub fn max_packet_size(self) -> Result<u16> {
        match self {
            UsbSpeed::Full => Ok(PACKET_SIZE_FULL_SPEED),
            UsbSpeed::High => Ok(PACKET_SIZE_HIGH_SPEED),
            UsbSpeed::Super => Ok(PACKET_SIZE_SUPER_SPEED),
            UsbSpeed::Unknown => Err(Error::UnsupportedSpeed),
        }
    }

    /// Burst length to program for this speed. Bursts only exist at super speed.
    pub fn burst_length(self, configured: u8) -> u8 {
        match self {
            UsbSpeed::Super => configured,
            _ => 1,
        }
    }
}

/// One end of a DMA channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socket {
    /// USB block producer socket, fed by an OUT endpoint.
    UsbProducer(u8),
    /// USB block consumer socket, draining into an IN endpoint.
    UsbConsumer(u8),
    /// Firmware reads buffers from this side.
    CpuConsumer,
    /// Firmware writes buffers from this side.
    CpuProducer,
}

/// Hardware endpoint programming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Whether the endpoint is enabled.
    pub enable: bool,
    /// Transfer type, bulk for every data endpoint here.
    pub ep_type: EndpointType,
    /// Max packet size in bytes.
    pub packet_size: u16,
    /// Packets per burst (1 below super speed).
    pub burst_length: u8,
    /// Bulk streams, unused.
    pub streams: u8,
}

impl EndpointConfig {
    /// Bulk endpoint configuration for the given speed.
    pub fn bulk(speed: UsbSpeed, burst_length: u8) -> Result<Self> {
        Ok(EndpointConfig {
            enable: true,
            ep_type: EndpointType::Bulk,
            packet_size: speed.max_packet_size()?,
            burst_length: speed.burst_length(burst_length),
            streams: 0,
        })
    }

    /// Configuration that turns an endpoint off.
    pub const fn disabled() -> Self {
        EndpointConfig {
            enable: false,
            ep_type: EndpointType::Bulk,
            packet_size: 0,
            burst_length: 0,
            streams: 0,
        }
    }

    /// Check packet size and burst length against the negotiated speed.
    pub fn check(&self, speed: UsbSpeed) -> Result<()> {
        if self.packet_size != speed.max_packet_size()? {
            return Err(Error::SpeedMismatch);
        }
        if speed != UsbSpeed::Super && self.burst_length != 1 {
            return Err(Error::SpeedMismatch);
        }
        Ok(())
    }
}
