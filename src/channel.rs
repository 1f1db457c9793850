//! Provisioning of the buffer rings for the configured layout.

use heapless::Vec;
use usb_device::endpoint::EndpointAddress;

use crate::config::{Config, Layout};
use crate::endpoint::{Socket, UsbSpeed};
use crate::hal::{ChannelSpec, DmaEngine, Notification, RingId};
use crate::ring::{BufferRing, RingRole};
use crate::{Error, Result};

/// Most rings any layout provisions.
pub const MAX_RINGS: usize = 4;

/// Sink ring fed by the producer endpoint.
pub const SINK_RING: RingId = RingId(0);
/// Pattern (or control echo) source ring.
pub const PATTERN_RING: RingId = RingId(1);
/// "data" literal ring.
pub const DATA_RING: RingId = RingId(2);
/// "event" literal ring.
pub const EVENT_RING: RingId = RingId(3);

/// Payload of the "data" literal ring.
pub const DATA_LITERAL: &[u8] = b"data";
/// Payload of the "event" literal ring.
pub const EVENT_LITERAL: &[u8] = b"event";

struct RingPlan {
    id: RingId,
    endpoint: EndpointAddress,
    role: RingRole,
    spec: ChannelSpec,
}

/// Owns every buffer ring of the device.
///
/// Rings are created all together on configuration and destroyed all together
/// when the data path stops. Setup never leaves a partial set behind.
#[derive(Debug)]
pub struct ChannelManager {
    config: Config,
    rings: Vec<BufferRing, MAX_RINGS>,
}

impl ChannelManager {
    /// Manager with no rings.
    pub fn new(config: Config) -> Self {
        ChannelManager {
            config,
            rings: Vec::new(),
        }
    }

    /// Size of one sink or pattern buffer.
    ///
    /// Packet size times burst (super speed only) times the size multiplier.
    pub fn buffer_size(&self, packet_size: u16, speed: UsbSpeed) -> usize {
        usize::from(packet_size)
            * usize::from(speed.burst_length(self.config.burst_length))
            * usize::from(self.config.size_multiplier)
    }

    /// Data endpoints the layout uses, OUT first.
    pub fn endpoints(&self) -> Vec<EndpointAddress, MAX_RINGS> {
        let mut eps = Vec::new();
        let _ = eps.push(self.config.producer_ep);
        let _ = eps.push(self.config.consumer_ep);
        if self.config.layout == Layout::CommandStreams {
            let _ = eps.push(self.config.data_ep);
            let _ = eps.push(self.config.event_ep);
        }
        eps
    }

    fn plan(&self, packet_size: u16, speed: UsbSpeed) -> Vec<RingPlan, MAX_RINGS> {
        let size = self.buffer_size(packet_size, speed);
        let count = usize::from(self.config.buffer_count);
        let aux_count = usize::from(self.config.aux_buffer_count);
        let source = |socket: u8, size: usize, count: usize| ChannelSpec {
            size,
            count,
            producer: Socket::CpuProducer,
            consumer: Socket::UsbConsumer(socket),
            notification: Notification::Consume,
        };

        let mut plan = Vec::new();
        let _ = plan.push(RingPlan {
            id: SINK_RING,
            endpoint: self.config.producer_ep,
            role: RingRole::Sink,
            spec: ChannelSpec {
                size,
                count,
                producer: Socket::UsbProducer(self.config.producer_socket),
                consumer: Socket::CpuConsumer,
                notification: Notification::Produce,
            },
        });
        let _ = plan.push(RingPlan {
            id: PATTERN_RING,
            endpoint: self.config.consumer_ep,
            role: RingRole::Pattern(self.config.pattern),
            spec: source(self.config.consumer_socket, size, count),
        });
        if self.config.layout == Layout::CommandStreams {
            let aux_size = usize::from(packet_size);
            let _ = plan.push(RingPlan {
                id: DATA_RING,
                endpoint: self.config.data_ep,
                role: RingRole::Literal(DATA_LITERAL),
                spec: source(self.config.data_socket, aux_size, aux_count),
            });
            let _ = plan.push(RingPlan {
                id: EVENT_RING,
                endpoint: self.config.event_ep,
                role: RingRole::Literal(EVENT_LITERAL),
                spec: source(self.config.event_socket, aux_size, aux_count),
            });
        }
        plan
    }

    /// Create every ring of the layout.
    ///
    /// On failure, rings created so far are destroyed again and the error is
    /// returned; no ring exists afterwards.
    pub fn setup_channels<D: DmaEngine>(
        &mut self,
        dma: &mut D,
        packet_size: u16,
        speed: UsbSpeed,
    ) -> Result<()> {
        if !self.rings.is_empty() {
            log::warn!("rings already provisioned, tearing down first");
            self.teardown_channels(dma);
        }
        if speed.max_packet_size()? != packet_size {
            return Err(Error::SpeedMismatch);
        }

        for plan in self.plan(packet_size, speed) {
            // DMA transfers move whole packets
            if plan.spec.size % usize::from(packet_size) != 0 {
                self.teardown_channels(dma);
                return Err(Error::SpeedMismatch);
            }
            match BufferRing::create(dma, plan.id, plan.endpoint, plan.role, plan.spec) {
                Ok(ring) => {
                    if self.rings.push(ring).is_err() {
                        self.teardown_channels(dma);
                        return Err(Error::ResourceExhausted);
                    }
                }
                Err(err) => {
                    log::error!("ring {}: create failed: {}", plan.id.0, err);
                    self.teardown_channels(dma);
                    return Err(err);
                }
            }
        }

        log::info!(
            "{} rings ready, {} x {} bytes per data ring",
            self.rings.len(),
            self.config.buffer_count,
            self.buffer_size(packet_size, speed)
        );
        Ok(())
    }

    /// Destroy every ring.
    pub fn teardown_channels<D: DmaEngine>(&mut self, dma: &mut D) {
        for ring in self.rings.iter_mut() {
            ring.destroy(dma);
        }
        self.rings.clear();
    }

    /// Arm every ring for an unbounded transfer.
    pub fn start_transfers<D: DmaEngine>(&mut self, dma: &mut D) -> Result<()> {
        for ring in self.rings.iter_mut() {
            ring.arm(dma)?;
        }
        Ok(())
    }

    /// Commit every free buffer of every source ring.
    pub fn preload<D: DmaEngine>(&mut self, dma: &mut D) -> Result<()> {
        for ring in self.rings.iter_mut().filter(|r| r.is_source()) {
            ring.preload(dma)?;
        }
        Ok(())
    }

    /// Commit every free buffer of one source ring.
    pub fn preload_ring<D: DmaEngine>(&mut self, dma: &mut D, id: RingId) -> Result<()> {
        let ring = self.ring_mut(id)?;
        if !ring.is_source() {
            return Err(Error::UnknownRing);
        }
        ring.preload(dma)
    }

    /// Whether the rings exist.
    pub fn is_provisioned(&self) -> bool {
        !self.rings.is_empty()
    }

    /// Whether produce events fan out to every source ring.
    pub fn fans_out(&self) -> bool {
        self.config.layout == Layout::CommandStreams
    }

    /// Ring by identifier.
    pub fn ring(&self, id: RingId) -> Result<&BufferRing> {
        self.rings
            .iter()
            .find(|r| r.id() == id)
            .ok_or(Error::UnknownRing)
    }

    /// Ring by identifier.
    pub fn ring_mut(&mut self, id: RingId) -> Result<&mut BufferRing> {
        self.rings
            .iter_mut()
            .find(|r| r.id() == id)
            .ok_or(Error::UnknownRing)
    }

    /// Ring backing an endpoint.
    pub fn ring_for_endpoint(&self, ep: EndpointAddress) -> Option<RingId> {
        self.rings
            .iter()
            .find(|r| u8::from(r.endpoint()) == u8::from(ep))
            .map(|r| r.id())
    }

    /// All rings.
    pub fn rings(&self) -> impl Iterator<Item = &BufferRing> {
        self.rings.iter()
    }

    /// All rings.
    pub fn rings_mut(&mut self) -> impl Iterator<Item = &mut BufferRing> {
        self.rings.iter_mut()
    }
}
