//! Fixed-count DMA buffer ring bound to one channel.
//!
//! A ring never owns buffer memory itself: the DMA engine does. The ring
//! keeps the bookkeeping the firmware needs (how many buffers currently sit
//! with the hardware, how many with firmware) and the diagnostic counters.
//!
//! For every ring `outstanding() + available() == count()` holds from
//! creation until destruction.

use usb_device::endpoint::EndpointAddress;

use crate::hal::{ChannelSpec, DmaBuffer, DmaEngine, RingId, TransferSize};
use crate::{Error, Result};

/// What a ring carries, and so which way its buffers flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingRole {
    /// Drains an OUT endpoint. Buffers are discarded unread.
    Sink,
    /// Feeds an IN endpoint with full buffers of one byte value.
    Pattern(u8),
    /// Feeds an IN endpoint with a fixed string per buffer.
    Literal(&'static [u8]),
}

impl RingRole {
    /// Whether buffers of this ring are filled by firmware.
    pub fn is_source(&self) -> bool {
        !matches!(self, RingRole::Sink)
    }

    /// Fill `buf` with this role's payload and return the number of valid bytes.
    pub fn fill(&self, buf: &mut [u8]) -> usize {
        match *self {
            RingRole::Sink => 0,
            RingRole::Pattern(byte) => {
                buf.fill(byte);
                buf.len()
            }
            RingRole::Literal(text) => {
                let len = text.len().min(buf.len());
                buf[..len].copy_from_slice(&text[..len]);
                len
            }
        }
    }
}

/// Diagnostic counters of one ring. Monotonic, wrapping, advisory only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    /// Produce events handled.
    pub received: u32,
    /// Consume events handled.
    pub transmitted: u32,
    /// Successful acquires.
    pub acquired: u32,
    /// Successful commits.
    pub committed: u32,
    /// Successful discards.
    pub discarded: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RingState {
    Idle,
    Armed,
    Destroyed,
}

/// A fixed pool of fixed-size DMA buffers attached to one channel.
#[derive(Debug)]
pub struct BufferRing {
    id: RingId,
    endpoint: EndpointAddress,
    role: RingRole,
    spec: ChannelSpec,
    state: RingState,
    in_hardware: usize,
    stats: RingStats,
}

impl BufferRing {
    /// Create the DMA channel and allocate `spec.count` buffers of `spec.size` bytes.
    pub fn create<D: DmaEngine>(
        dma: &mut D,
        id: RingId,
        endpoint: EndpointAddress,
        role: RingRole,
        spec: ChannelSpec,
    ) -> Result<Self> {
        dma.create_channel(id, &spec)?;
        log::trace!(
            "ring {}: {} x {} bytes for ep {:#04x}",
            id.0,
            spec.count,
            spec.size,
            u8::from(endpoint)
        );

        Ok(BufferRing {
            id,
            endpoint,
            role,
            spec,
            state: RingState::Idle,
            in_hardware: 0,
            stats: RingStats::default(),
        })
    }

    /// Release the channel. Calling it again is a no-op.
    pub fn destroy<D: DmaEngine>(&mut self, dma: &mut D) {
        if self.state == RingState::Destroyed {
            return;
        }
        dma.destroy_channel(self.id);
        self.state = RingState::Destroyed;
        self.in_hardware = 0;
    }

    /// Let the hardware run transfers on this ring until stopped.
    ///
    /// Sink buffers are handed to the producer socket here.
    pub fn arm<D: DmaEngine>(&mut self, dma: &mut D) -> Result<()> {
        self.live()?;
        dma.set_transfer_size(self.id, TransferSize::Infinite)?;
        self.state = RingState::Armed;
        if !self.role.is_source() {
            self.in_hardware = self.spec.count;
        }
        Ok(())
    }

    /// Get the next buffer without waiting. [`Error::NotReady`] if there is none.
    pub fn acquire_next<'d, D: DmaEngine>(&mut self, dma: &'d mut D) -> Result<DmaBuffer<'d>> {
        self.live()?;
        let buf = dma.acquire_buffer(self.id)?;
        self.stats.acquired = self.stats.acquired.wrapping_add(1);
        Ok(buf)
    }

    /// Hand the acquired buffer to the hardware with `len` valid bytes.
    pub fn commit<D: DmaEngine>(&mut self, dma: &mut D, len: usize) -> Result<()> {
        self.live()?;
        debug_assert!(len <= self.spec.size);
        dma.commit_buffer(self.id, len)?;
        self.stats.committed = self.stats.committed.wrapping_add(1);
        self.give_to_hardware();
        Ok(())
    }

    /// Return the oldest received buffer to the hardware without reading it.
    pub fn discard<D: DmaEngine>(&mut self, dma: &mut D) -> Result<()> {
        self.live()?;
        dma.discard_buffer(self.id)?;
        self.stats.discarded = self.stats.discarded.wrapping_add(1);
        self.give_to_hardware();
        Ok(())
    }

    /// Abort everything in flight. The ring has to be armed again afterwards.
    pub fn reset<D: DmaEngine>(&mut self, dma: &mut D) -> Result<()> {
        self.live()?;
        dma.reset_channel(self.id)?;
        self.state = RingState::Idle;
        self.in_hardware = 0;
        Ok(())
    }

    /// Acquire, fill with the ring's payload, commit. Returns the committed length.
    pub fn refill<D: DmaEngine>(&mut self, dma: &mut D) -> Result<usize> {
        let role = self.role;
        let len = {
            let buf = self.acquire_next(dma)?;
            role.fill(buf.data)
        };
        self.commit(dma, len)?;
        Ok(len)
    }

    /// Commit every buffer firmware holds so the endpoint has data ready
    /// before the host asks for it.
    pub fn preload<D: DmaEngine>(&mut self, dma: &mut D) -> Result<()> {
        for _ in 0..self.available() {
            self.refill(dma)?;
        }
        Ok(())
    }

    /// Hardware filled a buffer and gave it to firmware.
    pub(crate) fn note_produced(&mut self) {
        self.stats.received = self.stats.received.wrapping_add(1);
        self.take_from_hardware();
    }

    /// Hardware drained a buffer and gave it back to firmware.
    pub(crate) fn note_consumed(&mut self) {
        self.stats.transmitted = self.stats.transmitted.wrapping_add(1);
        self.take_from_hardware();
    }

    fn give_to_hardware(&mut self) {
        if self.in_hardware < self.spec.count {
            self.in_hardware += 1;
        } else {
            log::warn!("ring {}: more buffers handed out than exist", self.id.0);
        }
    }

    fn take_from_hardware(&mut self) {
        if self.in_hardware > 0 {
            self.in_hardware -= 1;
        } else {
            log::warn!("ring {}: completion with no buffer outstanding", self.id.0);
        }
    }

    fn live(&self) -> Result<()> {
        if self.state == RingState::Destroyed {
            Err(Error::NotActive)
        } else {
            Ok(())
        }
    }

    /// Ring identifier, also the DMA channel handle.
    pub fn id(&self) -> RingId {
        self.id
    }

    /// Endpoint this ring backs.
    pub fn endpoint(&self) -> EndpointAddress {
        self.endpoint
    }

    /// Ring role.
    pub fn role(&self) -> RingRole {
        self.role
    }

    /// Whether firmware fills this ring's buffers.
    pub fn is_source(&self) -> bool {
        self.role.is_source()
    }

    /// Channel parameters the ring was created with.
    pub fn spec(&self) -> &ChannelSpec {
        &self.spec
    }

    /// Buffer size in bytes.
    pub fn size(&self) -> usize {
        self.spec.size
    }

    /// Number of buffers.
    pub fn count(&self) -> usize {
        self.spec.count
    }

    /// Buffers currently owned by the hardware.
    pub fn outstanding(&self) -> usize {
        self.in_hardware
    }

    /// Buffers currently owned by firmware.
    pub fn available(&self) -> usize {
        self.spec.count - self.in_hardware
    }

    /// Whether the ring is armed for transfers.
    pub fn is_armed(&self) -> bool {
        self.state == RingState::Armed
    }

    /// Diagnostic counters.
    pub fn stats(&self) -> RingStats {
        self.stats
    }
}
