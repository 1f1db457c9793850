//! Routing of DMA completion events to their rings.
//!
//! Runs in the completion context: nothing here waits, allocates or halts.
//! Failures are logged and the event is dropped.

use heapless::Vec;

use crate::channel::ChannelManager;
use crate::hal::{DmaEngine, RingId};
use crate::ring::RingRole;
use crate::{Error, Result};

/// Prefix of the reply written to the echo ring for every received command.
pub const ECHO_PREFIX: &[u8] = b"ok:";

/// Largest buffer the echo path handles.
///
/// Super speed buffers of the default configuration (1024 byte packets,
/// burst of 16, multiplier of 2). `Config::validate` rejects command stream
/// configurations that could produce larger buffers, so a received command
/// is never cut short.
pub const ECHO_CAPACITY: usize = 32 * 1024;

/// DMA completion event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaEvent {
    /// The producer socket filled a buffer.
    Produce,
    /// The consumer socket drained a buffer.
    Consume,
}

/// Hook run after every completion has been handled.
pub trait TransferObserver {
    /// Called once per completion, after the ring has been serviced.
    fn on_transfer(&mut self, ring: RingId, event: DmaEvent);
}

impl TransferObserver for () {
    fn on_transfer(&mut self, _ring: RingId, _event: DmaEvent) {}
}

/// Services completions and keeps the transfer totals across reconfigurations.
#[derive(Debug)]
pub struct CompletionDispatcher<O> {
    observer: O,
    received: u32,
    transmitted: u32,
    command: Vec<u8, ECHO_CAPACITY>,
}

impl<O: TransferObserver> CompletionDispatcher<O> {
    /// Dispatcher reporting to `observer`.
    pub fn new(observer: O) -> Self {
        CompletionDispatcher {
            observer,
            received: 0,
            transmitted: 0,
            command: Vec::new(),
        }
    }

    /// Service one completion on `ring`.
    ///
    /// Only errors that identify the event itself as bogus are returned:
    /// an unknown ring or an event of the wrong direction.
    pub fn handle<D: DmaEngine>(
        &mut self,
        channels: &mut ChannelManager,
        dma: &mut D,
        ring: RingId,
        event: DmaEvent,
    ) -> Result<()> {
        match event {
            DmaEvent::Produce => self.on_produce(channels, dma, ring)?,
            DmaEvent::Consume => self.on_consume(channels, dma, ring)?,
        }
        self.observer.on_transfer(ring, event);
        Ok(())
    }

    fn on_produce<D: DmaEngine>(
        &mut self,
        channels: &mut ChannelManager,
        dma: &mut D,
        id: RingId,
    ) -> Result<()> {
        let sink = channels.ring_mut(id)?;
        if sink.is_source() {
            return Err(Error::UnknownRing);
        }
        sink.note_produced();
        self.received = self.received.wrapping_add(1);

        if channels.fans_out() {
            fan_out(channels, dma, id, &mut self.command);
        }

        let sink = channels.ring_mut(id)?;
        if let Err(err) = sink.discard(dma) {
            log::warn!("ring {}: discard failed: {}", id.0, err);
        }
        Ok(())
    }

    fn on_consume<D: DmaEngine>(
        &mut self,
        channels: &mut ChannelManager,
        dma: &mut D,
        id: RingId,
    ) -> Result<()> {
        let source = channels.ring_mut(id)?;
        if !source.is_source() {
            return Err(Error::UnknownRing);
        }
        source.note_consumed();
        self.transmitted = self.transmitted.wrapping_add(1);

        match source.refill(dma) {
            Ok(len) => log::trace!("ring {}: refilled {} bytes", id.0, len),
            Err(err) if err.is_transient() => log::warn!("ring {}: refill skipped: {}", id.0, err),
            Err(err) => log::error!("ring {}: refill failed: {}", id.0, err),
        }
        Ok(())
    }

    /// Produce events handled since boot.
    pub fn received(&self) -> u32 {
        self.received
    }

    /// Consume events handled since boot.
    pub fn transmitted(&self) -> u32 {
        self.transmitted
    }

    /// Observer.
    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Observer.
    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }
}

/// Answer one received command on every source ring.
///
/// The pattern ring gets the echo reply, the literal rings their literal.
/// Each write is best effort. `command` is scratch space for the copy.
fn fan_out<D: DmaEngine>(
    channels: &mut ChannelManager,
    dma: &mut D,
    sink: RingId,
    command: &mut Vec<u8, ECHO_CAPACITY>,
) {
    command.clear();
    let Ok(sink_ring) = channels.ring_mut(sink) else {
        return;
    };
    match sink_ring.acquire_next(dma) {
        Ok(buf) => {
            let len = buf.count.min(buf.data.len());
            if len > ECHO_CAPACITY {
                log::warn!("ring {}: command of {} bytes not answered", sink.0, len);
                return;
            }
            // cannot fail, len is within the capacity
            let _ = command.extend_from_slice(&buf.data[..len]);
        }
        Err(err) => {
            log::warn!("ring {}: no command to answer: {}", sink.0, err);
            return;
        }
    }
    log::debug!("command of {} bytes", command.len());

    for ring in channels.rings_mut().filter(|r| r.is_source()) {
        let id = ring.id();
        let res = match ring.role() {
            RingRole::Pattern(_) => {
                let len = match ring.acquire_next(dma) {
                    Ok(buf) => write_echo(buf.data, command),
                    Err(err) => {
                        log::warn!("ring {}: no buffer for reply: {}", id.0, err);
                        continue;
                    }
                };
                ring.commit(dma, len)
            }
            _ => ring.refill(dma).map(|_| ()),
        };
        if let Err(err) = res {
            log::warn!("ring {}: reply dropped: {}", id.0, err);
        }
    }
}

/// Write `ok:` followed by the command into `buf`.
///
/// The command is only appended if the whole reply fits in less than the
/// buffer; otherwise the reply is the prefix alone.
fn write_echo(buf: &mut [u8], command: &[u8]) -> usize {
    let prefix = ECHO_PREFIX.len().min(buf.len());
    buf[..prefix].copy_from_slice(&ECHO_PREFIX[..prefix]);
    let end = prefix + command.len();
    if end < buf.len() {
        buf[prefix..end].copy_from_slice(command);
        end
    } else {
        prefix
    }
}
