//! Setup packet decoding and the deferred vendor request handoff.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use usb_device::control::{Recipient, Request, RequestType};
use usb_device::UsbDirection;

/// Size of the EP0 data phase buffer.
pub const EP0_BUFFER_SIZE: usize = 32;

/// Feature selector of function suspend on an interface.
pub const FEATURE_FUNCTION_SUSPEND: u16 = 0;

/// Raw setup packet as the controller hands it over.
///
/// Word 0 holds `bmRequestType | bRequest << 8 | wValue << 16`,
/// word 1 holds `wIndex | wLength << 16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetupData {
    words: [u32; 2],
}

impl SetupData {
    /// Setup packet from the two controller words.
    pub const fn from_words(word0: u32, word1: u32) -> Self {
        SetupData {
            words: [word0, word1],
        }
    }

    /// Setup packet from its 8 wire bytes.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        let word0 = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let word1 = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self::from_words(word0, word1)
    }

    /// The two controller words.
    pub fn words(&self) -> (u32, u32) {
        (self.words[0], self.words[1])
    }

    /// `bmRequestType`.
    pub fn request_type(&self) -> u8 {
        (self.words[0] & 0xff) as u8
    }

    /// `bRequest`.
    pub fn code(&self) -> u8 {
        ((self.words[0] >> 8) & 0xff) as u8
    }

    /// `wValue`.
    pub fn value(&self) -> u16 {
        (self.words[0] >> 16) as u16
    }

    /// `wIndex`.
    pub fn index(&self) -> u16 {
        (self.words[1] & 0xffff) as u16
    }

    /// `wLength`.
    pub fn length(&self) -> u16 {
        (self.words[1] >> 16) as u16
    }

    /// Decode into a standard request.
    pub fn request(&self) -> Request {
        let rt = self.request_type();
        Request {
            direction: if rt & 0x80 != 0 {
                UsbDirection::In
            } else {
                UsbDirection::Out
            },
            request_type: match (rt >> 5) & 0b11 {
                0 => RequestType::Standard,
                1 => RequestType::Class,
                2 => RequestType::Vendor,
                _ => RequestType::Reserved,
            },
            recipient: match rt & 0b1_1111 {
                0 => Recipient::Device,
                1 => Recipient::Interface,
                2 => Recipient::Endpoint,
                3 => Recipient::Other,
                _ => Recipient::Reserved,
            },
            request: self.code(),
            value: self.value(),
            index: self.index(),
            length: self.length(),
        }
    }
}

/// Vendor requests understood on the device recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VendorRequest {
    /// Reply with the request counter and a fixed tag.
    Echo = 0x76,
    /// Trigger remote wakeup from the application thread.
    HostWake = 0x77,
    /// Reply with the EP0 status phase count.
    StatusCount = 0x78,
    /// Delay, then ack.
    Delay = 0x79,
    /// Receive and drop an OUT data phase.
    DataOut = 0x80,
    /// Reply with the driver event log index.
    LogIndex = 0x81,
    /// Reply with the driver event log.
    LogRead = 0x82,
    /// Reply with one device register.
    ReadRegister = 0x83,
    /// Reply with the boot firmware version.
    BooterVersion = 0x84,
    /// Hand control to the boot firmware.
    JumpToBooter = 0x90,
    /// Reconnect as a USB 2 device.
    ForceUsb2 = 0xb1,
    /// Reconnect with USB 3 enabled.
    ForceUsb3 = 0xb2,
    /// Stop and restart the USB stack.
    RestartStack = 0xb3,
    /// Reset the device.
    Reset = 0xe0,
    /// Enter standby on the next VBus removal.
    ArmStandby = 0xe1,
}

impl VendorRequest {
    /// Look a request code up.
    pub fn from_code(code: u8) -> Option<Self> {
        use VendorRequest::*;
        let req = match code {
            0x76 => Echo,
            0x77 => HostWake,
            0x78 => StatusCount,
            0x79 => Delay,
            0x80 => DataOut,
            0x81 => LogIndex,
            0x82 => LogRead,
            0x83 => ReadRegister,
            0x84 => BooterVersion,
            0x90 => JumpToBooter,
            0xb1 => ForceUsb2,
            0xb2 => ForceUsb3,
            0xb3 => RestartStack,
            0xe0 => Reset,
            0xe1 => ArmStandby,
            _ => return None,
        };
        Some(req)
    }

    /// Whether the request leaves this firmware for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VendorRequest::JumpToBooter | VendorRequest::Reset)
    }
}

/// Handoff of one vendor request from the setup callback to the
/// application thread, plus the EP0 bookkeeping.
///
/// Shared between both contexts without a lock.
///
/// The host serializes control transfers, so at most one request is ever
/// pending and the two setup words are never written while being read.
#[derive(Debug, Default)]
pub struct ControlRequestContext {
    setup: [AtomicU32; 2],
    pending: AtomicBool,
    status_count: AtomicU32,
    counter: AtomicU8,
}

impl ControlRequestContext {
    /// Empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a request for the application thread. Setup callback side.
    pub fn store(&self, setup: SetupData) {
        let (word0, word1) = setup.words();
        self.setup[0].store(word0, Ordering::Relaxed);
        self.setup[1].store(word1, Ordering::Relaxed);
        self.pending.store(true, Ordering::Release);
    }

    /// Take the stored request. Application thread side.
    pub fn take(&self) -> Option<SetupData> {
        if !self.pending.load(Ordering::Acquire) {
            return None;
        }
        self.pending.store(false, Ordering::Relaxed);
        Some(SetupData::from_words(
            self.setup[0].load(Ordering::Relaxed),
            self.setup[1].load(Ordering::Relaxed),
        ))
    }

    /// Count one completed status phase.
    pub fn note_status_complete(&self) {
        // single writer, no read-modify-write needed
        let count = self.status_count.load(Ordering::Relaxed);
        self.status_count.store(count.wrapping_add(1), Ordering::Relaxed);
    }

    /// Completed status phases since boot.
    pub fn status_count(&self) -> u32 {
        self.status_count.load(Ordering::Relaxed)
    }

    /// Return the vendor request counter and advance it.
    ///
    /// Application thread only.
    pub fn next_counter(&self) -> u8 {
        let n = self.counter.load(Ordering::Relaxed);
        self.counter.store(n.wrapping_add(1), Ordering::Relaxed);
        n
    }
}
