//! Wire protocol definitions for the Homa transport.
//!
//! Every packet on the wire starts with a [`CommonHeader`] carrying the
//! opcode and the id of the message the packet belongs to. DATA, GRANT and
//! RESEND packets extend the common header with their own fields; DONE,
//! BUSY, PING, UNKNOWN and ERROR packets are a bare common header.
//!
//! Messages themselves carry a [`MessageHeader`] prefix (currently just the
//! raw reply address) ahead of the application payload. The transport
//! strips this prefix before the payload is handed to the application.
//!
//! A message is identified by a [`MessageId`]: the [`OpId`] of the
//! operation it belongs to plus a tag. Tag 1 marks the initial request of
//! an operation chain, tag 0 the ultimate response; each delegated hop in
//! between uses the incoming request's tag plus one, so response and
//! request tags can never collide.

use std::fmt;

use crate::error::{Error, Result};

/// Tag of the final reply in an operation chain.
pub const ULTIMATE_RESPONSE_TAG: u32 = 0;

/// Tag of the first request in an operation chain.
pub const INITIAL_REQUEST_TAG: u32 = 1;

/// Packet opcode.
///
/// Opcode 0 is deliberately unused so a zeroed buffer never parses as a
/// valid packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Message payload bytes.
    Data = 1,
    /// Permission for the sender to transmit more bytes.
    Grant = 2,
    /// Acknowledgement that the receiving operation completed.
    Done = 3,
    /// Request to retransmit a byte range.
    Resend = 4,
    /// The asked-about bytes have not been sent yet; stop asking.
    Busy = 5,
    /// Liveness probe for an outbound message.
    Ping = 6,
    /// The probed message is not known at this endpoint.
    Unknown = 7,
    /// The remote endpoint failed the operation.
    Error = 8,
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Opcode::Data),
            2 => Ok(Opcode::Grant),
            3 => Ok(Opcode::Done),
            4 => Ok(Opcode::Resend),
            5 => Ok(Opcode::Busy),
            6 => Ok(Opcode::Ping),
            7 => Ok(Opcode::Unknown),
            8 => Ok(Opcode::Error),
            _ => Err(Error::InvalidOpcode(value)),
        }
    }
}

/// Globally unique operation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId {
    /// Identifier of the transport that created the operation.
    pub transport_id: u64,
    /// Sequence number within that transport.
    pub sequence: u64,
}

impl OpId {
    /// Create a new operation id.
    pub fn new(transport_id: u64, sequence: u64) -> Self {
        Self {
            transport_id,
            sequence,
        }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport_id, self.sequence)
    }
}

/// Identifier of one message within an operation chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId {
    /// Operation the message belongs to.
    pub op_id: OpId,
    /// Position of the message within the chain.
    pub tag: u32,
}

impl MessageId {
    /// Create a new message id.
    pub fn new(op_id: OpId, tag: u32) -> Self {
        Self { op_id, tag }
    }

    /// True if this id names the ultimate response of its chain.
    #[inline]
    pub fn is_response(&self) -> bool {
        self.tag == ULTIMATE_RESPONSE_TAG
    }

    /// True if this id names the initial request of its chain.
    #[inline]
    pub fn is_initial_request(&self) -> bool {
        self.tag == INITIAL_REQUEST_TAG
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.op_id, self.tag)
    }
}

/// Header common to every packet (21 bytes).
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       1     opcode
/// 1       8     transport_id
/// 9       8     sequence
/// 17      4     tag
/// ```
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct CommonHeader {
    /// Packet opcode (see [`Opcode`]).
    pub opcode: u8,
    /// Transport id of the owning operation.
    pub transport_id: u64,
    /// Sequence number of the owning operation.
    pub sequence: u64,
    /// Message tag within the operation chain.
    pub tag: u32,
}

impl CommonHeader {
    /// Size of the common header in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Create a new common header.
    pub fn new(opcode: Opcode, id: MessageId) -> Self {
        Self {
            opcode: opcode as u8,
            transport_id: id.op_id.transport_id,
            sequence: id.op_id.sequence,
            tag: id.tag,
        }
    }

    /// The id of the message this packet belongs to.
    #[inline]
    pub fn message_id(&self) -> MessageId {
        let transport_id = self.transport_id;
        let sequence = self.sequence;
        let tag = self.tag;
        MessageId::new(OpId::new(transport_id, sequence), tag)
    }

    /// The packet opcode, if valid.
    #[inline]
    pub fn opcode(&self) -> Result<Opcode> {
        Opcode::try_from(self.opcode)
    }

    /// Serialize the header into a fixed-size array.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        unsafe { self.write_to(buf.as_mut_ptr()) };
        buf
    }

    /// Parse a header from the front of a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SIZE,
                available: bytes.len(),
            });
        }
        let hdr = unsafe { Self::read_from(bytes.as_ptr()) };
        hdr.opcode()?;
        Ok(hdr)
    }

    /// Write the header to a raw buffer.
    ///
    /// # Safety
    /// The destination must be at least `SIZE` bytes.
    pub unsafe fn write_to(&self, dst: *mut u8) {
        std::ptr::copy_nonoverlapping(self as *const Self as *const u8, dst, Self::SIZE);
    }

    /// Read a header from a raw buffer.
    ///
    /// # Safety
    /// The source must be at least `SIZE` bytes.
    pub unsafe fn read_from(src: *const u8) -> Self {
        std::ptr::read_unaligned(src as *const Self)
    }
}

/// Header of a DATA packet (29 bytes). Payload bytes follow it.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct DataHeader {
    /// Common packet header (opcode DATA).
    pub common: CommonHeader,
    /// Total length of the message in bytes.
    pub total_length: u32,
    /// Byte offset of this packet's payload within the message.
    pub offset: u32,
}

impl DataHeader {
    /// Size of the DATA header in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Create a new DATA header.
    pub fn new(id: MessageId, total_length: u32, offset: u32) -> Self {
        Self {
            common: CommonHeader::new(Opcode::Data, id),
            total_length,
            offset,
        }
    }

    /// Serialize the header into a fixed-size array.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        unsafe {
            std::ptr::copy_nonoverlapping(self as *const Self as *const u8, buf.as_mut_ptr(), Self::SIZE);
        }
        buf
    }

    /// Parse a header from the front of a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SIZE,
                available: bytes.len(),
            });
        }
        Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const Self) })
    }
}

/// Header of a GRANT packet (25 bytes).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct GrantHeader {
    /// Common packet header (opcode GRANT).
    pub common: CommonHeader,
    /// The sender may transmit message bytes up to this offset.
    pub offset: u32,
}

impl GrantHeader {
    /// Size of the GRANT header in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Create a new GRANT header.
    pub fn new(id: MessageId, offset: u32) -> Self {
        Self {
            common: CommonHeader::new(Opcode::Grant, id),
            offset,
        }
    }

    /// Serialize the header into a fixed-size array.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        unsafe {
            std::ptr::copy_nonoverlapping(self as *const Self as *const u8, buf.as_mut_ptr(), Self::SIZE);
        }
        buf
    }

    /// Parse a header from the front of a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SIZE,
                available: bytes.len(),
            });
        }
        Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const Self) })
    }
}

/// Header of a RESEND packet (29 bytes).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct ResendHeader {
    /// Common packet header (opcode RESEND).
    pub common: CommonHeader,
    /// First byte of the range to retransmit.
    pub offset: u32,
    /// Length of the range to retransmit.
    pub length: u32,
}

impl ResendHeader {
    /// Size of the RESEND header in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Create a new RESEND header.
    pub fn new(id: MessageId, offset: u32, length: u32) -> Self {
        Self {
            common: CommonHeader::new(Opcode::Resend, id),
            offset,
            length,
        }
    }

    /// Serialize the header into a fixed-size array.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        unsafe {
            std::ptr::copy_nonoverlapping(self as *const Self as *const u8, buf.as_mut_ptr(), Self::SIZE);
        }
        buf
    }

    /// Parse a header from the front of a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SIZE,
                available: bytes.len(),
            });
        }
        Ok(unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const Self) })
    }
}

/// Number of bytes of raw address carried in a message header.
pub const RAW_ADDRESS_SIZE: usize = 8;

/// Per-message header placed ahead of the application payload (8 bytes).
///
/// Written by `alloc_op`/`receive_op` into the outbound buffer and stripped
/// from the inbound buffer once the message is ready.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct MessageHeader {
    /// Address replies to this message should be sent to, in raw wire form.
    pub reply_address: [u8; RAW_ADDRESS_SIZE],
}

impl MessageHeader {
    /// Size of the message header in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Create a new message header.
    pub fn new(reply_address: [u8; RAW_ADDRESS_SIZE]) -> Self {
        Self { reply_address }
    }

    /// Serialize the header into a fixed-size array.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        self.reply_address
    }

    /// Parse a header from the front of a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::BufferTooSmall {
                required: Self::SIZE,
                available: bytes.len(),
            });
        }
        let mut reply_address = [0u8; RAW_ADDRESS_SIZE];
        reply_address.copy_from_slice(&bytes[..Self::SIZE]);
        Ok(Self { reply_address })
    }
}
