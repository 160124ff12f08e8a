// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Command-level header carried at the front of every transport message.
//!
//! Requests start with a three byte [`CommandHeader`]; responses repeat the
//! header (with the request bit cleared) and append a [`CompletionCode`].

use crate::transport::MessageTag;
use crate::HubpackError;
use core::fmt;
use core::mem;
use serde::Serialize;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const REQUEST_HEADER_SIZE: usize = 3;
pub const RESPONSE_HEADER_SIZE: usize = REQUEST_HEADER_SIZE + 1;

pub const INTEGRITY_CHECK: u8 = 0x80;
pub const TYPE_MASK: u8 = 0x7f;
pub const REQUEST: u8 = 0x80;
pub const DATAGRAM: u8 = 0x40;
pub const INSTANCE_ID_MASK: u8 = 0x3f;

/// Command sets understood by the EROT.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum_macros::FromRepr,
    strum_macros::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum MessageType {
    /// MCTP control commands (endpoint ID assignment).
    Control = 0x00,
    /// Firmware update commands.
    FwUpdate = 0x01,
}

/// 6-bit request/response correlation ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct InstanceId(u8);

impl InstanceId {
    /// Number of distinct instance IDs.
    pub const COUNT: usize = INSTANCE_ID_MASK as usize + 1;

    pub const fn new(id: u8) -> Self {
        Self(id & INSTANCE_ID_MASK)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self::new(self.0.wrapping_add(1))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Response completion code. Values at or above
/// [`CompletionCode::COMMAND_SPECIFIC`] are defined per command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionCode(pub u8);

impl CompletionCode {
    pub const SUCCESS: Self = Self(0x00);
    pub const ERROR: Self = Self(0x01);
    pub const INVALID_DATA: Self = Self(0x02);
    pub const INVALID_LENGTH: Self = Self(0x03);
    pub const NOT_READY: Self = Self(0x04);
    pub const UNSUPPORTED_COMMAND: Self = Self(0x05);
    pub const COMMAND_SPECIFIC: Self = Self(0x80);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for CompletionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::SUCCESS => "success",
            Self::ERROR => "error",
            Self::INVALID_DATA => "invalid data",
            Self::INVALID_LENGTH => "invalid length",
            Self::NOT_READY => "not ready",
            Self::UNSUPPORTED_COMMAND => "unsupported command",
            _ => return write!(f, "completion code {:#04x}", self.0),
        };
        write!(f, "{name}")
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    FromBytes,
    IntoBytes,
    Immutable,
    KnownLayout,
)]
#[repr(C)]
pub struct CommandHeader {
    type_byte: u8,
    instance_byte: u8,
    pub command: u8,
}

const_assert_eq!(mem::size_of::<CommandHeader>(), REQUEST_HEADER_SIZE);

impl CommandHeader {
    /// Builds a request header: request bit set, type and instance ID masked
    /// to their fields.
    pub fn request(
        msg_type: MessageType,
        instance_id: InstanceId,
        command: u8,
    ) -> Self {
        Self {
            type_byte: msg_type as u8 & TYPE_MASK,
            instance_byte: REQUEST | instance_id.get(),
            command,
        }
    }

    /// The header a response to this request carries.
    pub fn to_response(self) -> Self {
        Self { instance_byte: self.instance_byte & !REQUEST, ..self }
    }

    /// Message type with the integrity-check bit removed.
    pub fn msg_type(&self) -> u8 {
        self.type_byte & TYPE_MASK
    }

    pub fn integrity_check(&self) -> bool {
        self.type_byte & INTEGRITY_CHECK != 0
    }

    pub fn instance_id(&self) -> InstanceId {
        InstanceId::new(self.instance_byte)
    }

    pub fn is_request(&self) -> bool {
        self.instance_byte & REQUEST != 0
    }

    pub fn is_datagram(&self) -> bool {
        self.instance_byte & DATAGRAM != 0
    }

    /// Splits a header off the front of `bytes`.
    pub fn read(bytes: &[u8]) -> Result<(Self, &[u8]), CommandError> {
        Self::read_from_prefix(bytes)
            .map_err(|_| CommandError::Truncated { len: bytes.len() })
    }

    /// Splits a response header and completion code off the front of
    /// `bytes`.
    pub fn read_response(
        bytes: &[u8],
    ) -> Result<(Self, CompletionCode, &[u8]), CommandError> {
        if bytes.len() < RESPONSE_HEADER_SIZE {
            return Err(CommandError::Truncated { len: bytes.len() });
        }
        let (header, rest) = Self::read(bytes)?;
        Ok((header, CompletionCode(rest[0]), &rest[1..]))
    }
}

/// Which field of a response failed to match its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMismatch {
    Tag { expected: MessageTag, got: MessageTag },
    Command { expected: u8, got: u8 },
    InstanceId { expected: InstanceId, got: InstanceId },
    MessageType { expected: u8, got: u8 },
}

impl fmt::Display for ResponseMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tag { expected, got } => {
                write!(f, "response tag {got} != request tag {expected}")
            }
            Self::Command { expected, got } => {
                write!(f, "response command {got:#x} != {expected:#x}")
            }
            Self::InstanceId { expected, got } => {
                write!(f, "response instance ID {got} != {expected}")
            }
            Self::MessageType { expected, got } => {
                write!(f, "response type {got:#x} != {expected:#x}")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for ResponseMismatch {}

/// Accepts `response` as the answer to `request` only if the message tag,
/// command, instance ID and type all agree.
pub fn validate_response(
    request: &CommandHeader,
    response: &CommandHeader,
    request_tag: MessageTag,
    response_tag: MessageTag,
) -> Result<(), ResponseMismatch> {
    if request_tag != response_tag {
        return Err(ResponseMismatch::Tag {
            expected: request_tag,
            got: response_tag,
        });
    }
    if request.command != response.command {
        return Err(ResponseMismatch::Command {
            expected: request.command,
            got: response.command,
        });
    }
    if request.instance_id() != response.instance_id() {
        return Err(ResponseMismatch::InstanceId {
            expected: request.instance_id(),
            got: response.instance_id(),
        });
    }
    if request.msg_type() != response.msg_type() {
        return Err(ResponseMismatch::MessageType {
            expected: request.msg_type(),
            got: response.msg_type(),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    /// Message shorter than its header.
    Truncated { len: usize },
    /// Encoding ran past the end of the output buffer.
    OutputTooSmall,
    /// Body ended before all of its fixed fields.
    BodyTruncated,
    /// A length field disagrees with the bytes actually present.
    LengthMismatch { expected: usize, got: usize },
    /// A body field holds a value that cannot be decoded.
    InvalidBody,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { len } => {
                write!(f, "message of {len} bytes is too short for its header")
            }
            Self::OutputTooSmall => write!(f, "output buffer too small"),
            Self::BodyTruncated => write!(f, "message body truncated"),
            Self::LengthMismatch { expected, got } => {
                write!(f, "body length {got} does not match expected {expected}")
            }
            Self::InvalidBody => write!(f, "invalid message body"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CommandError {}

impl From<HubpackError> for CommandError {
    fn from(err: HubpackError) -> Self {
        match err {
            HubpackError::Overrun => Self::OutputTooSmall,
            HubpackError::Truncated => Self::BodyTruncated,
            _ => Self::InvalidBody,
        }
    }
}

/// Appends raw bytes at `offset`, returning the new offset.
pub(crate) fn put_bytes(
    out: &mut [u8],
    offset: usize,
    bytes: &[u8],
) -> Result<usize, CommandError> {
    let end = offset + bytes.len();
    out.get_mut(offset..end)
        .ok_or(CommandError::OutputTooSmall)?
        .copy_from_slice(bytes);
    Ok(end)
}

/// Encodes `header`, a fixed-width little-endian `body` and trailing
/// variable-length bytes into `out`.
pub fn encode_request<T: Serialize>(
    out: &mut [u8],
    header: CommandHeader,
    body: &T,
    trailing: &[u8],
) -> Result<usize, CommandError> {
    let n = put_bytes(out, 0, header.as_bytes())?;
    let n = n + hubpack::serialize(
        out.get_mut(n..).ok_or(CommandError::OutputTooSmall)?,
        body,
    )?;
    put_bytes(out, n, trailing)
}

/// Encodes a response: `header` (request bit cleared), completion code,
/// `body` and trailing bytes.
pub fn encode_response<T: Serialize>(
    out: &mut [u8],
    header: CommandHeader,
    code: CompletionCode,
    body: &T,
    trailing: &[u8],
) -> Result<usize, CommandError> {
    let n = put_bytes(out, 0, header.to_response().as_bytes())?;
    let n = put_bytes(out, n, &[code.0])?;
    let n = n + hubpack::serialize(
        out.get_mut(n..).ok_or(CommandError::OutputTooSmall)?,
        body,
    )?;
    put_bytes(out, n, trailing)
}
