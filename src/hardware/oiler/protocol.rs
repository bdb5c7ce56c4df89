//! Oiler command framing.
//!
//! Frames travel over the UART-style wireless service as little-endian binary:
//!
//! ```text
//! request:  opcode:u8 | seq:u16 | len:u8 | payload[len]
//! response: seq:u16   | status:u8 | len:u8 | payload[len]
//! ```
//!
//! Both layouts carry the payload length in the fourth byte, so one [`FrameDecoder`]
//! reassembles either direction from notification chunks that may split or join frames.

use crate::error::{AppResult, OilerError};
use crate::messages::BatteryReading;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Fixed header size shared by requests and responses.
pub const HEADER_LEN: usize = 4;

/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    Ping = 0x01,
    Dispense = 0x02,
    Battery = 0x03,
}

impl Opcode {
    /// Decode a wire opcode.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Opcode::Ping),
            0x02 => Some(Opcode::Dispense),
            0x03 => Some(Opcode::Battery),
            _ => None,
        }
    }

    /// Lower-case name used in logs and timeout errors.
    pub fn name(&self) -> &'static str {
        match self {
            Opcode::Ping => "ping",
            Opcode::Dispense => "dispense",
            Opcode::Battery => "battery",
        }
    }
}

/// Result code carried in every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    Busy,
    InvalidArgument,
    LowBattery,
    MotorFault,
    Unknown(u8),
}

impl StatusCode {
    /// Decode a wire status; unassigned values are kept as `Unknown`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => StatusCode::Ok,
            0x01 => StatusCode::Busy,
            0x02 => StatusCode::InvalidArgument,
            0x03 => StatusCode::LowBattery,
            0x04 => StatusCode::MotorFault,
            other => StatusCode::Unknown(other),
        }
    }

    /// Wire value.
    pub fn as_u8(&self) -> u8 {
        match self {
            StatusCode::Ok => 0x00,
            StatusCode::Busy => 0x01,
            StatusCode::InvalidArgument => 0x02,
            StatusCode::LowBattery => 0x03,
            StatusCode::MotorFault => 0x04,
            StatusCode::Unknown(code) => *code,
        }
    }

    /// Operator-facing description.
    pub fn describe(&self) -> &'static str {
        match self {
            StatusCode::Ok => "ok",
            StatusCode::Busy => "busy",
            StatusCode::InvalidArgument => "invalid argument",
            StatusCode::LowBattery => "battery too low",
            StatusCode::MotorFault => "motor fault",
            StatusCode::Unknown(_) => "unknown status",
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Host to oiler frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Requested operation
    pub opcode: Opcode,
    /// Echoed in the matching response
    pub seq: u16,
    /// Opcode-specific arguments
    pub payload: Bytes,
}

impl Request {
    /// Liveness check.
    pub fn ping(seq: u16) -> Self {
        Self {
            opcode: Opcode::Ping,
            seq,
            payload: Bytes::new(),
        }
    }

    /// Dispense request. The pump counts steps in 16 bits.
    pub fn dispense(seq: u16, amount_steps: u32) -> AppResult<Self> {
        let steps = u16::try_from(amount_steps).map_err(|_| {
            OilerError::Protocol(format!(
                "dispense amount {amount_steps} does not fit the 16-bit step counter"
            ))
        })?;
        Ok(Self {
            opcode: Opcode::Dispense,
            seq,
            payload: Bytes::copy_from_slice(&steps.to_le_bytes()),
        })
    }

    /// Battery voltage and power source query.
    pub fn battery(seq: u16) -> Self {
        Self {
            opcode: Opcode::Battery,
            seq,
            payload: Bytes::new(),
        }
    }

    /// Wire form, header included.
    pub fn encode(&self) -> Bytes {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD);
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.opcode as u8);
        buf.put_u16_le(self.seq);
        buf.put_u8(self.payload.len() as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode one complete request frame.
    pub fn decode(mut frame: Bytes) -> Result<Self, String> {
        if frame.len() < HEADER_LEN {
            return Err("Insufficient data for request header".to_string());
        }
        let opcode = Opcode::from_u8(frame.get_u8()).ok_or_else(|| "Invalid opcode".to_string())?;
        let seq = frame.get_u16_le();
        let len = frame.get_u8() as usize;
        if frame.len() != len {
            return Err("Payload size mismatch".to_string());
        }
        Ok(Self {
            opcode,
            seq,
            payload: frame,
        })
    }

    /// Dispense amount, when this is a well-formed dispense request.
    pub fn dispense_steps(&self) -> Option<u16> {
        match (self.opcode, self.payload.as_ref()) {
            (Opcode::Dispense, [lo, hi]) => Some(u16::from_le_bytes([*lo, *hi])),
            _ => None,
        }
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Oiler to host frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Sequence number of the request answered
    pub seq: u16,
    /// Result code
    pub status: StatusCode,
    /// Opcode-specific result data
    pub payload: Bytes,
}

impl Response {
    /// Successful response to `seq`.
    pub fn ok(seq: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            seq,
            status: StatusCode::Ok,
            payload: payload.into(),
        }
    }

    /// Wire form, header included.
    pub fn encode(&self) -> Bytes {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD);
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u16_le(self.seq);
        buf.put_u8(self.status.as_u8());
        buf.put_u8(self.payload.len() as u8);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode one complete response frame.
    pub fn decode(mut frame: Bytes) -> Result<Self, String> {
        if frame.len() < HEADER_LEN {
            return Err("Insufficient data for response header".to_string());
        }
        let seq = frame.get_u16_le();
        let status = StatusCode::from_u8(frame.get_u8());
        let len = frame.get_u8() as usize;
        if frame.len() != len {
            return Err("Payload size mismatch".to_string());
        }
        Ok(Self {
            seq,
            status,
            payload: frame,
        })
    }

    /// Payload on success, `Device` error carrying the status code otherwise.
    pub fn into_result(self, opcode: Opcode) -> AppResult<Bytes> {
        match self.status {
            StatusCode::Ok => Ok(self.payload),
            status => Err(OilerError::Device {
                code: i32::from(status.as_u8()),
                message: format!("{} rejected: {}", opcode.name(), status.describe()),
            }),
        }
    }
}

/// Battery reply payload: `millivolts:u16 | usb:u8`.
pub fn decode_battery(payload: &[u8]) -> AppResult<BatteryReading> {
    match payload {
        [lo, hi, usb, ..] => Ok(BatteryReading {
            voltage: f32::from(u16::from_le_bytes([*lo, *hi])) / 1000.0,
            on_usb_power: *usb != 0,
        }),
        _ => Err(OilerError::Protocol(format!(
            "battery reply too short ({} bytes)",
            payload.len()
        ))),
    }
}

/// Encode a battery reply payload.
pub fn encode_battery(millivolts: u16, on_usb_power: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(3);
    buf.put_u16_le(millivolts);
    buf.put_u8(u8::from(on_usb_power));
    buf.freeze()
}

// =============================================================================
// Reassembly
// =============================================================================

/// Reassembles frames from arbitrarily chunked input.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a received chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Next complete frame, header included.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let total = HEADER_LEN + self.buf[3] as usize;
        if self.buf.len() < total {
            return None;
        }
        Some(self.buf.split_to(total).freeze())
    }

    /// Bytes waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drop any partial frame.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

/// Wrapping 16-bit request counter.
#[derive(Debug, Default)]
pub struct SequenceCounter {
    next: u16,
}

impl SequenceCounter {
    /// Take the next number, wrapping after `u16::MAX`.
    pub fn next(&mut self) -> u16 {
        let seq = self.next;
        self.next = self.next.wrapping_add(1);
        seq
    }
}
