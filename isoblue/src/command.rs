//! Line protocol spoken with the ISOBlue bridge
//!
//! Every command is one newline-terminated ASCII line:
//!
//! ```text
//! <opcode char><channel nibble><payload>
//! ```
//!
//! Numbers in payloads are fixed-width, zero-padded hex. We always emit
//! lower case and accept either case.
//!
//! | Opcode     | Payload                                                                     |
//! |------------|-----------------------------------------------------------------------------|
//! | `F` FILT   | `<5 count>` then `count` x `<5 pgn>`                                        |
//! | `W` WRITE  | `<5 pgn><2 dest><4 len><len x 2 data>`                                      |
//! | `M` MESG   | `<8 id><5 pgn><2 dest><4 len><len x 2 data><8 secs><5 usecs><2 src>`        |
//! | `O` OLD_MESG | same as MESG, an id of `00000000` marks the end of history                |
//! | `P` PAST   | `<8 from id><8 to id>` on the broadcast channel                             |
//! | `A` ACK, `S` START | opaque                                                              |

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::FrameError;
use crate::message::{Message, MessageId};
use crate::pgn::Pgn;

/// Largest payload the 4-digit length field can describe.
pub const MAX_DATA_LEN: usize = 0xFFFF;

/// Longest line the bridge can send: a MESG carrying `MAX_DATA_LEN` bytes,
/// plus the terminator.
pub const MAX_FRAME_LEN: usize = 2 + 8 + 5 + 2 + 4 + 2 * MAX_DATA_LEN + 8 + 5 + 2 + 2;

const MICROS_PER_SECOND: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Filt,
    Write,
    Mesg,
    OldMesg,
    Ack,
    Past,
    Start,
}

impl OpCode {
    pub fn as_char(self) -> char {
        match self {
            OpCode::Filt => 'F',
            OpCode::Write => 'W',
            OpCode::Mesg => 'M',
            OpCode::OldMesg => 'O',
            OpCode::Ack => 'A',
            OpCode::Past => 'P',
            OpCode::Start => 'S',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'F' => Some(OpCode::Filt),
            'W' => Some(OpCode::Write),
            'M' => Some(OpCode::Mesg),
            'O' => Some(OpCode::OldMesg),
            'A' => Some(OpCode::Ack),
            'P' => Some(OpCode::Past),
            'S' => Some(OpCode::Start),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpCode::Filt => "FILT",
            OpCode::Write => "WRITE",
            OpCode::Mesg => "MESG",
            OpCode::OldMesg => "OLD_MESG",
            OpCode::Ack => "ACK",
            OpCode::Past => "PAST",
            OpCode::Start => "START",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which bus a command concerns. `Broadcast` addresses the bridge itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Engine,
    Implement,
    Broadcast,
}

impl Channel {
    pub fn nibble(self) -> u8 {
        match self {
            Channel::Engine => 0x0,
            Channel::Implement => 0x1,
            Channel::Broadcast => 0xF,
        }
    }

    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x0 => Some(Channel::Engine),
            0x1 => Some(Channel::Implement),
            0xF => Some(Channel::Broadcast),
            _ => None,
        }
    }
}

/// One frame of the bridge protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    opcode: OpCode,
    channel: Channel,
    payload: String,
}

impl Command {
    pub fn new(opcode: OpCode, channel: Channel, payload: impl Into<String>) -> Self {
        Self {
            opcode,
            channel,
            payload: payload.into(),
        }
    }

    /// FILT with the complete filter set for `channel`. Replaces any previous filter.
    /// An empty set means no filtering.
    pub fn filter(channel: Channel, pgns: impl IntoIterator<Item = Pgn>) -> Self {
        let pgns: BTreeSet<Pgn> = pgns.into_iter().collect();
        let mut payload = format!("{:05x}", pgns.len());
        for pgn in &pgns {
            payload.push_str(&format!("{:05x}", pgn.as_u32()));
        }
        Self::new(OpCode::Filt, channel, payload)
    }

    /// WRITE asking the bridge to put `message` on the bus.
    pub fn write(channel: Channel, message: &Message) -> Result<Self, FrameError> {
        let data = checked_data(message)?;
        let payload = format!(
            "{:05x}{:02x}{:04x}{}",
            message.pgn().as_u32(),
            message.dest_addr(),
            data.len(),
            hex::encode(data)
        );
        Ok(Self::new(OpCode::Write, channel, payload))
    }

    /// MESG carrying a live message. A message without an id encodes as the sentinel.
    pub fn mesg(channel: Channel, message: &Message) -> Result<Self, FrameError> {
        Ok(Self::new(OpCode::Mesg, channel, stored_payload(Some(message))?))
    }

    /// OLD_MESG carrying a replayed message.
    pub fn old_mesg(channel: Channel, message: &Message) -> Result<Self, FrameError> {
        Ok(Self::new(OpCode::OldMesg, channel, stored_payload(Some(message))?))
    }

    /// OLD_MESG with the all-zero id: the bridge has no more history.
    pub fn end_of_history(channel: Channel) -> Self {
        // A sentinel carries no data, so encoding cannot fail
        let payload = stored_payload(None).unwrap_or_default();
        Self::new(OpCode::OldMesg, channel, payload)
    }

    /// PAST asking the bridge to replay stored messages with ids in `[from, to]`.
    pub fn past(from: u32, to: MessageId) -> Self {
        Self::new(
            OpCode::Past,
            Channel::Broadcast,
            format!("{:08x}{:08x}", from, to.as_u32()),
        )
    }

    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Decode one received line, without its terminator.
    pub fn from_bytes(line: &[u8]) -> Result<Self, FrameError> {
        let line = std::str::from_utf8(line).map_err(|_| FrameError::NotText)?;
        line.parse()
    }

    /// Decode the payload of a MESG or OLD_MESG. `Ok(None)` is the all-zero sentinel.
    pub fn decode_message(&self) -> Result<Option<Message>, FrameError> {
        if !matches!(self.opcode, OpCode::Mesg | OpCode::OldMesg) {
            return Err(self.unexpected("MESG"));
        }
        let mut fields = Fields::new(&self.payload);
        let Some(id) = MessageId::new(fields.number(8, "id")?) else {
            return Ok(None);
        };
        let pgn = Pgn::new(fields.number(5, "pgn")?)?;
        let dest_addr = fields.number(2, "dest")? as u8;
        let len = fields.number(4, "len")? as usize;
        let data = fields.bytes(len, "data")?;
        let secs = fields.number(8, "seconds")? as i64;
        let micros = fields.number(5, "microseconds")?;
        if i64::from(micros) >= MICROS_PER_SECOND {
            return Err(FrameError::OutOfRange {
                field: "microseconds",
                value: micros,
            });
        }
        let src_addr = fields.number(2, "src")? as u8;
        fields.finish()?;

        Ok(Some(Message::new(
            Some(id),
            src_addr,
            dest_addr,
            pgn,
            data,
            secs * MICROS_PER_SECOND + i64::from(micros),
        )))
    }

    /// Decode the payload of a WRITE. Source and time are not on the wire.
    pub fn decode_write(&self) -> Result<Message, FrameError> {
        if self.opcode != OpCode::Write {
            return Err(self.unexpected("WRITE"));
        }
        let mut fields = Fields::new(&self.payload);
        let pgn = Pgn::new(fields.number(5, "pgn")?)?;
        let dest_addr = fields.number(2, "dest")? as u8;
        let len = fields.number(4, "len")? as usize;
        let data = fields.bytes(len, "data")?;
        fields.finish()?;
        Ok(Message::outgoing(dest_addr, pgn, data))
    }

    /// Decode the PGN list of a FILT.
    pub fn decode_filter(&self) -> Result<Vec<Pgn>, FrameError> {
        if self.opcode != OpCode::Filt {
            return Err(self.unexpected("FILT"));
        }
        let mut fields = Fields::new(&self.payload);
        let count = fields.number(5, "count")? as usize;
        let mut pgns = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            pgns.push(Pgn::new(fields.number(5, "pgn")?)?);
        }
        fields.finish()?;
        Ok(pgns)
    }

    /// Decode the `(from, to)` ids of a PAST.
    pub fn decode_past(&self) -> Result<(u32, u32), FrameError> {
        if self.opcode != OpCode::Past {
            return Err(self.unexpected("PAST"));
        }
        let mut fields = Fields::new(&self.payload);
        let from = fields.number(8, "from")?;
        let to = fields.number(8, "to")?;
        fields.finish()?;
        Ok((from, to))
    }

    fn unexpected(&self, expected: &'static str) -> FrameError {
        FrameError::UnexpectedOpcode {
            opcode: self.opcode.name(),
            expected,
        }
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        if !line.is_ascii() {
            return Err(FrameError::NotText);
        }
        let mut chars = line.chars();
        let op = chars.next().ok_or(FrameError::Empty)?;
        let opcode = OpCode::from_char(op).ok_or(FrameError::UnknownOpcode(op))?;
        let nibble = chars.next().ok_or(FrameError::Length {
            expected: 2,
            actual: 1,
        })?;
        let channel = nibble
            .to_digit(16)
            .and_then(|n| Channel::from_nibble(n as u8))
            .ok_or(FrameError::InvalidChannel(nibble))?;
        Ok(Self::new(opcode, channel, &line[2..]))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}{:x}{}",
            self.opcode.as_char(),
            self.channel.nibble(),
            self.payload
        )
    }
}

fn checked_data(message: &Message) -> Result<&[u8], FrameError> {
    let data = message.data();
    if data.len() > MAX_DATA_LEN {
        return Err(FrameError::Length {
            expected: MAX_DATA_LEN,
            actual: data.len(),
        });
    }
    Ok(data)
}

fn stored_payload(message: Option<&Message>) -> Result<String, FrameError> {
    let Some(message) = message.filter(|m| m.id().is_some()) else {
        return Ok(format!("{:08x}{:05x}{:02x}{:04x}{:08x}{:05x}{:02x}", 0, 0, 0, 0, 0, 0, 0));
    };
    let data = checked_data(message)?;
    // The wire cannot carry times before the epoch or past u32 seconds
    let micros = message.timestamp_micros().max(0);
    let secs = (micros / MICROS_PER_SECOND).min(u32::MAX as i64);
    Ok(format!(
        "{:08x}{:05x}{:02x}{:04x}{}{:08x}{:05x}{:02x}",
        message.id().map_or(0, |id| id.as_u32()),
        message.pgn().as_u32(),
        message.dest_addr(),
        data.len(),
        hex::encode(data),
        secs,
        micros % MICROS_PER_SECOND,
        message.src_addr()
    ))
}

/// Cursor over the fixed-width fields of an ASCII payload.
struct Fields<'a> {
    payload: &'a str,
    pos: usize,
}

impl<'a> Fields<'a> {
    fn new(payload: &'a str) -> Self {
        Self { payload, pos: 0 }
    }

    fn take(&mut self, width: usize) -> Result<&'a str, FrameError> {
        let end = self.pos + width;
        let field = self.payload.get(self.pos..end).ok_or(FrameError::Length {
            expected: end,
            actual: self.payload.len(),
        })?;
        self.pos = end;
        Ok(field)
    }

    fn number(&mut self, width: usize, field: &'static str) -> Result<u32, FrameError> {
        let value = self.take(width)?;
        if !value.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(FrameError::InvalidHex {
                field,
                value: value.to_string(),
            });
        }
        u32::from_str_radix(value, 16).map_err(|_| FrameError::InvalidHex {
            field,
            value: value.to_string(),
        })
    }

    fn bytes(&mut self, len: usize, field: &'static str) -> Result<Vec<u8>, FrameError> {
        let value = self.take(len * 2)?;
        hex::decode(value).map_err(|_| FrameError::InvalidHex {
            field,
            value: value.to_string(),
        })
    }

    fn finish(self) -> Result<(), FrameError> {
        if self.pos != self.payload.len() {
            return Err(FrameError::Length {
                expected: self.pos,
                actual: self.payload.len(),
            });
        }
        Ok(())
    }
}
