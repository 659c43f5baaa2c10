use std::fmt;

use chrono::{DateTime, Utc};

use crate::pgn::Pgn;

/// ISOBUS null address, used as the source of messages we originate.
pub const NULL_ADDRESS: u8 = 0xFE;
/// ISOBUS global (broadcast) destination address.
pub const GLOBAL_ADDRESS: u8 = 0xFF;

/// Sequence number the bridge assigns to every message it stores.
///
/// Zero is reserved on the wire as the "no message" sentinel, so a
/// `MessageId` is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(u32);

impl MessageId {
    pub fn new(value: u32) -> Option<Self> {
        (value != 0).then_some(Self(value))
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

fn format_data_bytes(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A single ISOBUS datagram.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Message {
    id: Option<MessageId>,
    src_addr: u8,
    dest_addr: u8,
    pgn: Pgn,
    data: Vec<u8>,
    timestamp_micros: i64,
}

impl Message {
    /// Timestamp carried by messages that have not been on the bus yet.
    pub const NO_TIMESTAMP: i64 = -1;

    pub fn new(
        id: Option<MessageId>,
        src_addr: u8,
        dest_addr: u8,
        pgn: Pgn,
        data: impl Into<Vec<u8>>,
        timestamp_micros: i64,
    ) -> Self {
        Self {
            id,
            src_addr,
            dest_addr,
            pgn,
            data: data.into(),
            timestamp_micros,
        }
    }

    /// A message to be written to a bus. The bridge supplies source and time.
    pub fn outgoing(dest_addr: u8, pgn: Pgn, data: impl Into<Vec<u8>>) -> Self {
        Self::new(None, NULL_ADDRESS, dest_addr, pgn, data, Self::NO_TIMESTAMP)
    }

    pub fn id(&self) -> Option<MessageId> {
        self.id
    }

    pub fn src_addr(&self) -> u8 {
        self.src_addr
    }

    pub fn dest_addr(&self) -> u8 {
        self.dest_addr
    }

    pub fn pgn(&self) -> Pgn {
        self.pgn
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Microseconds since the Unix epoch.
    pub fn timestamp_micros(&self) -> i64 {
        self.timestamp_micros
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        if self.timestamp_micros < 0 {
            return None;
        }
        DateTime::from_timestamp_micros(self.timestamp_micros)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} SA:{} DA:{} Data: {} Time: {}",
            self.pgn,
            self.src_addr,
            self.dest_addr,
            format_data_bytes(&self.data),
            self.timestamp_micros
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pgn(value: u32) -> Pgn {
        Pgn::new(value).unwrap()
    }

    #[test]
    fn test_message_id_zero_is_sentinel() {
        assert_eq!(MessageId::new(0), None);
        assert_eq!(MessageId::new(42).map(MessageId::as_u32), Some(42));
    }

    #[test]
    fn test_outgoing_defaults() {
        let msg = Message::outgoing(0x26, pgn(0x00EF00), vec![1, 2, 3]);
        assert_eq!(msg.id(), None);
        assert_eq!(msg.src_addr(), NULL_ADDRESS);
        assert_eq!(msg.dest_addr(), 0x26);
        assert_eq!(msg.timestamp_micros(), Message::NO_TIMESTAMP);
        assert_eq!(msg.time(), None);
        assert_eq!(msg.data(), &[1, 2, 3]);
    }

    #[test]
    fn test_payload_is_owned_copy() {
        let mut buf: Vec<u8> = vec![0xAA, 0xBB];
        let msg = Message::outgoing(GLOBAL_ADDRESS, pgn(0x00F004), buf.as_slice());
        buf[0] = 0x00;
        assert_eq!(msg.data(), &[0xAA, 0xBB]);
    }

    #[test]
    fn test_equality_includes_id() {
        let a = Message::new(MessageId::new(1), 3, 0xFF, pgn(0x00F004), vec![1], 10);
        let b = Message::new(MessageId::new(2), 3, 0xFF, pgn(0x00F004), vec![1], 10);
        let c = Message::new(MessageId::new(1), 3, 0xFF, pgn(0x00F004), vec![1], 10);
        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_time_conversion() {
        let msg = Message::new(None, 0, 0xFF, pgn(0x00F004), Vec::new(), 1_500_000);
        let time = msg.time().unwrap();
        assert_eq!(time.timestamp(), 1);
        assert_eq!(time.timestamp_subsec_micros(), 500_000);
    }

    #[test]
    fn test_display() {
        let msg = Message::new(None, 0x1C, 0xFF, pgn(61444), vec![0x0F, 0xA0], 77);
        assert_eq!(msg.to_string(), "PGN:61444 SA:28 DA:255 Data: 0f a0 Time: 77");
    }
}
