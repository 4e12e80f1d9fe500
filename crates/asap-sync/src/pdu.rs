//! Protocol data units.
//!
//! Two PDUs exist: INTEREST, sent once per format when a session starts, and
//! ASSIMILATE, which carries one chunk. Optional header fields are `Option`s;
//! their presence decides the corresponding flag bit on the wire.

use std::collections::BTreeMap;

use bytes::Bytes;

use asap_core::{Era, Format, Hop, PeerId};

/// Command bytes.
pub mod command {
    /// "Send me what I don't have yet."
    pub const INTEREST: u8 = 0;
    /// One chunk of messages.
    pub const ASSIMILATE: u8 = 2;
}

/// Header flag bits (little-endian `u16` after the command byte).
pub mod flags {
    pub const SENDER: u16 = 1 << 0;
    pub const RECIPIENT: u16 = 1 << 1;
    pub const CHANNEL: u16 = 1 << 2;
    pub const ERA: u16 = 1 << 3;
    pub const ERA_FROM: u16 = 1 << 4;
    pub const ERA_TO: u16 = 1 << 5;
    pub const OFFSETS: u16 = 1 << 6;
    pub const SIGNED: u16 = 1 << 7;
    pub const ROUTING: u16 = 1 << 8;
    pub const ENCOUNTER: u16 = 1 << 9;

    /// Bits an INTEREST may carry.
    pub const INTEREST_ALLOWED: u16 =
        SENDER | RECIPIENT | CHANNEL | ERA_FROM | ERA_TO | SIGNED | ROUTING | ENCOUNTER;

    /// Bits an ASSIMILATE may carry.
    pub const ASSIMILATE_ALLOWED: u16 =
        SENDER | RECIPIENT | CHANNEL | ERA | OFFSETS | SIGNED | ROUTING;
}

/// Handshake PDU: announces the sender's window and routing preference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interest {
    pub format: Format,
    pub sender: Option<PeerId>,
    pub recipient: Option<PeerId>,
    pub channel: Option<String>,
    /// Oldest era the sender retains, in its own numbering.
    pub era_from: Option<Era>,
    /// The sender's open era.
    pub era_to: Option<Era>,
    /// Whether the sender accepts routed content.
    pub routing: bool,
    /// The sender's `last_seen` map.
    pub encounters: Option<BTreeMap<PeerId, Era>>,
}

impl Interest {
    /// An INTEREST carrying only the format.
    pub fn new(format: Format) -> Self {
        Self {
            format,
            sender: None,
            recipient: None,
            channel: None,
            era_from: None,
            era_to: None,
            routing: false,
            encounters: None,
        }
    }

    /// Flag bits implied by the present fields.
    pub fn flags(&self) -> u16 {
        let mut bits = 0;
        if self.sender.is_some() {
            bits |= flags::SENDER;
        }
        if self.recipient.is_some() {
            bits |= flags::RECIPIENT;
        }
        if self.channel.is_some() {
            bits |= flags::CHANNEL;
        }
        if self.era_from.is_some() {
            bits |= flags::ERA_FROM;
        }
        if self.era_to.is_some() {
            bits |= flags::ERA_TO;
        }
        if self.routing {
            bits |= flags::ROUTING;
        }
        if self.encounters.is_some() {
            bits |= flags::ENCOUNTER;
        }
        bits
    }
}

/// How an ASSIMILATE payload splits into messages.
///
/// `offsets` holds the start offsets of messages 2..n; the first message
/// starts at zero and the last one ends at `payload_len`. An empty payload
/// holds no message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Framing {
    pub offsets: Vec<u64>,
    pub payload_len: u64,
}

impl Framing {
    /// Framing for sending `messages` back to back.
    pub fn of(messages: &[Bytes]) -> Self {
        let mut offsets = Vec::with_capacity(messages.len().saturating_sub(1));
        let mut position = 0u64;
        for (index, message) in messages.iter().enumerate() {
            if index > 0 {
                offsets.push(position);
            }
            position += message.len() as u64;
        }
        Self {
            offsets,
            payload_len: position,
        }
    }

    /// Check that offsets are strictly increasing and inside the payload.
    pub fn validate(&self) -> std::result::Result<(), String> {
        let mut previous = 0u64;
        for &offset in &self.offsets {
            if offset <= previous {
                return Err(format!("offset {} does not follow {}", offset, previous));
            }
            if offset >= self.payload_len {
                return Err(format!(
                    "offset {} outside payload of {} bytes",
                    offset, self.payload_len
                ));
            }
            previous = offset;
        }
        Ok(())
    }

    /// Length of each message, in order.
    pub fn message_lengths(&self) -> Vec<u64> {
        if self.payload_len == 0 {
            return Vec::new();
        }
        let mut lengths = Vec::with_capacity(self.offsets.len() + 1);
        let mut start = 0u64;
        for &offset in &self.offsets {
            lengths.push(offset - start);
            start = offset;
        }
        lengths.push(self.payload_len - start);
        lengths
    }

    /// The offsets field as sent on the wire: decimal, comma separated.
    pub fn offsets_field(&self) -> Option<String> {
        if self.offsets.is_empty() {
            return None;
        }
        let parts: Vec<String> = self.offsets.iter().map(u64::to_string).collect();
        Some(parts.join(","))
    }

    /// Parse the offsets field.
    pub fn parse_offsets(field: &str) -> std::result::Result<Vec<u64>, String> {
        field
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<u64>()
                    .map_err(|_| format!("invalid offset {:?}", part))
            })
            .collect()
    }
}

/// Header of an ASSIMILATE PDU. The payload follows it on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssimilateHeader {
    pub format: Format,
    /// End-to-end sender. When absent the immediate peer is the sender.
    pub sender: Option<PeerId>,
    /// Present for closed channels: the peer this copy is meant for.
    pub recipient: Option<PeerId>,
    pub channel: String,
    /// Era of the chunk, in the end-to-end sender's numbering.
    pub era: Era,
    /// The chunk is re-offered by a peer other than its sender.
    pub routed: bool,
    /// Relay attestations collected so far.
    pub hops: Vec<Hop>,
    pub framing: Framing,
}

impl AssimilateHeader {
    /// Header for an unrouted chunk with no hops and an empty payload.
    pub fn new(format: Format, channel: impl Into<String>, era: Era) -> Self {
        Self {
            format,
            sender: None,
            recipient: None,
            channel: channel.into(),
            era,
            routed: false,
            hops: Vec::new(),
            framing: Framing::default(),
        }
    }

    /// Flag bits implied by the present fields.
    pub fn flags(&self) -> u16 {
        let mut bits = flags::CHANNEL | flags::ERA;
        if self.sender.is_some() {
            bits |= flags::SENDER;
        }
        if self.recipient.is_some() {
            bits |= flags::RECIPIENT;
        }
        if !self.framing.offsets.is_empty() {
            bits |= flags::OFFSETS;
        }
        if self.routed {
            bits |= flags::ROUTING;
        }
        bits
    }
}

/// A decoded protocol data unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    Interest(Interest),
    Assimilate(AssimilateHeader),
}

impl Pdu {
    /// Command byte.
    pub fn command(&self) -> u8 {
        match self {
            Pdu::Interest(_) => command::INTEREST,
            Pdu::Assimilate(_) => command::ASSIMILATE,
        }
    }

    /// Human-readable command name.
    pub fn name(&self) -> &'static str {
        match self {
            Pdu::Interest(_) => "INTEREST",
            Pdu::Assimilate(_) => "ASSIMILATE",
        }
    }

    /// Format the PDU is addressed to.
    pub fn format(&self) -> &Format {
        match self {
            Pdu::Interest(interest) => &interest.format,
            Pdu::Assimilate(header) => &header.format,
        }
    }

    /// Payload bytes following the header on the stream.
    pub fn payload_len(&self) -> u64 {
        match self {
            Pdu::Interest(_) => 0,
            Pdu::Assimilate(header) => header.framing.payload_len,
        }
    }
}
