//! Binary wire codec.
//!
//! Layout after the command byte and the little-endian flags:
//!
//! ```text
//! format        string
//! sender?       string
//! recipient?    string
//! channel?      string
//! era?          u32                      ASSIMILATE
//! era_from?     u32                      INTEREST
//! era_to?       u32                      INTEREST
//! encounter?    u16 count, (string, u32) INTEREST
//! offsets?      string "o2,o3,..."       ASSIMILATE
//! hops          u16 count, (string, u8 medium, u8 verified, u8 encrypted)
//!                                        ASSIMILATE
//! signature?    u16 length, bytes
//! payload_len   u64                      ASSIMILATE
//! payload                                ASSIMILATE, streamed
//! ```
//!
//! Strings are a big-endian `u16` length followed by UTF-8. Other integers are
//! big-endian. A field is read only when its flag bit is set; unknown bits and
//! bits that do not belong to the command are protocol errors. The signature
//! covers every header byte before it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use asap_core::{Crypto, Era, Format, Hop, Medium, PeerId};

use crate::error::{Result, SyncError};
use crate::pdu::{command, flags, AssimilateHeader, Framing, Interest, Pdu};

/// Reader half as the session holds it.
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Writer half as the session holds it.
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Destination for outbound PDUs.
#[async_trait]
pub trait PduSink: Send + Sync {
    /// Write one PDU followed by its payload, the concatenation of `payload`.
    async fn send(&self, pdu: &Pdu, payload: &[Bytes]) -> Result<()>;
}

/// A detached header signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Header bytes the signature covers.
    pub covered: Vec<u8>,
    pub bytes: Vec<u8>,
}

/// A PDU header read from the stream. Its payload is still unread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub pdu: Pdu,
    pub signature: Option<Signature>,
}

fn protocol(message: impl Into<String>) -> SyncError {
    SyncError::Protocol(message.into())
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

fn put_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    put_bytes16(buf, value.as_bytes())
}

fn put_bytes16(buf: &mut BytesMut, value: &[u8]) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| protocol(format!("field of {} bytes exceeds u16 length", value.len())))?;
    buf.put_u16(len);
    buf.put_slice(value);
    Ok(())
}

fn put_count(buf: &mut BytesMut, count: usize, what: &str) -> Result<()> {
    let count = u16::try_from(count).map_err(|_| protocol(format!("too many {}", what)))?;
    buf.put_u16(count);
    Ok(())
}

/// Encode the header of `pdu` up to, not including, the signature.
///
/// `signed` only sets the flag bit; the caller appends the signature.
pub fn encode_header(pdu: &Pdu, signed: bool) -> Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(128);
    let sign_bit = if signed { flags::SIGNED } else { 0 };

    match pdu {
        Pdu::Interest(interest) => {
            buf.put_u8(command::INTEREST);
            buf.put_u16_le(interest.flags() | sign_bit);
            put_string(&mut buf, interest.format.as_str())?;
            if let Some(sender) = &interest.sender {
                put_string(&mut buf, sender.as_str())?;
            }
            if let Some(recipient) = &interest.recipient {
                put_string(&mut buf, recipient.as_str())?;
            }
            if let Some(channel) = &interest.channel {
                put_string(&mut buf, channel)?;
            }
            if let Some(era) = interest.era_from {
                buf.put_u32(era.value());
            }
            if let Some(era) = interest.era_to {
                buf.put_u32(era.value());
            }
            if let Some(encounters) = &interest.encounters {
                put_count(&mut buf, encounters.len(), "encounter entries")?;
                for (peer, era) in encounters {
                    put_string(&mut buf, peer.as_str())?;
                    buf.put_u32(era.value());
                }
            }
        }
        Pdu::Assimilate(header) => {
            header
                .framing
                .validate()
                .map_err(|e| protocol(format!("refusing to send: {}", e)))?;

            buf.put_u8(command::ASSIMILATE);
            buf.put_u16_le(header.flags() | sign_bit);
            put_string(&mut buf, header.format.as_str())?;
            if let Some(sender) = &header.sender {
                put_string(&mut buf, sender.as_str())?;
            }
            if let Some(recipient) = &header.recipient {
                put_string(&mut buf, recipient.as_str())?;
            }
            put_string(&mut buf, &header.channel)?;
            buf.put_u32(header.era.value());
            if let Some(offsets) = header.framing.offsets_field() {
                put_string(&mut buf, &offsets)?;
            }
            put_count(&mut buf, header.hops.len(), "hops")?;
            for hop in &header.hops {
                put_string(&mut buf, hop.sender.as_str())?;
                buf.put_u8(hop.medium.to_u8());
                buf.put_u8(hop.verified as u8);
                buf.put_u8(hop.encrypted as u8);
            }
        }
    }

    Ok(buf)
}

/// Encode everything before the payload, signing the header when the crypto
/// collaborator produces a signature.
pub fn encode(pdu: &Pdu, crypto: &dyn Crypto) -> Result<BytesMut> {
    let signed = encode_header(pdu, true)?;
    let mut frame = match crypto.sign(&signed) {
        Some(signature) => {
            let mut frame = signed;
            put_bytes16(&mut frame, &signature)?;
            frame
        }
        None => encode_header(pdu, false)?,
    };

    if let Pdu::Assimilate(header) = pdu {
        frame.put_u64(header.framing.payload_len);
    }
    Ok(frame)
}

/// Write one PDU and its payload, then flush.
pub async fn write_pdu<W>(writer: &mut W, pdu: &Pdu, payload: &[Bytes], crypto: &dyn Crypto) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let total: u64 = payload.iter().map(|part| part.len() as u64).sum();
    if total != pdu.payload_len() {
        return Err(protocol(format!(
            "{} declares {} payload bytes, got {}",
            pdu.name(),
            pdu.payload_len(),
            total
        )));
    }

    let frame = encode(pdu, crypto)?;
    writer.write_all(&frame).await?;
    for part in payload {
        writer.write_all(part).await?;
    }
    writer.flush().await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Reads header fields and remembers the raw bytes for signature checks.
struct HeaderReader<'a> {
    inner: &'a mut (dyn AsyncRead + Unpin + Send),
    raw: Vec<u8>,
}

impl<'a> HeaderReader<'a> {
    fn new(inner: &'a mut (dyn AsyncRead + Unpin + Send)) -> Self {
        Self {
            inner,
            raw: Vec::with_capacity(128),
        }
    }

    /// The command byte, or `None` on a clean end of stream.
    async fn command(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        if self.inner.read(&mut byte).await? == 0 {
            return Ok(None);
        }
        self.raw.push(byte[0]);
        Ok(Some(byte[0]))
    }

    async fn exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.inner.read_exact(&mut buf).await?;
        self.raw.extend_from_slice(&buf);
        Ok(buf)
    }

    async fn u8(&mut self) -> Result<u8> {
        Ok(self.exact(1).await?[0])
    }

    async fn u16_le(&mut self) -> Result<u16> {
        let bytes = self.exact(2).await?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    async fn u16(&mut self) -> Result<u16> {
        let bytes = self.exact(2).await?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    async fn u32(&mut self) -> Result<u32> {
        let bytes = self.exact(4).await?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    async fn u64(&mut self) -> Result<u64> {
        let bytes = self.exact(8).await?;
        let mut array = [0u8; 8];
        array.copy_from_slice(&bytes);
        Ok(u64::from_be_bytes(array))
    }

    async fn bool(&mut self) -> Result<bool> {
        match self.u8().await? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(protocol(format!("invalid boolean {}", other))),
        }
    }

    async fn string(&mut self) -> Result<String> {
        let len = self.u16().await? as usize;
        let bytes = self.exact(len).await?;
        String::from_utf8(bytes).map_err(|_| protocol("string is not UTF-8"))
    }

    async fn peer(&mut self) -> Result<PeerId> {
        let id = self.string().await?;
        PeerId::new(id).map_err(|e| protocol(e.to_string()))
    }
}

fn has(bits: u16, flag: u16) -> bool {
    bits & flag != 0
}

/// Read one PDU header.
///
/// A clean end of stream before the command byte is [`SyncError::Closed`].
pub async fn read_pdu(reader: &mut (dyn AsyncRead + Unpin + Send), max_payload_len: u64) -> Result<Inbound> {
    let mut h = HeaderReader::new(reader);

    let cmd = h.command().await?.ok_or(SyncError::Closed)?;
    let bits = h.u16_le().await?;
    let allowed = match cmd {
        command::INTEREST => flags::INTEREST_ALLOWED,
        command::ASSIMILATE => flags::ASSIMILATE_ALLOWED,
        other => return Err(protocol(format!("unknown command {}", other))),
    };
    if bits & !allowed != 0 {
        return Err(protocol(format!(
            "flags {:#06x} not allowed for command {}",
            bits & !allowed,
            cmd
        )));
    }

    let format = Format::new(h.string().await?).map_err(|e| protocol(e.to_string()))?;
    let sender = if has(bits, flags::SENDER) { Some(h.peer().await?) } else { None };
    let recipient = if has(bits, flags::RECIPIENT) { Some(h.peer().await?) } else { None };
    let channel = if has(bits, flags::CHANNEL) { Some(h.string().await?) } else { None };

    let pdu = if cmd == command::INTEREST {
        let era_from = if has(bits, flags::ERA_FROM) { Some(Era(h.u32().await?)) } else { None };
        let era_to = if has(bits, flags::ERA_TO) { Some(Era(h.u32().await?)) } else { None };
        let encounters = if has(bits, flags::ENCOUNTER) {
            let count = h.u16().await?;
            let mut map = BTreeMap::new();
            for _ in 0..count {
                let peer = h.peer().await?;
                let era = Era(h.u32().await?);
                map.insert(peer, era);
            }
            Some(map)
        } else {
            None
        };

        Pdu::Interest(Interest {
            format,
            sender,
            recipient,
            channel,
            era_from,
            era_to,
            routing: has(bits, flags::ROUTING),
            encounters,
        })
    } else {
        let channel = channel.ok_or_else(|| protocol("ASSIMILATE without channel"))?;
        if !has(bits, flags::ERA) {
            return Err(protocol("ASSIMILATE without era"));
        }
        let era = Era(h.u32().await?);
        let offsets = if has(bits, flags::OFFSETS) {
            let field = h.string().await?;
            Framing::parse_offsets(&field).map_err(protocol)?
        } else {
            Vec::new()
        };

        let count = h.u16().await?;
        let mut hops = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let sender = h.peer().await?;
            let medium = Medium::from_u8(h.u8().await?).map_err(|e| protocol(e.to_string()))?;
            let verified = h.bool().await?;
            let encrypted = h.bool().await?;
            hops.push(Hop::new(sender, medium, verified, encrypted));
        }

        Pdu::Assimilate(AssimilateHeader {
            format,
            sender,
            recipient,
            channel,
            era,
            routed: has(bits, flags::ROUTING),
            hops,
            framing: Framing {
                offsets,
                payload_len: 0,
            },
        })
    };

    let signature = if has(bits, flags::SIGNED) {
        let covered = h.raw.clone();
        let len = h.u16().await? as usize;
        let bytes = h.exact(len).await?;
        Some(Signature { covered, bytes })
    } else {
        None
    };

    let pdu = match pdu {
        Pdu::Assimilate(mut header) => {
            let payload_len = h.u64().await?;
            if payload_len > max_payload_len {
                return Err(protocol(format!(
                    "payload of {} bytes exceeds limit of {}",
                    payload_len, max_payload_len
                )));
            }
            header.framing.payload_len = payload_len;
            header.framing.validate().map_err(protocol)?;
            Pdu::Assimilate(header)
        }
        interest => interest,
    };

    Ok(Inbound { pdu, signature })
}

// ─────────────────────────────────────────────────────────────────────────────
// Payload
// ─────────────────────────────────────────────────────────────────────────────

/// The unread payload of the current PDU.
///
/// Handlers consume what they need; whoever dispatched the PDU calls
/// [`Payload::drain`] afterwards so the stream is positioned at the next
/// header.
pub struct Payload<'a> {
    reader: &'a mut (dyn AsyncRead + Unpin + Send),
    remaining: u64,
}

impl<'a> Payload<'a> {
    /// Payload of `len` bytes at the current stream position.
    pub fn new(reader: &'a mut (dyn AsyncRead + Unpin + Send), len: u64) -> Self {
        Self {
            reader,
            remaining: len,
        }
    }

    /// Bytes not read yet.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Read the next `len` bytes.
    pub async fn read_message(&mut self, len: u64) -> Result<Bytes> {
        if len > self.remaining {
            return Err(protocol(format!(
                "message of {} bytes overruns payload ({} left)",
                len, self.remaining
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.reader.read_exact(&mut buf).await?;
        self.remaining -= len;
        Ok(Bytes::from(buf))
    }

    /// Skip the next `len` bytes.
    pub async fn skip(&mut self, len: u64) -> Result<()> {
        if len > self.remaining {
            return Err(protocol(format!(
                "skip of {} bytes overruns payload ({} left)",
                len, self.remaining
            )));
        }
        let mut limited = (&mut *self.reader).take(len);
        let skipped = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
        self.remaining -= skipped;
        if skipped < len {
            return Err(SyncError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        Ok(())
    }

    /// Skip whatever is left. Returns the number of bytes skipped.
    pub async fn drain(&mut self) -> Result<u64> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let expected = self.remaining;
        self.skip(expected).await?;
        Ok(expected)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Identification
// ─────────────────────────────────────────────────────────────────────────────

/// Send the local peer id as a length-prefixed string.
pub async fn write_peer_id<W>(writer: &mut W, id: &PeerId) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::new();
    put_string(&mut buf, id.as_str())?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the remote peer id.
pub async fn read_peer_id<R>(reader: &mut R) -> Result<PeerId>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = reader.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let id = String::from_utf8(buf).map_err(|_| SyncError::PeerNotIdentified)?;
    PeerId::new(id).map_err(|_| SyncError::PeerNotIdentified)
}
