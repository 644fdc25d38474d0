//! Sample packets on the data channel.
//!
//! ```text
//! byte 0       flags (PacketFlags)
//! bytes 1-7    reserved
//! bytes 8-15   counter: timestamp of the first sample, u64 LE
//! bytes 16-    payload: samples in the link encoding, channels interleaved
//! ```

use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_complex::Complex;

use super::codec::{self, SampleFormat};
use crate::error::{LmsError, Result};

/// Size of one data packet.
pub const DATA_PACKET_SIZE: usize = 4096;
/// Header bytes before the payload.
pub const DATA_HEADER_SIZE: usize = 16;
/// Payload bytes per packet.
pub const DATA_PAYLOAD_SIZE: usize = DATA_PACKET_SIZE - DATA_HEADER_SIZE;

bitflags! {
    /// Header flag byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u8 {
        /// Last packet of a transmit burst.
        const END_OF_BURST = 1 << 1;
        /// Board dropped a transmit packet whose timestamp had passed.
        const TX_DROPPED_LATE = 1 << 3;
        /// Transmit immediately, ignoring the counter.
        const IGNORE_TIMESTAMP = 1 << 4;
    }
}

/// Parsed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    /// Flag byte.
    pub flags: PacketFlags,
    /// Timestamp of the first sample.
    pub counter: u64,
}

impl PacketHeader {
    /// Parse the first [`DATA_HEADER_SIZE`] bytes of `packet`.
    pub fn parse(packet: &[u8]) -> Self {
        let mut buf = &packet[..DATA_HEADER_SIZE];
        let flags = PacketFlags::from_bits_retain(buf.get_u8());
        buf.advance(7);
        Self {
            flags,
            counter: buf.get_u64_le(),
        }
    }

    /// Append the header bytes to `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        out.put_u8(self.flags.bits());
        out.put_bytes(0, 7);
        out.put_u64_le(self.counter);
    }
}

/// Samples per channel carried by one packet.
pub fn samples_per_packet(link: SampleFormat, channels: usize) -> usize {
    DATA_PAYLOAD_SIZE / (link.bytes_per_sample() * channels.max(1))
}

/// Append one packet to `out`: header, then the channels interleaved
/// sample by sample. Short channels are zero-padded to a full payload.
pub fn encode_packet(
    header: PacketHeader,
    link: SampleFormat,
    channels: &[&[Complex<i16>]],
    out: &mut Vec<u8>,
) -> Result<()> {
    let per_channel = samples_per_packet(link, channels.len());
    if let Some(long) = channels.iter().find(|c| c.len() > per_channel) {
        return Err(LmsError::invalid_argument(format!(
            "{} samples exceed {per_channel} per packet",
            long.len()
        )));
    }
    let start = out.len();
    header.write(out);
    let mut interleaved = Vec::with_capacity(per_channel * channels.len());
    let used = channels.iter().map(|c| c.len()).max().unwrap_or(0);
    for n in 0..used {
        for channel in channels {
            interleaved.push(channel.get(n).copied().unwrap_or_default());
        }
    }
    codec::encode(link, &interleaved, out);
    out.resize(start + DATA_PACKET_SIZE, 0);
    Ok(())
}

/// Split one packet into its header and per-channel sample vectors.
pub fn decode_packet(
    packet: &[u8],
    link: SampleFormat,
    channels: usize,
) -> Result<(PacketHeader, Vec<Vec<Complex<i16>>>)> {
    if packet.len() != DATA_PACKET_SIZE {
        return Err(LmsError::invalid_argument(format!(
            "data packet is {} bytes, expected {DATA_PACKET_SIZE}",
            packet.len()
        )));
    }
    let channels = channels.max(1);
    let header = PacketHeader::parse(packet);
    let per_channel = samples_per_packet(link, channels);
    let used = link.encoded_len(per_channel * channels);

    let mut interleaved = Vec::with_capacity(per_channel * channels);
    codec::decode(link, &packet[DATA_HEADER_SIZE..DATA_HEADER_SIZE + used], &mut interleaved)?;

    let mut split = vec![Vec::with_capacity(per_channel); channels];
    for frame in interleaved.chunks_exact(channels) {
        for (dst, &sample) in split.iter_mut().zip(frame) {
            dst.push(sample);
        }
    }
    Ok((header, split))
}
