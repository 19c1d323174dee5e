//! AAC RTP payload format (RFC 3640), MPEG-4 generic "mode 2" framing.
//!
//! Each RTP payload starts with an AU-headers section: a 16-bit
//! `AU-headers-length` (bit count) followed by that many bits of AU-headers,
//! one per access unit carried in the packet. This crate uses the common
//! `SizeLength=13, IndexLength=3, IndexDeltaLength=3` configuration (the
//! defaults most RTSP cameras and `ffmpeg` advertise), so every AU-header is
//! exactly 16 bits: a 13-bit AU size and a 3-bit index.
//!
//! ```text
//! AU-headers-length (16 bits)
//! AU-header 1 (13-bit size, 3-bit index) ...
//! AU 1
//! AU 2
//! ...
//! ```
//!
//! Several AAC frames can be aggregated into one packet when they fit under
//! the MTU; a single oversized frame is instead fragmented across multiple
//! packets, repeating the same AU-header (the full, unfragmented size) on
//! every fragment — mirroring how this crate's H.264 FU-A fragmentation
//! works in [`crate::media::h264`].

use crate::error::{Result, RtspError};
use crate::media::rtp::RtpHeader;
use crate::media::{AccessUnit, Depacketizer, Packetizer};

const DEFAULT_MTU: usize = 1400;

/// Samples per AAC frame, and so the RTP timestamp ticks (clock rate equals
/// sample rate for this payload) separating consecutive AUs aggregated into
/// one packet.
const SAMPLES_PER_FRAME: u32 = 1024;

/// Bits per AU-header under the SizeLength=13/IndexLength=3 configuration
/// this crate advertises in SDP (`fmtp` `sizelength=13;indexlength=3;indexdeltalength=3`).
const AU_HEADER_BITS: u16 = 16;

/// RTP/AAC packetizer (RFC 3640 §3.3, MPEG-4-generic payload).
pub struct AacPacketizer {
    header: RtpHeader,
    mtu: usize,
    sample_rate: u32,
    channels: u8,
}

impl AacPacketizer {
    pub fn new(payload_type: u8, ssrc: u32, sample_rate: u32, channels: u8) -> Self {
        Self { header: RtpHeader::new(payload_type, ssrc), mtu: DEFAULT_MTU, sample_rate, channels }
    }

    pub fn with_random_ssrc(payload_type: u8, sample_rate: u32, channels: u8) -> Self {
        Self { header: RtpHeader::with_random_ssrc(payload_type), mtu: DEFAULT_MTU, sample_rate, channels }
    }

    fn au_header(size: usize) -> [u8; 2] {
        (((size as u16) << 3) | 0).to_be_bytes()
    }

    /// Aggregates several access units that together fit under the MTU into
    /// one RTP packet (spec packing rule: "multiple small AUs -> one
    /// aggregated packet, marker = true"), each carrying its own AU-header
    /// with index delta 0 (RFC 3640 §3.2.1: consecutive AUs in one packet).
    ///
    /// Unlike [`packetize`](Packetizer::packetize), which treats its input
    /// as exactly one access unit, this is for callers that already have
    /// several small encoded AUs ready to send together (e.g. batching low
    /// bitrate audio to cut packet overhead).
    pub fn packetize_aggregate(&mut self, access_units: &[&[u8]], timestamp_increment: u32) -> Vec<u8> {
        let header_bits = AU_HEADER_BITS * access_units.len() as u16;
        let mut payload = Vec::with_capacity(2 + access_units.len() * 2 + access_units.iter().map(|a| a.len()).sum::<usize>());
        payload.extend_from_slice(&header_bits.to_be_bytes());
        for au in access_units {
            payload.extend_from_slice(&Self::au_header(au.len()));
        }
        for au in access_units {
            payload.extend_from_slice(au);
        }

        let header = self.header.write(true);
        let mut packet = Vec::with_capacity(12 + payload.len());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&payload);
        self.header.advance_timestamp(timestamp_increment);
        packet
    }
}

impl Packetizer for AacPacketizer {
    /// Packetizes a single raw AAC access unit (ADTS header already stripped).
    ///
    /// `timestamp_increment` is normally `1024` (the AAC frame size in
    /// samples) regardless of sample rate — RFC 3640's clock rate equals the
    /// sample rate, so one frame always advances the timestamp by the frame
    /// length in samples.
    fn packetize(&mut self, encoded_data: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        let single_packet_len = 4 + encoded_data.len();

        if single_packet_len <= self.mtu {
            let mut payload = Vec::with_capacity(single_packet_len);
            payload.extend_from_slice(&AU_HEADER_BITS.to_be_bytes());
            payload.extend_from_slice(&Self::au_header(encoded_data.len()));
            payload.extend_from_slice(encoded_data);

            let header = self.header.write(true);
            let mut packet = Vec::with_capacity(12 + payload.len());
            packet.extend_from_slice(&header);
            packet.extend_from_slice(&payload);
            packets.push(packet);
        } else {
            let chunk_cap = self.mtu.saturating_sub(4).max(1);
            let mut offset = 0;
            while offset < encoded_data.len() {
                let take = (encoded_data.len() - offset).min(chunk_cap);
                let is_last = offset + take >= encoded_data.len();

                let mut payload = Vec::with_capacity(4 + take);
                payload.extend_from_slice(&AU_HEADER_BITS.to_be_bytes());
                payload.extend_from_slice(&Self::au_header(encoded_data.len()));
                payload.extend_from_slice(&encoded_data[offset..offset + take]);

                let header = self.header.write(is_last);
                let mut packet = Vec::with_capacity(12 + payload.len());
                packet.extend_from_slice(&header);
                packet.extend_from_slice(&payload);
                packets.push(packet);

                offset += take;
            }
        }

        self.header.advance_timestamp(timestamp_increment);
        packets
    }

    fn codec_name(&self) -> &'static str {
        "MPEG4-GENERIC"
    }

    fn clock_rate(&self) -> u32 {
        self.sample_rate
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    fn sdp_attributes(&self) -> Vec<String> {
        let pt = self.payload_type();
        vec![
            format!("a=rtpmap:{pt} {}/{}/{}", self.codec_name(), self.sample_rate, self.channels),
            format!(
                "a=fmtp:{pt} streamtype=5; profile-level-id=1; mode=AAC-hbr; sizelength=13; indexlength=3; indexdeltalength=3; config=1210"
            ),
            "a=control:track2".to_string(),
        ]
    }

    fn next_sequence(&self) -> u16 {
        self.header.sequence()
    }

    fn next_rtp_timestamp(&self) -> u32 {
        self.header.timestamp() as u32
    }

    fn ssrc(&self) -> u32 {
        self.header.ssrc
    }
}

/// RTP/AAC depacketizer — the client-side inverse of [`AacPacketizer`].
#[derive(Default)]
pub struct AacDepacketizer {
    pending: Vec<u8>,
    expected_size: Option<usize>,
    pending_timestamp: Option<u32>,
}

impl AacDepacketizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn flush(&mut self) -> Vec<AccessUnit> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let timestamp = self.pending_timestamp.take().unwrap_or(0);
        let data = std::mem::take(&mut self.pending);
        self.expected_size = None;
        vec![AccessUnit { data, timestamp }]
    }
}

fn codec_err(msg: impl Into<String>) -> RtspError {
    RtspError::Codec(msg.into())
}

impl Depacketizer for AacDepacketizer {
    fn push(&mut self, payload: &[u8], timestamp: u32, marker: bool) -> Result<Vec<AccessUnit>> {
        if payload.len() < 2 {
            return Err(codec_err("AAC payload is too short"));
        }
        let au_headers_length_bits = u16::from_be_bytes([payload[0], payload[1]]);
        if au_headers_length_bits == 0 || au_headers_length_bits % AU_HEADER_BITS != 0 {
            return Err(codec_err(format!("invalid AU-headers-length ({au_headers_length_bits})")));
        }
        let num_headers = (au_headers_length_bits / AU_HEADER_BITS) as usize;
        let header_bytes = num_headers * 2;
        if payload.len() < 2 + header_bytes {
            return Err(codec_err("AAC payload is too short"));
        }

        let mut headers = Vec::with_capacity(num_headers);
        for i in 0..num_headers {
            let raw = u16::from_be_bytes([payload[2 + i * 2], payload[3 + i * 2]]);
            headers.push(((raw >> 3) as usize, raw & 0x7));
        }
        if headers[0].1 != 0 {
            return Err(codec_err("AU-index on first AU is unsupported"));
        }

        let mut offset = 2 + header_bytes;

        if num_headers > 1 {
            if !self.pending.is_empty() {
                return Err(codec_err("fragmented packet with more than one AU header is invalid"));
            }
            let mut out = Vec::with_capacity(num_headers);
            for (i, (size, _index)) in headers.iter().enumerate() {
                if offset + size > payload.len() {
                    return Err(codec_err("AAC payload is too short"));
                }
                let au_timestamp = timestamp.wrapping_add(SAMPLES_PER_FRAME * i as u32);
                out.push(AccessUnit { data: payload[offset..offset + size].to_vec(), timestamp: au_timestamp });
                offset += size;
            }
            return Ok(out);
        }

        let (size, _index) = headers[0];
        let chunk = &payload[offset..];

        if self.pending.is_empty() {
            if chunk.len() >= size {
                return Ok(vec![AccessUnit { data: chunk[..size].to_vec(), timestamp }]);
            }
            self.pending = chunk.to_vec();
            self.expected_size = Some(size);
            self.pending_timestamp = Some(timestamp);
            if marker {
                return Ok(self.flush());
            }
            return Ok(Vec::new());
        }

        self.pending.extend_from_slice(chunk);
        if marker || self.pending.len() >= self.expected_size.unwrap_or(usize::MAX) {
            return Ok(self.flush());
        }
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_au_fits_in_one_packet() {
        let mut p = AacPacketizer::new(97, 0x1234, 48000, 2);
        let au = vec![0xAAu8; 100];
        let packets = p.packetize(&au, 1024);
        assert_eq!(packets.len(), 1);
        let payload = &packets[0][12..];
        assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 16);
        assert_eq!(u16::from_be_bytes([payload[2], payload[3]]) >> 3, 100);
        assert_eq!(&payload[4..], &au[..]);
        assert_eq!(packets[0][1] & 0x80, 0x80, "marker set on single-packet AU");
    }

    #[test]
    fn aggregate_encode_matches_three_au_reference_payload() {
        let mut p = AacPacketizer::new(97, 0x9dbb7812, 48000, 2);
        let aus = [&[0x00u8, 0x01, 0x02, 0x03][..], &[0x04, 0x05, 0x06, 0x07][..], &[0x08, 0x09, 0x0A, 0x0B][..]];
        let packet = p.packetize_aggregate(&aus, 1024);
        let expected_payload = [0x00, 0x30, 0x00, 0x20, 0x00, 0x20, 0x00, 0x20, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B];
        assert_eq!(&packet[12..], &expected_payload[..]);
        assert_eq!(packet[1] & 0x80, 0x80, "marker set on aggregated packet");
    }

    #[test]
    fn aggregate_encode_decodes_back_to_separate_aus() {
        let mut p = AacPacketizer::new(97, 0x1234, 48000, 2);
        let aus = [&[0u8, 1, 2, 3][..], &[4, 5, 6, 7][..], &[8, 9, 10, 11][..]];
        let packet = p.packetize_aggregate(&aus, 1024);

        let mut d = AacDepacketizer::new();
        let decoded = d.push(&packet[12..], 3000, true).unwrap();
        assert_eq!(decoded.len(), 3);
        for (i, (au, expected)) in decoded.iter().zip(aus.iter()).enumerate() {
            assert_eq!(&au.data, expected);
            assert_eq!(au.timestamp, 3000 + 1024 * i as u32, "AU {i} PTS must advance by 1024/AU within the packet");
        }
    }

    #[test]
    fn oversized_au_is_fragmented_and_reassembles() {
        let mut p = AacPacketizer::new(97, 0x1234, 48000, 2);
        let au: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
        let packets = p.packetize(&au, 1024);
        assert!(packets.len() > 1);

        let mut d = AacDepacketizer::new();
        let mut aus = Vec::new();
        let last = packets.len() - 1;
        for (i, packet) in packets.iter().enumerate() {
            let marker = packet[1] & 0x80 != 0;
            assert_eq!(marker, i == last);
            aus.extend(d.push(&packet[12..], 0, marker).unwrap());
        }
        assert_eq!(aus.len(), 1);
        assert_eq!(aus[0].data, au);
    }

    #[test]
    fn aggregated_aus_decode_to_separate_access_units() {
        let payload = {
            let mut v = vec![];
            v.extend_from_slice(&48u16.to_be_bytes()); // 3 headers * 16 bits
            v.extend_from_slice(&((4u16) << 3).to_be_bytes());
            v.extend_from_slice(&((4u16) << 3).to_be_bytes());
            v.extend_from_slice(&((4u16) << 3).to_be_bytes());
            v.extend_from_slice(&[0, 1, 2, 3]);
            v.extend_from_slice(&[4, 5, 6, 7]);
            v.extend_from_slice(&[8, 9, 10, 11]);
            v
        };
        let mut d = AacDepacketizer::new();
        let aus = d.push(&payload, 1000, true).unwrap();
        assert_eq!(aus.len(), 3);
        assert_eq!(aus[0].data, vec![0, 1, 2, 3]);
        assert_eq!(aus[2].data, vec![8, 9, 10, 11]);
    }

    #[test]
    fn zero_au_headers_length_is_rejected() {
        let mut d = AacDepacketizer::new();
        assert!(d.push(&[0x00, 0x00, 0xff], 0, true).is_err());
    }

    #[test]
    fn nonzero_index_on_first_au_is_rejected() {
        let mut d = AacDepacketizer::new();
        let header = ((4u16) << 3) | 1; // index=1
        let mut payload = vec![];
        payload.extend_from_slice(&16u16.to_be_bytes());
        payload.extend_from_slice(&header.to_be_bytes());
        payload.extend_from_slice(&[0, 1, 2, 3]);
        assert!(d.push(&payload, 0, true).is_err());
    }

    #[test]
    fn sdp_attributes_describe_mpeg4_generic() {
        let p = AacPacketizer::new(97, 0x1234, 48000, 2);
        let attrs = p.sdp_attributes();
        assert!(attrs[0].contains("MPEG4-GENERIC/48000/2"));
        assert!(attrs[1].contains("mode=AAC-hbr"));
    }
}
