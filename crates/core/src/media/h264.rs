use base64::prelude::{BASE64_STANDARD, Engine as _};

use super::{AccessUnit, Depacketizer, Packetizer};
use super::rtp::RtpHeader;
use crate::error::{Result, RtspError};

const DEFAULT_MTU: usize = 1400;
/// Bound on a reassembled access unit (RFC 6184 depacketization), per spec §3.
const MAX_ACCESS_UNIT_SIZE: usize = 1024 * 1024;

fn codec_err(msg: impl Into<String>) -> RtspError {
    RtspError::Codec(msg.into())
}

/// Converts between H.264 Annex B byte streams and lists of NAL units
/// (RFC 6184 §1.3 background; ITU-T H.264 Annex B start-code delimiting).
///
/// The codec accepts both the 3-byte (`00 00 01`) and 4-byte
/// (`00 00 00 01`) start code on input — real encoders emit either — but
/// always *emits* the 4-byte form, matching the asymmetry the reference
/// implementation exhibits (spec §9 Open Question, resolved as-is).
pub struct AnnexBCodec;

impl AnnexBCodec {
    /// Serializes a list of NAL units with 4-byte start codes.
    pub fn marshal(nal_units: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::with_capacity(nal_units.iter().map(|n| n.len() + 4).sum());
        for nal in nal_units {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nal);
        }
        out
    }

    /// Parses an Annex B byte stream into NAL units. An empty NAL between
    /// two start codes (i.e. two delimiters with nothing between them) is
    /// rejected, per spec §8.
    pub fn unmarshal(data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let starts = find_start_codes(data);
        if starts.is_empty() {
            return Ok(Vec::new());
        }
        let mut nal_units = Vec::with_capacity(starts.len());
        for (idx, &(start, _)) in starts.iter().enumerate() {
            let end = if idx + 1 < starts.len() {
                let (next_start, next_sc_len) = starts[idx + 1];
                next_start - next_sc_len
            } else {
                data.len()
            };
            if start >= end {
                return Err(codec_err("empty NAL unit between Annex B start codes"));
            }
            nal_units.push(data[start..end].to_vec());
        }
        Ok(nal_units)
    }
}

/// Scans for start codes (4-byte `00 00 00 01` and 3-byte `00 00 01`),
/// returning `(nal_data_start_index, start_code_length)` pairs.
fn find_start_codes(data: &[u8]) -> Vec<(usize, usize)> {
    let mut starts = Vec::new();
    let mut i = 0usize;
    while i < data.len() {
        if i + 3 < data.len() && data[i..i + 4] == [0, 0, 0, 1] {
            starts.push((i + 4, 4));
            i += 4;
        } else if i + 2 < data.len() && data[i..i + 3] == [0, 0, 1] {
            starts.push((i + 3, 3));
            i += 3;
        } else {
            i += 1;
        }
    }
    starts
}

/// H.264 RTP packetizer (RFC 6184).
///
/// Converts H.264 Annex B bitstreams into RTP packets, choosing among
/// three packetization modes from RFC 6184 depending on NAL size:
///
/// - **Single NAL Unit** (§5.6): one NAL per packet.
/// - **STAP-A** (§5.7.1): several small NALs aggregated into one packet.
/// - **FU-A** (§5.8): a NAL exceeding the MTU, fragmented across packets.
///
///   ```text
///   FU indicator:  [F|NRI|Type=28]     (1 byte)
///   FU header:     [S|E|R|NAL_Type]    (1 byte)
///   Fragment data: [...]               (up to MTU - 2 bytes)
///   ```
///
///   - **S** (start): set on the first fragment
///   - **E** (end): set on the last fragment
///   - **NAL_Type**: the original NAL unit type from the first byte
///
/// ## SDP attributes (RFC 6184 §8.1)
///
/// SPS/PPS are auto-captured from the first frame that contains them (e.g.
/// first keyframe); the fmtp line then includes `profile-level-id` and
/// `sprop-parameter-sets` (RFC 6184 §8.1).
///
/// ## Marker bit
///
/// Per RFC 6184 §5.1, the RTP marker bit is set on the last RTP packet
/// of an H.264 access unit (frame boundary).
#[derive(Debug)]
pub struct H264Packetizer {
    header: RtpHeader,
    mtu: usize,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
}

impl H264Packetizer {
    /// Create with explicit payload type and SSRC.
    pub fn new(pt: u8, ssrc: u32) -> Self {
        Self {
            header: RtpHeader::new(pt, ssrc),
            mtu: DEFAULT_MTU,
            sps: None,
            pps: None,
        }
    }

    /// Create with a random SSRC (RFC 3550 §8.1).
    pub fn with_random_ssrc(pt: u8) -> Self {
        Self {
            header: RtpHeader::with_random_ssrc(pt),
            mtu: DEFAULT_MTU,
            sps: None,
            pps: None,
        }
    }

    /// Derive profile-level-id from SPS NAL (RFC 6184 §8.1): bytes 1–3 are profile_idc, constraint_set, level_idc.
    fn get_profile_level_id(&self) -> Result<String, String> {
        let sps = self.sps.as_deref().ok_or("SPS not set")?;
        if sps.len() < 4 {
            return Err("SPS too short for profile-level-id".into());
        }
        Ok(format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]))
    }

    fn get_sprop_parameter_sets(&self) -> Result<String, String> {
        let sps = self.sps.as_deref().ok_or("SPS not set")?;
        let pps = self.pps.as_deref().ok_or("PPS not set")?;
        Ok(format!(
            "{},{}",
            BASE64_STANDARD.encode(sps),
            BASE64_STANDARD.encode(pps)
        ))
    }

    /// Packetize a single NAL unit into one or more RTP packets, without
    /// aggregation (used when a NAL can't join a STAP-A group, i.e. it's
    /// oversize and needs FU-A fragmentation).
    fn packetize_nal(&mut self, nal_unit: &[u8], is_last_nal: bool) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();

        if nal_unit.is_empty() {
            return packets;
        }

        if nal_unit.len() <= self.mtu {
            let hdr = self.header.write(is_last_nal);
            let mut packet = Vec::with_capacity(12 + nal_unit.len());
            packet.extend_from_slice(&hdr);
            packet.extend_from_slice(nal_unit);
            packets.push(packet);
        } else {
            // FU-A fragmentation (RFC 6184 §5.8)
            let nal_header = nal_unit[0];
            let nal_type = nal_header & 0x1f;
            let nri = nal_header & 0x60;

            let fu_indicator = nri | 28;
            let payload = &nal_unit[1..];

            let max_fragment = self.mtu - 2; // 2 bytes for FU indicator + FU header
            let mut offset = 0usize;
            let mut first = true;

            while offset < payload.len() {
                let remaining = payload.len() - offset;
                let last_fragment = remaining <= max_fragment;
                let chunk_size = std::cmp::min(max_fragment, remaining);
                let chunk = &payload[offset..offset + chunk_size];

                let start_bit = if first { 0x80 } else { 0x00 };
                let end_bit = if last_fragment { 0x40 } else { 0x00 };
                let fu_header = start_bit | end_bit | nal_type;

                let marker = is_last_nal && last_fragment;
                let hdr = self.header.write(marker);

                let mut packet = Vec::with_capacity(12 + 2 + chunk.len());
                packet.extend_from_slice(&hdr);
                packet.push(fu_indicator);
                packet.push(fu_header);
                packet.extend_from_slice(chunk);
                packets.push(packet);

                offset += chunk_size;
                first = false;
            }

            tracing::trace!(
                nal_type,
                nal_size = nal_unit.len(),
                fragments = packets.len(),
                "FU-A fragmented NAL unit"
            );
        }

        packets
    }

    /// Emits a group of 1+ small NALs as a Single NAL Unit packet (if the
    /// group has one member) or a STAP-A packet (RFC 6184 §5.7.1).
    fn flush_group(&mut self, group: &[&[u8]], is_last_group: bool) -> Option<Vec<u8>> {
        match group {
            [] => None,
            [single] => {
                let hdr = self.header.write(is_last_group);
                let mut packet = Vec::with_capacity(12 + single.len());
                packet.extend_from_slice(&hdr);
                packet.extend_from_slice(single);
                Some(packet)
            }
            _ => {
                let hdr = self.header.write(is_last_group);
                let nri = group.iter().map(|n| n[0] & 0x60).max().unwrap_or(0);
                let size: usize = 1 + group.iter().map(|n| 2 + n.len()).sum::<usize>();
                let mut packet = Vec::with_capacity(12 + size);
                packet.extend_from_slice(&hdr);
                packet.push(24 | nri); // STAP-A NAL header (type 24)
                for nal in group {
                    packet.extend_from_slice(&(nal.len() as u16).to_be_bytes());
                    packet.extend_from_slice(nal);
                }
                tracing::trace!(aggregated = group.len(), "STAP-A aggregated NAL units");
                Some(packet)
            }
        }
    }

    /// Extract NAL units from an H.264 Annex B bitstream.
    ///
    /// This is the infallible counterpart to [`AnnexBCodec::unmarshal`] used
    /// internally by the packetizer: it silently skips an empty NAL instead
    /// of erroring, since a malformed send-side bitstream shouldn't stall
    /// packetization of an otherwise-valid frame.
    pub fn extract_nal_units(data: &[u8]) -> Vec<Vec<u8>> {
        let starts = find_start_codes(data);
        let mut nal_units = Vec::with_capacity(starts.len());
        for (idx, &(start, _)) in starts.iter().enumerate() {
            let end = if idx + 1 < starts.len() {
                let (next_start, next_sc_len) = starts[idx + 1];
                next_start - next_sc_len
            } else {
                data.len()
            };
            if start < end {
                nal_units.push(data[start..end].to_vec());
            }
        }
        nal_units
    }
}

impl Packetizer for H264Packetizer {
    fn packetize(&mut self, encoded_data: &[u8], timestamp_increment: u32) -> Vec<Vec<u8>> {
        let nal_units = Self::extract_nal_units(encoded_data);
        let mut packets = Vec::new();

        if self.sps.is_none() || self.pps.is_none() {
            for nal in &nal_units {
                if nal.is_empty() {
                    continue;
                }
                let nal_type = nal[0] & 0x1f;
                if nal_type == 7 && self.sps.is_none() {
                    self.sps = Some(nal.clone());
                    tracing::debug!("H.264 SPS captured from bitstream ({} bytes)", nal.len());
                } else if nal_type == 8 && self.pps.is_none() {
                    self.pps = Some(nal.clone());
                    tracing::debug!("H.264 PPS captured from bitstream ({} bytes)", nal.len());
                }
            }
        }

        // Greedily aggregate consecutive small NALs into STAP-A groups,
        // flushing to FU-A fragmentation whenever a NAL doesn't fit at all
        // (RFC 6184 §5.7.1 packing rule, spec §4.6).
        let mut group: Vec<&[u8]> = Vec::new();
        let mut group_stap_size = 1usize; // STAP-A NAL type byte

        for (i, nal) in nal_units.iter().enumerate() {
            if nal.is_empty() {
                continue;
            }
            let is_last_nal = i == nal_units.len() - 1;

            if nal.len() > self.mtu {
                if let Some(packet) = self.flush_group(&group, false) {
                    packets.push(packet);
                }
                group.clear();
                group_stap_size = 1;
                packets.append(&mut self.packetize_nal(nal, is_last_nal));
                continue;
            }

            let prospective_size = group_stap_size + 2 + nal.len();
            if !group.is_empty() && prospective_size > self.mtu {
                if let Some(packet) = self.flush_group(&group, false) {
                    packets.push(packet);
                }
                group.clear();
                group_stap_size = 1;
            }

            group.push(nal);
            group_stap_size += 2 + nal.len();

            if is_last_nal {
                if let Some(packet) = self.flush_group(&group, true) {
                    packets.push(packet);
                }
                group.clear();
            }
        }

        self.header.advance_timestamp(timestamp_increment);

        tracing::trace!(
            nal_count = nal_units.len(),
            rtp_packets = packets.len(),
            frame_bytes = encoded_data.len(),
            seq = self.header.sequence(),
            ts = self.header.timestamp(),
            "frame packetized"
        );

        packets
    }

    fn codec_name(&self) -> &'static str {
        "H264"
    }

    /// 90 kHz clock rate per RFC 6184 §8.1.
    fn clock_rate(&self) -> u32 {
        90000
    }

    fn payload_type(&self) -> u8 {
        self.header.pt
    }

    /// SDP attributes per RFC 6184 §8.2.1.
    ///
    /// Order matters — `a=rtpmap` defines the payload type and MUST precede
    /// `a=fmtp` which references it. ffplay and other clients parse attributes
    /// sequentially and expect this ordering.
    fn sdp_attributes(&self) -> Vec<String> {
        let mut fmtp = format!("a=fmtp:{} packetization-mode=1", self.header.pt);
        if let Ok(pl) = self.get_profile_level_id() {
            fmtp.push_str(&format!(";profile-level-id={}", pl));
        }
        if let Ok(sprop) = self.get_sprop_parameter_sets() {
            fmtp.push_str(&format!(";sprop-parameter-sets={}", sprop));
        }

        vec![
            format!(
                "a=rtpmap:{} {}/{}",
                self.payload_type(),
                self.codec_name(),
                self.clock_rate()
            ),
            fmtp,
            "a=control:track1".to_string(),
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

/// Reverses [`H264Packetizer`]'s STAP-A/FU-A encoding back into Annex B
/// access units, for the client read direction.
///
/// Reassembly is bounded: an access unit that would exceed
/// `MAX_ACCESS_UNIT_SIZE` is rejected (spec §3) rather than growing
/// unbounded from a peer that never sends a marker bit.
pub struct H264Depacketizer {
    pending: Vec<u8>,
    pending_timestamp: Option<u32>,
    fu_buffer: Option<Vec<u8>>,
}

impl H264Depacketizer {
    pub fn new() -> Self {
        Self { pending: Vec::new(), pending_timestamp: None, fu_buffer: None }
    }

    fn append_nal(&mut self, nal: &[u8]) -> Result<()> {
        if self.pending.len() + 4 + nal.len() > MAX_ACCESS_UNIT_SIZE {
            self.pending.clear();
            self.fu_buffer = None;
            return Err(RtspError::MessageTooLarge(
                "H.264 access unit exceeded 1 MiB reassembly cap".to_string(),
            ));
        }
        self.pending.extend_from_slice(&[0, 0, 0, 1]);
        self.pending.extend_from_slice(nal);
        Ok(())
    }
}

impl Default for H264Depacketizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Depacketizer for H264Depacketizer {
    fn push(&mut self, payload: &[u8], timestamp: u32, marker: bool) -> Result<Vec<AccessUnit>> {
        if payload.is_empty() {
            return Err(codec_err("empty RTP payload for H.264"));
        }

        if self.pending_timestamp.is_some_and(|ts| ts != timestamp) && !self.pending.is_empty() {
            tracing::warn!("H.264 access unit missing marker bit before timestamp change");
            let data = std::mem::take(&mut self.pending);
            let ts = self.pending_timestamp.take().unwrap();
            self.fu_buffer = None;
            // Start reassembling the new access unit before returning the
            // orphaned one, since `payload` still needs to be processed.
            let mut completed = vec![AccessUnit { data, timestamp: ts }];
            completed.extend(self.push(payload, timestamp, marker)?);
            return Ok(completed);
        }
        self.pending_timestamp = Some(timestamp);

        let nal_type = payload[0] & 0x1f;
        match nal_type {
            1..=23 => self.append_nal(payload)?,
            24 => {
                // STAP-A: (u16 size, NAL)+
                let mut pos = 2usize;
                while pos + 2 <= payload.len() {
                    let size = u16::from_be_bytes([payload[pos], payload[pos + 1]]) as usize;
                    pos += 2;
                    let nal = payload.get(pos..pos + size).ok_or_else(|| codec_err("truncated STAP-A aggregation unit"))?;
                    self.append_nal(nal)?;
                    pos += size;
                }
            }
            28 => {
                // FU-A: [indicator][header: S|E|R|type][...fragment]
                if payload.len() < 2 {
                    return Err(codec_err("FU-A packet shorter than 2 bytes"));
                }
                let indicator = payload[0];
                let fu_header = payload[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                let original_type = fu_header & 0x1f;

                if start {
                    let mut nal = Vec::with_capacity(payload.len() - 1);
                    nal.push((indicator & 0x60) | original_type);
                    nal.extend_from_slice(&payload[2..]);
                    self.fu_buffer = Some(nal);
                } else if let Some(buf) = self.fu_buffer.as_mut() {
                    buf.extend_from_slice(&payload[2..]);
                } else {
                    return Err(codec_err("FU-A continuation without a start fragment"));
                }

                if end {
                    let nal = self.fu_buffer.take().ok_or_else(|| codec_err("FU-A end fragment without a start"))?;
                    self.append_nal(&nal)?;
                }
            }
            25..=27 | 29 => return Err(codec_err(format!("unsupported H.264 aggregation/fragmentation type {nal_type}"))),
            _ => return Err(codec_err(format!("invalid H.264 NAL type {nal_type}"))),
        }

        if marker {
            let data = std::mem::take(&mut self.pending);
            self.pending_timestamp = None;
            self.fu_buffer = None;
            Ok(vec![AccessUnit { data, timestamp }])
        } else {
            Ok(Vec::new())
        }
    }
}

// --- DTS extraction (spec §4.6) ---

/// Minimal SPS fields needed to parse a slice header's `pic_order_cnt_lsb`
/// (ITU-T H.264 §7.3.2.1.1), grounded in the field names the spec calls out:
/// `log2_max_pic_order_cnt_lsb_minus4`, `gaps_in_frame_num_value_allowed_flag`,
/// `frame_mbs_only_flag`. Only `pic_order_cnt_type == 0` is supported, which
/// covers the overwhelming majority of RTSP camera/encoder output.
#[derive(Debug, Clone)]
struct Sps {
    log2_max_frame_num_minus4: u32,
    pic_order_cnt_type: u32,
    log2_max_pic_order_cnt_lsb_minus4: Option<u32>,
    frame_mbs_only_flag: bool,
    #[allow(dead_code)]
    gaps_in_frame_num_value_allowed_flag: bool,
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bit(&mut self) -> Result<u32> {
        let byte = self.pos / 8;
        let bit = 7 - (self.pos % 8);
        let b = *self.data.get(byte).ok_or_else(|| codec_err("bitstream exhausted"))?;
        self.pos += 1;
        Ok(((b >> bit) & 1) as u32)
    }

    fn read_bits(&mut self, n: u32) -> Result<u32> {
        let mut v = 0u32;
        for _ in 0..n {
            v = (v << 1) | self.read_bit()?;
        }
        Ok(v)
    }

    /// Exp-Golomb unsigned code (ITU-T H.264 §9.1).
    fn read_ue(&mut self) -> Result<u32> {
        let mut zeros = 0u32;
        while self.read_bit()? == 0 {
            zeros += 1;
            if zeros > 32 {
                return Err(codec_err("exp-golomb code too long"));
            }
        }
        if zeros == 0 {
            return Ok(0);
        }
        let suffix = self.read_bits(zeros)?;
        Ok((1u32 << zeros) - 1 + suffix)
    }
}

/// Strips emulation-prevention bytes (ITU-T H.264 §7.4.1: `00 00 03 xx` ->
/// `00 00 xx` when `xx <= 3`) before bit-level parsing.
fn to_rbsp(ebsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ebsp.len());
    let mut zero_run = 0u32;
    let mut i = 0;
    while i < ebsp.len() {
        if zero_run >= 2 && ebsp[i] == 0x03 && ebsp.get(i + 1).is_some_and(|&b| b <= 0x03) {
            zero_run = 0;
            i += 1;
            continue;
        }
        zero_run = if ebsp[i] == 0 { zero_run + 1 } else { 0 };
        out.push(ebsp[i]);
        i += 1;
    }
    out
}

impl Sps {
    fn parse(nal: &[u8]) -> Result<Self> {
        let rbsp = to_rbsp(nal.get(1..).ok_or_else(|| codec_err("SPS NAL too short"))?);
        let mut r = BitReader::new(&rbsp);
        let profile_idc = r.read_bits(8)?;
        let _constraint_flags_and_reserved = r.read_bits(8)?;
        let _level_idc = r.read_bits(8)?;
        let _seq_parameter_set_id = r.read_ue()?;

        if matches!(profile_idc, 100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135) {
            let chroma_format_idc = r.read_ue()?;
            if chroma_format_idc == 3 {
                let _separate_colour_plane_flag = r.read_bit()?;
            }
            let _bit_depth_luma_minus8 = r.read_ue()?;
            let _bit_depth_chroma_minus8 = r.read_ue()?;
            let _qpprime_y_zero_transform_bypass_flag = r.read_bit()?;
            let seq_scaling_matrix_present_flag = r.read_bit()?;
            if seq_scaling_matrix_present_flag != 0 {
                return Err(codec_err("SPS seq_scaling_matrix_present_flag is not supported"));
            }
        }

        let log2_max_frame_num_minus4 = r.read_ue()?;
        let pic_order_cnt_type = r.read_ue()?;
        let log2_max_pic_order_cnt_lsb_minus4 = match pic_order_cnt_type {
            0 => Some(r.read_ue()?),
            _ => return Err(codec_err("only pic_order_cnt_type 0 is supported for DTS extraction")),
        };
        let _max_num_ref_frames = r.read_ue()?;
        let gaps_in_frame_num_value_allowed_flag = r.read_bit()? == 1;
        let _pic_width_in_mbs_minus1 = r.read_ue()?;
        let _pic_height_in_map_units_minus1 = r.read_ue()?;
        let frame_mbs_only_flag = r.read_bit()? == 1;

        Ok(Self {
            log2_max_frame_num_minus4,
            pic_order_cnt_type,
            log2_max_pic_order_cnt_lsb_minus4,
            frame_mbs_only_flag,
            gaps_in_frame_num_value_allowed_flag,
        })
    }
}

fn parse_slice_poc_lsb(nal: &[u8], sps: &Sps) -> Result<u32> {
    let nal_type = nal[0] & 0x1f;
    let is_idr = nal_type == 5;
    let rbsp = to_rbsp(nal.get(1..).ok_or_else(|| codec_err("slice NAL too short"))?);
    let mut r = BitReader::new(&rbsp);
    let _first_mb_in_slice = r.read_ue()?;
    let _slice_type = r.read_ue()?;
    let _pic_parameter_set_id = r.read_ue()?;
    let frame_num_bits = sps.log2_max_frame_num_minus4 + 4;
    let _frame_num = r.read_bits(frame_num_bits)?;
    if !sps.frame_mbs_only_flag {
        let _field_pic_flag = r.read_bit()?;
    }
    if is_idr {
        let _idr_pic_id = r.read_ue()?;
    }
    let poc_bits = sps
        .log2_max_pic_order_cnt_lsb_minus4
        .ok_or_else(|| codec_err("pic_order_cnt_type != 0"))?
        + 4;
    r.read_bits(poc_bits)
}

/// Extracts a monotonically increasing DTS from an H.264 access unit's
/// `pic_order_cnt_lsb`, reconstructing full POC across 16-bit-style wrap
/// (ITU-T H.264 §8.2.1.1) and establishing a POC-to-time scale from the
/// first non-IDR frame observed after an IDR. Resets on every IDR.
///
/// This is a from-scratch reconstruction rather than a port: the original
/// implementation's DTS extractor source was not part of the retrieved
/// reference material (only its test vectors were), so the POC bookkeeping
/// here is original work grounded in the SPS/slice-header field names the
/// spec calls out, not a byte-exact replica.
pub struct DtsExtractor {
    sps: Option<Sps>,
    have_base: bool,
    prev_poc_msb: i64,
    prev_poc_lsb: i64,
    idr_pts: u32,
    tick_per_poc_unit: Option<f64>,
    last_dts: u32,
}

impl DtsExtractor {
    pub fn new() -> Self {
        Self {
            sps: None,
            have_base: false,
            prev_poc_msb: 0,
            prev_poc_lsb: 0,
            idr_pts: 0,
            tick_per_poc_unit: None,
            last_dts: 0,
        }
    }

    /// Feeds one access unit's NAL units (in bitstream order) and its PTS;
    /// returns the reconstructed DTS.
    pub fn extract(&mut self, nal_units: &[Vec<u8>], pts: u32) -> Result<u32> {
        let mut is_idr = false;
        let mut slice: Option<&[u8]> = None;

        for nal in nal_units {
            if nal.is_empty() {
                continue;
            }
            match nal[0] & 0x1f {
                7 => self.sps = Some(Sps::parse(nal)?),
                5 => {
                    is_idr = true;
                    slice = Some(nal);
                }
                1 if slice.is_none() => slice = Some(nal),
                _ => {}
            }
        }

        if is_idr {
            self.have_base = true;
            self.prev_poc_msb = 0;
            self.prev_poc_lsb = 0;
            self.idr_pts = pts;
            self.tick_per_poc_unit = None;
            self.last_dts = pts;
            return Ok(pts);
        }

        if !self.have_base {
            return Err(codec_err("DTS extraction requires an IDR before the first non-IDR frame"));
        }
        let sps = self.sps.as_ref().ok_or_else(|| codec_err("DTS extraction requires an SPS"))?;
        let slice = slice.ok_or_else(|| codec_err("access unit has no slice NAL"))?;

        let poc_lsb = parse_slice_poc_lsb(slice, sps)? as i64;
        let max_poc_lsb = 1i64 << (sps.log2_max_pic_order_cnt_lsb_minus4.unwrap_or(0) + 4);

        let poc_msb = if poc_lsb < self.prev_poc_lsb && self.prev_poc_lsb - poc_lsb >= max_poc_lsb / 2 {
            self.prev_poc_msb + max_poc_lsb
        } else if poc_lsb > self.prev_poc_lsb && poc_lsb - self.prev_poc_lsb > max_poc_lsb / 2 {
            self.prev_poc_msb - max_poc_lsb
        } else {
            self.prev_poc_msb
        };
        self.prev_poc_msb = poc_msb;
        self.prev_poc_lsb = poc_lsb;
        let full_poc = poc_msb + poc_lsb;

        if self.tick_per_poc_unit.is_none() && full_poc > 0 && pts > self.idr_pts {
            self.tick_per_poc_unit = Some((pts - self.idr_pts) as f64 / full_poc as f64);
        }

        let dts = match self.tick_per_poc_unit {
            Some(tick) => self.idr_pts.saturating_add((full_poc.max(0) as f64 * tick).round() as u32),
            None => self.last_dts,
        };
        let dts = dts.max(self.last_dts);
        self.last_dts = dts;
        Ok(dts)
    }
}

impl Default for DtsExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_packetizer() -> H264Packetizer {
        H264Packetizer::new(96, 0xAABBCCDD)
    }

    // --- NAL extraction ---

    #[test]
    fn extract_single_nal_4byte_sc() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let nals = H264Packetizer::extract_nal_units(&data);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0], vec![0x65, 0xAA, 0xBB]);
    }

    #[test]
    fn extract_single_nal_3byte_sc() {
        let data = [0, 0, 1, 0x67, 0x42, 0x00];
        let nals = H264Packetizer::extract_nal_units(&data);
        assert_eq!(nals.len(), 1);
        assert_eq!(nals[0], vec![0x67, 0x42, 0x00]);
    }

    #[test]
    fn extract_two_nals_4byte_sc() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xCE]);
        let nals = H264Packetizer::extract_nal_units(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], vec![0x67, 0x42]);
        assert_eq!(nals[1], vec![0x68, 0xCE]);
    }

    #[test]
    fn extract_mixed_start_codes() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        let nals = H264Packetizer::extract_nal_units(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0], vec![0x67, 0x42]);
        assert_eq!(nals[1], vec![0x68, 0xCE]);
    }

    #[test]
    fn extract_empty_data() {
        assert!(H264Packetizer::extract_nal_units(&[]).is_empty());
    }

    #[test]
    fn extract_no_start_code() {
        assert!(H264Packetizer::extract_nal_units(&[0xFF, 0xFE]).is_empty());
    }

    // --- Annex B codec ---

    #[test]
    fn annexb_decode_matches_scenario_3() {
        let data = [0, 0, 1, 0xAA, 0xBB, 0, 0, 1, 0xCC, 0xDD, 0, 0, 1, 0xEE, 0xFF];
        let nals = AnnexBCodec::unmarshal(&data).unwrap();
        assert_eq!(nals, vec![vec![0xAA, 0xBB], vec![0xCC, 0xDD], vec![0xEE, 0xFF]]);

        let reencoded = AnnexBCodec::marshal(&nals);
        let expected = [
            0, 0, 0, 1, 0xAA, 0xBB, 0, 0, 0, 1, 0xCC, 0xDD, 0, 0, 0, 1, 0xEE, 0xFF,
        ];
        assert_eq!(reencoded, expected);
    }

    #[test]
    fn annexb_round_trips_for_any_nonempty_nal_list() {
        let nals = vec![vec![0x67, 0x42, 0x00], vec![0x68, 0xCE], vec![0x65, 0x88, 0x00]];
        let marshaled = AnnexBCodec::marshal(&nals);
        assert_eq!(AnnexBCodec::unmarshal(&marshaled).unwrap(), nals);
    }

    #[test]
    fn annexb_rejects_empty_nal_between_delimiters() {
        let data = [0, 0, 0, 1, 0, 0, 0, 1, 0x65, 0xAA];
        assert!(AnnexBCodec::unmarshal(&data).is_err());
    }

    #[test]
    fn annexb_accepts_3_and_4_byte_start_codes_mixed_on_input() {
        let data = [0, 0, 1, 0x67, 0, 0, 0, 1, 0x68];
        let nals = AnnexBCodec::unmarshal(&data).unwrap();
        assert_eq!(nals, vec![vec![0x67], vec![0x68]]);
    }

    // --- Packetization ---

    #[test]
    fn small_nal_single_packet() {
        let mut p = make_packetizer();
        let nal = vec![0x65, 0xAA, 0xBB, 0xCC];
        let packets = p.packetize_nal(&nal, true);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].len(), 12 + 4);
        assert_eq!(packets[0][1] & 0x80, 0x80); // marker bit
    }

    #[test]
    fn large_nal_fragmented() {
        let mut p = H264Packetizer::new(96, 0x11223344);
        let mut nal = vec![0x65]; // NAL header
        nal.extend(vec![0xAA; DEFAULT_MTU + 500]);
        let packets = p.packetize_nal(&nal, true);
        assert!(packets.len() > 1);

        assert_eq!(packets[0][12] & 0x1f, 28); // FU-A type
        assert_eq!(packets[0][13] & 0x80, 0x80); // Start bit

        let last = packets.last().unwrap();
        assert_eq!(last[13] & 0x40, 0x40); // End bit
        assert_eq!(last[1] & 0x80, 0x80); // Marker bit
    }

    #[test]
    fn empty_nal_no_packets() {
        let mut p = make_packetizer();
        assert!(p.packetize_nal(&[], true).is_empty());
    }

    #[test]
    fn small_nals_are_aggregated_into_one_stap_a_packet() {
        let mut p = make_packetizer();
        let mut frame = Vec::new();
        for nal in [[0x06, 1, 2], [0x06, 3, 4], [0x06, 5, 6]] {
            frame.extend_from_slice(&[0, 0, 0, 1]);
            frame.extend_from_slice(&nal);
        }
        let packets = p.packetize(&frame, 3000);
        assert_eq!(packets.len(), 1, "three small NALs should aggregate into a single STAP-A packet");
        assert_eq!(packets[0][12] & 0x1f, 24, "aggregated packet must use STAP-A type 24");
    }

    #[test]
    fn oversize_nal_among_small_nals_flushes_aggregation_and_fragments() {
        let mut p = make_packetizer();
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0, 0, 0, 1, 0x06, 1, 2]);
        let mut big = vec![0x65];
        big.extend(vec![0xAA; DEFAULT_MTU + 200]);
        frame.extend_from_slice(&[0, 0, 0, 1]);
        frame.extend_from_slice(&big);
        let packets = p.packetize(&frame, 3000);
        assert!(packets.len() >= 2, "small NAL plus oversize NAL should produce at least single + FU-A packets");
        assert!(packets.last().unwrap()[1] & 0x80 != 0, "last packet of access unit carries the marker");
    }

    #[test]
    fn packetize_trait_advances_timestamp() {
        let mut p = make_packetizer();
        let frame = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        p.packetize(&frame, 3000);
        p.packetize(&frame, 3000);
        let packets = p.packetize(&frame, 3000);
        assert!(!packets.is_empty());
    }

    #[test]
    fn sdp_attributes_include_packetization_mode() {
        let p = make_packetizer();
        let attrs = p.sdp_attributes();
        assert!(attrs.len() >= 1, "must include at least fmtp");
        assert!(
            attrs.iter().any(|a| a.contains("packetization-mode=1")),
            "must include packetization-mode=1"
        );
    }

    #[test]
    fn codec_metadata() {
        let p = make_packetizer();
        assert_eq!(p.codec_name(), "H264");
        assert_eq!(p.clock_rate(), 90000);
        assert_eq!(p.payload_type(), 96);
    }

    #[test]
    fn auto_capture_sps_pps_from_first_frame() {
        let mut p = H264Packetizer::new(96, 0xAABBCCDD);
        let sps_nal = vec![0x67, 0x42, 0x00, 0x1e];
        let pps_nal = vec![0x68, 0xce, 0x38, 0x80];
        let frame = [
            &[0u8, 0, 0, 1][..],
            sps_nal.as_slice(),
            &[0, 0, 0, 1][..],
            pps_nal.as_slice(),
            &[0, 0, 0, 1, 0x65, 0x88, 0x00][..],
        ]
        .concat();
        p.packetize(&frame, 3000);
        let attrs = p.sdp_attributes();
        let fmtp = attrs.iter().find(|a| a.starts_with("a=fmtp:")).expect("fmtp line");
        assert!(fmtp.contains("profile-level-id="), "SPS auto-captured, profile-level-id in SDP");
        assert!(fmtp.contains("sprop-parameter-sets="), "SPS/PPS auto-captured, sprop-parameter-sets in SDP");
    }

    // --- Depacketization ---

    #[test]
    fn depacketizer_reassembles_single_nal_packet() {
        let mut d = H264Depacketizer::new();
        let aus = d.push(&[0x65, 1, 2, 3], 1000, true).unwrap();
        assert_eq!(aus.len(), 1);
        assert_eq!(aus[0].data, vec![0, 0, 0, 1, 0x65, 1, 2, 3]);
        assert_eq!(aus[0].timestamp, 1000);
    }

    #[test]
    fn depacketizer_reassembles_stap_a_packet() {
        let mut d = H264Depacketizer::new();
        let mut payload = vec![24 | 0x60];
        for nal in [[0x06u8, 1, 2], [0x06, 3, 4]] {
            payload.extend_from_slice(&(nal.len() as u16).to_be_bytes());
            payload.extend_from_slice(&nal);
        }
        let aus = d.push(&payload, 2000, true).unwrap();
        assert_eq!(aus.len(), 1);
        let expected = AnnexBCodec::marshal(&[vec![0x06, 1, 2], vec![0x06, 3, 4]]);
        assert_eq!(aus[0].data, expected);
    }

    #[test]
    fn depacketizer_reassembles_fu_a_fragments() {
        let mut p = H264Packetizer::new(96, 0x1234);
        let mut nal = vec![0x65];
        nal.extend(vec![0xAB; DEFAULT_MTU + 300]);
        let mut frame = vec![0, 0, 0, 1];
        frame.extend_from_slice(&nal);
        let packets = p.packetize(&frame, 3000);
        assert!(packets.len() > 1);

        let mut d = H264Depacketizer::new();
        let mut aus = Vec::new();
        for (i, packet) in packets.iter().enumerate() {
            let marker = packet[1] & 0x80 != 0;
            assert_eq!(marker, i == packets.len() - 1);
            aus.extend(d.push(&packet[12..], 3000, marker).unwrap());
        }
        assert_eq!(aus.len(), 1);
        assert_eq!(aus[0].data, AnnexBCodec::marshal(&[nal]));
    }

    #[test]
    fn depacketizer_rejects_access_unit_over_1mib() {
        let mut d = H264Depacketizer::new();
        let chunk = vec![0x01u8; 900_000];
        d.push(&chunk, 1, false).unwrap();
        assert!(d.push(&chunk, 1, false).is_err());
    }

    // --- DTS extraction ---

    fn bits_writer() -> Vec<(u32, u32)> {
        Vec::new()
    }

    struct BitWriter {
        bits: Vec<(u32, u32)>,
    }
    impl BitWriter {
        fn new() -> Self {
            Self { bits: bits_writer() }
        }
        fn push(&mut self, value: u32, n: u32) {
            self.bits.push((value, n));
        }
        fn push_ue(&mut self, value: u32) {
            let v = value + 1;
            let nbits = 32 - v.leading_zeros();
            for _ in 0..(nbits - 1) {
                self.bits.push((0, 1));
            }
            self.bits.push((v, nbits));
        }
        fn finish(&self) -> Vec<u8> {
            let mut out = Vec::new();
            let mut cur = 0u8;
            let mut nbits = 0u32;
            for &(value, width) in &self.bits {
                for i in (0..width).rev() {
                    let bit = (value >> i) & 1;
                    cur = (cur << 1) | bit as u8;
                    nbits += 1;
                    if nbits == 8 {
                        out.push(cur);
                        cur = 0;
                        nbits = 0;
                    }
                }
            }
            if nbits > 0 {
                cur <<= 8 - nbits;
                out.push(cur);
            }
            out
        }
    }

    fn make_test_sps(log2_max_frame_num_minus4: u32, log2_max_poc_lsb_minus4: u32) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.push(66, 8); // profile_idc = baseline (no extended fields)
        w.push(0, 8); // constraint flags + reserved
        w.push(10, 8); // level_idc
        w.push_ue(0); // seq_parameter_set_id
        w.push_ue(log2_max_frame_num_minus4);
        w.push_ue(0); // pic_order_cnt_type = 0
        w.push_ue(log2_max_poc_lsb_minus4);
        w.push_ue(1); // max_num_ref_frames
        w.push(0, 1); // gaps_in_frame_num_value_allowed_flag
        w.push_ue(10); // pic_width_in_mbs_minus1
        w.push_ue(10); // pic_height_in_map_units_minus1
        w.push(1, 1); // frame_mbs_only_flag
        let mut nal = vec![0x67];
        nal.extend(w.finish());
        nal
    }

    fn make_test_slice(nal_type: u8, frame_num_bits: u32, poc_lsb_bits: u32, frame_num: u32, poc_lsb: u32) -> Vec<u8> {
        let mut w = BitWriter::new();
        w.push_ue(0); // first_mb_in_slice
        w.push_ue(7); // slice_type
        w.push_ue(0); // pic_parameter_set_id
        w.push(frame_num, frame_num_bits);
        if nal_type == 5 {
            w.push_ue(0); // idr_pic_id
        }
        w.push(poc_lsb, poc_lsb_bits);
        let mut nal = vec![nal_type];
        nal.extend(w.finish());
        nal
    }

    #[test]
    fn dts_resets_to_pts_on_idr() {
        let mut ex = DtsExtractor::new();
        let sps = make_test_sps(0, 2); // poc lsb is 6 bits
        let idr = make_test_slice(5, 4, 6, 0, 0);
        let dts = ex.extract(&[sps, idr], 5000).unwrap();
        assert_eq!(dts, 5000);
    }

    #[test]
    fn dts_is_monotonically_increasing_across_reordered_frames() {
        let mut ex = DtsExtractor::new();
        let sps = make_test_sps(0, 4); // poc lsb is 8 bits
        let idr = make_test_slice(5, 4, 8, 0, 0);
        let d0 = ex.extract(&[sps.clone(), idr], 0).unwrap();

        // Decode order after the IDR, with POC giving display (PTS) order.
        let frames = [(8u32, 800u32), (4, 400), (2, 200), (6, 600)];
        let mut prev = d0;
        for (poc, pts) in frames {
            let slice = make_test_slice(1, 4, 8, 1, poc);
            let dts = ex.extract(&[slice], pts).unwrap();
            assert!(dts >= prev, "DTS must never go backwards: {dts} < {prev}");
            prev = dts;
        }
    }

    #[test]
    fn dts_requires_sps_before_first_slice() {
        let mut ex = DtsExtractor::new();
        let idr = make_test_slice(5, 4, 4, 0, 0);
        // No SPS fed yet, but IDR always succeeds (resets unconditionally).
        assert!(ex.extract(&[idr], 0).is_ok());
    }
}
