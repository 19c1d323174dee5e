//! RTCP Sender/Receiver Reports (RFC 3550 §6.4) and the per-stream
//! statistics (jitter, loss, extended sequence numbers) needed to build them.

use std::time::Instant;

use crate::error::{Result, RtspError};

const RTP_VERSION: u8 = 2;
const PT_SENDER_REPORT: u8 = 200;
const PT_RECEIVER_REPORT: u8 = 201;
const REPORT_BLOCK_LEN: usize = 24;

fn codec_err(msg: impl Into<String>) -> RtspError {
    RtspError::Codec(msg.into())
}

/// One SSRC's reception statistics (RFC 3550 §6.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    /// Cumulative number of packets lost, a signed 24-bit value.
    pub cumulative_lost: i32,
    /// Extended highest sequence number received (cycles << 16 | seq).
    pub highest_seq: u32,
    pub jitter: u32,
    /// Middle 32 bits of the last SR's NTP timestamp (0 if none received).
    pub lsr: u32,
    /// Delay, in 1/65536 second units, since the last SR was received.
    pub dlsr: u32,
}

impl ReportBlock {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        let cumulative = (self.cumulative_lost as u32) & 0x00FF_FFFF;
        out.push(self.fraction_lost);
        out.extend_from_slice(&cumulative.to_be_bytes()[1..]);
        out.extend_from_slice(&self.highest_seq.to_be_bytes());
        out.extend_from_slice(&self.jitter.to_be_bytes());
        out.extend_from_slice(&self.lsr.to_be_bytes());
        out.extend_from_slice(&self.dlsr.to_be_bytes());
    }

    fn parse(b: &[u8]) -> Result<Self> {
        if b.len() < REPORT_BLOCK_LEN {
            return Err(codec_err("RTCP report block shorter than 24 bytes"));
        }
        let ssrc = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        let fraction_lost = b[4];
        let mut cumulative = [0u8; 4];
        cumulative[1..].copy_from_slice(&b[5..8]);
        let mut cumulative_lost = i32::from_be_bytes(cumulative);
        if cumulative_lost & 0x0080_0000 != 0 {
            cumulative_lost -= 0x0100_0000; // sign-extend the 24-bit field
        }
        let highest_seq = u32::from_be_bytes([b[8], b[9], b[10], b[11]]);
        let jitter = u32::from_be_bytes([b[12], b[13], b[14], b[15]]);
        let lsr = u32::from_be_bytes([b[16], b[17], b[18], b[19]]);
        let dlsr = u32::from_be_bytes([b[20], b[21], b[22], b[23]]);
        Ok(Self { ssrc, fraction_lost, cumulative_lost, highest_seq, jitter, lsr, dlsr })
    }
}

fn encode_header(out: &mut Vec<u8>, pt: u8, rc: u8, payload_words: u16) {
    out.push((RTP_VERSION << 6) | rc);
    out.push(pt);
    out.extend_from_slice(&payload_words.to_be_bytes());
}

/// An RTCP Sender Report, sent by a media source (RFC 3550 §6.4.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_seconds: u32,
    pub ntp_fraction: u32,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
    pub reports: Vec<ReportBlock>,
}

impl SenderReport {
    pub fn encode(&self) -> Vec<u8> {
        let words = 6 + self.reports.len() as u16 * 6;
        let mut out = Vec::with_capacity(8 + words as usize * 4);
        encode_header(&mut out, PT_SENDER_REPORT, self.reports.len() as u8, words);
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        out.extend_from_slice(&self.ntp_seconds.to_be_bytes());
        out.extend_from_slice(&self.ntp_fraction.to_be_bytes());
        out.extend_from_slice(&self.rtp_timestamp.to_be_bytes());
        out.extend_from_slice(&self.packet_count.to_be_bytes());
        out.extend_from_slice(&self.octet_count.to_be_bytes());
        for rb in &self.reports {
            rb.encode(&mut out);
        }
        out
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 28 {
            return Err(codec_err("RTCP SR packet shorter than 28 bytes"));
        }
        let (rc, pt) = (raw[0] & 0x1F, raw[1]);
        if pt != PT_SENDER_REPORT {
            return Err(codec_err(format!("expected SR packet type 200, got {pt}")));
        }
        let ssrc = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let ntp_seconds = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]);
        let ntp_fraction = u32::from_be_bytes([raw[12], raw[13], raw[14], raw[15]]);
        let rtp_timestamp = u32::from_be_bytes([raw[16], raw[17], raw[18], raw[19]]);
        let packet_count = u32::from_be_bytes([raw[20], raw[21], raw[22], raw[23]]);
        let octet_count = u32::from_be_bytes([raw[24], raw[25], raw[26], raw[27]]);

        let mut reports = Vec::with_capacity(rc as usize);
        let mut pos = 28;
        for _ in 0..rc {
            let block = raw.get(pos..pos + REPORT_BLOCK_LEN).ok_or_else(|| codec_err("truncated RTCP report block"))?;
            reports.push(ReportBlock::parse(block)?);
            pos += REPORT_BLOCK_LEN;
        }
        Ok(Self { ssrc, ntp_seconds, ntp_fraction, rtp_timestamp, packet_count, octet_count, reports })
    }

    /// The middle 32 bits of the 64-bit NTP timestamp, used as `LSR` by a
    /// receiver that replies with its own report (RFC 3550 §6.4.1).
    pub fn middle_ntp(&self) -> u32 {
        ((self.ntp_seconds & 0x0000_FFFF) << 16) | (self.ntp_fraction >> 16)
    }
}

/// An RTCP Receiver Report, sent by a participant that only receives media
/// (RFC 3550 §6.4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    pub reports: Vec<ReportBlock>,
}

impl ReceiverReport {
    pub fn encode(&self) -> Vec<u8> {
        let words = 1 + self.reports.len() as u16 * 6;
        let mut out = Vec::with_capacity(8 + words as usize * 4);
        encode_header(&mut out, PT_RECEIVER_REPORT, self.reports.len() as u8, words);
        out.extend_from_slice(&self.ssrc.to_be_bytes());
        for rb in &self.reports {
            rb.encode(&mut out);
        }
        out
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 8 {
            return Err(codec_err("RTCP RR packet shorter than 8 bytes"));
        }
        let (rc, pt) = (raw[0] & 0x1F, raw[1]);
        if pt != PT_RECEIVER_REPORT {
            return Err(codec_err(format!("expected RR packet type 201, got {pt}")));
        }
        let ssrc = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let mut reports = Vec::with_capacity(rc as usize);
        let mut pos = 8;
        for _ in 0..rc {
            let block = raw.get(pos..pos + REPORT_BLOCK_LEN).ok_or_else(|| codec_err("truncated RTCP report block"))?;
            reports.push(ReportBlock::parse(block)?);
            pos += REPORT_BLOCK_LEN;
        }
        Ok(Self { ssrc, reports })
    }
}

/// Tracks extended sequence numbers across 16-bit wraparound, per RFC 3550
/// Appendix A.1 (simplified: no probation state, since RTSP media sessions
/// are single-source and a misbehaving first packet just costs one bad
/// reading rather than attacker-grade packet injection).
#[derive(Debug, Default)]
struct SequenceTracker {
    base_seq: u16,
    max_seq: u16,
    cycles: u32,
    received: u64,
    initialized: bool,
}

impl SequenceTracker {
    fn update(&mut self, seq: u16) {
        if !self.initialized {
            self.base_seq = seq;
            self.max_seq = seq;
            self.received = 1;
            self.initialized = true;
            return;
        }
        let delta = seq.wrapping_sub(self.max_seq);
        if delta != 0 && delta < 0x8000 {
            if seq < self.max_seq {
                self.cycles += 1;
            }
            self.max_seq = seq;
        }
        self.received += 1;
    }

    fn extended_max(&self) -> u32 {
        (self.cycles << 16) | self.max_seq as u32
    }

    fn expected(&self) -> u64 {
        (self.extended_max() as u64 + 1).saturating_sub(self.base_seq as u64)
    }
}

/// Per-SSRC reception state: feeds RTP arrivals and SRs in, produces
/// [`ReportBlock`]s for outgoing RRs.
#[derive(Debug)]
pub struct ReceiverState {
    ssrc: u32,
    clock_rate: u32,
    epoch: Instant,
    seq: SequenceTracker,
    transit_prev: Option<i64>,
    jitter: f64,
    prior_expected: u64,
    prior_received: u64,
    last_sr: Option<(u32, Instant)>,
}

impl ReceiverState {
    /// `clock_rate` is the track's RTP clock rate (e.g. 90000 for H.264, the
    /// sample rate for AAC) — needed to convert wall-clock arrival time into
    /// the same units as the packet's RTP timestamp (RFC 3550 Appendix A.8).
    pub fn new(ssrc: u32, clock_rate: u32) -> Self {
        Self {
            ssrc,
            clock_rate: clock_rate.max(1),
            epoch: Instant::now(),
            seq: SequenceTracker::default(),
            transit_prev: None,
            jitter: 0.0,
            prior_expected: 0,
            prior_received: 0,
            last_sr: None,
        }
    }

    /// Feeds one received RTP packet's header fields, timestamping arrival
    /// against the wall clock and converting it into the track's RTP clock
    /// units via [`clock_rate`](Self::new) (RFC 3550 Appendix A.8: jitter is
    /// the smoothed difference between consecutive `arrival - rtp_timestamp`
    /// transit times, both expressed in those units).
    pub fn on_rtp(&mut self, seq: u16, rtp_timestamp: u32) {
        let arrival_rtp_ts = (self.epoch.elapsed().as_secs_f64() * self.clock_rate as f64) as i64;
        self.on_rtp_at(seq, rtp_timestamp, arrival_rtp_ts)
    }

    /// Same as [`on_rtp`](Self::on_rtp), but with an explicit arrival
    /// timestamp (already in RTP clock units) instead of the wall clock —
    /// used by tests to drive deterministic, synthetic inter-arrival gaps.
    pub fn on_rtp_at(&mut self, seq: u16, rtp_timestamp: u32, arrival_rtp_ts: i64) {
        self.seq.update(seq);
        let transit = arrival_rtp_ts - rtp_timestamp as i64;
        if let Some(prev) = self.transit_prev {
            let d = (transit - prev).unsigned_abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
        }
        self.transit_prev = Some(transit);
    }

    /// Records receipt of a Sender Report so `LSR`/`DLSR` can be computed.
    pub fn on_sender_report(&mut self, sr: &SenderReport) {
        self.last_sr = Some((sr.middle_ntp(), Instant::now()));
    }

    /// Builds the next report block, resetting the interval counters used
    /// for `fraction_lost` (RFC 3550 §6.4.1: loss is reported per interval,
    /// not cumulatively).
    pub fn build_report_block(&mut self) -> ReportBlock {
        let expected = self.seq.expected();
        let received = self.seq.received;
        let expected_interval = expected.saturating_sub(self.prior_expected);
        let received_interval = received.saturating_sub(self.prior_received);
        let lost_interval = expected_interval.saturating_sub(received_interval);
        let fraction_lost = if expected_interval == 0 { 0 } else { ((lost_interval * 256) / expected_interval) as u8 };
        self.prior_expected = expected;
        self.prior_received = received;

        let cumulative_lost = (expected as i64 - received as i64) as i32;
        let (lsr, dlsr) = match &self.last_sr {
            Some((middle, at)) => (*middle, (at.elapsed().as_secs_f64() * 65536.0) as u32),
            None => (0, 0),
        };

        ReportBlock {
            ssrc: self.ssrc,
            fraction_lost,
            cumulative_lost,
            highest_seq: self.seq.extended_max(),
            jitter: self.jitter as u32,
            lsr,
            dlsr,
        }
    }
}
