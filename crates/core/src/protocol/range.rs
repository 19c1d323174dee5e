//! The `Range` header (RFC 2326 §12.29), used by PLAY to request a playback
//! window and by PAUSE/PLAY responses to report what is actually playing.
//!
//! Three time formats are in use: NPT (normal play time, relative seconds),
//! SMPTE (timecode, for frame-accurate editing systems), and UTC wall-clock
//! ranges. All three share the same `unit=start-end` shape, with `end` optional
//! (an open range means "play to the end" or "until stopped").

use crate::error::{ParseErrorKind, Result, RtspError};

/// A point in normal play time: either `now` or an offset in seconds from the
/// start of the stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NptTime {
    Now,
    Seconds(f64),
}

impl NptTime {
    fn parse(s: &str) -> Result<Self> {
        if s == "now" {
            return Ok(Self::Now);
        }
        if let Some((h, rest)) = s.split_once(':') {
            let (m, sec) = rest.split_once(':').ok_or(invalid())?;
            let h: f64 = h.parse().map_err(|_| invalid())?;
            let m: f64 = m.parse().map_err(|_| invalid())?;
            let sec: f64 = sec.parse().map_err(|_| invalid())?;
            return Ok(Self::Seconds(h * 3600.0 + m * 60.0 + sec));
        }
        s.parse().map(Self::Seconds).map_err(|_| invalid())
    }

    fn format(&self) -> String {
        match self {
            Self::Now => "now".to_string(),
            Self::Seconds(s) => format!("{s}"),
        }
    }
}

/// An SMPTE timecode: hours:minutes:seconds[:frames].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmpteTime {
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
    pub frames: Option<u32>,
}

impl SmpteTime {
    fn parse(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let hours = parts.next().ok_or(invalid())?.parse().map_err(|_| invalid())?;
        let minutes = parts.next().ok_or(invalid())?.parse().map_err(|_| invalid())?;
        let seconds_field = parts.next().ok_or(invalid())?;
        let (seconds, frames) = match seconds_field.split_once('.') {
            Some((s, f)) => (s.parse().map_err(|_| invalid())?, Some(f.parse().map_err(|_| invalid())?)),
            None => (seconds_field.parse().map_err(|_| invalid())?, None),
        };
        Ok(Self { hours, minutes, seconds, frames })
    }

    fn format(&self) -> String {
        match self.frames {
            Some(f) => format!("{:02}:{:02}:{:02}.{:02}", self.hours, self.minutes, self.seconds, f),
            None => format!("{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds),
        }
    }
}

/// A parsed `Range` header value.
#[derive(Debug, Clone, PartialEq)]
pub enum Range {
    Npt { start: NptTime, end: Option<NptTime> },
    Smpte { start: SmpteTime, end: Option<SmpteTime> },
    /// UTC wall-clock range. Timestamps are kept as their raw ISO 8601-ish
    /// tokens (e.g. `19960213T143205Z`); this library never needs to do
    /// arithmetic on them, only forward them between peers.
    Utc { start: String, end: Option<String> },
}

impl Range {
    /// A convenience range meaning "play from the beginning to the end".
    pub fn from_start() -> Self {
        Range::Npt { start: NptTime::Seconds(0.0), end: None }
    }

    /// Parses a `Range` header value, e.g. `npt=10-25` or `smpte=10:07:33-`.
    pub fn parse(value: &str) -> Result<Self> {
        let (unit, rest) = value.split_once('=').ok_or(invalid())?;
        let (start, end) = match rest.split_once('-') {
            Some((s, e)) if e.is_empty() => (s, None),
            Some((s, e)) => (s, Some(e)),
            None => (rest, None),
        };
        match unit {
            "npt" => Ok(Range::Npt { start: NptTime::parse(start)?, end: end.map(NptTime::parse).transpose()? }),
            "smpte" | "smpte-30-drop" | "smpte-25" => {
                Ok(Range::Smpte { start: SmpteTime::parse(start)?, end: end.map(SmpteTime::parse).transpose()? })
            }
            "clock" => Ok(Range::Utc { start: start.to_string(), end: end.map(str::to_string) }),
            _ => Err(invalid()),
        }
    }

    /// Formats back to a `Range` header value.
    pub fn format(&self) -> String {
        match self {
            Range::Npt { start, end } => match end {
                Some(e) => format!("npt={}-{}", start.format(), e.format()),
                None => format!("npt={}-", start.format()),
            },
            Range::Smpte { start, end } => match end {
                Some(e) => format!("smpte={}-{}", start.format(), e.format()),
                None => format!("smpte={}-", start.format()),
            },
            Range::Utc { start, end } => match end {
                Some(e) => format!("clock={start}-{e}"),
                None => format!("clock={start}-"),
            },
        }
    }
}

fn invalid() -> RtspError {
    RtspError::Parse { kind: ParseErrorKind::InvalidHeaderValue("Range") }
}

/// A full `Range` header: a playback range plus an optional `;time=` suffix
/// naming the wall-clock instant at which the range takes effect (used by
/// PAUSE/PLAY to schedule a future seek). The suffix is always UTC, in the
/// same `YYYYMMDDTHHMMSSZ` form as the `clock=` unit.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeHeader {
    pub value: Range,
    pub time: Option<String>,
}

impl RangeHeader {
    pub fn parse(value: &str) -> Result<Self> {
        let (spec, time) = match value.split_once(";time=") {
            Some((s, t)) => (s, Some(t.to_string())),
            None => (value, None),
        };
        Ok(Self { value: Range::parse(spec)?, time })
    }

    pub fn format(&self) -> String {
        match &self.time {
            Some(t) => format!("{};time={}", self.value.format(), t),
            None => self.value.format(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_open_npt_range() {
        let r = Range::parse("npt=0-").unwrap();
        assert_eq!(r, Range::Npt { start: NptTime::Seconds(0.0), end: None });
    }

    #[test]
    fn parses_closed_npt_range() {
        let r = Range::parse("npt=10.5-25").unwrap();
        assert_eq!(r, Range::Npt { start: NptTime::Seconds(10.5), end: Some(NptTime::Seconds(25.0)) });
    }

    #[test]
    fn parses_npt_now() {
        let r = Range::parse("npt=now-").unwrap();
        assert_eq!(r, Range::Npt { start: NptTime::Now, end: None });
    }

    #[test]
    fn parses_smpte_range_with_frames() {
        let r = Range::parse("smpte=10:07:33-10:07:33.05").unwrap();
        assert_eq!(
            r,
            Range::Smpte {
                start: SmpteTime { hours: 10, minutes: 7, seconds: 33, frames: None },
                end: Some(SmpteTime { hours: 10, minutes: 7, seconds: 33, frames: Some(5) }),
            }
        );
    }

    #[test]
    fn parses_clock_range() {
        let r = Range::parse("clock=19960213T143205Z-19960213T143955Z").unwrap();
        assert_eq!(r, Range::Utc { start: "19960213T143205Z".into(), end: Some("19960213T143955Z".into()) });
    }

    #[test]
    fn round_trips_format() {
        let r = Range::parse("npt=10-25").unwrap();
        assert_eq!(Range::parse(&r.format()).unwrap(), r);
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(Range::parse("frobnicate=0-").is_err());
    }

    #[test]
    fn parses_range_header_with_time_suffix() {
        let h = RangeHeader::parse("npt=0-;time=19960213T143205Z").unwrap();
        assert_eq!(h.value, Range::Npt { start: NptTime::Seconds(0.0), end: None });
        assert_eq!(h.time.as_deref(), Some("19960213T143205Z"));
        assert_eq!(h.format(), "npt=0-;time=19960213T143205Z");
    }

    #[test]
    fn parses_range_header_without_time_suffix() {
        let h = RangeHeader::parse("npt=10-25").unwrap();
        assert_eq!(h.time, None);
        assert_eq!(h.format(), "npt=10-25");
    }
}
