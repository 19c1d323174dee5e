//! Case-insensitive, duplicate-preserving RTSP header map (RFC 2326 §4.2).

use std::collections::HashMap;

use crate::error::{ParseErrorKind, Result, RtspError};

/// Largest RTSP message body the wire codec will read.
///
/// Bodies are almost always SDP session descriptions; this bound exists to stop a
/// misbehaving peer from forcing an unbounded read off `Content-Length`.
pub const MAX_BODY_SIZE: usize = 131_072;

/// An ordered multimap of header name to value.
///
/// Lookups are case-insensitive per RFC 2326. Insertion order is preserved so that
/// repeated headers of the same name round-trip in the order they were added.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header map.
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Appends a header, keeping any existing header of the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces all headers with the given name with a single new value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(&name));
        self.entries.push((name, value.into()));
    }

    /// Returns the first value for `name`, ignoring case.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value for `name`, in insertion order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Iterates over `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Shortcut for the mandatory `CSeq` header (RFC 2326 §12.17).
    pub fn cseq(&self) -> Option<&str> {
        self.get("CSeq")
    }

    /// Parses and bounds-checks the `Content-Length` header.
    ///
    /// Returns `0` when the header is absent, per the request/response invariant that a
    /// missing `Content-Length` means no body.
    pub fn content_length(&self) -> Result<usize> {
        match self.get("Content-Length") {
            None => Ok(0),
            Some(raw) => {
                let len: usize = raw
                    .trim()
                    .parse()
                    .map_err(|_| RtspError::Parse { kind: ParseErrorKind::InvalidHeaderValue("Content-Length") })?;
                if len > MAX_BODY_SIZE {
                    return Err(RtspError::MessageTooLarge(format!(
                        "Content-Length {len} exceeds the {MAX_BODY_SIZE} byte limit"
                    )));
                }
                Ok(len)
            }
        }
    }

    /// Emits headers `CSeq` first, then the rest in stable alphabetical order by name.
    ///
    /// This is purely a wire-formatting convention; the header map itself does not
    /// attach meaning to ordering across distinct header names.
    pub fn ordered_for_write(&self) -> Vec<(&str, &str)> {
        let mut rest: Vec<&(String, String)> =
            self.entries.iter().filter(|(k, _)| !k.eq_ignore_ascii_case("CSeq")).collect();
        rest.sort_by(|a, b| a.0.to_ascii_lowercase().cmp(&b.0.to_ascii_lowercase()));

        let mut out = Vec::with_capacity(self.entries.len());
        if let Some((k, v)) = self.entries.iter().find(|(k, _)| k.eq_ignore_ascii_case("CSeq")) {
            out.push((k.as_str(), v.as_str()));
        }
        out.extend(rest.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        out
    }

    /// Groups values by lower-cased header name, preserving per-name order.
    ///
    /// Two header maps built from the same logical headers compare equal under
    /// [`PartialEq`] regardless of the relative order of *distinct* header names,
    /// since `ordered_for_write` is free to reorder those; duplicate values for the
    /// same name must still appear in the same order.
    fn grouped(&self) -> HashMap<String, Vec<&str>> {
        let mut map: HashMap<String, Vec<&str>> = HashMap::new();
        for (k, v) in &self.entries {
            map.entry(k.to_ascii_lowercase()).or_default().push(v.as_str());
        }
        map
    }
}

impl PartialEq for Headers {
    fn eq(&self, other: &Self) -> bool {
        self.grouped() == other.grouped()
    }
}

impl Eq for Headers {}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut h = Headers::new();
        h.insert("Content-Type", "application/sdp");
        assert_eq!(h.get("content-type"), Some("application/sdp"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("application/sdp"));
    }

    #[test]
    fn set_replaces_all_prior_values() {
        let mut h = Headers::new();
        h.insert("Transport", "RTP/AVP;unicast");
        h.insert("Transport", "RTP/AVP/TCP;interleaved=0-1");
        h.set("Transport", "final");
        assert_eq!(h.get_all("Transport"), vec!["final"]);
    }

    #[test]
    fn missing_content_length_is_zero() {
        let h = Headers::new();
        assert_eq!(h.content_length().unwrap(), 0);
    }

    #[test]
    fn oversized_content_length_is_rejected() {
        let mut h = Headers::new();
        h.insert("Content-Length", "999999999");
        assert!(h.content_length().is_err());
    }

    #[test]
    fn ordered_for_write_puts_cseq_first_then_alphabetical() {
        let mut h = Headers::new();
        h.insert("Session", "abc123");
        h.insert("CSeq", "2");
        h.insert("Content-Type", "application/sdp");
        let order: Vec<&str> = h.ordered_for_write().into_iter().map(|(k, _)| k).collect();
        assert_eq!(order, vec!["CSeq", "Content-Type", "Session"]);
    }

    #[test]
    fn equality_ignores_cross_name_order_but_not_duplicate_order() {
        let mut a = Headers::new();
        a.insert("CSeq", "1");
        a.insert("Transport", "one");
        a.insert("Transport", "two");

        let mut b = Headers::new();
        b.insert("Transport", "one");
        b.insert("Transport", "two");
        b.insert("CSeq", "1");

        assert_eq!(a, b);

        let mut c = Headers::new();
        c.insert("Transport", "two");
        c.insert("Transport", "one");
        c.insert("CSeq", "1");
        assert_ne!(a, c);
    }
}
