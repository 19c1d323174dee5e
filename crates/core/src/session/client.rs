//! Client-side RTSP session state machine (RFC 2326 §A.1, as driven by a
//! client rather than mirrored from inbound requests).
//!
//! Unlike [`super::SessionState`] (the server's simpler Ready/Playing/
//! Recording/Paused model, created fresh at SETUP), the client walks through
//! every step of the negotiation itself: it has to know whether it has said
//! OPTIONS yet, whether DESCRIBE or ANNOUNCE picked the direction, and
//! whether at least one track has been set up before PLAY/RECORD are legal.

use std::fmt;

use crate::error::{Result, RtspError};

/// One state in the client's view of an RTSP session (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSessionState {
    /// No request sent yet.
    Initial,
    /// `Start` has opened the control connection; OPTIONS may or may not
    /// have been sent yet, but nothing that assigns a direction has.
    Prelude,
    /// DESCRIBE succeeded: tracks are known, direction is read (play).
    Described,
    /// ANNOUNCE succeeded: direction is write (publish); tracks come from
    /// the caller, not a server DESCRIBE response.
    PreSetup,
    /// At least one SETUP succeeded and no PLAY/RECORD has happened yet.
    Ready,
    /// PLAY succeeded: media flows server -> client.
    Playing,
    /// RECORD succeeded: media flows client -> server.
    Recording,
    /// PAUSE succeeded from Playing or Recording.
    Paused,
    /// TEARDOWN, a fatal error, or the socket closing.
    Closed,
}

impl fmt::Display for ClientSessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initial => "Initial",
            Self::Prelude => "Prelude",
            Self::Described => "Described",
            Self::PreSetup => "PreSetup",
            Self::Ready => "Ready",
            Self::Playing => "Playing",
            Self::Recording => "Recording",
            Self::Paused => "Paused",
            Self::Closed => "Closed",
        };
        f.write_str(s)
    }
}

/// The operations the client state machine allows calling code to perform;
/// independent of the RTSP method name so [`ClientSessionState::check`] can
/// be used before the request is even built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientOp {
    Start,
    Options,
    Describe,
    Announce,
    Setup,
    Play,
    Record,
    Pause,
    Teardown,
    /// GET_PARAMETER / SET_PARAMETER keepalive traffic, legal in any
    /// non-terminal state once the connection is open.
    Keepalive,
}

impl ClientSessionState {
    /// Validates that `op` is legal from the current state (spec §4.8's
    /// transition table), returning the resulting state on success.
    ///
    /// This only encodes the *shape* of the state machine; it does not
    /// inspect the RTSP response itself (the caller advances state only
    /// after a 2xx, via [`Self::check`] then explicit assignment).
    pub fn check(&self, op: ClientOp) -> Result<ClientSessionState> {
        use ClientOp::*;
        use ClientSessionState::*;

        if *self == Closed && op != Start {
            return Err(RtspError::InvalidStateTransition(format!("{op:?} issued after session Closed")));
        }

        let next = match (*self, op) {
            (Initial, Start) => Prelude,
            (Prelude, Options) => Prelude,
            (Prelude, Describe) => Described,
            (Prelude, Announce) => PreSetup,
            (Described | PreSetup, Setup) => Ready,
            (Ready, Setup) => Ready,
            (Ready, Play) => Playing,
            (Ready, Record) => Recording,
            (Playing, Pause) => Paused,
            (Recording, Pause) => Paused,
            (Paused, Play) => Playing,
            (Paused, Record) => Recording,
            (_, Teardown) => Closed,
            (s, Keepalive) if s != Initial => s,
            (s, op) => {
                return Err(RtspError::InvalidStateTransition(format!("{op:?} is not valid in state {s}")));
            }
        };
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ClientOp::*;
    use ClientSessionState::*;

    #[test]
    fn play_in_initial_is_rejected() {
        assert!(Initial.check(Play).is_err());
    }

    #[test]
    fn setup_after_play_is_rejected() {
        assert!(Playing.check(Setup).is_err());
    }

    #[test]
    fn happy_path_read_direction() {
        let s = Initial.check(Start).unwrap();
        assert_eq!(s, Prelude);
        let s = s.check(Options).unwrap();
        assert_eq!(s, Prelude);
        let s = s.check(Describe).unwrap();
        assert_eq!(s, Described);
        let s = s.check(Setup).unwrap();
        assert_eq!(s, Ready);
        let s = s.check(Play).unwrap();
        assert_eq!(s, Playing);
        let s = s.check(Pause).unwrap();
        assert_eq!(s, Paused);
        let s = s.check(Play).unwrap();
        assert_eq!(s, Playing);
        let s = s.check(Teardown).unwrap();
        assert_eq!(s, Closed);
    }

    #[test]
    fn happy_path_publish_direction() {
        let s = Initial.check(Start).unwrap().check(Announce).unwrap();
        assert_eq!(s, PreSetup);
        let s = s.check(Setup).unwrap();
        assert_eq!(s, Ready);
        let s = s.check(Record).unwrap();
        assert_eq!(s, Recording);
    }

    #[test]
    fn nothing_is_valid_after_closed() {
        assert!(Closed.check(Options).is_err());
        assert!(Closed.check(Play).is_err());
    }

    #[test]
    fn teardown_is_valid_from_any_state() {
        for s in [Prelude, Described, PreSetup, Ready, Playing, Recording, Paused] {
            assert_eq!(s.check(Teardown).unwrap(), Closed);
        }
    }
}
