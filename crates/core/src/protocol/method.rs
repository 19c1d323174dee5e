use std::fmt;

/// RTSP request methods (RFC 2326 §10).
///
/// | Method          | Direction        | Purpose                                |
/// |-----------------|------------------|-----------------------------------------|
/// | OPTIONS         | either           | discover supported methods              |
/// | DESCRIBE        | client -> server | fetch an SDP session description        |
/// | ANNOUNCE        | client -> server | push an SDP description (recording)     |
/// | SETUP           | client -> server | negotiate a transport for one media     |
/// | PLAY            | client -> server | start/resume streaming                  |
/// | RECORD          | client -> server | start accepting media from the client   |
/// | PAUSE           | client -> server | suspend streaming without tearing down  |
/// | TEARDOWN        | client -> server | free session state and transport        |
/// | GET_PARAMETER   | either           | keepalive / parameter query             |
/// | SET_PARAMETER   | client -> server | keepalive / parameter update            |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Options,
    Describe,
    Announce,
    Setup,
    Play,
    Record,
    Pause,
    Teardown,
    GetParameter,
    SetParameter,
}

impl Method {
    /// Returns the wire token for this method (e.g. `"GET_PARAMETER"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Options => "OPTIONS",
            Self::Describe => "DESCRIBE",
            Self::Announce => "ANNOUNCE",
            Self::Setup => "SETUP",
            Self::Play => "PLAY",
            Self::Record => "RECORD",
            Self::Pause => "PAUSE",
            Self::Teardown => "TEARDOWN",
            Self::GetParameter => "GET_PARAMETER",
            Self::SetParameter => "SET_PARAMETER",
        }
    }

    /// Parses a method token. Matching is case-sensitive per RFC 2326's BNF
    /// (methods are defined as fixed uppercase tokens).
    pub fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "OPTIONS" => Self::Options,
            "DESCRIBE" => Self::Describe,
            "ANNOUNCE" => Self::Announce,
            "SETUP" => Self::Setup,
            "PLAY" => Self::Play,
            "RECORD" => Self::Record,
            "PAUSE" => Self::Pause,
            "TEARDOWN" => Self::Teardown,
            "GET_PARAMETER" => Self::GetParameter,
            "SET_PARAMETER" => Self::SetParameter,
            _ => return None,
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_method() {
        let all = [
            Method::Options,
            Method::Describe,
            Method::Announce,
            Method::Setup,
            Method::Play,
            Method::Record,
            Method::Pause,
            Method::Teardown,
            Method::GetParameter,
            Method::SetParameter,
        ];
        for m in all {
            assert_eq!(Method::parse(m.as_str()), Some(m));
        }
    }

    #[test]
    fn unknown_token_is_none() {
        assert_eq!(Method::parse("FROB"), None);
    }
}
