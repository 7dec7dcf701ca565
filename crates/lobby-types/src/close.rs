use std::fmt;

/// Why a chat connection was refused or closed by the server.
/// Each reason maps to its own close code in the 4000-4999 application range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Refusal {
    NoToken,
    InvalidToken,
    NotAMember,
    SelfConnect,
    NoSuchUser,
    ProcessingError,
    NoSuchRoom,
}

impl Refusal {
    pub fn code(&self) -> u16 {
        match self {
            Self::NoToken => 4001,
            Self::InvalidToken => 4002,
            Self::NotAMember => 4003,
            Self::SelfConnect => 4004,
            Self::NoSuchUser => 4005,
            Self::ProcessingError => 4006,
            Self::NoSuchRoom => 4007,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoToken => "no_token",
            Self::InvalidToken => "invalid_token",
            Self::NotAMember => "not_a_member",
            Self::SelfConnect => "self_connect",
            Self::NoSuchUser => "no_such_user",
            Self::ProcessingError => "processing_error",
            Self::NoSuchRoom => "no_such_room",
        }
    }

    /// Human-readable reason sent in the close frame.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NoToken => "No token provided.",
            Self::InvalidToken => "Invalid token.",
            Self::NotAMember => "User is not a member of this room.",
            Self::SelfConnect => "Cannot connect to yourself.",
            Self::NoSuchUser => "Other user does not exist.",
            Self::ProcessingError => "Error processing message.",
            Self::NoSuchRoom => "Room does not exist.",
        }
    }
}

impl fmt::Display for Refusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}
