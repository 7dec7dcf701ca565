use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// What to do with an inbound frame that fails parsing or validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePolicy {
    /// Ignore the frame and keep the connection open.
    Drop,
    /// Close the connection with `processing_error`.
    Close,
}

impl FromStr for FramePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "close" => Ok(Self::Close),
            other => Err(format!("unknown frame policy {other:?} (expected drop or close)")),
        }
    }
}

impl fmt::Display for FramePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drop => f.write_str("drop"),
            Self::Close => f.write_str("close"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Maximum number of queued events per connected session.
    pub subscriber_queue_capacity: usize,

    /// Server sends a Ping this often. Two missed Pongs drop the connection.
    pub heartbeat_interval: Duration,

    pub token_ttl: chrono::Duration,

    pub room_invalid_frame: FramePolicy,
    pub direct_invalid_frame: FramePolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: 256,
            heartbeat_interval: Duration::from_secs(15),
            token_ttl: chrono::Duration::days(30),
            room_invalid_frame: FramePolicy::Drop,
            direct_invalid_frame: FramePolicy::Close,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_policy_parse() {
        assert_eq!("drop".parse::<FramePolicy>().unwrap(), FramePolicy::Drop);
        assert_eq!("CLOSE".parse::<FramePolicy>().unwrap(), FramePolicy::Close);
        assert!("explode".parse::<FramePolicy>().is_err());
    }

    #[test]
    fn test_defaults_keep_per_kind_policies() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.room_invalid_frame, FramePolicy::Drop);
        assert_eq!(cfg.direct_invalid_frame, FramePolicy::Close);
    }
}
