//! Artifact naming shared by the panel and agents.
//!
//! A forward's remote artifacts are named `{forwardId}_{userId}_{userTunnelId}`
//! plus a kind suffix. Agents echo these names back in traffic reports, which
//! is how a report is attributed to a forward, user, and grant.

use std::fmt;
use std::str::FromStr;

/// User-tunnel id meaning "no per-tunnel grant quota applies".
pub const NO_USER_TUNNEL: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Tcp,
    Udp,
    /// Exit-side relay listener of a multi-hop forward.
    Tls,
    Chains,
}

impl ArtifactKind {
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Tls => "tls",
            Self::Chains => "chains",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceName {
    pub forward_id: i64,
    pub user_id: i64,
    pub user_tunnel_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NameError {
    #[error("service name `{0}` has fewer than three parts")]
    TooFewParts(String),
    #[error("service name `{0}` has a non-numeric id")]
    NotNumeric(String),
}

impl ServiceName {
    pub const fn new(forward_id: i64, user_id: i64, user_tunnel_id: i64) -> Self {
        Self {
            forward_id,
            user_id,
            user_tunnel_id,
        }
    }

    pub fn artifact(&self, kind: ArtifactKind) -> String {
        format!("{self}_{}", kind.suffix())
    }

    /// The client-facing listener pair.
    pub fn listeners(&self) -> [String; 2] {
        [self.artifact(ArtifactKind::Tcp), self.artifact(ArtifactKind::Udp)]
    }

    pub const fn has_grant(&self) -> bool {
        self.user_tunnel_id != NO_USER_TUNNEL
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.forward_id, self.user_id, self.user_tunnel_id)
    }
}

impl FromStr for ServiceName {
    type Err = NameError;

    /// Parses the leading three ids; any artifact suffix is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('_');
        let (Some(f), Some(u), Some(ut)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(NameError::TooFewParts(s.to_string()));
        };
        let parse = |p: &str| {
            p.trim()
                .parse::<i64>()
                .map_err(|_| NameError::NotNumeric(s.to_string()))
        };
        Ok(Self::new(parse(f)?, parse(u)?, parse(ut)?))
    }
}

/// Shared relay listener installed on every non-entry hop of a tunnel.
pub fn tunnel_relay_name(tunnel_id: i64) -> String {
    format!("tunnel_{tunnel_id}_relay")
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn formats_and_parses() {
        let name = ServiceName::new(12, 3, 0);
        assert_eq!(name.to_string(), "12_3_0");
        assert_eq!("12_3_0".parse::<ServiceName>().unwrap(), name);
        assert!(!name.has_grant());
    }

    #[test]
    fn artifact_suffix_is_ignored_when_parsing() {
        let name: ServiceName = "7_1_4_tcp".parse().unwrap();
        assert_eq!(name, ServiceName::new(7, 1, 4));
        assert_eq!(name.artifact(ArtifactKind::Tls), "7_1_4_tls");
        assert_eq!(name.listeners(), ["7_1_4_tcp".to_string(), "7_1_4_udp".to_string()]);
    }

    #[test]
    fn malformed_names_are_rejected() {
        assert_eq!(
            "7_1".parse::<ServiceName>(),
            Err(NameError::TooFewParts("7_1".into()))
        );
        assert!(matches!(
            "web_api_x".parse::<ServiceName>(),
            Err(NameError::NotNumeric(_))
        ));
    }

    #[test]
    fn tunnel_level_relay_name() {
        assert_eq!(tunnel_relay_name(9), "tunnel_9_relay");
    }
}
