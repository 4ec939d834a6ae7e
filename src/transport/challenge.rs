//! Authentication Challenges
//!
//! Protection spaces, credentials and the replies a challenge expects.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Authentication scheme a challenge was issued for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthenticationMethod {
    /// TLS server trust evaluation
    ServerTrust,
    HttpBasic,
    HttpDigest,
    ClientCertificate,
    Other(String),
}

/// Result of the transport's own evaluation of a server certificate chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTrust {
    /// DER-encoded certificates, leaf first
    pub certificates: Vec<Bytes>,
    /// Whether the chain verified against the system anchors
    pub chain_trusted: bool,
    /// Whether the leaf matched the requested host name
    pub hostname_matches: bool,
}

impl ServerTrust {
    pub fn new(certificates: Vec<Bytes>) -> Self {
        Self {
            certificates,
            chain_trusted: true,
            hostname_matches: true,
        }
    }
}

/// Authentication context a challenge is issued for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionSpace {
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub realm: Option<String>,
    pub method: AuthenticationMethod,
    /// Present for `ServerTrust` challenges
    pub server_trust: Option<ServerTrust>,
}

impl ProtectionSpace {
    /// Protection space for a server trust challenge
    pub fn server_trust(host: impl Into<String>, port: u16, trust: ServerTrust) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: "https".to_string(),
            realm: None,
            method: AuthenticationMethod::ServerTrust,
            server_trust: Some(trust),
        }
    }

    /// Protection space for an HTTP authentication challenge
    pub fn http(
        host: impl Into<String>,
        port: u16,
        protocol: impl Into<String>,
        realm: Option<String>,
        method: AuthenticationMethod,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            protocol: protocol.into(),
            realm,
            method,
            server_trust: None,
        }
    }
}

/// Credential offered in reply to a challenge
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Password { user: String, password: String },
    ServerTrust(ServerTrust),
    ClientCertificate(Bytes),
}

impl Credential {
    pub fn password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Password {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password { user, .. } => f
                .debug_struct("Password")
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
            Self::ServerTrust(trust) => f.debug_tuple("ServerTrust").field(trust).finish(),
            Self::ClientCertificate(_) => f.write_str("ClientCertificate(..)"),
        }
    }
}

/// An authentication challenge for one task or for the session
#[derive(Debug, Clone)]
pub struct Challenge {
    pub protection_space: ProtectionSpace,
    /// How many times this space has already failed authentication
    pub previous_failure_count: u32,
    pub proposed_credential: Option<Credential>,
}

impl Challenge {
    pub fn new(protection_space: ProtectionSpace) -> Self {
        Self {
            protection_space,
            previous_failure_count: 0,
            proposed_credential: None,
        }
    }

    pub fn with_failure_count(mut self, count: u32) -> Self {
        self.previous_failure_count = count;
        self
    }

    pub fn is_server_trust(&self) -> bool {
        self.protection_space.method == AuthenticationMethod::ServerTrust
    }
}

/// How the transport should treat a challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeDisposition {
    UseCredential,
    PerformDefaultHandling,
    CancelAuthenticationChallenge,
    RejectProtectionSpace,
}

/// Reply to a challenge: a disposition plus an optional credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeReply {
    pub disposition: ChallengeDisposition,
    pub credential: Option<Credential>,
}

impl ChallengeReply {
    pub fn use_credential(credential: Credential) -> Self {
        Self {
            disposition: ChallengeDisposition::UseCredential,
            credential: Some(credential),
        }
    }

    pub fn default_handling() -> Self {
        Self {
            disposition: ChallengeDisposition::PerformDefaultHandling,
            credential: None,
        }
    }

    pub fn cancel() -> Self {
        Self {
            disposition: ChallengeDisposition::CancelAuthenticationChallenge,
            credential: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_is_redacted() {
        let credential = Credential::password("alice", "hunter2");
        let printed = format!("{:?}", credential);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_server_trust_challenge() {
        let space = ProtectionSpace::server_trust("example.com", 443, ServerTrust::new(vec![]));
        let challenge = Challenge::new(space);
        assert!(challenge.is_server_trust());
        assert_eq!(challenge.previous_failure_count, 0);
    }
}
