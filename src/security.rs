//! Security Policy
//!
//! Server trust evaluation with optional certificate pinning. The session
//! manager consults a [`TrustEvaluator`] for every challenge nobody else
//! handled.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::transport::{AuthenticationMethod, ProtectionSpace};

/// Outcome of a trust evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustDecision {
    Accept,
    Reject,
}

/// Single decision function consulted for unhandled challenges
pub trait TrustEvaluator: Send + Sync {
    fn evaluate_trust(&self, space: &ProtectionSpace) -> TrustDecision;
}

impl<F> TrustEvaluator for F
where
    F: Fn(&ProtectionSpace) -> TrustDecision + Send + Sync,
{
    fn evaluate_trust(&self, space: &ProtectionSpace) -> TrustDecision {
        self(space)
    }
}

/// What a server certificate chain is pinned against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PinningMode {
    /// Trust the transport's own chain evaluation
    #[default]
    None,
    /// Some certificate in the chain must equal a pinned certificate
    Certificate,
    /// Some certificate in the chain must hash (SHA-256) to a pinned fingerprint
    Fingerprint,
}

/// Trust policy with optional pinning
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    pub pinning_mode: PinningMode,
    /// DER certificates for `PinningMode::Certificate`
    pub pinned_certificates: Vec<Bytes>,
    /// SHA-256 digests for `PinningMode::Fingerprint`
    pub pinned_fingerprints: Vec<[u8; 32]>,
    /// Accept chains the transport could not verify
    pub allow_invalid_certificates: bool,
    pub validates_domain_name: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            pinning_mode: PinningMode::None,
            pinned_certificates: Vec::new(),
            pinned_fingerprints: Vec::new(),
            allow_invalid_certificates: false,
            validates_domain_name: true,
        }
    }
}

impl SecurityPolicy {
    /// Policy that only trusts what the transport trusts
    pub fn default_policy() -> Self {
        Self::default()
    }

    /// Policy accepting any server. For testing against self-signed servers.
    pub fn permissive() -> Self {
        Self {
            allow_invalid_certificates: true,
            validates_domain_name: false,
            ..Self::default()
        }
    }

    pub fn with_pinned_certificates(certificates: Vec<Bytes>) -> Self {
        Self {
            pinning_mode: PinningMode::Certificate,
            pinned_certificates: certificates,
            ..Self::default()
        }
    }

    pub fn with_pinned_fingerprints(fingerprints: Vec<[u8; 32]>) -> Self {
        Self {
            pinning_mode: PinningMode::Fingerprint,
            pinned_fingerprints: fingerprints,
            ..Self::default()
        }
    }

    /// SHA-256 digest of a DER certificate
    pub fn fingerprint(certificate: &[u8]) -> [u8; 32] {
        Sha256::digest(certificate).into()
    }

    /// Base64 form of a fingerprint, as written in config files
    pub fn fingerprint_base64(certificate: &[u8]) -> String {
        STANDARD.encode(Self::fingerprint(certificate))
    }

    fn evaluate_server_trust(&self, space: &ProtectionSpace) -> TrustDecision {
        let Some(trust) = space.server_trust.as_ref() else {
            warn!("Server trust challenge for {} carried no trust", space.host);
            return TrustDecision::Reject;
        };

        if !trust.chain_trusted && !self.allow_invalid_certificates {
            warn!("Untrusted certificate chain for {}", space.host);
            return TrustDecision::Reject;
        }
        if !trust.hostname_matches && self.validates_domain_name {
            warn!("Certificate does not match host {}", space.host);
            return TrustDecision::Reject;
        }

        let pinned = match self.pinning_mode {
            PinningMode::None => true,
            PinningMode::Certificate => trust
                .certificates
                .iter()
                .any(|cert| self.pinned_certificates.contains(cert)),
            PinningMode::Fingerprint => trust
                .certificates
                .iter()
                .map(|cert| Self::fingerprint(cert))
                .any(|digest| self.pinned_fingerprints.contains(&digest)),
        };

        if pinned {
            debug!("Trusted server {}", space.host);
            TrustDecision::Accept
        } else {
            warn!("No pinned certificate matched for {}", space.host);
            TrustDecision::Reject
        }
    }
}

impl TrustEvaluator for SecurityPolicy {
    fn evaluate_trust(&self, space: &ProtectionSpace) -> TrustDecision {
        match space.method {
            AuthenticationMethod::ServerTrust => self.evaluate_server_trust(space),
            // credentials are chosen elsewhere; the policy only gates trust
            _ => TrustDecision::Accept,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ServerTrust;

    fn space(certificates: Vec<Bytes>) -> ProtectionSpace {
        ProtectionSpace::server_trust("example.com", 443, ServerTrust::new(certificates))
    }

    #[test]
    fn test_default_policy_follows_chain_evaluation() {
        let policy = SecurityPolicy::default_policy();
        assert_eq!(policy.evaluate_trust(&space(vec![])), TrustDecision::Accept);

        let mut untrusted = space(vec![]);
        if let Some(trust) = untrusted.server_trust.as_mut() {
            trust.chain_trusted = false;
        }
        assert_eq!(policy.evaluate_trust(&untrusted), TrustDecision::Reject);
        assert_eq!(
            SecurityPolicy::permissive().evaluate_trust(&untrusted),
            TrustDecision::Accept
        );
    }

    #[test]
    fn test_hostname_validation() {
        let mut mismatched = space(vec![]);
        if let Some(trust) = mismatched.server_trust.as_mut() {
            trust.hostname_matches = false;
        }
        assert_eq!(
            SecurityPolicy::default_policy().evaluate_trust(&mismatched),
            TrustDecision::Reject
        );
    }

    #[test]
    fn test_certificate_pinning() {
        let leaf = Bytes::from_static(b"leaf-der");
        let policy = SecurityPolicy::with_pinned_certificates(vec![leaf.clone()]);

        assert_eq!(policy.evaluate_trust(&space(vec![leaf])), TrustDecision::Accept);
        assert_eq!(
            policy.evaluate_trust(&space(vec![Bytes::from_static(b"other")])),
            TrustDecision::Reject
        );
    }

    #[test]
    fn test_fingerprint_pinning() {
        let leaf = Bytes::from_static(b"leaf-der");
        let policy = SecurityPolicy::with_pinned_fingerprints(vec![SecurityPolicy::fingerprint(&leaf)]);
        assert_eq!(policy.evaluate_trust(&space(vec![leaf])), TrustDecision::Accept);

        let empty = SecurityPolicy::with_pinned_fingerprints(vec![]);
        assert_eq!(
            empty.evaluate_trust(&space(vec![Bytes::from_static(b"leaf-der")])),
            TrustDecision::Reject
        );
    }

    #[test]
    fn test_non_trust_challenges_accepted() {
        let space = ProtectionSpace::http("example.com", 80, "http", None, AuthenticationMethod::HttpBasic);
        let policy = SecurityPolicy::with_pinned_certificates(vec![]);
        assert_eq!(policy.evaluate_trust(&space), TrustDecision::Accept);
    }

    #[test]
    fn test_closure_evaluator() {
        let reject_all = |_: &ProtectionSpace| TrustDecision::Reject;
        assert_eq!(reject_all.evaluate_trust(&space(vec![])), TrustDecision::Reject);
    }
}
