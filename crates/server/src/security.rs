//! Origin and Host checks for the HTTP endpoint (DNS-rebinding protection).

use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportSecurity {
    pub enable_dns_rebinding_protection: bool,
    pub allowed_origins: Vec<String>,
    pub allowed_hosts: Vec<String>,
}

/// Derive the transport security policy.
///
/// Production turns protection on only when an allow-list was configured;
/// with nothing to check against it stays off. Development never checks.
pub fn get_transport_config(
    production: bool,
    allowed_origins: &[String],
    allowed_hosts: &[String],
) -> TransportSecurity {
    if !production {
        return TransportSecurity::default();
    }
    let enable = !allowed_origins.is_empty() || !allowed_hosts.is_empty();
    if !enable {
        warn!("production mode without allowed origins or hosts; DNS rebinding protection is off");
    }
    TransportSecurity {
        enable_dns_rebinding_protection: enable,
        allowed_origins: allowed_origins.to_vec(),
        allowed_hosts: allowed_hosts.to_vec(),
    }
}

impl TransportSecurity {
    /// Check request headers. Absent headers pass: non-browser clients
    /// send no Origin.
    pub fn check(&self, origin: Option<&str>, host: Option<&str>) -> Result<()> {
        if !self.enable_dns_rebinding_protection {
            return Ok(());
        }
        if let Some(origin) = origin
            && !self.allowed_origins.is_empty()
            && !self.allowed_origins.iter().any(|o| o.eq_ignore_ascii_case(origin))
        {
            return Err(Error::Forbidden(origin.to_string()));
        }
        if let Some(host) = host
            && !self.allowed_hosts.is_empty()
            && !self.allowed_hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
        {
            return Err(Error::Forbidden(host.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn development_disables_checks() {
        let policy = get_transport_config(false, &list(&["https://app.example"]), &[]);
        assert!(!policy.enable_dns_rebinding_protection);
        assert!(policy.check(Some("https://evil.example"), None).is_ok());
    }

    #[test]
    fn production_follows_allow_list() {
        let empty = get_transport_config(true, &[], &[]);
        assert!(!empty.enable_dns_rebinding_protection);

        let policy = get_transport_config(true, &list(&["https://app.example"]), &[]);
        assert!(policy.enable_dns_rebinding_protection);
        assert!(policy.check(Some("https://app.example"), Some("anything")).is_ok());
        assert!(policy.check(None, None).is_ok());
        assert!(matches!(
            policy.check(Some("https://evil.example"), None),
            Err(Error::Forbidden(origin)) if origin == "https://evil.example"
        ));
    }

    #[test]
    fn host_allow_list() {
        let policy = get_transport_config(true, &[], &list(&["localhost:3000"]));
        assert!(policy.check(None, Some("localhost:3000")).is_ok());
        assert!(policy.check(None, Some("attacker.test")).is_err());
    }
}
