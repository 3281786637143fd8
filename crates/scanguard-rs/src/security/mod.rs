use std::{fmt, net::IpAddr, str::FromStr};

use ipnet::IpNet;

use crate::error::ValidationError;

lazy_static::lazy_static! {
    static ref FORBIDDEN_RANGES: Vec<IpNet> = [
        "127.0.0.0/8",    // loopback
        "169.254.0.0/16", // link-local
        "224.0.0.0/4",    // multicast
        "240.0.0.0/4",    // reserved
        "::1/128",
        "fe80::/10",
        "ff00::/8",
        // IPv4-mapped forms of the IPv4 ranges above
        "::ffff:127.0.0.0/104",
        "::ffff:169.254.0.0/112",
        "::ffff:224.0.0.0/100",
        "::ffff:240.0.0.0/100",
    ]
    .iter()
    .filter_map(|net| IpNet::from_str(net).ok())
    .collect();
}

pub const MAX_IPV4_HOSTS: u128 = 256;
pub const MAX_IPV6_HOSTS: u128 = 65_536;

/// A target that passed every policy check. `Display` renders the form handed
/// to the tool: a bare address for single hosts, the truncated network
/// otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTarget {
    network: IpNet,
}

impl ValidatedTarget {
    pub fn network(&self) -> IpNet {
        self.network
    }

    pub fn address_count(&self) -> u128 {
        address_count(&self.network)
    }
}

impl fmt::Display for ValidatedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.network.prefix_len() == self.network.max_prefix_len() {
            write!(f, "{}", self.network.addr())
        } else {
            write!(f, "{}", self.network)
        }
    }
}

#[derive(Debug, Clone)]
pub struct TargetPolicy {
    pub max_ipv4_hosts: u128,
    pub max_ipv6_hosts: u128,
    /// Empty means any non-forbidden network is in scope.
    pub scope_allowlist: Vec<IpNet>,
}

impl Default for TargetPolicy {
    fn default() -> Self {
        Self {
            max_ipv4_hosts: MAX_IPV4_HOSTS,
            max_ipv6_hosts: MAX_IPV6_HOSTS,
            scope_allowlist: vec![],
        }
    }
}

impl TargetPolicy {
    pub fn validate(&self, target: &str) -> Result<ValidatedTarget, ValidationError> {
        let target = target.trim();
        let network = parse_target(target)?;

        // CIDR blocks either nest or are disjoint
        if let Some(range) = FORBIDDEN_RANGES
            .iter()
            .find(|forbidden| forbidden.contains(&network) || network.contains(*forbidden))
        {
            return Err(ValidationError::ForbiddenRange {
                target: target.to_string(),
                range: *range,
            });
        }

        let count = address_count(&network);
        let max = match network {
            IpNet::V4(_) => self.max_ipv4_hosts,
            IpNet::V6(_) => self.max_ipv6_hosts,
        };
        if count > max {
            return Err(ValidationError::RangeTooLarge {
                target: target.to_string(),
                count,
                max,
            });
        }

        if !in_scope(&network, &self.scope_allowlist) {
            return Err(ValidationError::OutOfScope {
                target: target.to_string(),
            });
        }

        Ok(ValidatedTarget { network })
    }
}

fn parse_target(target: &str) -> Result<IpNet, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidFormat {
        target: target.to_string(),
        reason,
    };

    if target.is_empty() {
        return Err(invalid("empty target".to_string()));
    }
    if target.contains('/') {
        IpNet::from_str(target)
            .map(|net| net.trunc())
            .map_err(|e| invalid(e.to_string()))
    } else {
        IpAddr::from_str(target)
            .map(IpNet::from)
            .map_err(|e| invalid(e.to_string()))
    }
}

fn address_count(network: &IpNet) -> u128 {
    let host_bits = u32::from(network.max_prefix_len() - network.prefix_len());
    1u128.checked_shl(host_bits).unwrap_or(u128::MAX)
}

pub fn in_scope(network: &IpNet, allowlist: &[IpNet]) -> bool {
    allowlist.is_empty() || allowlist.iter().any(|allowed| allowed.contains(network))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reject(target: &str) -> ValidationError {
        TargetPolicy::default()
            .validate(target)
            .expect_err("target should be rejected")
    }

    #[test]
    fn accepts_single_addresses_and_small_ranges() {
        let policy = TargetPolicy::default();
        let single = policy.validate(" 192.168.1.5 ").unwrap();
        assert_eq!(single.to_string(), "192.168.1.5");
        assert_eq!(single.address_count(), 1);

        let net = policy.validate("192.168.1.77/24").unwrap();
        assert_eq!(net.to_string(), "192.168.1.0/24");
        assert_eq!(net.address_count(), 256);

        assert!(policy.validate("2001:db8::/112").is_ok());
    }

    #[test]
    fn malformed_targets_are_invalid_format() {
        for target in ["", "not-an-ip", "192.168.1.300", "10.0.0.0/33", "10.0.0.1; id"] {
            assert!(
                matches!(reject(target), ValidationError::InvalidFormat { .. }),
                "{target}"
            );
        }
    }

    #[test]
    fn forbidden_ranges_win_over_size() {
        for target in [
            "127.0.0.1",
            "169.254.10.1",
            "224.0.0.251",
            "250.1.2.3",
            "::1",
            "fe80::1",
            "ff02::1",
            "::ffff:127.0.0.1",
            "::ffff:169.254.0.5",
            "::ffff:224.0.0.251",
            "::ffff:7f00:1",
            "0.0.0.0/0",
            "126.0.0.0/7",
        ] {
            assert!(
                matches!(reject(target), ValidationError::ForbiddenRange { .. }),
                "{target}"
            );
        }
    }

    #[test]
    fn oversized_ranges_are_rejected_per_family() {
        match reject("10.0.0.0/8") {
            ValidationError::RangeTooLarge { count, max, .. } => {
                assert_eq!(count, 1 << 24);
                assert_eq!(max, 256);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            reject("192.168.0.0/23"),
            ValidationError::RangeTooLarge { .. }
        ));
        assert!(matches!(
            reject("2001:db8::/64"),
            ValidationError::RangeTooLarge { .. }
        ));
    }

    #[test]
    fn allowlist_limits_scope() {
        let policy = TargetPolicy {
            scope_allowlist: vec!["192.168.0.0/16".parse().unwrap()],
            ..TargetPolicy::default()
        };
        assert!(policy.validate("192.168.4.0/24").is_ok());
        assert!(matches!(
            policy.validate("10.1.1.1"),
            Err(ValidationError::OutOfScope { .. })
        ));
    }
}
