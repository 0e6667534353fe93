//! Ranges of IP addresses that the engine never talks to.
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use hashbrown::HashSet;

use crate::error::Error;

/// Reserved IPv4 ranges, blocked by default.
pub const RESERVED_RANGES: [&str; 5] = [
    "0.0.0.0/8",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "224.0.0.0/4",
    "240.0.0.0/4",
];

#[derive(Debug, Default, Clone)]
pub struct IpFilter {
    v4: Vec<(u32, u32)>,
    v6: Vec<(u128, u128)>,
    /// Addresses given to [`IpFilter::block_ip`].
    blocked: HashSet<IpAddr>,
}

impl IpFilter {
    /// A filter with the [`RESERVED_RANGES`].
    pub fn with_reserved_ranges() -> Self {
        let mut filter = Self::default();
        for rule in RESERVED_RANGES {
            // the rules are constants and valid
            let _ = filter.add_rule(rule);
        }
        filter
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_blocked(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(ip) => {
                let value = u32::from(ip);
                self.v4.iter().any(|(start, end)| (*start..=*end).contains(&value))
            }
            IpAddr::V6(ip) => {
                // ipv4 mapped addresses are checked against the ipv4 rules
                if let Some(ip) = ip.to_ipv4_mapped() {
                    return self.is_blocked(IpAddr::V4(ip));
                }
                let value = u128::from(ip);
                self.v6.iter().any(|(start, end)| (*start..=*end).contains(&value))
            }
        }
    }

    /// Number of addresses that were blocked one by one.
    pub fn blocked_ips(&self) -> usize {
        self.blocked.len()
    }

    /// Block a single address.
    pub fn block_ip(&mut self, ip: IpAddr) {
        self.blocked.insert(ip);
        if self.is_blocked(ip) {
            return;
        }
        match ip {
            IpAddr::V4(ip) => self.v4.push((u32::from(ip), u32::from(ip))),
            IpAddr::V6(ip) => self.v6.push((u128::from(ip), u128::from(ip))),
        }
    }

    /// Add a rule, either a single address, a range `start - end`, or a CIDR
    /// block.
    pub fn add_rule(&mut self, rule: &str) -> Result<(), Error> {
        let invalid = || Error::IpInvalid(rule.to_owned());

        if let Some((start, end)) = rule.split_once('-') {
            match (parse_ip(start)?, parse_ip(end)?) {
                (IpAddr::V4(start), IpAddr::V4(end)) => {
                    let (s, e) = (u32::from(start), u32::from(end));
                    self.v4.push((s.min(e), s.max(e)));
                }
                (IpAddr::V6(start), IpAddr::V6(end)) => {
                    let (s, e) = (u128::from(start), u128::from(end));
                    self.v6.push((s.min(e), s.max(e)));
                }
                _ => return Err(invalid()),
            }
        } else if let Some((base, prefix)) = rule.split_once('/') {
            let prefix = prefix.trim().parse::<u8>().map_err(|_| invalid())?;
            match parse_ip(base)? {
                IpAddr::V4(ip) => {
                    self.v4.push(cidr_v4(ip, prefix).ok_or_else(invalid)?)
                }
                IpAddr::V6(ip) => {
                    self.v6.push(cidr_v6(ip, prefix).ok_or_else(invalid)?)
                }
            }
        } else {
            let ip = parse_ip(rule)?;
            self.block_ip(ip);
        }
        Ok(())
    }
}

/// Parse an IPv4 dotted quad or an IPv6 address.
pub fn parse_ip(s: &str) -> Result<IpAddr, Error> {
    IpAddr::from_str(s.trim()).map_err(|_| Error::IpInvalid(s.to_owned()))
}

fn cidr_v4(ip: Ipv4Addr, prefix: u8) -> Option<(u32, u32)> {
    if prefix > 32 {
        return None;
    }
    let mask = u32::MAX.checked_shl(32 - prefix as u32).unwrap_or(0);
    let start = u32::from(ip) & mask;
    Some((start, start | !mask))
}

fn cidr_v6(ip: Ipv6Addr, prefix: u8) -> Option<(u128, u128)> {
    if prefix > 128 {
        return None;
    }
    let mask = u128::MAX.checked_shl(128 - prefix as u32).unwrap_or(0);
    let start = u128::from(ip) & mask;
    Some((start, start | !mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_range_and_cidr_rules() {
        let mut filter = IpFilter::default();
        filter.add_rule("10.0.0.1").unwrap();
        filter.add_rule("10.0.0.10 - 10.0.0.4").unwrap();
        filter.add_rule("192.168.1.0/24").unwrap();
        filter.add_rule("2001:db8::/32").unwrap();
        assert_eq!(filter.len(), 4);

        assert!(filter.is_blocked("10.0.0.1".parse().unwrap()));
        assert!(filter.is_blocked("10.0.0.7".parse().unwrap()));
        assert!(filter.is_blocked("192.168.1.200".parse().unwrap()));
        assert!(filter.is_blocked("2001:db8::1".parse().unwrap()));
        assert!(!filter.is_blocked("172.16.0.1".parse().unwrap()));
    }

    #[test]
    fn invalid_rules() {
        let mut filter = IpFilter::default();
        assert!(filter.add_rule("not-an-ip").is_err());
        assert!(filter.add_rule("10.0.0.0/33").is_err());
        assert!(filter.add_rule("10.0.0.1 - ::1").is_err());
        assert!(filter.add_rule("300.1.1.1").is_err());
        assert!(filter.is_empty());
        assert!(parse_ip("1.2.3").is_err());
        assert!(parse_ip(" 1.2.3.4 ").is_ok());
    }

    #[test]
    fn reserved_ranges() {
        let filter = IpFilter::with_reserved_ranges();
        assert_eq!(filter.len(), RESERVED_RANGES.len());
        assert!(filter.is_blocked("127.0.0.1".parse().unwrap()));
        assert!(filter.is_blocked("0.1.2.3".parse().unwrap()));
        assert!(filter.is_blocked("169.254.10.1".parse().unwrap()));
        assert!(filter.is_blocked("239.255.255.250".parse().unwrap()));
        assert!(filter.is_blocked("255.255.255.255".parse().unwrap()));
        assert!(filter.is_blocked("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!filter.is_blocked("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn block_ip_is_idempotent() {
        let mut filter = IpFilter::default();
        let ip = "1.2.3.4".parse().unwrap();
        filter.block_ip(ip);
        filter.block_ip(ip);
        assert_eq!(filter.len(), 1);
        assert_eq!(filter.blocked_ips(), 1);
        assert!(filter.is_blocked(ip));

        // already in a range, no rule is added but it is counted
        let mut filter = IpFilter::with_reserved_ranges();
        filter.block_ip("127.0.0.2".parse().unwrap());
        assert_eq!(filter.len(), RESERVED_RANGES.len());
        assert_eq!(filter.blocked_ips(), 1);
    }

    #[test]
    fn cidr_bounds() {
        assert_eq!(cidr_v4(Ipv4Addr::new(1, 2, 3, 4), 32), Some((0x01020304, 0x01020304)));
        assert_eq!(cidr_v4(Ipv4Addr::new(1, 2, 3, 4), 0), Some((0, u32::MAX)));
        assert!(cidr_v6("2001:db8::1".parse().unwrap(), 129).is_none());
    }
}
