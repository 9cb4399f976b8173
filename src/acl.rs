//! Client access control lists
//!
//! A `NetmaskGroup` is an ordered set of CIDR networks checked against the
//! effective client address of every query before any rule runs. The default
//! group admits the conventional private and local ranges only, so an
//! instance exposed to the wide internet answers nobody until the operator
//! says otherwise.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;

use crate::error::{Error, Result};

/// An ordered group of networks used for allow-list matching.
///
/// # Example
///
/// ```
/// use dnslb::acl::NetmaskGroup;
///
/// let mut acl = NetmaskGroup::empty();
/// acl.add_mask("192.0.2.0/24").unwrap();
/// assert!(acl.matches("192.0.2.17".parse().unwrap()));
/// assert!(!acl.matches("198.51.100.1".parse().unwrap()));
/// ```
#[derive(Debug, Clone, Default)]
pub struct NetmaskGroup {
    masks: Vec<IpNet>,
}

impl NetmaskGroup {
    /// An empty group matching nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self { masks: Vec::new() }
    }

    /// The default ACL: loopback, RFC 1918, link-local and unique-local
    /// ranges.
    #[must_use]
    pub fn default_acl() -> Self {
        let masks = [
            "127.0.0.0/8",
            "10.0.0.0/8",
            "100.64.0.0/10",
            "169.254.0.0/16",
            "192.168.0.0/16",
            "172.16.0.0/12",
            "::1/128",
            "fc00::/7",
            "fe80::/10",
        ]
        .iter()
        .map(|m| m.parse().expect("static mask"))
        .collect();
        Self { masks }
    }

    /// Build a group from CIDR strings.
    pub fn from_masks<I, S>(masks: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut group = Self::empty();
        for mask in masks {
            group.add_mask(mask.as_ref())?;
        }
        Ok(group)
    }

    /// Add a single CIDR mask. Bare addresses get a host-length prefix.
    pub fn add_mask(&mut self, mask: &str) -> Result<()> {
        let net = if mask.contains('/') {
            IpNet::from_str(mask)
                .map_err(|e| Error::config_field(format!("bad netmask {mask:?}: {e}"), "acl"))?
        } else {
            let addr: IpAddr = mask
                .parse()
                .map_err(|e| Error::config_field(format!("bad address {mask:?}: {e}"), "acl"))?;
            IpNet::from(addr)
        };
        self.masks.push(net);
        Ok(())
    }

    /// Whether `addr` falls inside any mask of the group.
    #[must_use]
    pub fn matches(&self, addr: IpAddr) -> bool {
        self.masks.iter().any(|net| net.contains(&addr))
    }

    /// Number of masks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.masks.len()
    }

    /// Whether the group is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.masks.is_empty()
    }

    /// The masks, in insertion order.
    #[must_use]
    pub fn masks(&self) -> &[IpNet] {
        &self.masks
    }
}

impl std::fmt::Display for NetmaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for mask in &self.masks {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{mask}")?;
            first = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_acl_admits_private_ranges() {
        let acl = NetmaskGroup::default_acl();
        assert!(acl.matches("127.0.0.1".parse().unwrap()));
        assert!(acl.matches("10.1.2.3".parse().unwrap()));
        assert!(acl.matches("192.168.1.1".parse().unwrap()));
        assert!(acl.matches("::1".parse().unwrap()));
        assert!(acl.matches("fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_default_acl_rejects_public_ranges() {
        let acl = NetmaskGroup::default_acl();
        assert!(!acl.matches("8.8.8.8".parse().unwrap()));
        assert!(!acl.matches("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_bare_address_becomes_host_mask() {
        let acl = NetmaskGroup::from_masks(["203.0.113.7"]).unwrap();
        assert!(acl.matches("203.0.113.7".parse().unwrap()));
        assert!(!acl.matches("203.0.113.8".parse().unwrap()));
    }

    #[test]
    fn test_invalid_mask_is_config_error() {
        let mut acl = NetmaskGroup::empty();
        let err = acl.add_mask("not-a-network").unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_empty_group_matches_nothing() {
        let acl = NetmaskGroup::empty();
        assert!(acl.is_empty());
        assert!(!acl.matches("127.0.0.1".parse().unwrap()));
    }
}
