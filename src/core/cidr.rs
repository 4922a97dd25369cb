//! IPv4 CIDR parsing and sequential subnet allocation.
//!
//! Subnets are carved from the network's address space in declaration order.
//! Each block is aligned to its own size, so a /24 after a /26 skips ahead to
//! the next /24 boundary instead of straddling it.

use crate::error::{InfraError, Result};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    /// Build from an address and prefix. Host bits must be zero.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        let text = format!("{}/{}", addr, prefix);
        if prefix > 32 {
            return Err(InfraError::Cidr {
                cidr: text,
                reason: "prefix length must be <= 32".to_string(),
            });
        }
        let network = u32::from(addr);
        if network & !mask(prefix) != 0 {
            return Err(InfraError::Cidr {
                cidr: text,
                reason: "host bits must be zero".to_string(),
            });
        }
        Ok(Self { network, prefix })
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn first(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network)
    }

    /// Number of addresses in the block.
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    fn end(&self) -> u64 {
        u64::from(self.network) + self.size()
    }

    /// True if `other` lies entirely within this block.
    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix
            && u64::from(other.network) >= u64::from(self.network)
            && other.end() <= self.end()
    }

    /// True if the two blocks share any address.
    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        u64::from(self.network) < other.end() && u64::from(other.network) < self.end()
    }
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

impl FromStr for Ipv4Cidr {
    type Err = InfraError;

    fn from_str(s: &str) -> Result<Self> {
        let err = |reason: &str| InfraError::Cidr {
            cidr: s.to_string(),
            reason: reason.to_string(),
        };
        let (addr, prefix) = s.split_once('/').ok_or_else(|| err("missing '/'"))?;
        let addr: Ipv4Addr = addr.trim().parse().map_err(|_| err("bad address"))?;
        let prefix: u8 = prefix.trim().parse().map_err(|_| err("bad prefix length"))?;
        Self::new(addr, prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.first(), self.prefix)
    }
}

/// Hands out aligned, non-overlapping blocks from an address space.
#[derive(Debug, Clone)]
pub struct SubnetAllocator {
    space: Ipv4Cidr,
    next: u64,
}

impl SubnetAllocator {
    pub fn new(space: Ipv4Cidr) -> Self {
        Self {
            next: u64::from(space.network),
            space,
        }
    }

    /// Allocate the next block with the given prefix length.
    pub fn allocate(&mut self, prefix: u8) -> Result<Ipv4Cidr> {
        if prefix < self.space.prefix || prefix > 32 {
            return Err(InfraError::Cidr {
                cidr: self.space.to_string(),
                reason: format!(
                    "cannot allocate a /{} inside a /{}",
                    prefix, self.space.prefix
                ),
            });
        }
        let size = 1u64 << (32 - u32::from(prefix));
        let start = self.next.div_ceil(size) * size;
        if start + size > self.space.end() {
            return Err(InfraError::Cidr {
                cidr: self.space.to_string(),
                reason: format!("address space exhausted allocating a /{}", prefix),
            });
        }
        self.next = start + size;
        // start < 2^32 because space.end() <= 2^32
        let network = u32::try_from(start).map_err(|_| InfraError::Cidr {
            cidr: self.space.to_string(),
            reason: "allocation overflow".to_string(),
        })?;
        Ok(Ipv4Cidr { network, prefix })
    }

    /// Addresses still unallocated after the cursor.
    pub fn remaining(&self) -> u64 {
        self.space.end().saturating_sub(self.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let c: Ipv4Cidr = "10.0.0.0/16".parse().unwrap();
        assert_eq!(c.prefix(), 16);
        assert_eq!(c.size(), 65536);
        assert_eq!(c.to_string(), "10.0.0.0/16");
    }

    #[test]
    fn test_parse_rejects_host_bits() {
        let err = "10.0.0.1/16".parse::<Ipv4Cidr>().unwrap_err();
        assert!(err.to_string().contains("host bits"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("10.0.0.0".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0/16".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_sequential_allocation() {
        let mut alloc = SubnetAllocator::new("10.0.0.0/16".parse().unwrap());
        let blocks: Vec<String> = (0..6)
            .map(|_| alloc.allocate(24).unwrap().to_string())
            .collect();
        assert_eq!(
            blocks,
            vec![
                "10.0.0.0/24",
                "10.0.1.0/24",
                "10.0.2.0/24",
                "10.0.3.0/24",
                "10.0.4.0/24",
                "10.0.5.0/24"
            ]
        );
    }

    #[test]
    fn test_alignment_after_smaller_block() {
        let mut alloc = SubnetAllocator::new("10.0.0.0/16".parse().unwrap());
        assert_eq!(alloc.allocate(26).unwrap().to_string(), "10.0.0.0/26");
        assert_eq!(alloc.allocate(24).unwrap().to_string(), "10.0.1.0/24");
        assert_eq!(alloc.allocate(26).unwrap().to_string(), "10.0.2.0/26");
    }

    #[test]
    fn test_exhaustion() {
        let mut alloc = SubnetAllocator::new("10.0.0.0/23".parse().unwrap());
        alloc.allocate(24).unwrap();
        alloc.allocate(24).unwrap();
        assert_eq!(alloc.remaining(), 0);
        let err = alloc.allocate(24).unwrap_err();
        assert!(err.to_string().contains("exhausted"));
    }

    #[test]
    fn test_prefix_shorter_than_space() {
        let mut alloc = SubnetAllocator::new("10.0.0.0/24".parse().unwrap());
        assert!(alloc.allocate(16).is_err());
    }

    #[test]
    fn test_contains_and_overlaps() {
        let space: Ipv4Cidr = "10.0.0.0/16".parse().unwrap();
        let a: Ipv4Cidr = "10.0.1.0/24".parse().unwrap();
        let b: Ipv4Cidr = "10.0.1.128/25".parse().unwrap();
        let outside: Ipv4Cidr = "10.1.0.0/24".parse().unwrap();
        assert!(space.contains(&a));
        assert!(!space.contains(&outside));
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&outside));
    }
}
