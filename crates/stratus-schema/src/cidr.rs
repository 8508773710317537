use crate::SchemaError;
use std::net::Ipv4Addr;

/// An IPv4 network in CIDR notation, e.g. `10.0.0.0/16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    network: u32,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn parse(field: &'static str, s: &str) -> Result<Self, SchemaError> {
        let invalid = |reason: &str| SchemaError::InvalidField {
            field,
            reason: format!("'{s}': {reason}"),
        };

        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| invalid("expected <address>/<prefix>"))?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid("bad IPv4 address"))?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid("bad prefix length"))?;
        if prefix > 32 {
            return Err(invalid("prefix length must be 0-32"));
        }

        let bits = u32::from(addr);
        if bits & !Self::mask(prefix) != 0 {
            return Err(invalid("host bits set"));
        }
        Ok(Self {
            network: bits,
            prefix,
        })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Whether `other` lies entirely inside this network.
    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix && other.network & Self::mask(self.prefix) == self.network
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_networks() {
        let net = Ipv4Cidr::parse("vpc_cidr", "10.0.0.0/16").unwrap();
        assert_eq!(net.prefix(), 16);
        assert!(Ipv4Cidr::parse("vpc_cidr", "0.0.0.0/0").is_ok());
        assert!(Ipv4Cidr::parse("vpc_cidr", "192.168.1.7/32").is_ok());
    }

    #[test]
    fn rejects_malformed() {
        assert!(Ipv4Cidr::parse("vpc_cidr", "10.0.0.0").is_err());
        assert!(Ipv4Cidr::parse("vpc_cidr", "10.0.0/16").is_err());
        assert!(Ipv4Cidr::parse("vpc_cidr", "10.0.0.0/33").is_err());
        assert!(Ipv4Cidr::parse("vpc_cidr", "10.0.0.1/16").is_err());
    }

    #[test]
    fn containment() {
        let vpc = Ipv4Cidr::parse("vpc_cidr", "10.0.0.0/16").unwrap();
        let inside = Ipv4Cidr::parse("subnet_cidr", "10.0.8.0/21").unwrap();
        let outside = Ipv4Cidr::parse("subnet_cidr", "10.1.0.0/21").unwrap();
        let wider = Ipv4Cidr::parse("subnet_cidr", "10.0.0.0/8").unwrap();
        assert!(vpc.contains(&inside));
        assert!(!vpc.contains(&outside));
        assert!(!vpc.contains(&wider));
    }
}
