//! IP address and CIDR containment
use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("invalid network address '{0}'")]
    InvalidNetwork(String),
}

/// Parses an address or a CIDR. A bare address becomes a /32 (or /128) network and
/// host bits of a CIDR are dropped.
pub fn parse_network(s: &str) -> Result<IpNet, NetworkError> {
    let s = s.trim();

    if let Ok(addr) = s.parse::<IpAddr>() {
        return Ok(IpNet::from(addr));
    }

    s.parse::<IpNet>()
        .map(|net| net.trunc())
        .map_err(|_| NetworkError::InvalidNetwork(s.to_string()))
}

/// Checks if the network of `addr` lies within `range`. Networks of different address
/// families never contain each other.
pub fn ip_in_range(addr: &str, range: &str) -> Result<bool, NetworkError> {
    let addr = parse_network(addr)?;
    let range = parse_network(range)?;

    Ok(range.contains(&addr))
}

/// Checks if every address in `addrs` is contained by at least one of `ranges`.
/// Vacuously true when either side is empty.
pub fn ips_in_list<A, R>(addrs: A, ranges: R) -> Result<bool, NetworkError>
where
    A: IntoIterator,
    A::Item: AsRef<str>,
    R: IntoIterator,
    R::Item: AsRef<str>,
{
    let mut addrs = addrs.into_iter().peekable();

    if addrs.peek().is_none() {
        return Ok(true);
    }

    let ranges = ranges
        .into_iter()
        .map(|r| parse_network(r.as_ref()))
        .collect::<Result<Vec<_>, _>>()?;

    if ranges.is_empty() {
        return Ok(true);
    }

    for addr in addrs {
        let addr = parse_network(addr.as_ref())?;

        if !ranges.iter().any(|range| range.contains(&addr)) {
            return Ok(false);
        }
    }

    Ok(true)
}
