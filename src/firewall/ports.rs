//! Port specifications as they appear in firewall actions: `"80"`, `"1000-2000"`, `"all"`.
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use thiserror::Error;

/// Port tokens which stand for "every port" on the containing side of a comparison.
///
/// `0-65355` is not the full range, but policy files in the wild rely on it being
/// treated as such, so it stays.
pub const ALL_REPRESENTATIONS: [&str; 3] = ["all", "0-65355", "1-65535"];

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum PortError {
    #[error("invalid port '{0}'")]
    InvalidPort(String),
    #[error("port '{0}' out of range 0-65535")]
    OutOfRange(String),
    #[error("invalid port range '{0}': start is greater than end")]
    InvalidRange(String),
}

/// Returns true if any of the tokens is one of the [ALL_REPRESENTATIONS]
pub fn has_wildcard<S: AsRef<str>>(tokens: &[S]) -> bool {
    tokens
        .iter()
        .any(|t| ALL_REPRESENTATIONS.contains(&t.as_ref()))
}

fn parse_port(value: &str, token: &str) -> Result<u16, PortError> {
    // the regex only lets digits through, so a failure here is an overflow
    value
        .parse::<u16>()
        .map_err(|_| PortError::OutOfRange(token.to_string()))
}

/// Parses a numeric port or port range token
pub fn parse_port_token(token: &str) -> Result<RangeInclusive<u16>, PortError> {
    static PORT_TOKEN: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^\s*(\d+)\s*(?:-\s*(\d+)\s*)?$").unwrap());

    let caps = PORT_TOKEN
        .captures(token)
        .ok_or_else(|| PortError::InvalidPort(token.to_string()))?;

    let start = parse_port(&caps[1], token)?;
    let end = match caps.get(2) {
        Some(m) => parse_port(m.as_str(), token)?,
        None => start,
    };

    if start > end {
        return Err(PortError::InvalidRange(token.to_string()));
    }

    Ok(start..=end)
}

/// A set of ports, kept as sorted and merged inclusive ranges so that wide ranges
/// never have to be enumerated.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PortSet {
    ranges: Vec<RangeInclusive<u16>>,
}

impl PortSet {
    /// Every port, 0-65535
    pub fn all() -> Self {
        Self {
            ranges: vec![0..=u16::MAX],
        }
    }

    /// Builds a [PortSet] from port tokens. `all` is accepted as a member and covers
    /// the whole port space.
    pub fn parse<S: AsRef<str>>(tokens: &[S]) -> Result<Self, PortError> {
        let ranges = tokens
            .iter()
            .map(|t| match t.as_ref().trim() {
                "all" => Ok(0..=u16::MAX),
                t => parse_port_token(t),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::from_ranges(ranges))
    }

    fn from_ranges(mut ranges: Vec<RangeInclusive<u16>>) -> Self {
        ranges.sort_by_key(|r| *r.start());

        let mut merged: Vec<RangeInclusive<u16>> = Vec::with_capacity(ranges.len());

        for r in ranges {
            match merged.last_mut() {
                // overlapping or adjacent
                Some(last) if u32::from(*r.start()) <= u32::from(*last.end()) + 1 => {
                    if r.end() > last.end() {
                        *last = *last.start()..=*r.end();
                    }
                }
                _ => merged.push(r),
            }
        }

        Self { ranges: merged }
    }

    pub fn union(&self, other: &PortSet) -> PortSet {
        let mut ranges = self.ranges.clone();
        ranges.extend(other.ranges.iter().cloned());
        Self::from_ranges(ranges)
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of individual ports in the set
    pub fn len(&self) -> usize {
        self.ranges
            .iter()
            .map(|r| usize::from(*r.end()) - usize::from(*r.start()) + 1)
            .sum()
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ranges.iter().any(|r| r.contains(&port))
    }

    /// Ranges are maximal after merging, so every range of `self` has to fit inside a
    /// single range of `other`.
    pub fn is_subset(&self, other: &PortSet) -> bool {
        self.ranges.iter().all(|r| {
            other
                .ranges
                .iter()
                .any(|o| o.start() <= r.start() && r.end() <= o.end())
        })
    }

    /// Enumerates every port in the set
    pub fn expand(&self) -> BTreeSet<u16> {
        self.ranges.iter().flat_map(|r| r.clone()).collect()
    }
}

/// The ports of one protocol in a firewall action, both as written and parsed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSpec {
    tokens: Vec<String>,
    set: PortSet,
}

impl PortSpec {
    pub fn new<S: AsRef<str>>(tokens: &[S]) -> Result<Self, PortError> {
        Ok(Self {
            tokens: tokens.iter().map(|t| t.as_ref().to_string()).collect(),
            set: PortSet::parse(tokens)?,
        })
    }

    /// The spec of a protocol entry which lists no ports
    pub fn all() -> Self {
        Self {
            tokens: vec!["all".to_string()],
            set: PortSet::all(),
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn set(&self) -> &PortSet {
        &self.set
    }

    pub fn is_wildcard(&self) -> bool {
        has_wildcard(&self.tokens)
    }

    /// Merges the ports of another entry for the same protocol
    pub fn merge(&mut self, other: &PortSpec) {
        self.tokens.extend(other.tokens.iter().cloned());
        self.set = self.set.union(&other.set);
    }

    pub fn is_subset(&self, other: &PortSpec) -> bool {
        other.is_wildcard() || self.set.is_subset(&other.set)
    }

    pub fn is_equal(&self, other: &PortSpec) -> bool {
        (self.is_wildcard() && other.is_wildcard()) || self.set == other.set
    }
}

/// Expands port tokens into the set of individual ports they cover
pub fn expand_ports<S: AsRef<str>>(tokens: &[S]) -> Result<BTreeSet<u16>, PortError> {
    Ok(PortSet::parse(tokens)?.expand())
}

/// Checks if the ports in `a` are all covered by `b`. A wildcard token in `b` covers
/// anything, without looking at `a`.
pub fn ports_are_subset<S: AsRef<str>, T: AsRef<str>>(a: &[S], b: &[T]) -> Result<bool, PortError> {
    if has_wildcard(b) {
        return Ok(true);
    }

    Ok(PortSpec::new(a)?.is_subset(&PortSpec::new(b)?))
}

/// Checks if `a` and `b` cover the same ports; two wildcards are always equal.
pub fn ports_are_equal<S: AsRef<str>, T: AsRef<str>>(a: &[S], b: &[T]) -> Result<bool, PortError> {
    if has_wildcard(a) && has_wildcard(b) {
        return Ok(true);
    }

    Ok(PortSpec::new(a)?.is_equal(&PortSpec::new(b)?))
}

#[cfg(test)]
mod tests {

    use super::*;
    use anyhow::Result;
    use assert2::check;
    use rstest::rstest;

    #[rstest]
    #[case(&["80"], &[80])]
    #[case(&["10-12"], &[10, 11, 12])]
    #[case(&["22", "20-21", "22"], &[20, 21, 22])]
    #[case(&[" 443 "], &[443])]
    #[case(&["0", "65535"], &[0, 65535])]
    fn test_expand_ports(#[case] tokens: &[&str], #[case] expected: &[u16]) -> Result<()> {
        let expanded = expand_ports(tokens)?;
        check!(expanded == expected.iter().copied().collect::<BTreeSet<u16>>());
        Ok(())
    }

    #[rstest]
    #[case("65536", PortError::OutOfRange("65536".to_string()))]
    #[case("99999999999", PortError::OutOfRange("99999999999".to_string()))]
    #[case("20-10", PortError::InvalidRange("20-10".to_string()))]
    #[case("-1", PortError::InvalidPort("-1".to_string()))]
    #[case("ssh", PortError::InvalidPort("ssh".to_string()))]
    #[case("", PortError::InvalidPort("".to_string()))]
    fn test_invalid_ports(#[case] token: &str, #[case] expected: PortError) {
        check!(expand_ports(&[token]) == Err(expected));
    }

    #[test]
    fn test_all_token_covers_every_port() -> Result<()> {
        let set = PortSet::parse(&["all"])?;
        check!(set == PortSet::all());
        check!(set.len() == 65536);
        check!(set.contains(0));
        check!(set.contains(65535));
        Ok(())
    }

    #[test]
    fn test_ranges_are_merged() -> Result<()> {
        let set = PortSet::parse(&["10-20", "21", "15-30", "40"])?;
        check!(set == PortSet::parse(&["10-30", "40"])?);
        check!(set.len() == 22);
        check!(!set.contains(35));
        Ok(())
    }

    #[test]
    fn test_port_set_subset() -> Result<()> {
        let wide = PortSet::parse(&["1-1024"])?;

        check!(PortSet::parse(&["80", "443"])?.is_subset(&wide));
        check!(!PortSet::parse(&["80", "2222"])?.is_subset(&wide));
        // split across two ranges of the containing set
        check!(!PortSet::parse(&["10-30"])?.is_subset(&PortSet::parse(&["10-19", "21-30"])?));
        check!(PortSet::default().is_subset(&wide));
        Ok(())
    }

    #[rstest]
    #[case::legacy_wildcard(&["80"], &["0-65355"], true)]
    #[case::all(&["1-65535"], &["all"], true)]
    #[case::full_range(&["0-100"], &["1-65535"], true)]
    #[case::subset(&["22"], &["20-25"], true)]
    #[case::not_subset(&["2222"], &["1-1024"], false)]
    #[case::all_inside_literal_full_range(&["all"], &["0-65535"], true)]
    #[case::partial_overlap(&["20-30"], &["25-35"], false)]
    fn test_ports_are_subset(#[case] a: &[&str], #[case] b: &[&str], #[case] expected: bool) -> Result<()> {
        check!(ports_are_subset(a, b)? == expected);
        Ok(())
    }

    #[test]
    fn test_wildcard_short_circuits_subset() -> Result<()> {
        // the containing side is a wildcard, so the malformed side is never parsed
        check!(ports_are_subset(&["garbage"], &["all"])?);
        check!(ports_are_subset(&["garbage"], &["80"]).is_err());
        Ok(())
    }

    #[rstest]
    #[case(&["all"], &["1-65535"], true)]
    #[case(&["0-65355"], &["all"], true)]
    #[case(&["80", "81"], &["80-81"], true)]
    #[case(&["81", "80"], &["80", "81"], true)]
    #[case(&["80"], &["80-81"], false)]
    #[case(&["all"], &["80"], false)]
    fn test_ports_are_equal(#[case] a: &[&str], #[case] b: &[&str], #[case] expected: bool) -> Result<()> {
        check!(ports_are_equal(a, b)? == expected);
        Ok(())
    }

    #[test]
    fn test_port_spec_merge() -> Result<()> {
        let mut spec = PortSpec::new(&["22"])?;
        spec.merge(&PortSpec::new(&["80-81"])?);

        check!(spec.tokens() == ["22", "80-81"]);
        check!(spec.set().expand() == BTreeSet::from([22, 80, 81]));
        check!(!spec.is_wildcard());

        spec.merge(&PortSpec::all());
        check!(spec.is_wildcard());
        Ok(())
    }
}
