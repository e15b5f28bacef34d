//! Node port ranges: `"1080,1090,2080-3080"`.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use super::PortError;

/// Range used for nodes that have none configured.
pub const DEFAULT_PORT_RANGE: &str = "1000-65535";

/// Normalised list of inclusive sub-ranges, in the order they were written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRanges {
    ranges: Vec<RangeInclusive<u16>>,
}

impl PortRanges {
    /// Parse a node's ranges, falling back to the default range when blank.
    pub fn for_node(text: &str) -> Result<Self, PortError> {
        if text.trim().is_empty() {
            DEFAULT_PORT_RANGE.parse()
        } else {
            text.parse()
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.ranges.iter().any(|r| r.contains(&port))
    }

    pub fn ranges(&self) -> &[RangeInclusive<u16>] {
        &self.ranges
    }

    /// Lowest free port, scanning sub-ranges in declaration order.
    pub fn first_free(&self, used: &BTreeSet<u16>) -> Option<u16> {
        self.ranges
            .iter()
            .flat_map(Clone::clone)
            .find(|port| !used.contains(port))
    }

    /// Number of ports covered, counting overlaps once per sub-range.
    pub fn capacity(&self) -> usize {
        self.ranges.iter().map(|r| r.clone().count()).sum()
    }
}

impl FromStr for PortRanges {
    type Err = PortError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut ranges = Vec::new();
        for token in text.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let range = match token.split_once('-') {
                Some((start, end)) => {
                    let start = parse_port(start, token)?;
                    let end = parse_port(end, token)?;
                    if start > end {
                        return Err(PortError::InvalidRange(format!(
                            "`{token}`: start is greater than end"
                        )));
                    }
                    start..=end
                }
                None => {
                    let port = parse_port(token, token)?;
                    port..=port
                }
            };
            ranges.push(range);
        }
        if ranges.is_empty() {
            return Err(PortError::Empty);
        }
        Ok(Self { ranges })
    }
}

impl fmt::Display for PortRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .ranges
            .iter()
            .map(|r| {
                if r.start() == r.end() {
                    r.start().to_string()
                } else {
                    format!("{}-{}", r.start(), r.end())
                }
            })
            .collect();
        f.write_str(&parts.join(","))
    }
}

fn parse_port(raw: &str, token: &str) -> Result<u16, PortError> {
    let value: u32 = raw
        .trim()
        .parse()
        .map_err(|_| PortError::InvalidRange(format!("`{token}`: not a number")))?;
    match u16::try_from(value) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(PortError::InvalidRange(format!(
            "`{token}`: ports must be between 1 and 65535"
        ))),
    }
}
