//! Small shared parsing helpers.

/// A closed port interval, normalized so `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: i64,
    pub end: i64,
}

impl PortRange {
    pub fn is_empty(&self) -> bool {
        self.start == 0 && self.end == 0
    }
}

/// Parses a port-range annotation value.
///
/// Accepts a single port (`"1232"`) or a dash-separated range (`"9-32"`).
/// Leading/trailing dashes and whitespace around the parts are tolerated,
/// negative bounds are clamped to zero and a descending range is normalized
/// ascending. Anything else parses to the empty `[0, 0]` range.
pub fn parse_port_range(raw: &str) -> PortRange {
    let raw = raw.trim();
    if let Ok(single) = raw.parse::<i64>() {
        return PortRange { start: single, end: single };
    }

    let parts: Vec<&str> = raw
        .split('-')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if parts.len() != 2 {
        return PortRange { start: 0, end: 0 };
    }

    let (Ok(low), Ok(high)) = (parts[0].parse::<i64>(), parts[1].parse::<i64>()) else {
        return PortRange { start: 0, end: 0 };
    };

    let low = low.max(0);
    let high = high.max(0);
    if low <= high {
        PortRange { start: low, end: high }
    } else {
        PortRange { start: high, end: low }
    }
}
