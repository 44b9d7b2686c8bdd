use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CidrError {
    #[error("invalid dotted-quad address: {0}")]
    InvalidAddress(String),
    #[error("invalid CIDR string: {0}")]
    InvalidCidr(String),
    #[error("prefix length {0} out of range (expected 0..=32)")]
    PrefixOutOfRange(u8),
    #[error("start address {start} is not aligned to prefix length {prefix_len}")]
    Unaligned { start: u32, prefix_len: u8 },
}

/// A bare IPv4 address, stored as a host-order 32-bit integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ipv4Address(u32);

impl Ipv4Address {
    pub fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self::from_octets([a, b, c, d])
    }

    pub fn from_octets(octets: [u8; 4]) -> Self {
        Ipv4Address(u32::from_be_bytes(octets))
    }

    pub fn to_octets(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn to_integer(&self) -> u32 {
        self.0
    }

    pub fn from_integer(value: u32) -> Self {
        Ipv4Address(value)
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.to_octets();
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

impl FromStr for Ipv4Address {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 4 {
            return Err(CidrError::InvalidAddress(s.to_string()));
        }
        let mut octets = [0u8; 4];
        for (i, part) in parts.iter().enumerate() {
            octets[i] = part
                .parse::<u8>()
                .map_err(|_| CidrError::InvalidAddress(s.to_string()))?;
        }
        Ok(Ipv4Address::from_octets(octets))
    }
}

impl From<[u8; 4]> for Ipv4Address {
    fn from(octets: [u8; 4]) -> Self {
        Ipv4Address::from_octets(octets)
    }
}

/// A contiguous, prefix-aligned block of IPv4 addresses `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    start: u32,
    prefix_len: u8,
}

impl Cidr {
    pub fn new(start: u32, prefix_len: u8) -> Result<Self, CidrError> {
        if prefix_len > 32 {
            return Err(CidrError::PrefixOutOfRange(prefix_len));
        }
        if !is_aligned(start, prefix_len) {
            return Err(CidrError::Unaligned { start, prefix_len });
        }
        Ok(Cidr { start, prefix_len })
    }

    pub fn from_string(s: &str) -> Result<Self, CidrError> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| CidrError::InvalidCidr(s.to_string()))?;
        let start = Ipv4Address::from_str(addr)
            .map_err(|_| CidrError::InvalidCidr(s.to_string()))?
            .to_integer();
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|_| CidrError::InvalidCidr(s.to_string()))?;
        Cidr::new(start, prefix_len)
    }

    pub fn to_string(&self) -> String {
        format!("{}/{}", Ipv4Address::from_integer(self.start), self.prefix_len)
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Inclusive last address of this block.
    pub fn end(&self) -> u32 {
        (self.start as u64 + block_size(self.prefix_len) - 1) as u32
    }

    /// Number of addresses covered by this block (up to 2^32 for /0).
    pub fn addresses(&self) -> u64 {
        block_size(self.prefix_len)
    }

    pub fn range(&self) -> RangeInclusive<u32> {
        self.start..=self.end()
    }

    /// True iff `other`'s range lies entirely within `self`'s range.
    pub fn contains(&self, other: &Cidr) -> bool {
        self.start <= other.start && other.end() <= self.end()
    }

    /// True iff the two ranges share at least one address.
    pub fn overlaps(&self, other: &Cidr) -> bool {
        self.start <= other.end() && other.start <= self.end()
    }

    /// Split an arbitrary inclusive integer range into the minimum set of
    /// prefix-aligned CIDR blocks whose union equals `[start, end]`.
    ///
    /// At each step, the largest block is chosen that is both aligned to
    /// `start` and fits within the remaining range, i.e. the prefix length
    /// is `32 - min(trailing_zeros(start), floor(log2(range_size)))` —
    /// the standard address-range-summarization algorithm. Terminates in
    /// at most 32 emissions because each step at least halves `prefix_len`'s
    /// remaining headroom.
    pub fn from_range(start: u32, end: u32) -> Vec<Cidr> {
        if start > end {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut cur = start as u64;
        let last = end as u64;
        while cur <= last {
            let range_size = last - cur + 1;
            let align_bits = trailing_zero_bits(cur as u32);
            let size_bits = floor_log2(range_size);
            let nbits = align_bits.min(size_bits);
            let prefix_len = 32 - nbits;
            out.push(Cidr {
                start: cur as u32,
                prefix_len: prefix_len as u8,
            });
            cur += 1u64 << nbits;
        }
        out
    }

    /// The portions of `a`'s range that are not covered by `b`'s range,
    /// expressed as the minimal set of aligned CIDR blocks. Empty when
    /// `a == b` or `a` is entirely contained by `b`.
    pub fn left_minus_right(a: &Cidr, b: &Cidr) -> Vec<Cidr> {
        let overlap_start = a.start.max(b.start);
        let overlap_end = a.end().min(b.end());
        if overlap_start > overlap_end {
            // disjoint: nothing removed
            return vec![*a];
        }
        let mut out = Vec::new();
        if a.start < overlap_start {
            out.extend(Cidr::from_range(a.start, overlap_start - 1));
        }
        if a.end() > overlap_end {
            out.extend(Cidr::from_range(overlap_end + 1, a.end()));
        }
        out
    }

    /// The portions of `b`'s range that are not covered by `a`'s range.
    pub fn right_minus_left(a: &Cidr, b: &Cidr) -> Vec<Cidr> {
        Cidr::left_minus_right(b, a)
    }

    /// Symmetric-difference compatibility wrapper combining both directions;
    /// callers that know which side they mean should prefer
    /// [`Cidr::left_minus_right`] / [`Cidr::right_minus_left`] directly
    /// (see the direction ambiguity noted against the source material).
    pub fn difference(a: &Cidr, b: &Cidr) -> Vec<Cidr> {
        let mut out = Cidr::left_minus_right(a, b);
        out.extend(Cidr::right_minus_left(a, b));
        out
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string())
    }
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Cidr::from_string(s)
    }
}

fn is_aligned(start: u32, prefix_len: u8) -> bool {
    if prefix_len >= 32 {
        return true;
    }
    let host_bits = 32 - prefix_len as u32;
    let mask = if host_bits == 32 {
        u32::MAX
    } else {
        (1u32 << host_bits) - 1
    };
    start & mask == 0
}

fn block_size(prefix_len: u8) -> u64 {
    1u64 << (32 - prefix_len as u32)
}

/// Number of trailing zero bits in `value`, treated as 32 when `value == 0`
/// (fully aligned to any prefix length, including `/0`).
fn trailing_zero_bits(value: u32) -> u32 {
    if value == 0 {
        32
    } else {
        value.trailing_zeros()
    }
}

/// `floor(log2(value))`, defined as 32 for `value == 0` so a degenerate
/// single-step call never panics (from_range never passes a zero-size
/// range since `start <= end` is checked by the caller).
fn floor_log2(value: u64) -> u32 {
    if value == 0 {
        0
    } else {
        63 - value.leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_address_roundtrip() {
        let a = Ipv4Address::new(10, 0, 0, 1);
        assert_eq!(a.to_string(), "10.0.0.1");
        assert_eq!(Ipv4Address::from_str("10.0.0.1").unwrap(), a);
    }

    #[test]
    fn cidr_string_roundtrip() {
        for s in ["10.0.0.0/8", "192.168.1.0/24", "172.16.0.0/12", "0.0.0.0/0", "1.2.3.4/32"] {
            let c = Cidr::from_string(s).unwrap();
            assert_eq!(c.to_string(), s);
        }
    }

    #[test]
    fn cidr_rejects_unaligned_start() {
        assert!(Cidr::from_string("10.0.0.1/24").is_err());
    }

    #[test]
    fn slash_32_has_one_address() {
        let c = Cidr::from_string("1.2.3.4/32").unwrap();
        assert_eq!(c.addresses(), 1);
        assert_eq!(c.end(), c.start());
    }

    #[test]
    fn from_range_union_covers_input() {
        let blocks = Cidr::from_range(10, 37);
        assert!(!blocks.is_empty());
        assert!(blocks.len() <= 32);
        let mut covered: Vec<u32> = blocks.iter().flat_map(|b| b.range()).collect();
        covered.sort_unstable();
        let expected: Vec<u32> = (10..=37).collect();
        assert_eq!(covered, expected);
        for b in &blocks {
            assert!(is_aligned(b.start(), b.prefix_len()));
        }
    }

    #[test]
    fn from_range_exact_aligned_block_is_single_emission() {
        let blocks = Cidr::from_range(0, 3);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].to_string(), "0.0.0.0/30");
    }

    #[test]
    fn contains_is_range_containment() {
        let outer = Cidr::from_string("10.0.0.0/8").unwrap();
        let inner = Cidr::from_string("10.1.2.3/32").unwrap();
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
    }

    #[test]
    fn left_minus_right_empty_when_identical_or_contained() {
        let a = Cidr::from_string("10.0.0.0/24").unwrap();
        assert!(Cidr::left_minus_right(&a, &a).is_empty());

        let inner = Cidr::from_string("10.0.0.5/32").unwrap();
        assert!(Cidr::left_minus_right(&inner, &a).is_empty());
    }

    #[test]
    fn left_minus_right_yields_remainder_when_a_extends_beyond_b() {
        let pool = Cidr::from_string("10.0.0.0/24").unwrap();
        let reserved = Cidr::from_string("10.0.0.5/32").unwrap();
        let free = Cidr::left_minus_right(&pool, &reserved);
        assert!(!free.is_empty());
        let mut covered: Vec<u32> = free.iter().flat_map(|b| b.range()).collect();
        covered.sort_unstable();
        let expected: Vec<u32> = pool
            .range()
            .filter(|a| !reserved.range().contains(a))
            .collect();
        assert_eq!(covered, expected);
    }

    #[test]
    fn left_minus_right_disjoint_returns_original() {
        let a = Cidr::from_string("10.0.0.0/24").unwrap();
        let b = Cidr::from_string("192.168.0.0/24").unwrap();
        let out = Cidr::left_minus_right(&a, &b);
        assert_eq!(out, vec![a]);
    }
}
