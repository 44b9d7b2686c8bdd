//! Resource allocator (spec §4.3): turns a pool CIDR and a reserved set
//! into the concrete IP/port a new tunnel gets handed.

use std::ops::RangeInclusive;

use rand::Rng;
use thiserror::Error;

use crate::cidr::{Cidr, Ipv4Address};

#[derive(Error, Debug)]
pub enum AllocatorError {
    #[error("no free address remains in pool {0}")]
    PoolExhausted(String),
    #[error("no free port remains in range {0}..={1}")]
    PortRangeExhausted(u16, u16),
}

/// The free portions of `pool`, as the minimal set of aligned blocks,
/// after removing every block in `reserved` that overlaps it.
///
/// Each reservation is subtracted with [`Cidr::left_minus_right`] taking
/// the running free set as the left-hand side — the pool (or what is
/// left of it) is what loses territory, never the reservation.
pub fn available_cidrs(pool: &Cidr, reserved: &[Cidr]) -> Vec<Cidr> {
    let mut free = vec![*pool];
    for reservation in reserved {
        if !reservation.overlaps(pool) {
            continue;
        }
        free = free
            .into_iter()
            .flat_map(|block| {
                if block.overlaps(reservation) {
                    Cidr::left_minus_right(&block, reservation)
                } else {
                    vec![block]
                }
            })
            .collect();
    }
    free
}

/// The maximal disjoint free sub-ranges of `range` once every point in
/// `reserved` is removed (spec §4.3/§8). Unlike [`available_cidrs`], these
/// sub-ranges carry no alignment constraint — they're plain port numbers,
/// not CIDR blocks.
pub fn split_range(range: RangeInclusive<u16>, reserved: &[u16]) -> Vec<RangeInclusive<u16>> {
    let (lo, hi) = (*range.start() as u32, *range.end() as u32);
    let mut points: Vec<u32> = reserved
        .iter()
        .map(|&p| p as u32)
        .filter(|p| *p >= lo && *p <= hi)
        .collect();
    points.sort_unstable();
    points.dedup();

    let mut out = Vec::new();
    let mut cursor = lo;
    for point in points {
        if cursor < point {
            out.push((cursor as u16)..=((point - 1) as u16));
        }
        cursor = point + 1;
    }
    if cursor <= hi {
        out.push((cursor as u16)..=(hi as u16));
    }
    out
}

/// Ports in `range` not present in `reserved`.
pub fn available_ports(range: RangeInclusive<u16>, reserved: &[u16]) -> Vec<u16> {
    range.filter(|p| !reserved.contains(p)).collect()
}

/// Pick a free, non-network, non-broadcast address from `pool`, retrying
/// against freshly drawn candidates until one isn't in `reserved`.
///
/// `pool` must have a prefix length of at most 30 so a usable host
/// address range exists; the network and broadcast addresses of `pool`
/// itself are never handed out, matching `wg-quick`'s own IPv4 usage.
pub fn pick_ip(
    pool: &Cidr,
    reserved: &[Cidr],
    rng: &mut impl Rng,
) -> Result<Ipv4Address, AllocatorError> {
    let free = available_cidrs(pool, reserved);
    let mut candidates: Vec<u32> = free
        .iter()
        .flat_map(|c| c.range())
        .filter(|&addr| addr != pool.start() && addr != pool.end())
        .collect();
    if candidates.is_empty() {
        return Err(AllocatorError::PoolExhausted(pool.to_string()));
    }
    candidates.sort_unstable();
    let index = rng.gen_range(0..candidates.len());
    Ok(Ipv4Address::from_integer(candidates[index]))
}

/// Pick a free port from `range`, excluding `reserved`.
pub fn pick_port(
    range: RangeInclusive<u16>,
    reserved: &[u16],
    rng: &mut impl Rng,
) -> Result<u16, AllocatorError> {
    let (lo, hi) = (*range.start(), *range.end());
    let free = available_ports(range, reserved);
    if free.is_empty() {
        return Err(AllocatorError::PortRangeExhausted(lo, hi));
    }
    let index = rng.gen_range(0..free.len());
    Ok(free[index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn available_cidrs_removes_single_reservation() {
        let pool = Cidr::from_string("10.0.0.0/24").unwrap();
        let reserved = vec![Cidr::from_string("10.0.0.128/25").unwrap()];
        let free = available_cidrs(&pool, &reserved);
        let total: u64 = free.iter().map(|c| c.addresses()).sum();
        assert_eq!(total, 128);
    }

    #[test]
    fn available_cidrs_ignores_non_overlapping_reservation() {
        let pool = Cidr::from_string("10.0.0.0/24").unwrap();
        let reserved = vec![Cidr::from_string("192.168.0.0/24").unwrap()];
        let free = available_cidrs(&pool, &reserved);
        assert_eq!(free, vec![pool]);
    }

    #[test]
    fn split_range_with_no_reservations_returns_whole_range() {
        let free = split_range(51000..=51010, &[]);
        assert_eq!(free, vec![51000..=51010]);
    }

    #[test]
    fn split_range_removes_an_interior_run() {
        let free = split_range(51000..=51010, &[51004, 51005, 51006]);
        assert_eq!(free, vec![51000..=51003, 51007..=51010]);
    }

    #[test]
    fn split_range_handles_reservations_at_both_edges() {
        let free = split_range(51000..=51010, &[51000, 51010]);
        assert_eq!(free, vec![51001..=51009]);
    }

    #[test]
    fn split_range_fully_reserved_yields_nothing() {
        let reserved: Vec<u16> = (51000..=51010).collect();
        assert!(split_range(51000..=51010, &reserved).is_empty());
    }

    #[test]
    fn split_range_outputs_are_disjoint_and_cover_the_complement() {
        let range = 51000..=51020u16;
        let reserved = [51000, 51002, 51005, 51006, 51015];
        let free = split_range(range.clone(), &reserved);

        let mut covered: Vec<u16> = free.iter().flat_map(|r| r.clone()).collect();
        covered.sort_unstable();
        let expected: Vec<u16> = range.filter(|p| !reserved.contains(p)).collect();
        assert_eq!(covered, expected);

        for pair in free.windows(2) {
            assert!(pair[0].end() < pair[1].start());
        }
    }

    #[test]
    fn pick_ip_avoids_network_and_broadcast() {
        let pool = Cidr::from_string("10.0.0.0/30").unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        for _ in 0..20 {
            let ip = pick_ip(&pool, &[], &mut rng).unwrap();
            assert_ne!(ip.to_integer(), pool.start());
            assert_ne!(ip.to_integer(), pool.end());
        }
    }

    #[test]
    fn pick_ip_errors_when_pool_exhausted() {
        let pool = Cidr::from_string("10.0.0.0/30").unwrap();
        let reserved = vec![pool];
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        assert!(pick_ip(&pool, &reserved, &mut rng).is_err());
    }

    #[test]
    fn pick_port_excludes_reserved() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(2);
        let reserved: Vec<u16> = (51001..52000).collect();
        let port = pick_port(51000..=52000, &reserved, &mut rng).unwrap();
        assert_eq!(port, 52000);
    }

    #[test]
    fn pick_port_errors_when_range_exhausted() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(2);
        let reserved: Vec<u16> = (51000..=51000).collect();
        assert!(pick_port(51000..=51000, &reserved, &mut rng).is_err());
    }
}
