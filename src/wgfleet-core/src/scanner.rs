//! Resource scanner (spec §4.2): reduces host state to the set of CIDRs
//! and ports already spoken for, so the allocator never hands out
//! something already in use.

use std::ops::RangeInclusive;

use thiserror::Error;

use crate::cidr::Cidr;
use crate::driver::{Driver, DriverError};

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("scan command failed: {0}")]
    CommandFailed(#[from] DriverError),
}

/// CIDRs already claimed by host interfaces, plus a `/32` for every IP
/// address currently assigned to a live tunnel.
pub fn reserved_cidrs(driver: &dyn Driver, live_ips: &[Cidr]) -> Result<Vec<Cidr>, ScanError> {
    let mut out: Vec<Cidr> = driver
        .list_host_interfaces()?
        .into_iter()
        .map(|h| h.cidr)
        .collect();
    out.extend(live_ips.iter().copied());
    Ok(out)
}

/// Ports already bound within `range`. A scan failure is deliberately
/// not propagated: callers get an empty reserved set and a warning is
/// logged, since an allocator that refuses to run at all because `ss`
/// is unavailable is worse than one that might occasionally collide
/// with a port bound outside this process's view.
pub fn reserved_ports(driver: &dyn Driver, range: RangeInclusive<u16>) -> Vec<u16> {
    match driver.list_listening_ports(range) {
        Ok(ports) => ports,
        Err(e) => {
            log::warn!("reserved_ports: scan failed, treating as empty: {e}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MockDriver;
    use crate::model::HostInterface;

    #[test]
    fn reserved_cidrs_combines_host_interfaces_and_live_ips() {
        let host = HostInterface {
            name: "eth0".to_string(),
            cidr: Cidr::from_string("192.168.1.0/24").unwrap(),
        };
        let driver = MockDriver::new().with_host_interfaces(vec![host]);
        let live = vec![Cidr::from_string("10.0.0.5/32").unwrap()];
        let reserved = reserved_cidrs(&driver, &live).unwrap();
        assert_eq!(reserved.len(), 2);
    }

    #[test]
    fn reserved_ports_filters_to_range() {
        let driver = MockDriver::new().with_reserved_ports(vec![22, 51820, 8080]);
        let ports = reserved_ports(&driver, 51000..=52000);
        assert_eq!(ports, vec![51820]);
    }
}
