//! Core library for managing the lifecycle of a fleet of single-peer
//! WireGuard tunnels on one host: address/port allocation, `wg-quick`
//! config generation, and interface bring-up/monitoring/teardown.

pub mod allocator;
pub mod cidr;
pub mod config;
pub mod driver;
pub mod model;
pub mod quickconfig;
pub mod registry;
pub mod scanner;
pub mod tunnel;

pub use allocator::{AllocatorError, pick_ip, pick_port};
pub use cidr::{Cidr, CidrError, Ipv4Address};
pub use config::{ConfigError, FleetConfig};
pub use driver::{Driver, DriverError, MockDriver, RealDriver};
pub use model::{HostInterface, InterfaceDescriptor, KeyPair, PeerDescriptor, StaleAction, TableMode, TunnelOpts};
pub use quickconfig::{CodecError, QuickConfig};
pub use registry::{Registry, RegistryError};
pub use scanner::ScanError;
pub use tunnel::{TunnelError, TunnelState, TunnelStatus};

/// A 7-character base32 (Crockford, lowercase) suffix, combined with the
/// `peridio-` prefix to form an interface name that fits Linux's 15-byte
/// `IFNAMSIZ` limit (`peridio-` is 8 bytes, leaving 7).
pub fn random_interface_id(rng: &mut impl rand::Rng) -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghjkmnpqrstvwxyz";
    let suffix: String = (0..7)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect();
    format!("peridio-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_interface_id_has_expected_shape() {
        let mut rng = rand::thread_rng();
        let id = random_interface_id(&mut rng);
        assert_eq!(id.len(), 15);
        assert!(id.starts_with("peridio-"));
    }
}
