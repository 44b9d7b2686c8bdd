//! Abstraction over the external shells-and-syscalls this system depends
//! on (`wg`, `wg-quick`, `ip`, `ss`, `/sys/class/net`), so a mock can stand
//! in during tests (spec §4.4, §6).

use std::fs;
use std::io::Write;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::sync::{Mutex, RwLock};

use thiserror::Error;

use crate::cidr::Cidr;
use crate::model::{HostInterface, InterfaceDescriptor, KeyPair, PeerDescriptor, TunnelOpts};
use crate::quickconfig::{encode_tunnel, ExtraSection, QuickConfig};

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("command failed: {0}")]
    CommandFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Codec(#[from] crate::quickconfig::CodecError),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// Abstract driver behavior. Every operation either succeeds or reports
/// `(stdout, exit_code)`-flavored failure via `DriverError::CommandFailed`.
pub trait Driver: Send + Sync {
    fn create_interface(&self, name: &str) -> DriverResult<()>;

    /// Write the `.conf` to `opts.data_dir/<interface.id>.conf`.
    fn configure_wireguard(
        &self,
        tunnel_id: &str,
        interface: &InterfaceDescriptor,
        peer: &PeerDescriptor,
        opts: &TunnelOpts,
    ) -> DriverResult<PathBuf>;

    fn bring_up_interface(&self, name: &str, opts: &TunnelOpts) -> DriverResult<()>;

    /// Regardless of exit status, the `.conf` file is removed.
    fn teardown_interface(&self, name: &str, opts: &TunnelOpts) -> DriverResult<()>;

    /// Parsed `.conf` files currently in `opts.data_dir`, keyed by
    /// interface id (the file stem).
    fn list_interfaces(&self, opts: &TunnelOpts) -> DriverResult<Vec<(String, QuickConfig)>>;

    fn interface_exists(&self, name: &str) -> DriverResult<bool>;

    /// Host network interfaces, reduced to the CIDR each one reserves.
    fn list_host_interfaces(&self) -> DriverResult<Vec<HostInterface>>;

    /// Local ports with an open listening socket, intersected with `range`.
    fn list_listening_ports(&self, range: RangeInclusive<u16>) -> DriverResult<Vec<u16>>;

    fn generate_key_pair(&self) -> DriverResult<KeyPair>;

    fn rx_packet_stats(&self, name: &str) -> DriverResult<u64>;

    fn tx_packet_stats(&self, name: &str) -> DriverResult<u64>;

    /// Unix seconds of the most recent handshake, or 0 if there has never
    /// been one.
    fn wg_latest_handshake(&self, name: &str) -> DriverResult<u64>;
}

fn conf_path(opts: &TunnelOpts, interface_id: &str) -> PathBuf {
    opts.data_dir.join(format!("{interface_id}.conf"))
}

/// Write `contents` to `path` via a same-directory temp file plus
/// rename, so a reader never observes a partially written `.conf`
/// (generalized from the teacher's own persisted-config write path).
fn write_atomically(path: &PathBuf, contents: &str) -> DriverResult<()> {
    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.persist(path)
        .map_err(|e| DriverError::CommandFailed(format!("failed to persist {}: {}", path.display(), e.error)))?;
    Ok(())
}

/// Shell out, logging the invocation at debug and any failure at warn —
/// generalized from the teacher's own `shell_cmd` helper.
fn shell_cmd(args: &[&str]) -> DriverResult<Output> {
    if args.is_empty() {
        return Err(DriverError::CommandFailed("empty command".to_string()));
    }
    log::debug!("[+] {}", args.join(" "));
    let output = Command::new(args[0]).args(&args[1..]).output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        log::warn!("[+] {} failed: {}", args.join(" "), stderr);
        return Err(DriverError::CommandFailed(stderr));
    }
    Ok(output)
}

/// The real driver: shells out to `wg`, `wg-quick`, `ip`, `ss`, and reads
/// `/sys/class/net/<name>/statistics/*`.
pub struct RealDriver;

impl RealDriver {
    pub fn new() -> Self {
        RealDriver
    }
}

impl Default for RealDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for RealDriver {
    fn create_interface(&self, name: &str) -> DriverResult<()> {
        shell_cmd(&["ip", "link", "add", "dev", name, "type", "wireguard"])?;
        Ok(())
    }

    fn configure_wireguard(
        &self,
        tunnel_id: &str,
        interface: &InterfaceDescriptor,
        peer: &PeerDescriptor,
        opts: &TunnelOpts,
    ) -> DriverResult<PathBuf> {
        fs::create_dir_all(&opts.data_dir)?;
        let config = encode_tunnel(tunnel_id, interface, peer, &opts.hooks, &opts.extra as &[ExtraSection]);
        let path = conf_path(opts, &interface.id);
        write_atomically(&path, &config.encode())?;
        Ok(path)
    }

    fn bring_up_interface(&self, name: &str, opts: &TunnelOpts) -> DriverResult<()> {
        let path = conf_path(opts, name);
        shell_cmd(&["wg-quick", "up", &path.to_string_lossy()])?;
        Ok(())
    }

    fn teardown_interface(&self, name: &str, opts: &TunnelOpts) -> DriverResult<()> {
        let path = conf_path(opts, name);
        let result = shell_cmd(&["wg-quick", "down", &path.to_string_lossy()]);
        let _ = fs::remove_file(&path);
        result.map(|_| ())
    }

    fn list_interfaces(&self, opts: &TunnelOpts) -> DriverResult<Vec<(String, QuickConfig)>> {
        let mut out = Vec::new();
        if !opts.data_dir.exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(&opts.data_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("conf") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let text = fs::read_to_string(&path)?;
            match QuickConfig::decode(&text) {
                Ok(config) => out.push((stem.to_string(), config)),
                Err(e) => log::warn!("skipping unreadable conf file {}: {}", path.display(), e),
            }
        }
        Ok(out)
    }

    fn interface_exists(&self, name: &str) -> DriverResult<bool> {
        match shell_cmd(&["ip", "link", "show", name]) {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    fn list_host_interfaces(&self) -> DriverResult<Vec<HostInterface>> {
        let mut out = Vec::new();
        #[cfg(target_os = "linux")]
        {
            let ifaces = get_if_addrs::get_if_addrs()?;
            for iface in ifaces {
                if let get_if_addrs::IfAddr::V4(v4) = iface.addr {
                    let mask = u32::from_be_bytes(v4.netmask.octets());
                    let prefix_len = host_mask_to_prefix_len(mask);
                    let start = u32::from_be_bytes(v4.ip.octets()) & mask;
                    if let Ok(cidr) = Cidr::new(start, prefix_len) {
                        out.push(HostInterface { name: iface.name, cidr });
                    }
                }
            }
        }
        Ok(out)
    }

    fn list_listening_ports(&self, range: RangeInclusive<u16>) -> DriverResult<Vec<u16>> {
        let filter = format!(
            "sport > :{} and sport < :{}",
            range.start().saturating_sub(1),
            range.end().saturating_add(1)
        );
        let output = shell_cmd(&["ss", "-tauH", filter.as_str()])?;
        let text = String::from_utf8_lossy(&output.stdout);
        let mut ports = Vec::new();
        for line in text.lines() {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let Some(local) = cols.get(4) else { continue };
            let Some(port_str) = local.rsplit(':').next() else {
                continue;
            };
            if let Ok(port) = port_str.parse::<u16>() {
                if range.contains(&port) {
                    ports.push(port);
                }
            }
        }
        ports.sort_unstable();
        ports.dedup();
        Ok(ports)
    }

    fn generate_key_pair(&self) -> DriverResult<KeyPair> {
        let priv_output = shell_cmd(&["wg", "genkey"])?;
        let private_key = String::from_utf8_lossy(&priv_output.stdout).trim().to_string();

        let mut child = Command::new("sh")
            .arg("-c")
            .arg("wg pubkey")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()?;
        child
            .stdin
            .as_mut()
            .expect("piped stdin")
            .write_all(private_key.as_bytes())?;
        let pub_output = child.wait_with_output()?;
        if !pub_output.status.success() {
            return Err(DriverError::CommandFailed("wg pubkey failed".to_string()));
        }
        let public_key = String::from_utf8_lossy(&pub_output.stdout).trim().to_string();

        Ok(KeyPair { private_key, public_key })
    }

    fn rx_packet_stats(&self, name: &str) -> DriverResult<u64> {
        read_stat(name, "rx_packets")
    }

    fn tx_packet_stats(&self, name: &str) -> DriverResult<u64> {
        read_stat(name, "tx_packets")
    }

    fn wg_latest_handshake(&self, name: &str) -> DriverResult<u64> {
        let output = shell_cmd(&["wg", "show", name, "latest-handshakes"])?;
        let text = String::from_utf8_lossy(&output.stdout);
        let first_line = text.lines().next().unwrap_or("");
        let field = first_line.split_whitespace().nth(1).unwrap_or("0");
        Ok(field.parse::<u64>().unwrap_or(0))
    }
}

fn host_mask_to_prefix_len(mask: u32) -> u8 {
    mask.count_ones() as u8
}

fn read_stat(name: &str, stat: &str) -> DriverResult<u64> {
    let path = format!("/sys/class/net/{name}/statistics/{stat}");
    let text = fs::read_to_string(path)?;
    Ok(text.trim().parse::<u64>().unwrap_or(0))
}

/// Deterministic mock driver used throughout this workspace's tests:
/// every operation succeeds for any interface name other than the literal
/// `"failure"`, and stats are fixed (spec §4.4).
pub struct MockDriver {
    conf_dir_lock: Mutex<()>,
    interfaces_up: RwLock<std::collections::HashSet<String>>,
    host_interfaces: Vec<HostInterface>,
    reserved_ports: RwLock<Vec<u16>>,
}

impl MockDriver {
    pub fn new() -> Self {
        MockDriver {
            conf_dir_lock: Mutex::new(()),
            interfaces_up: RwLock::new(std::collections::HashSet::new()),
            host_interfaces: Vec::new(),
            reserved_ports: RwLock::new(Vec::new()),
        }
    }

    pub fn with_host_interfaces(mut self, interfaces: Vec<HostInterface>) -> Self {
        self.host_interfaces = interfaces;
        self
    }

    pub fn with_reserved_ports(self, ports: Vec<u16>) -> Self {
        *self.reserved_ports.write().unwrap() = ports;
        self
    }

    fn fails(name: &str) -> bool {
        name == "failure"
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for MockDriver {
    fn create_interface(&self, name: &str) -> DriverResult<()> {
        if Self::fails(name) {
            return Err(DriverError::CommandFailed(format!("create_interface {name} failed")));
        }
        Ok(())
    }

    fn configure_wireguard(
        &self,
        tunnel_id: &str,
        interface: &InterfaceDescriptor,
        peer: &PeerDescriptor,
        opts: &TunnelOpts,
    ) -> DriverResult<PathBuf> {
        let _lock = self.conf_dir_lock.lock().unwrap();
        fs::create_dir_all(&opts.data_dir)?;
        let config = encode_tunnel(tunnel_id, interface, peer, &opts.hooks, &opts.extra as &[ExtraSection]);
        let path = conf_path(opts, &interface.id);
        write_atomically(&path, &config.encode())?;
        Ok(path)
    }

    fn bring_up_interface(&self, name: &str, _opts: &TunnelOpts) -> DriverResult<()> {
        if Self::fails(name) {
            return Err(DriverError::CommandFailed(format!("bring_up_interface {name} failed")));
        }
        self.interfaces_up.write().unwrap().insert(name.to_string());
        Ok(())
    }

    fn teardown_interface(&self, name: &str, opts: &TunnelOpts) -> DriverResult<()> {
        self.interfaces_up.write().unwrap().remove(name);
        let path = conf_path(opts, name);
        let _ = fs::remove_file(&path);
        if Self::fails(name) {
            return Err(DriverError::CommandFailed(format!("teardown_interface {name} failed")));
        }
        Ok(())
    }

    fn list_interfaces(&self, opts: &TunnelOpts) -> DriverResult<Vec<(String, QuickConfig)>> {
        let mut out = Vec::new();
        if !opts.data_dir.exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(&opts.data_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("conf") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let text = fs::read_to_string(&path)?;
            if let Ok(config) = QuickConfig::decode(&text) {
                out.push((stem.to_string(), config));
            }
        }
        Ok(out)
    }

    fn interface_exists(&self, name: &str) -> DriverResult<bool> {
        Ok(self.interfaces_up.read().unwrap().contains(name))
    }

    fn list_host_interfaces(&self) -> DriverResult<Vec<HostInterface>> {
        Ok(self.host_interfaces.clone())
    }

    fn list_listening_ports(&self, range: RangeInclusive<u16>) -> DriverResult<Vec<u16>> {
        Ok(self
            .reserved_ports
            .read()
            .unwrap()
            .iter()
            .copied()
            .filter(|p| range.contains(p))
            .collect())
    }

    fn generate_key_pair(&self) -> DriverResult<KeyPair> {
        Ok(KeyPair {
            private_key: "mock-private-key".to_string(),
            public_key: "mock-public-key".to_string(),
        })
    }

    fn rx_packet_stats(&self, _name: &str) -> DriverResult<u64> {
        Ok(27)
    }

    fn tx_packet_stats(&self, _name: &str) -> DriverResult<u64> {
        Ok(8)
    }

    fn wg_latest_handshake(&self, _name: &str) -> DriverResult<u64> {
        Ok(1656345389)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TableMode;
    use std::str::FromStr;
    use crate::cidr::Ipv4Address;

    fn interface(id: &str) -> InterfaceDescriptor {
        InterfaceDescriptor {
            id: id.to_string(),
            ip_address: Ipv4Address::from_str("10.0.0.1").unwrap(),
            port: 51820,
            private_key: "priv".to_string(),
            public_key: "pub".to_string(),
            table: TableMode::Auto,
        }
    }

    fn peer() -> PeerDescriptor {
        PeerDescriptor {
            ip_address: Ipv4Address::from_str("10.0.0.2").unwrap(),
            endpoint: "203.0.113.1".to_string(),
            port: 51821,
            public_key: "peerpub".to_string(),
            persistent_keepalive: 25,
        }
    }

    #[test]
    fn mock_driver_succeeds_for_non_failure_names() {
        let dir = tempfile::tempdir().unwrap();
        let opts = TunnelOpts {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let driver = MockDriver::new();
        let path = driver
            .configure_wireguard("t1", &interface("peridio-AAA"), &peer(), &opts)
            .unwrap();
        assert!(path.exists());
        driver.bring_up_interface("peridio-AAA", &opts).unwrap();
        assert!(driver.interface_exists("peridio-AAA").unwrap());
        driver.teardown_interface("peridio-AAA", &opts).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn mock_driver_fails_for_literal_failure_name() {
        let dir = tempfile::tempdir().unwrap();
        let opts = TunnelOpts {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let driver = MockDriver::new();
        driver
            .configure_wireguard("t1", &interface("failure"), &peer(), &opts)
            .unwrap();
        assert!(driver.bring_up_interface("failure", &opts).is_err());
    }

    #[test]
    fn mock_driver_stats_are_deterministic() {
        let driver = MockDriver::new();
        assert_eq!(driver.rx_packet_stats("any").unwrap(), 27);
        assert_eq!(driver.tx_packet_stats("any").unwrap(), 8);
        assert_eq!(driver.wg_latest_handshake("any").unwrap(), 1656345389);
    }
}
