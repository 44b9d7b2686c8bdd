//! Core data model (spec §3): the value types shared by the driver,
//! quick-config codec, and tunnel state machine.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cidr::Ipv4Address;

/// `wg-quick`'s `Table=` setting for the `[Interface]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableMode {
    Auto,
    Off,
}

impl Default for TableMode {
    fn default() -> Self {
        TableMode::Auto
    }
}

impl TableMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableMode::Auto => "auto",
            TableMode::Off => "off",
        }
    }

    pub fn parse(s: &str) -> Option<TableMode> {
        match s {
            "auto" => Some(TableMode::Auto),
            "off" => Some(TableMode::Off),
            _ => None,
        }
    }
}

/// Local-side configuration for one tunnel's interface.
#[derive(Debug, Clone)]
pub struct InterfaceDescriptor {
    pub id: String,
    pub ip_address: Ipv4Address,
    pub port: u16,
    pub private_key: String,
    pub public_key: String,
    pub table: TableMode,
}

/// Remote-side configuration for one tunnel's sole peer.
#[derive(Debug, Clone)]
pub struct PeerDescriptor {
    /// Allowed peer IP, always treated as a `/32`.
    pub ip_address: Ipv4Address,
    pub endpoint: String,
    pub port: u16,
    pub public_key: String,
    pub persistent_keepalive: u32,
}

/// A callback invoked with the tunnel's exit reason after teardown.
pub type ExitCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Per-tunnel options (spec §3 `opts`).
#[derive(Clone)]
pub struct TunnelOpts {
    pub data_dir: PathBuf,
    pub hooks: Vec<(String, String)>,
    pub extra: Vec<(String, Vec<(String, String)>)>,
    pub on_exit: Option<ExitCallback>,
    /// What to do when a steady-state liveness check classifies the tunnel
    /// as stale (spec §9, Open Question 1). Defaults to `LogOnly`, matching
    /// the source's current (documented-as-intentional) behavior.
    pub stale_action: StaleAction,
}

impl std::fmt::Debug for TunnelOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelOpts")
            .field("data_dir", &self.data_dir)
            .field("hooks", &self.hooks)
            .field("extra", &self.extra)
            .field("on_exit", &self.on_exit.is_some())
            .field("stale_action", &self.stale_action)
            .finish()
    }
}

impl Default for TunnelOpts {
    fn default() -> Self {
        TunnelOpts {
            data_dir: std::env::temp_dir(),
            hooks: Vec::new(),
            extra: Vec::new(),
            on_exit: None,
            stale_action: StaleAction::LogOnly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleAction {
    LogOnly,
    Terminate,
}

/// A host network interface discovered by the resource scanner, reduced to
/// the single CIDR it reserves.
#[derive(Debug, Clone)]
pub struct HostInterface {
    pub name: String,
    pub cidr: crate::cidr::Cidr,
}

/// A freshly generated WireGuard key pair, base64-encoded.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}
