//! Bidirectional codec for `wg-quick` `.conf` files, extended with a
//! convention for carrying application metadata as comment-prefixed
//! key/value pairs inside named "extra" sections (spec §4.5).

use thiserror::Error;

use crate::model::{InterfaceDescriptor, PeerDescriptor, TableMode};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("file not found")]
    FileNotFound,
    #[error("empty file")]
    EmptyFile,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("missing required keys: {0:?}")]
    MissingRequiredKeys(Vec<String>),
    #[error("invalid integer: {0}")]
    InvalidInteger(String),
    #[error("invalid endpoint format: {0}")]
    InvalidEndpointFormat(String),
    #[error("invalid allowed-ips format: {0}")]
    InvalidAllowedIpsFormat(String),
    #[error("decode error: {0}")]
    DecodeError(String),
}

const INTERFACE_CANONICAL_KEYS: &[&str] = &[
    "Address",
    "DNS",
    "MTU",
    "Table",
    "ListenPort",
    "PrivateKey",
    "PreUp",
    "PreDown",
    "PostUp",
    "PostDown",
    "SaveConfig",
];

const PEER_CANONICAL_KEYS: &[&str] = &[
    "AllowedIPs",
    "PublicKey",
    "Endpoint",
    "PersistentKeepalive",
    "PresharedKey",
];

fn is_canonical(section: &str, key: &str) -> bool {
    match section {
        "Interface" => INTERFACE_CANONICAL_KEYS.contains(&key),
        "Peer" => PEER_CANONICAL_KEYS.contains(&key),
        _ => false,
    }
}

/// One `key = value` pair, preserving the order and duplicates in which it
/// appeared (duplicate keys, e.g. multiple `PreUp`, are meaningful).
pub type Pair = (String, String);

/// A named extra section: everything that isn't the canonical `[Interface]`
/// or `[Peer]` section.
pub type ExtraSection = (String, Vec<Pair>);

/// The in-memory form of a `.conf` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuickConfig {
    pub interface: Vec<Pair>,
    pub peer: Vec<Pair>,
    pub extra: Vec<ExtraSection>,
}

impl QuickConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drill into `extra` sections: `get_in_extra(cfg, &["Peridio", "TunnelID"])`
    /// returns every matching `(key, value)` leaf pair in that section, or
    /// an empty vec if the section is absent.
    pub fn get_in_extra(&self, path: &[&str]) -> Vec<Pair> {
        let (Some(&section_name), Some(&key)) = (path.first(), path.get(1)) else {
            return Vec::new();
        };
        self.extra
            .iter()
            .find(|(name, _)| name == section_name)
            .map(|(_, pairs)| {
                pairs
                    .iter()
                    .filter(|(k, _)| k == key)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Encode into `wg-quick` `.conf` text. Canonical keys are emitted bare;
    /// everything else is emitted comment-prefixed (`# k = v`), and extra
    /// sections get a commented header (`# [Name]`).
    pub fn encode(&self) -> String {
        let mut out = String::new();
        encode_primary_section(&mut out, "Interface", &self.interface, self.find_extra("Interface"));
        out.push('\n');
        encode_primary_section(&mut out, "Peer", &self.peer, self.find_extra("Peer"));
        for (name, pairs) in &self.extra {
            if name == "Interface" || name == "Peer" {
                continue;
            }
            out.push('\n');
            encode_section(&mut out, name, pairs);
        }
        out
    }

    fn find_extra(&self, name: &str) -> Option<&Vec<Pair>> {
        self.extra.iter().find(|(n, _)| n == name).map(|(_, pairs)| pairs)
    }

    /// Decode `wg-quick` `.conf` text, preserving duplicate keys and order
    /// within each section.
    pub fn decode(text: &str) -> Result<QuickConfig, CodecError> {
        if text.is_empty() {
            return Err(CodecError::EmptyFile);
        }

        let mut config = QuickConfig::new();
        let mut current: Option<String> = None;

        for raw_line in text.lines() {
            let line = raw_line.trim_end();
            if line.trim().is_empty() || line.trim_start().starts_with(';') {
                continue;
            }
            // A leading "# " is stripped before parsing, so comment-prefixed
            // lines participate in section/key parsing like any other line.
            let line = line.strip_prefix("# ").unwrap_or(line);
            let trimmed = line.trim();

            if let Some(name) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                current = Some(name.to_string());
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(CodecError::DecodeError(format!(
                    "malformed line: {raw_line}"
                )));
            };
            let key = key.trim().to_string();
            let value = value.trim().to_string();

            match current.as_deref() {
                Some("Interface") if is_canonical("Interface", &key) => {
                    config.interface.push((key, value));
                }
                Some("Peer") if is_canonical("Peer", &key) => {
                    config.peer.push((key, value));
                }
                Some(name) => push_extra(&mut config.extra, name, key, value),
                None => push_extra(&mut config.extra, "", key, value),
            }
        }

        Ok(config)
    }
}

/// A non-canonical key under `[Interface]`/`[Peer]`, or any key under a
/// section that isn't one of those two, lands in the matching `extra`
/// bucket (creating it if this is its first key).
fn push_extra(extra: &mut Vec<ExtraSection>, name: &str, key: String, value: String) {
    match extra.iter_mut().find(|(n, _)| n == name) {
        Some((_, pairs)) => pairs.push((key, value)),
        None => extra.push((name.to_string(), vec![(key, value)])),
    }
}

/// Emit the single `[Interface]`/`[Peer]` header with its canonical pairs
/// bare, followed by any matching `extra` bucket's pairs comment-prefixed —
/// never a second header for the same section name.
fn encode_primary_section(out: &mut String, name: &str, canonical_pairs: &[Pair], extra_pairs: Option<&Vec<Pair>>) {
    out.push_str(&format!("[{name}]\n"));
    for (k, v) in canonical_pairs {
        out.push_str(&format!("{k} = {v}\n"));
    }
    if let Some(pairs) = extra_pairs {
        for (k, v) in pairs {
            out.push_str(&format!("# {k} = {v}\n"));
        }
    }
}

fn encode_section(out: &mut String, name: &str, pairs: &[Pair]) {
    if name == "Interface" || name == "Peer" {
        out.push_str(&format!("[{name}]\n"));
    } else {
        out.push_str(&format!("# [{name}]\n"));
    }
    for (k, v) in pairs {
        if is_canonical(name, k) {
            out.push_str(&format!("{k} = {v}\n"));
        } else {
            out.push_str(&format!("# {k} = {v}\n"));
        }
    }
}

/// Build the `QuickConfig` for one tunnel: `[Interface]` fields in the
/// fixed order `Address, ListenPort, PrivateKey, ID, PublicKey` (the last
/// two move to `extra` on emit since they aren't canonical `wg-quick`
/// keys), one `[Peer]`, plus hooks and caller-supplied `extra` sections,
/// and a mandatory `[Peridio]` extra section carrying `TunnelID`.
pub fn encode_tunnel(
    tunnel_id: &str,
    interface: &InterfaceDescriptor,
    peer: &PeerDescriptor,
    hooks: &[(String, String)],
    extra: &[ExtraSection],
) -> QuickConfig {
    let mut config = QuickConfig::new();

    config
        .interface
        .push(("Address".to_string(), interface.ip_address.to_string()));
    config
        .interface
        .push(("ListenPort".to_string(), interface.port.to_string()));
    config
        .interface
        .push(("PrivateKey".to_string(), interface.private_key.clone()));
    if interface.table != TableMode::Auto {
        config
            .interface
            .push(("Table".to_string(), interface.table.as_str().to_string()));
    }
    for (k, v) in hooks {
        config.interface.push((k.clone(), v.clone()));
    }

    config
        .peer
        .push(("AllowedIPs".to_string(), format!("{}/32", peer.ip_address)));
    config
        .peer
        .push(("PublicKey".to_string(), peer.public_key.clone()));
    config.peer.push((
        "Endpoint".to_string(),
        format!("{}:{}", peer.endpoint, peer.port),
    ));
    config.peer.push((
        "PersistentKeepalive".to_string(),
        peer.persistent_keepalive.to_string(),
    ));

    let mut interface_extra = vec![
        ("ID".to_string(), interface.id.clone()),
        ("PublicKey".to_string(), interface.public_key.clone()),
    ];
    if let Some((_, pairs)) = extra.iter().find(|(name, _)| name == "Interface") {
        interface_extra.extend(pairs.clone());
    }
    config.extra.push(("Interface".to_string(), interface_extra));

    for (name, pairs) in extra {
        if name != "Interface" {
            config.extra.push((name.clone(), pairs.clone()));
        }
    }

    config
        .extra
        .push(("Peridio".to_string(), vec![("TunnelID".to_string(), tunnel_id.to_string())]));

    config
}

/// Extract the application tunnel identifier from a decoded config
/// (invariant 4: every live tunnel's `.conf` carries `Peridio.TunnelID`).
pub fn tunnel_id_of(config: &QuickConfig) -> Option<String> {
    config
        .get_in_extra(&["Peridio", "TunnelID"])
        .into_iter()
        .next()
        .map(|(_, v)| v)
}

/// Validate that a decoded `[Interface]`/`[Peer]` pair carries the
/// required canonical keys, returning structured errors rather than
/// panicking deep in the tunnel actor.
pub fn require_interface_keys(config: &QuickConfig) -> Result<(), CodecError> {
    let required = ["PrivateKey"];
    let missing: Vec<String> = required
        .iter()
        .filter(|k| !config.interface.iter().any(|(key, _)| key == *k))
        .map(|s| s.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(CodecError::MissingRequiredKeys(missing))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cidr::Ipv4Address;
    use std::str::FromStr;

    fn sample_interface() -> InterfaceDescriptor {
        InterfaceDescriptor {
            id: "peridio-56X4U4Q".to_string(),
            ip_address: Ipv4Address::from_str("10.0.0.1").unwrap(),
            port: 8080,
            private_key: "2PSyTqm+3rXzUK+T8jBhgZp9UHjFkgVZv4bXncWMyXY=".to_string(),
            public_key: "Pu7ymHtDqF4X9VNjVj9mYFBh/z7LGxY6VQJAGiSEgTM=".to_string(),
            table: TableMode::Auto,
        }
    }

    fn sample_peer() -> PeerDescriptor {
        PeerDescriptor {
            ip_address: Ipv4Address::from_str("10.0.0.3").unwrap(),
            endpoint: "10.0.0.2".to_string(),
            port: 8081,
            public_key: "h2W8fjxUwZH+G8/Qp/H7kzn4SQz/EJIhOVFMh6mmtX4=".to_string(),
            persistent_keepalive: 25,
        }
    }

    #[test]
    fn encode_then_decode_preserves_interface_and_peer() {
        let config = encode_tunnel(
            "prn:1:tunnel:abc",
            &sample_interface(),
            &sample_peer(),
            &[],
            &[],
        );
        let text = config.encode();
        let decoded = QuickConfig::decode(&text).unwrap();
        assert_eq!(decoded.interface, config.interface);
        assert_eq!(decoded.peer, config.peer);
        assert_eq!(decoded.extra, config.extra);
    }

    #[test]
    fn tunnel_id_round_trips_through_extras() {
        let config = encode_tunnel("prn:1:tunnel:abc", &sample_interface(), &sample_peer(), &[], &[]);
        let text = config.encode();
        let decoded = QuickConfig::decode(&text).unwrap();
        assert_eq!(tunnel_id_of(&decoded).as_deref(), Some("prn:1:tunnel:abc"));
    }

    #[test]
    fn decode_preserves_duplicate_keys_in_extras() {
        let text = "\
[Interface]
Address = 10.0.0.1
ListenPort = 8080
PrivateKey = 2PSyTqm+3rXzUK+T8jBhgZp9UHjFkgVZv4bXncWMyXY=
# ID = peridio-56X4U4Q
# PublicKey = Pu7ymHtDqF4X9VNjVj9mYFBh/z7LGxY6VQJAGiSEgTM=

[Peer]
AllowedIPs = 10.0.0.3/32
PublicKey = h2W8fjxUwZH+G8/Qp/H7kzn4SQz/EJIhOVFMh6mmtX4=
Endpoint = 10.0.0.2:8081
PersistentKeepalive = 25

# [Peridio]
# TunnelID = prn:1:foo
# A = B
# A = C
";
        let config = QuickConfig::decode(text).unwrap();
        assert_eq!(config.interface.len(), 3);
        assert_eq!(config.peer.len(), 4);
        assert_eq!(config.extra.len(), 2);
        assert_eq!(config.extra[0].0, "Interface");
        assert_eq!(
            config.extra[0].1,
            vec![
                ("ID".to_string(), "peridio-56X4U4Q".to_string()),
                ("PublicKey".to_string(), "Pu7ymHtDqF4X9VNjVj9mYFBh/z7LGxY6VQJAGiSEgTM=".to_string()),
            ]
        );
        assert_eq!(config.extra[1].0, "Peridio");
        let a_values = config.get_in_extra(&["Peridio", "A"]);
        assert_eq!(
            a_values,
            vec![("A".to_string(), "B".to_string()), ("A".to_string(), "C".to_string())]
        );
    }

    #[test]
    fn blank_lines_and_semicolon_comments_are_dropped() {
        let text = "\n; a real comment\n[Interface]\nPrivateKey = abc\n";
        let config = QuickConfig::decode(text).unwrap();
        assert_eq!(config.interface, vec![("PrivateKey".to_string(), "abc".to_string())]);
    }

    #[test]
    fn empty_file_is_an_error() {
        assert!(matches!(QuickConfig::decode(""), Err(CodecError::EmptyFile)));
    }

    #[test]
    fn missing_required_keys_detected() {
        let config = QuickConfig::new();
        assert!(matches!(
            require_interface_keys(&config),
            Err(CodecError::MissingRequiredKeys(_))
        ));
    }
}
