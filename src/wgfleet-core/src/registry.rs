//! Registry/supervisor (spec §4.7): the single point of truth for which
//! tunnels exist, keyed both by tunnel id and by interface id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::driver::Driver;
use crate::model::{InterfaceDescriptor, PeerDescriptor, TunnelOpts};
use crate::tunnel::{self, TunnelError, TunnelHandle, TunnelStatus};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("tunnel {0} already exists")]
    AlreadyExists(String),
    #[error("tunnel {0} not found")]
    NotFound(String),
    #[error("interface {0} not found")]
    InterfaceNotFound(String),
    #[error("tunnel setup failed: {0}")]
    Tunnel(#[from] TunnelError),
    #[error("tunnel task vanished before reporting readiness")]
    ReadyChannelDropped,
}

struct Inner {
    by_tunnel_id: HashMap<String, Arc<TunnelHandle>>,
    by_interface_id: HashMap<String, String>,
}

/// Owns every live tunnel task. `open` guarantees its `.conf` file exists
/// on disk before returning `Ok`, via a `oneshot` handshake with the
/// freshly spawned tunnel task (spec §5). The tunnel task itself removes
/// its entry from `inner` when it exits, whether that's an explicit
/// `close` or a self-initiated exit (TTL expiry, a device error, an
/// interface that never appeared) — `inner` lives behind an `Arc` so the
/// spawned task can reach back into it after `open` has long returned.
pub struct Registry {
    driver: Arc<dyn Driver>,
    inner: Arc<Mutex<Inner>>,
}

impl Registry {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Registry {
            driver,
            inner: Arc::new(Mutex::new(Inner {
                by_tunnel_id: HashMap::new(),
                by_interface_id: HashMap::new(),
            })),
        }
    }

    pub async fn open(
        &self,
        tunnel_id: String,
        interface: InterfaceDescriptor,
        peer: PeerDescriptor,
        opts: TunnelOpts,
        ttl: Duration,
    ) -> Result<(), RegistryError> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.by_tunnel_id.contains_key(&tunnel_id) {
                return Err(RegistryError::AlreadyExists(tunnel_id));
            }
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let interface_id = interface.id.clone();
        let inner_for_cleanup = self.inner.clone();
        let deregister: tunnel::DeregisterCallback = Arc::new(move |tunnel_id: &str, interface_id: &str| {
            let mut inner = inner_for_cleanup.lock().unwrap();
            inner.by_tunnel_id.remove(tunnel_id);
            inner.by_interface_id.remove(interface_id);
        });
        let handle = tunnel::spawn(
            tunnel_id.clone(),
            interface,
            peer,
            opts,
            ttl,
            self.driver.clone(),
            ready_tx,
            deregister,
        );

        // Insert before awaiting `ready_rx`: the spawned task can exit and
        // deregister itself as early as the first failed `configure`, and
        // that deregister must find an entry to remove, not race ahead of
        // it being inserted.
        {
            let mut inner = self.inner.lock().unwrap();
            inner.by_interface_id.insert(interface_id, tunnel_id.clone());
            inner.by_tunnel_id.insert(tunnel_id, Arc::new(handle));
        }

        ready_rx
            .await
            .map_err(|_| RegistryError::ReadyChannelDropped)??;

        Ok(())
    }

    pub async fn close(&self, tunnel_id: &str) -> Result<(), RegistryError> {
        let handle = self.remove(tunnel_id)?;
        handle.close().await?;
        Ok(())
    }

    pub async fn extend(&self, tunnel_id: &str, by: Duration) -> Result<(), RegistryError> {
        let handle = self.get(tunnel_id)?;
        handle.extend(by).await?;
        Ok(())
    }

    pub async fn show(&self, tunnel_id: &str) -> Result<TunnelStatus, RegistryError> {
        let handle = self.get(tunnel_id)?;
        Ok(handle.get_state().await?)
    }

    pub fn list(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.by_tunnel_id.keys().cloned().collect()
    }

    pub fn get_by_interface_id(&self, interface_id: &str) -> Result<Arc<TunnelHandle>, RegistryError> {
        let inner = self.inner.lock().unwrap();
        let tunnel_id = inner
            .by_interface_id
            .get(interface_id)
            .ok_or_else(|| RegistryError::InterfaceNotFound(interface_id.to_string()))?;
        inner
            .by_tunnel_id
            .get(tunnel_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(tunnel_id.clone()))
    }

    fn get(&self, tunnel_id: &str) -> Result<Arc<TunnelHandle>, RegistryError> {
        let inner = self.inner.lock().unwrap();
        inner
            .by_tunnel_id
            .get(tunnel_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(tunnel_id.to_string()))
    }

    fn remove(&self, tunnel_id: &str) -> Result<Arc<TunnelHandle>, RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        let handle = inner
            .by_tunnel_id
            .remove(tunnel_id)
            .ok_or_else(|| RegistryError::NotFound(tunnel_id.to_string()))?;
        inner.by_interface_id.remove(&handle.interface_id);
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cidr::Ipv4Address;
    use crate::driver::MockDriver;
    use crate::model::TableMode;
    use std::str::FromStr;

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

    #[tokio::test(start_paused = true)]
    async fn open_does_not_return_until_conf_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let opts = TunnelOpts {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let registry = Registry::new(Arc::new(MockDriver::new()));
        registry
            .open(
                "t1".to_string(),
                interface("peridio-AAA"),
                peer(),
                opts,
                Duration::from_secs(3600),
            )
            .await
            .unwrap();
        assert!(dir.path().join("peridio-AAA.conf").exists());
        assert_eq!(registry.list(), vec!["t1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn open_rejects_duplicate_tunnel_id() {
        let dir = tempfile::tempdir().unwrap();
        let opts = TunnelOpts {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let registry = Registry::new(Arc::new(MockDriver::new()));
        registry
            .open(
                "t1".to_string(),
                interface("peridio-AAA"),
                peer(),
                opts.clone(),
                Duration::from_secs(3600),
            )
            .await
            .unwrap();
        let err = registry
            .open(
                "t1".to_string(),
                interface("peridio-BBB"),
                peer(),
                opts,
                Duration::from_secs(3600),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists(_)));
    }

    /// A device error during bring-up must not fail `open` itself (spec
    /// scenario 4): the tunnel comes up far enough to write its `.conf`,
    /// then exits on its own and removes itself from the registry.
    #[tokio::test(start_paused = true)]
    async fn open_succeeds_despite_bring_up_failure_then_self_removes() {
        let dir = tempfile::tempdir().unwrap();
        let opts = TunnelOpts {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let registry = Registry::new(Arc::new(MockDriver::new()));
        registry
            .open(
                "t1".to_string(),
                interface("failure"),
                peer(),
                opts,
                Duration::from_secs(3600),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(registry.list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_removes_from_both_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let opts = TunnelOpts {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let registry = Registry::new(Arc::new(MockDriver::new()));
        registry
            .open(
                "t1".to_string(),
                interface("peridio-AAA"),
                peer(),
                opts,
                Duration::from_secs(3600),
            )
            .await
            .unwrap();
        registry.close("t1").await.unwrap();
        assert!(registry.get_by_interface_id("peridio-AAA").is_err());
    }
}
