//! The long-running process: owns the registry, accepts control
//! connections on a Unix domain socket, and tears every tunnel down
//! cleanly on shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::thread_rng;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use wgfleet_core::cidr::Cidr;
use wgfleet_core::config::FleetConfig;
use wgfleet_core::driver::{Driver, MockDriver, RealDriver};
use wgfleet_core::model::{InterfaceDescriptor, PeerDescriptor, TableMode, TunnelOpts};
use wgfleet_core::registry::Registry;
use wgfleet_core::{allocator, random_interface_id, scanner};

use crate::protocol::{Request, Response, StatusDto};

struct Allocation {
    interface_ip: u32,
    peer_ip: u32,
    port: u16,
}

pub struct Daemon {
    config: FleetConfig,
    driver: Arc<dyn Driver>,
    registry: Registry,
    allocations: Mutex<HashMap<String, Allocation>>,
}

impl Daemon {
    pub fn new(config: FleetConfig) -> Self {
        let driver: Arc<dyn Driver> = if config.use_mock_driver {
            Arc::new(MockDriver::new())
        } else {
            Arc::new(RealDriver::new())
        };
        let registry = Registry::new(driver.clone());
        Daemon {
            config,
            driver,
            registry,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    fn live_ip_cidrs(&self) -> Vec<Cidr> {
        let allocations = self.allocations.lock().unwrap();
        allocations
            .values()
            .flat_map(|a| {
                [
                    Cidr::new(a.interface_ip, 32).expect("/32 is always aligned"),
                    Cidr::new(a.peer_ip, 32).expect("/32 is always aligned"),
                ]
            })
            .collect()
    }

    fn live_ports(&self) -> Vec<u16> {
        self.allocations
            .lock()
            .unwrap()
            .values()
            .map(|a| a.port)
            .collect()
    }

    async fn handle_open(
        &self,
        tunnel_id: String,
        peer_endpoint: String,
        peer_port: u16,
        peer_public_key: String,
        ttl_secs: u64,
    ) -> Response {
        let mut reserved_cidrs = match scanner::reserved_cidrs(&*self.driver, &self.live_ip_cidrs()) {
            Ok(r) => r,
            Err(e) => return Response::Error(e.to_string()),
        };

        let (interface_ip, peer_ip, port, interface_id) = {
            let mut rng = thread_rng();

            let interface_ip = match allocator::pick_ip(&self.config.pool, &reserved_cidrs, &mut rng) {
                Ok(ip) => ip,
                Err(e) => return Response::Error(e.to_string()),
            };
            reserved_cidrs.push(Cidr::new(interface_ip.to_integer(), 32).expect("/32 is always aligned"));

            let peer_ip = match allocator::pick_ip(&self.config.pool, &reserved_cidrs, &mut rng) {
                Ok(ip) => ip,
                Err(e) => return Response::Error(e.to_string()),
            };

            let mut reserved_ports = scanner::reserved_ports(&*self.driver, self.config.port_range.clone());
            reserved_ports.extend(self.live_ports());
            let port = match allocator::pick_port(self.config.port_range.clone(), &reserved_ports, &mut rng) {
                Ok(p) => p,
                Err(e) => return Response::Error(e.to_string()),
            };

            let interface_id = random_interface_id(&mut rng);

            (interface_ip, peer_ip, port, interface_id)
        };

        let keys = match self.driver.generate_key_pair() {
            Ok(k) => k,
            Err(e) => return Response::Error(e.to_string()),
        };
        let interface = InterfaceDescriptor {
            id: interface_id.clone(),
            ip_address: interface_ip,
            port,
            private_key: keys.private_key,
            public_key: keys.public_key,
            table: TableMode::Auto,
        };
        let peer = PeerDescriptor {
            ip_address: peer_ip,
            endpoint: peer_endpoint,
            port: peer_port,
            public_key: peer_public_key,
            persistent_keepalive: 25,
        };
        let opts = TunnelOpts {
            data_dir: self.config.data_dir.clone(),
            stale_action: self.config.stale_action,
            ..Default::default()
        };

        match self
            .registry
            .open(tunnel_id.clone(), interface, peer, opts, Duration::from_secs(ttl_secs))
            .await
        {
            Ok(()) => {
                self.allocations.lock().unwrap().insert(
                    tunnel_id,
                    Allocation {
                        interface_ip: interface_ip.to_integer(),
                        peer_ip: peer_ip.to_integer(),
                        port,
                    },
                );
                Response::Ok
            }
            Err(e) => Response::Error(e.to_string()),
        }
    }

    async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Open {
                tunnel_id,
                peer_endpoint,
                peer_port,
                peer_public_key,
                ttl_secs,
            } => {
                self.handle_open(tunnel_id, peer_endpoint, peer_port, peer_public_key, ttl_secs)
                    .await
            }
            Request::Close { tunnel_id } => match self.registry.close(&tunnel_id).await {
                Ok(()) => {
                    self.allocations.lock().unwrap().remove(&tunnel_id);
                    Response::Ok
                }
                Err(e) => Response::Error(e.to_string()),
            },
            Request::Extend { tunnel_id, by_secs } => {
                match self.registry.extend(&tunnel_id, Duration::from_secs(by_secs)).await {
                    Ok(()) => Response::Ok,
                    Err(e) => Response::Error(e.to_string()),
                }
            }
            Request::List => Response::List(self.registry.list()),
            Request::Show { tunnel_id } => match self.registry.show(&tunnel_id).await {
                Ok(status) => Response::Status(StatusDto {
                    tunnel_id: status.tunnel_id,
                    interface_id: status.interface_id,
                    state: format!("{:?}", status.state),
                    rx_packets: status.rx_packets,
                    tx_packets: status.tx_packets,
                    latest_handshake: status.latest_handshake,
                }),
                Err(e) => Response::Error(e.to_string()),
            },
        }
    }

    async fn shutdown(&self) {
        for tunnel_id in self.registry.list() {
            if let Err(e) = self.registry.close(&tunnel_id).await {
                log::warn!("failed to close tunnel {tunnel_id} during shutdown: {e}");
            }
        }
    }
}

async fn handle_connection(daemon: Arc<Daemon>, stream: UnixStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let Ok(Some(line)) = lines.next_line().await else {
        return;
    };
    let response = match serde_json::from_str::<Request>(&line) {
        Ok(request) => daemon.handle(request).await,
        Err(e) => Response::Error(format!("malformed request: {e}")),
    };
    let mut text = serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string());
    text.push('\n');
    let _ = write_half.write_all(text.as_bytes()).await;
}

/// Run the daemon until interrupted, then close every tunnel and remove
/// the socket file.
pub async fn run(config: FleetConfig, socket_path: std::path::PathBuf) -> std::io::Result<()> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;
    log::info!("wgfleetd listening on {}", socket_path.display());

    let daemon = Arc::new(Daemon::new(config));

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                let daemon = daemon.clone();
                tokio::spawn(handle_connection(daemon, stream));
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("received interrupt, shutting down");
                break;
            }
        }
    }

    daemon.shutdown().await;
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}
