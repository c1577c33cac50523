use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::SystemClock;
use crate::config::Config;
use crate::engine::AllocationEngine;
use crate::error::{Error, Result};
use crate::protocol::{DHCP_SERVER_PORT, ProtocolHandler};
use crate::store::{JournalStore, LeaseStore};

const RECV_BUFFER_SIZE: usize = 1500;

/// UDP front end: one task per datagram plus a periodic sweeper.
#[derive(Debug)]
pub struct DhcpServer<S> {
    handler: Arc<ProtocolHandler<S>>,
    socket: Arc<UdpSocket>,
    sweep_interval: Duration,
}

impl DhcpServer<JournalStore> {
    /// Opens the journal at `config.leases_file`, compacts it, starts the
    /// engine on wall-clock time and binds `0.0.0.0:67`.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(JournalStore::new(&config.leases_file));
        let records = store.compact().await?;
        info!(
            "Loaded {} lease record(s) from {}",
            records, config.leases_file
        );

        let engine = AllocationEngine::start(config, store, Arc::new(SystemClock)).await?;
        let socket = create_socket(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT))?;

        info!(
            "DHCP server {} listening on port {}",
            engine.config().server_ip,
            DHCP_SERVER_PORT
        );
        Ok(Self::from_parts(Arc::new(engine), socket))
    }
}

impl<S: LeaseStore> DhcpServer<S> {
    /// Serves `engine` on an already bound socket.
    pub fn from_parts(engine: Arc<AllocationEngine<S>>, socket: UdpSocket) -> Self {
        let sweep_interval = Duration::from_secs(u64::from(engine.config().sweep_interval_seconds));
        Self {
            handler: Arc::new(ProtocolHandler::new(engine)),
            socket: Arc::new(socket),
            sweep_interval,
        }
    }

    pub fn engine(&self) -> &Arc<AllocationEngine<S>> {
        self.handler.engine()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serves until the process is killed.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serves until `shutdown` completes, then stops the sweeper.
    pub async fn run_until<F: Future<Output = ()>>(&self, shutdown: F) -> Result<()> {
        let sweeper = spawn_sweeper(Arc::clone(self.engine()), self.sweep_interval);

        info!("DHCP server ready and listening");
        tokio::select! {
            () = self.serve() => {}
            () = shutdown => info!("Received shutdown signal, stopping server..."),
        }

        sweeper.abort();
        Ok(())
    }

    async fn serve(&self) {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        loop {
            match self.socket.recv_from(&mut buffer).await {
                Ok((size, source)) => {
                    let data = buffer[..size].to_vec();
                    let handler = Arc::clone(&self.handler);
                    let socket = Arc::clone(&self.socket);

                    tokio::spawn(async move {
                        match handler.handle_datagram(&data).await {
                            Ok(Some(outbound)) => {
                                let bytes = outbound.packet.encode();
                                if let Err(error) =
                                    socket.send_to(&bytes, outbound.destination).await
                                {
                                    warn!(
                                        "Failed to send reply to {}: {}",
                                        outbound.destination, error
                                    );
                                } else {
                                    debug!(
                                        "Sent {} bytes to {}",
                                        bytes.len(),
                                        outbound.destination
                                    );
                                }
                            }
                            Ok(None) => {}
                            Err(error) => {
                                error!("Error handling packet from {}: {}", source, error);
                            }
                        }
                    });
                }
                Err(error) => {
                    error!("Error receiving packet: {}", error);
                }
            }
        }
    }
}

/// Runs [`AllocationEngine::sweep`] every `period` until aborted.
pub fn spawn_sweeper<S: LeaseStore>(
    engine: Arc<AllocationEngine<S>>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match engine.sweep().await {
                Ok(report) if !report.is_empty() => info!("Sweep: {:?}", report),
                Ok(_) => {}
                Err(error) => error!("Sweep failed: {}", error),
            }
        }
    })
}

/// Binds a broadcast-capable, address-reusing UDP socket.
pub fn create_socket(bind_addr: SocketAddrV4) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

    socket
        .set_reuse_address(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

    socket
        .set_broadcast(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

    socket
        .set_nonblocking(true)
        .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

    socket
        .bind(&bind_addr.into())
        .map_err(|error| Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|error| Error::Socket(format!("Failed to convert to tokio socket: {}", error)))
}
