//! The capture server: bind a listener for the configured protocol, run
//! its adapter until terminated, and publish the bound address.

use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::Notify;

use crate::adapters::{amqp, framed_tcp, ftp, http, line_tcp, xmlrpc, ServerProtocol};
use crate::config::{RcConfig, GENERAL_SECTION};
use crate::dispatcher::Dispatcher;
use crate::error::{Error, Result};

/// State shared by every connection handler of a running server.
pub struct ServerState {
    pub config: RcConfig,
    pub dispatcher: Dispatcher,
    pub shutdown: Notify,
    /// Path redirects installed through the HTTP meta-endpoint.
    pub redirects: http::RedirectTable,
    stopping: std::sync::atomic::AtomicBool,
    in_flight: std::sync::atomic::AtomicUsize,
    multithreaded: bool,
    /// Serialises dispatch when `server_multithreaded` is off.
    serial: tokio::sync::Mutex<()>,
}

impl ServerState {
    pub fn new(config: RcConfig, dispatcher: Dispatcher) -> Self {
        let multithreaded = config.get_bool(GENERAL_SECTION, "server_multithreaded", true);
        Self {
            config,
            dispatcher,
            shutdown: Notify::new(),
            redirects: http::RedirectTable::default(),
            stopping: std::sync::atomic::AtomicBool::new(false),
            in_flight: std::sync::atomic::AtomicUsize::new(0),
            multithreaded,
            serial: tokio::sync::Mutex::new(()),
        }
    }

    /// Directory receiving stored copies of uploads and edited files in
    /// record mode, if one was configured.
    pub fn edit_record_dir(&self) -> Option<std::path::PathBuf> {
        self.dispatcher.edit_record_dir()
    }

    pub fn trigger_shutdown(&self) {
        debug!("Shutdown requested");
        self.dispatcher.reset();
        self.stopping.store(true, std::sync::atomic::Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Checked by accept loops each iteration, closing the race between a
    /// trigger and the next `notified()` registration.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Run `handle` for an accepted connection, either on its own task or
    /// serially under the dispatch lock, per `server_multithreaded`.
    pub fn spawn_handler<F>(self: &Arc<Self>, handle: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        use std::sync::atomic::Ordering;

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let state = self.clone();
        tokio::spawn(async move {
            if state.multithreaded {
                handle.await;
            } else {
                let _guard = state.serial.lock().await;
                handle.await;
            }
            state.in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Count one request as in-flight for the guard's lifetime. Used by
    /// the HTTP-shaped adapters, whose connections outlive requests.
    pub fn track_request(self: &Arc<Self>) -> RequestGuard {
        self.in_flight
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        RequestGuard(self.clone())
    }

    /// The dispatch lock, when `server_multithreaded` is off.
    pub async fn serial_guard(&self) -> Option<tokio::sync::MutexGuard<'_, ()>> {
        if self.multithreaded {
            None
        } else {
            Some(self.serial.lock().await)
        }
    }

    /// Wait, boundedly, for in-flight handlers after the listener closed:
    /// the last request's bytes still belong in the journal.
    pub async fn drain(&self) {
        use std::sync::atomic::Ordering;

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if tokio::time::Instant::now() >= deadline {
                debug!("Giving up on in-flight handlers after the grace period");
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

pub struct RequestGuard(Arc<ServerState>);

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.0
            .in_flight
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }
}

/// A running capture server.
///
/// `start` binds the protocol's listener on the requested address (port 0
/// picks a free port), hands it to the adapter and returns once the server
/// is accepting. The first line the server binary prints is this address.
pub struct CaptureServer {
    state: Arc<ServerState>,
    address: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl CaptureServer {
    pub async fn start(config: RcConfig, dispatcher: Dispatcher) -> Result<Self> {
        let protocol = ServerProtocol::from_config_value(
            config.get_or(GENERAL_SECTION, "server_protocol", "classic_tcp"),
        );
        let bind_address = if config.get_bool(GENERAL_SECTION, "server_remote_access", false) {
            "0.0.0.0:0"
        } else {
            "127.0.0.1:0"
        };

        let mut config = config;
        if protocol == ServerProtocol::ClassicUdp {
            let socket = UdpSocket::bind(bind_address).await.map_err(|source| Error::Bind {
                address: bind_address.to_string(),
                source,
            })?;
            let address = socket.local_addr()?;
            config.set_server_address(address);
            let state = Arc::new(ServerState::new(config, dispatcher));
            let run_state = state.clone();
            let handle = tokio::spawn(async move {
                line_tcp::run_udp(run_state.clone(), socket).await;
                run_state.drain().await;
            });
            info!("Capture server (classic_udp) listening on {address}");
            return Ok(Self {
                state,
                address,
                handle,
            });
        }

        let listener = TcpListener::bind(bind_address).await.map_err(|source| Error::Bind {
            address: bind_address.to_string(),
            source,
        })?;
        let address = listener.local_addr()?;
        config.set_server_address(address);
        let state = Arc::new(ServerState::new(config, dispatcher));

        let run_state = state.clone();
        let handle = tokio::spawn(async move {
            let adapter_state = run_state.clone();
            match protocol {
                ServerProtocol::ClassicTcp | ServerProtocol::ClassicUdp => {
                    line_tcp::run(adapter_state, listener).await;
                }
                ServerProtocol::TcpHeader => framed_tcp::run(adapter_state, listener).await,
                ServerProtocol::Http => http::run(adapter_state, listener).await,
                ServerProtocol::XmlRpc => xmlrpc::run(adapter_state, listener).await,
                ServerProtocol::Ftp => ftp::run(adapter_state, listener).await,
                ServerProtocol::Amqp => amqp::run(adapter_state, listener).await,
            }
            run_state.drain().await;
        });
        info!("Capture server ({protocol:?}) listening on {address}");
        Ok(Self {
            state,
            address,
            handle,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Ask the server to stop accepting and wait for it to drain.
    pub async fn shutdown(self) {
        self.state.trigger_shutdown();
        let _ = self.handle.await;
    }

    /// Wait until the server terminates of its own accord, e.g. through a
    /// `TERMINATE_SERVER` message.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }
}
