//! Tor and I2P connectivity
//!
//! The anonymity daemons run outside this process. A `ConnectivityMonitor`
//! probes one of them with a plain TCP connect on a background thread and
//! keeps the last answer. `AppRouting` combines the monitors with the user's
//! settings into the routing inputs the engine asks for on every attempt.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::{debug, info};
use umbra::routing::{AnonymityPolicy, RoutingContext, TorConnectivity};

use crate::config::connectivity::{CHECK_INTERVAL_SECS, PROBE_TIMEOUT_MS};
use crate::data::Settings;
use crate::error::Result;

/// True if something accepts TCP connections on `host:port` within `timeout`
pub fn probe(host: &str, port: u16, timeout: Duration) -> bool {
    let addrs = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            debug!(host, port, error = %e, "Probe address did not resolve");
            return false;
        }
    };
    addrs
        .into_iter()
        .any(|addr| TcpStream::connect_timeout(&addr, timeout).is_ok())
}

/// Periodic reachability check of one local daemon
pub struct ConnectivityMonitor {
    up: Arc<AtomicBool>,
    wake: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ConnectivityMonitor {
    /// Probe `host:port` now and then every `CHECK_INTERVAL_SECS`
    pub fn spawn(label: &'static str, host: String, port: u16) -> Result<Self> {
        Self::spawn_with_interval(label, host, port, Duration::from_secs(CHECK_INTERVAL_SECS))
    }

    pub fn spawn_with_interval(
        label: &'static str,
        host: String,
        port: u16,
        interval: Duration,
    ) -> Result<Self> {
        let up = Arc::new(AtomicBool::new(false));
        let (wake_tx, wake_rx) = bounded::<()>(1);
        let timeout = Duration::from_millis(PROBE_TIMEOUT_MS);

        let flag = up.clone();
        let thread = thread::Builder::new()
            .name(format!("{label}-monitor"))
            .spawn(move || loop {
                let reachable = probe(&host, port, timeout);
                if flag.swap(reachable, Ordering::SeqCst) != reachable {
                    info!(network = label, %host, port, reachable, "Connectivity changed");
                }
                match wake_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Self {
            up,
            wake: Some(wake_tx),
            thread: Some(thread),
        })
    }

    /// A monitor that always reports `up` and never probes
    pub fn fixed(up: bool) -> Self {
        Self {
            up: Arc::new(AtomicBool::new(up)),
            wake: None,
            thread: None,
        }
    }

    /// Result of the latest probe
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Probe again without waiting for the next interval
    pub fn check_now(&self) {
        if let Some(wake) = &self.wake {
            let _ = wake.try_send(());
        }
    }
}

impl Drop for ConnectivityMonitor {
    fn drop(&mut self) {
        // Disconnecting the wake channel ends the loop
        self.wake.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Live routing inputs: the user's settings plus daemon reachability
pub struct AppRouting {
    settings: Arc<Mutex<Settings>>,
    tor: ConnectivityMonitor,
    i2p: ConnectivityMonitor,
}

impl AppRouting {
    pub fn new(settings: Arc<Mutex<Settings>>, tor: ConnectivityMonitor, i2p: ConnectivityMonitor) -> Self {
        Self { settings, tor, i2p }
    }

    /// Start monitors for the Tor and I2P endpoints named in `settings`
    pub fn spawn(settings: Arc<Mutex<Settings>>) -> Result<Self> {
        let (tor_host, tor_port, i2p_host, i2p_port) = {
            let s = settings.lock().unwrap_or_else(|e| e.into_inner());
            (s.tor_host.clone(), s.tor_port, s.i2p_host.clone(), s.i2p_port)
        };
        let tor = ConnectivityMonitor::spawn("tor", tor_host, tor_port)?;
        let i2p = ConnectivityMonitor::spawn("i2p", i2p_host, i2p_port)?;
        Ok(Self::new(settings, tor, i2p))
    }

    pub fn settings(&self) -> &Arc<Mutex<Settings>> {
        &self.settings
    }

    /// Re-probe both daemons
    pub fn refresh(&self) {
        self.tor.check_now();
        self.i2p.check_now();
    }
}

impl RoutingContext for AppRouting {
    fn policy(&self) -> AnonymityPolicy {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .policy()
    }

    fn tor(&self) -> TorConnectivity {
        let s = self.settings.lock().unwrap_or_else(|e| e.into_inner());
        TorConnectivity {
            connected: self.tor.is_up(),
            socks_host: s.tor_host.clone(),
            socks_port: s.tor_port,
        }
    }

    fn i2p_available(&self) -> bool {
        self.i2p.is_up()
    }
}
