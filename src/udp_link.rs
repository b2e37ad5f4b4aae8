/// UDP telemetry link to the robot
///
/// One socket is shared between the sender (gain updates) and a background
/// receiver thread. The receiver decodes telemetry datagrams, learns the device
/// address from the first non-loopback sender, and hands readings to the trial
/// sampler through a bounded queue. A short display history and packet counters
/// are kept for the GUI.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, info, warn};

use crate::config_loader::TunerSettings;
use crate::gains::GainVector;
use crate::telemetry::{parse_datagram, Datagram, Reading, TelemetryFrame, TelemetryLink};

/// Readings buffered for the sampler before the oldest start being dropped
pub const READING_QUEUE_LEN: usize = 500;

const MAX_DATAGRAM: usize = 1024;

/// Packet counters, readable from any thread.
#[derive(Debug, Default)]
pub struct LinkStats {
    pub frames: AtomicU64,
    pub acks: AtomicU64,
    pub malformed: AtomicU64,
    last_ack: Mutex<Option<String>>,
}

impl LinkStats {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn acks(&self) -> u64 {
        self.acks.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn last_ack(&self) -> Option<String> {
        self.last_ack.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// State shared between the link handle and its receiver thread
struct Shared {
    device: Mutex<Option<SocketAddr>>,
    device_port: u16,
    history: Mutex<VecDeque<TelemetryFrame>>,
    history_len: usize,
    stats: LinkStats,
    shutdown: AtomicBool,
}

impl Shared {
    fn device(&self) -> Option<SocketAddr> {
        *self.device.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// First non-loopback sender becomes the device; gains go to its IP on the configured port.
    fn learn_device(&self, from: SocketAddr) {
        if from.ip().is_loopback() {
            return;
        }
        let mut device = self.device.lock().unwrap_or_else(PoisonError::into_inner);
        if device.is_none() {
            let addr = SocketAddr::new(from.ip(), self.device_port);
            info!(target: "udp_link", "Discovered device at {} (gains will be sent to {})", from.ip(), addr);
            *device = Some(addr);
        }
    }

    fn push_history(&self, frame: TelemetryFrame) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        while history.len() >= self.history_len {
            history.pop_front();
        }
        history.push_back(frame);
    }
}

pub struct UdpTelemetryLink {
    socket: UdpSocket,
    shared: Arc<Shared>,
    readings: Receiver<Reading>,
    receiver: Option<JoinHandle<()>>,
}

impl UdpTelemetryLink {
    /// Bind using the resolved tuner settings.
    pub fn from_settings(settings: &TunerSettings) -> Result<Self> {
        Self::bind(
            settings.udp_bind,
            settings.device_addr,
            settings.device_port,
            settings.recv_timeout,
            settings.history_len,
        )
    }

    pub fn bind(
        bind_addr: SocketAddr,
        device: Option<SocketAddr>,
        device_port: u16,
        recv_timeout: Duration,
        history_len: usize,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)
            .map_err(|e| anyhow!("Failed to bind UDP socket on {}: {}", bind_addr, e))?;
        let rx_socket = socket.try_clone().context("Failed to clone UDP socket for receiver")?;
        // Zero would mean "block forever" and the receiver could never observe shutdown
        let timeout = recv_timeout.max(Duration::from_millis(1));
        rx_socket
            .set_read_timeout(Some(timeout))
            .context("Failed to set UDP read timeout")?;

        if let Some(addr) = device {
            info!(target: "udp_link", "Using configured device address {}", addr);
        }

        let shared = Arc::new(Shared {
            device: Mutex::new(device),
            device_port,
            history: Mutex::new(VecDeque::with_capacity(history_len)),
            history_len: history_len.max(1),
            stats: LinkStats::default(),
            shutdown: AtomicBool::new(false),
        });

        let (tx, rx) = bounded(READING_QUEUE_LEN);
        let shared_rx = Arc::clone(&shared);
        let overflow = rx.clone();
        let receiver = thread::Builder::new()
            .name("udp-telemetry".into())
            .spawn(move || receive_loop(rx_socket, shared_rx, tx, overflow))
            .context("Failed to spawn UDP receiver thread")?;

        info!(target: "udp_link", "Listening for telemetry on {}", socket.local_addr().unwrap_or(bind_addr));

        Ok(Self {
            socket,
            shared,
            readings: rx,
            receiver: Some(receiver),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stats(&self) -> &LinkStats {
        &self.shared.stats
    }

    /// Copy of the recent frames, oldest first.
    pub fn history(&self) -> Vec<TelemetryFrame> {
        self.shared
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    /// Block until the device is known or `timeout` elapses.
    pub fn wait_for_device(&self, timeout: Duration) -> Option<SocketAddr> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(addr) = self.shared.device() {
                return Some(addr);
            }
            if std::time::Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
}

impl TelemetryLink for UdpTelemetryLink {
    fn send_gains(&self, gains: &GainVector) {
        let Some(device) = self.shared.device() else {
            warn!(target: "udp_link", "Device address unknown, waiting for telemetry; dropped {}", gains.to_command());
            return;
        };
        let msg = gains.to_command();
        match self.socket.send_to(msg.as_bytes(), device) {
            Ok(_) => info!(target: "udp_link", "→ {} {}", device, msg),
            Err(e) => warn!(target: "udp_link", "Failed to send '{}' to {}: {}", msg, device, e),
        }
    }

    fn receive_latest(&self, timeout: Duration) -> Option<Reading> {
        self.readings.recv_timeout(timeout).ok()
    }

    fn discard_pending(&self) -> usize {
        self.readings.try_iter().count()
    }

    fn device(&self) -> Option<SocketAddr> {
        self.shared.device()
    }
}

impl Drop for UdpTelemetryLink {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }
    }
}

fn receive_loop(socket: UdpSocket, shared: Arc<Shared>, tx: Sender<Reading>, overflow: Receiver<Reading>) {
    debug!(target: "udp_link", "Receiver thread started");
    let mut buf = [0u8; MAX_DATAGRAM];
    while !shared.shutdown.load(Ordering::Relaxed) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => {
                debug!(target: "udp_link", "recv error: {}", e);
                continue;
            }
        };

        shared.learn_device(from);

        let text = String::from_utf8_lossy(&buf[..len]);
        match parse_datagram(&text) {
            Some(Datagram::Ack(ack)) => {
                shared.stats.acks.fetch_add(1, Ordering::Relaxed);
                info!(target: "udp_link", "Device acknowledged gains: {}", ack);
                *shared.stats.last_ack.lock().unwrap_or_else(PoisonError::into_inner) = Some(ack);
            }
            Some(Datagram::Frame(frame)) => {
                shared.stats.frames.fetch_add(1, Ordering::Relaxed);
                shared.push_history(frame);
                enqueue(&tx, &overflow, frame.angle);
            }
            None => {
                shared.stats.malformed.fetch_add(1, Ordering::Relaxed);
                debug!(target: "udp_link", "Dropped malformed datagram from {}: {:?}", from, text);
            }
        }
    }
    debug!(target: "udp_link", "Receiver thread stopped");
}

/// Queue a reading, evicting the oldest one when the queue is full.
fn enqueue(tx: &Sender<Reading>, overflow: &Receiver<Reading>, reading: Reading) {
    match tx.try_send(reading) {
        Ok(()) => {}
        Err(TrySendError::Full(r)) => {
            let _ = overflow.try_recv();
            let _ = tx.try_send(r);
        }
        Err(TrySendError::Disconnected(_)) => {}
    }
}

/// Outbound IPv4 address of this machine, for pointing the robot at the tuner.
/// Uses a connected UDP socket; nothing is transmitted.
pub fn local_ip_address() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("Failed to bind probe socket")?;
    socket
        .connect("8.8.8.8:80")
        .context("No route to an external network")?;
    let ip = socket.local_addr()?.ip();
    if ip.is_unspecified() {
        return Err(anyhow!("Could not determine local IP address"));
    }
    Ok(ip)
}
