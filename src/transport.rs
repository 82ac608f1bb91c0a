use log::{debug, info};
use std::io::{self, Write};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Write side of the device link. The engine holds one behind an `Arc`
/// and calls `send` from its output thread, so implementations must be
/// callable from any thread.
pub trait Transport: Send + Sync {
    /// Write one newline-terminated command line.
    fn send(&self, line: &str) -> Result<(), String>;
    fn is_connected(&self) -> bool;
    fn disconnect(&self);
}

/// Transport that is never connected. The engine idles until a real one
/// is installed.
pub struct NullTransport;

impl Transport for NullTransport {
    fn send(&self, _line: &str) -> Result<(), String> {
        Err("no transport connected".into())
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn disconnect(&self) {}
}

// ─── UDP ────────────────────────────────────────────────────────────────────

/// Sends each command line as one datagram (network-attached devices).
pub struct UdpTransport {
    socket: Mutex<Option<UdpSocket>>,
    target: String,
}

impl UdpTransport {
    pub fn connect(target: &str) -> Result<Self, String> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .map_err(|e| format!("Failed to bind UDP socket: {}", e))?;
        socket
            .connect(target)
            .map_err(|e| format!("Failed to connect UDP socket to {}: {}", target, e))?;
        info!("UDP transport → {}", target);
        Ok(Self {
            socket: Mutex::new(Some(socket)),
            target: target.to_string(),
        })
    }
}

impl Transport for UdpTransport {
    fn send(&self, line: &str) -> Result<(), String> {
        let guard = self.socket.lock().unwrap_or_else(|e| e.into_inner());
        let socket = guard.as_ref().ok_or("UDP transport disconnected")?;
        socket
            .send(line.as_bytes())
            .map(|_| ())
            .map_err(|e| format!("UDP send to {} failed: {}", self.target, e))
    }

    fn is_connected(&self) -> bool {
        self.socket
            .lock()
            .map(|s| s.is_some())
            .unwrap_or(false)
    }

    fn disconnect(&self) {
        let mut guard = self.socket.lock().unwrap_or_else(|e| e.into_inner());
        if guard.take().is_some() {
            info!("UDP transport to {} closed", self.target);
        }
    }
}

// ─── Console (dry run) ──────────────────────────────────────────────────────

/// Prints each line to stdout instead of driving a device.
pub struct ConsoleTransport {
    connected: AtomicBool,
    lines: AtomicU64,
}

impl ConsoleTransport {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            lines: AtomicU64::new(0),
        }
    }

    pub fn lines_sent(&self) -> u64 {
        self.lines.load(Ordering::Relaxed)
    }
}

impl Default for ConsoleTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for ConsoleTransport {
    fn send(&self, line: &str) -> Result<(), String> {
        if !self.is_connected() {
            return Err("console transport disconnected".into());
        }
        let mut stdout = io::stdout().lock();
        stdout
            .write_all(line.as_bytes())
            .and_then(|_| stdout.flush())
            .map_err(|e| format!("stdout write error: {}", e))?;
        self.lines.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::Relaxed) {
            debug!("Console transport closed after {} lines", self.lines_sent());
        }
    }
}

// ─── Serial ─────────────────────────────────────────────────────────────────

/// USB serial link to the device (115200 8N1).
#[cfg(feature = "hardware")]
pub struct SerialTransport {
    port: Mutex<Option<Box<dyn serialport::SerialPort>>>,
    port_name: String,
}

#[cfg(feature = "hardware")]
impl SerialTransport {
    pub const BAUD_RATE: u32 = 115_200;

    pub fn open(port_name: &str) -> Result<Self, String> {
        info!(
            "Opening serial port {} at {} baud",
            port_name,
            Self::BAUD_RATE
        );
        let port = serialport::new(port_name, Self::BAUD_RATE)
            .timeout(std::time::Duration::from_millis(100))
            .open()
            .map_err(|e| format!("Failed to open serial port {}: {}", port_name, e))?;
        Ok(Self {
            port: Mutex::new(Some(port)),
            port_name: port_name.to_string(),
        })
    }
}

#[cfg(feature = "hardware")]
impl Transport for SerialTransport {
    fn send(&self, line: &str) -> Result<(), String> {
        let mut guard = self.port.lock().unwrap_or_else(|e| e.into_inner());
        let port = guard.as_mut().ok_or("serial port closed")?;
        if let Err(e) = port.write_all(line.as_bytes()) {
            log::warn!("Serial write error on {}: {}", self.port_name, e);
            if e.kind() == io::ErrorKind::BrokenPipe {
                guard.take();
            }
            return Err(format!("Serial write error: {}", e));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port
            .lock()
            .map(|p| p.is_some())
            .unwrap_or(false)
    }

    fn disconnect(&self) {
        let mut guard = self.port.lock().unwrap_or_else(|e| e.into_inner());
        if guard.take().is_some() {
            info!("Serial port {} closed", self.port_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_transport_is_disconnected() {
        let t = NullTransport;
        assert!(!t.is_connected());
        assert!(t.send("L0500I10\n").is_err());
    }

    #[test]
    fn test_console_disconnect() {
        let t = ConsoleTransport::new();
        assert!(t.is_connected());
        t.disconnect();
        assert!(!t.is_connected());
        assert!(t.send("L0500I10\n").is_err());
        assert_eq!(t.lines_sent(), 0);
    }

    #[test]
    fn test_udp_delivers_line_as_datagram() {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        rx.set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let addr = rx.local_addr().unwrap().to_string();

        let t = UdpTransport::connect(&addr).unwrap();
        assert!(t.is_connected());
        t.send("L0499I10 R2374I10\n").unwrap();

        let mut buf = [0u8; 64];
        let n = rx.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"L0499I10 R2374I10\n");

        t.disconnect();
        assert!(!t.is_connected());
        assert!(t.send("L0500I10\n").is_err());
    }
}
