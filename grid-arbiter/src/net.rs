//! TCP table and health probe
//!
//! - `listening_ports` / `pid_listening_on`: read `/proc/net/tcp{,6}` and map
//!   a listening port back to the process owning the socket
//! - `TcpHealthCheck`: raw TCP connect probe with a bounded attempt count

use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

const TCP_LISTEN_STATE: &str = "0A";
const TCP_TABLES: [&str; 2] = ["/proc/net/tcp", "/proc/net/tcp6"];

// =============================================================================
// /proc TCP table
// =============================================================================

/// Parses one `/proc/net/tcp` table into `port -> socket inode` for listeners
pub fn parse_listeners(table: &str) -> HashMap<u16, u64> {
    let mut listeners = HashMap::new();

    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 || fields[3] != TCP_LISTEN_STATE {
            continue;
        }

        let Some(port_hex) = fields[1].rsplit(':').next() else {
            continue;
        };
        let (Ok(port), Ok(inode)) = (u16::from_str_radix(port_hex, 16), fields[9].parse::<u64>())
        else {
            continue;
        };

        listeners.insert(port, inode);
    }

    listeners
}

/// All listening TCP ports on this host, keyed to their socket inode
pub fn listening_ports() -> HashMap<u16, u64> {
    let mut listeners = HashMap::new();
    for table in TCP_TABLES {
        if let Ok(content) = std::fs::read_to_string(table) {
            listeners.extend(parse_listeners(&content));
        }
    }
    listeners
}

/// Finds the process holding the socket with the given inode
pub fn pid_owning_inode(inode: u64) -> Option<i32> {
    let needle = format!("socket:[{}]", inode);

    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<i32>().ok()) else {
            continue;
        };

        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };

        for fd in fds.flatten() {
            if let Ok(target) = std::fs::read_link(fd.path()) {
                if target.to_string_lossy() == needle {
                    return Some(pid);
                }
            }
        }
    }

    None
}

/// Process id of the listener on `port`, if any
pub fn pid_listening_on(port: u16) -> Option<i32> {
    let inode = *listening_ports().get(&port)?;
    pid_owning_inode(inode)
}

/// Returns true while `/proc/{pid}` exists
pub fn process_exists(pid: i32) -> bool {
    std::path::Path::new(&format!("/proc/{}", pid)).exists()
}

/// Short executable name of a process (`/proc/{pid}/comm`)
pub fn process_name(pid: i32) -> Option<String> {
    std::fs::read_to_string(format!("/proc/{}/comm", pid))
        .ok()
        .map(|s| s.trim().to_string())
}

// =============================================================================
// Health probe
// =============================================================================

/// Raw TCP connect probe
///
/// The RPC layer may not answer yet while a Grid Server boots, so liveness is
/// judged by whether the port accepts connections.
#[derive(Debug, Clone)]
pub struct TcpHealthCheck {
    host: String,
    port: u16,
    attempts: u32,
    sleep_interval: Duration,
    connect_timeout: Duration,
}

impl TcpHealthCheck {
    /// Creates a new probe
    ///
    /// # Arguments
    /// * `host` - Host to connect to
    /// * `port` - Port to connect to
    /// * `attempts` - Connect attempts before giving up
    /// * `sleep_interval` - Delay between failed attempts
    /// * `connect_timeout` - Bound on each connect attempt
    pub fn new(
        host: impl Into<String>,
        port: u16,
        attempts: u32,
        sleep_interval: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            attempts,
            sleep_interval,
            connect_timeout,
        }
    }

    /// Makes one connect attempt
    pub async fn try_connect(&self) -> bool {
        matches!(
            tokio::time::timeout(
                self.connect_timeout,
                TcpStream::connect((self.host.as_str(), self.port))
            )
            .await,
            Ok(Ok(_))
        )
    }

    /// Probes until the port accepts a connection or attempts run out
    pub async fn is_alive(&self) -> bool {
        self.is_alive_while(|| true).await
    }

    /// Like `is_alive`, but gives up as soon as `still_running` turns false
    pub async fn is_alive_while(&self, still_running: impl Fn() -> bool) -> bool {
        for attempt in 1..=self.attempts {
            if self.try_connect().await {
                debug!(
                    "TcpHealthCheck. {}:{} is accepting connections after {} attempt(s)",
                    self.host, self.port, attempt
                );
                return true;
            }

            if !still_running() {
                debug!(
                    "TcpHealthCheck. Owner of {}:{} went away after {} attempt(s)",
                    self.host, self.port, attempt
                );
                return false;
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.sleep_interval).await;
            }
        }

        debug!(
            "TcpHealthCheck. {}:{} did not accept connections after {} attempts",
            self.host, self.port, self.attempts
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;

    const TABLE: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:AFC8 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 31337 1 0000000000000000 100 0 0 10 0
   1: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 4242 1 0000000000000000 100 0 0 10 0
   2: 0100007F:AFC9 0100007F:D431 01 00000000:00000000 00:00000000 00000000  1000        0 5555 1 0000000000000000 20 4 30 10 -1
";

    #[test]
    fn test_parse_listeners_skips_non_listening_sockets() {
        let listeners = parse_listeners(TABLE);

        assert_eq!(listeners.len(), 2);
        assert_eq!(listeners.get(&45000), Some(&31337));
        assert_eq!(listeners.get(&8080), Some(&4242));
        assert!(!listeners.contains_key(&45001));
    }

    #[tokio::test]
    async fn test_health_check_detects_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let check = TcpHealthCheck::new("127.0.0.1", port, 3, Duration::from_millis(10), Duration::from_secs(1));
        assert!(check.is_alive().await);
    }

    #[tokio::test]
    async fn test_health_check_gives_up_after_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let check = TcpHealthCheck::new("127.0.0.1", port, 2, Duration::from_millis(10), Duration::from_millis(200));
        assert!(!check.is_alive().await);
    }

    #[tokio::test]
    async fn test_health_check_stops_when_owner_is_gone() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let checks = AtomicU32::new(0);
        let check = TcpHealthCheck::new("127.0.0.1", port, 100, Duration::from_millis(10), Duration::from_millis(200));
        let alive = check
            .is_alive_while(|| checks.fetch_add(1, Ordering::SeqCst) < 1)
            .await;

        assert!(!alive);
        assert_eq!(checks.load(Ordering::SeqCst), 2);
    }
}
