//! Process deployer
//!
//! Grid Servers as plain OS processes launched from a configured executable.

use grid_core::random::Random;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{DeployError, Result};
use crate::net::{self, TcpHealthCheck};
use crate::ports::PortAllocator;

/// Launch and readiness settings
#[derive(Debug, Clone)]
pub struct ProcessDeployerSettings {
    pub executable_path: PathBuf,
    /// `{port}` is replaced with the allocated port
    pub argument_template: String,
    pub start_attempts: u32,
    pub sleep_interval: Duration,
    pub connect_timeout: Duration,
}

impl ProcessDeployerSettings {
    /// Arguments for a server bound to `port`
    pub fn arguments(&self, port: u16) -> Vec<String> {
        self.argument_template
            .split_whitespace()
            .map(|arg| arg.replace("{port}", &port.to_string()))
            .collect()
    }

    fn executable_name(&self) -> Option<String> {
        self.executable_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    }
}

/// OS handle of one Grid Server process
#[derive(Debug)]
pub struct GridServerProcess {
    pid: i32,
    port: u16,
    /// Present only for processes launched by this arbiter
    child: Mutex<Option<Child>>,
    disposed: AtomicBool,
}

impl GridServerProcess {
    fn launched(pid: i32, port: u16, child: Child) -> Self {
        Self {
            pid,
            port,
            child: Mutex::new(Some(child)),
            disposed: AtomicBool::new(false),
        }
    }

    fn discovered(pid: i32, port: u16) -> Self {
        Self {
            pid,
            port,
            child: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.port))
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Returns true while the process is running
    pub fn is_open(&self) -> bool {
        if self.is_disposed() {
            return false;
        }

        if let Some(child) = self.child.lock().unwrap().as_mut() {
            return matches!(child.try_wait(), Ok(None));
        }

        net::process_exists(self.pid)
    }

    /// Sends SIGKILL and reaps the child if we own it
    pub fn kill(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(child) = self.child.lock().unwrap().as_mut() {
            if let Err(e) = child.start_kill() {
                debug!("Kill. start_kill failed for pid {}: {}", self.pid, e);
            }
            let _ = child.try_wait();
            return Ok(());
        }

        match signal::kill(Pid::from_raw(self.pid), Signal::SIGKILL) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(DeployError::Launch(format!(
                "Failed to kill pid {}: {}",
                self.pid, e
            ))),
        }
    }
}

/// Launches, tracks and kills Grid Server processes
pub struct ProcessDeployer {
    settings: ProcessDeployerSettings,
    ports: Arc<PortAllocator>,
    random: Arc<dyn Random>,
    processes: Mutex<HashMap<u16, Arc<GridServerProcess>>>,
}

impl ProcessDeployer {
    pub fn new(
        settings: ProcessDeployerSettings,
        ports: Arc<PortAllocator>,
        random: Arc<dyn Random>,
    ) -> Self {
        Self {
            settings,
            ports,
            random,
            processes: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &ProcessDeployerSettings {
        &self.settings
    }

    /// Launches a Grid Server and waits for its port to accept connections
    ///
    /// # Arguments
    /// * `port` - Port to bind; allocated when `None`
    ///
    /// # Returns
    /// The running process, or why it could not be started
    pub async fn create_process(&self, port: Option<u16>) -> Result<Arc<GridServerProcess>> {
        let port = match port {
            Some(port) => port,
            None => self.ports.find_next_available_port()?,
        };

        let arguments = self.settings.arguments(port);
        info!(
            "CreateProcess. Launching {} {:?}",
            self.settings.executable_path.display(),
            arguments
        );

        let child = Command::new(&self.settings.executable_path)
            .args(&arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| DeployError::Launch(format!("Failed to spawn process: {}", e)))?;

        let pid = child
            .id()
            .ok_or_else(|| DeployError::Launch("Process exited before reporting a pid".to_string()))?
            as i32;

        let process = Arc::new(GridServerProcess::launched(pid, port, child));

        let health = TcpHealthCheck::new(
            "127.0.0.1",
            port,
            self.settings.start_attempts,
            self.settings.sleep_interval,
            self.settings.connect_timeout,
        );

        if !health.is_alive_while(|| process.is_open()).await {
            if !process.is_open() {
                warn!(
                    "CreateProcess. Process {} exited before accepting connections on port {}",
                    pid, port
                );
                let _ = process.kill();
                return Err(DeployError::Launch(format!(
                    "Process {} exited before accepting connections",
                    pid
                )));
            }

            warn!(
                "CreateProcess. Process {} on port {} never accepted connections, killing it",
                pid, port
            );
            let _ = process.kill();
            return Err(DeployError::NotReady {
                port,
                attempts: self.settings.start_attempts,
            });
        }

        self.processes.lock().unwrap().insert(port, process.clone());
        info!("CreateProcess. Grid Server pid {} ready on port {}", pid, port);

        Ok(process)
    }

    pub fn get_process(&self, port: u16) -> Option<Arc<GridServerProcess>> {
        self.processes.lock().unwrap().get(&port).cloned()
    }

    pub fn get_process_by_pid(&self, pid: i32) -> Option<Arc<GridServerProcess>> {
        self.processes
            .lock()
            .unwrap()
            .values()
            .find(|p| p.pid() == pid)
            .cloned()
    }

    /// Picks any tracked process
    pub fn get_random_process(&self) -> Option<Arc<GridServerProcess>> {
        let processes = self.processes.lock().unwrap();
        if processes.is_empty() {
            return None;
        }
        let index = self.random.next_i64_in(0, processes.len() as i64) as usize;
        processes.values().nth(index).cloned()
    }

    pub fn process_count(&self) -> usize {
        self.processes.lock().unwrap().len()
    }

    /// Kills and forgets a process
    pub fn kill(&self, process: &GridServerProcess) -> Result<()> {
        self.processes.lock().unwrap().remove(&process.port());
        self.ports.remove_port_from_cache_if_exists(process.port());
        process.kill()
    }

    /// Kills the process on `port`; false when none is tracked
    pub fn kill_process(&self, port: u16) -> Result<bool> {
        match self.get_process(port) {
            Some(process) => self.kill(&process).map(|_| true),
            None => Ok(false),
        }
    }

    pub fn kill_process_by_pid(&self, pid: i32) -> Result<bool> {
        match self.get_process_by_pid(pid) {
            Some(process) => self.kill(&process).map(|_| true),
            None => Ok(false),
        }
    }

    /// Registers Grid Server processes already listening in the port range
    ///
    /// A listener counts when its owning process runs the configured
    /// executable.
    pub fn discover_processes(&self) -> Vec<Arc<GridServerProcess>> {
        let range = self.ports.settings().range.clone();
        let executable = self.settings.executable_name();
        let mut discovered = Vec::new();

        for (port, inode) in net::listening_ports() {
            if !range.contains(&port) || self.get_process(port).is_some() {
                continue;
            }

            let Some(pid) = net::pid_owning_inode(inode) else {
                continue;
            };

            // comm is truncated to 15 bytes
            let matches = match (&executable, net::process_name(pid)) {
                (Some(exe), Some(name)) => !name.is_empty() && exe.starts_with(&name),
                _ => false,
            };
            if !matches {
                continue;
            }

            let process = Arc::new(GridServerProcess::discovered(pid, port));
            self.processes.lock().unwrap().insert(port, process.clone());
            discovered.push(process);
        }

        info!("DiscoverProcesses. Found {} running Grid Server processes", discovered.len());
        discovered
    }

    /// Kills every tracked process, returning how many were killed
    pub fn kill_all(&self) -> usize {
        let processes: Vec<_> = self.processes.lock().unwrap().drain().map(|(_, p)| p).collect();
        let mut killed = 0;

        for process in processes {
            match process.kill() {
                Ok(()) => killed += 1,
                Err(e) => warn!("KillAll. {}", e),
            }
        }

        killed
    }
}
