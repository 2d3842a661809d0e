//! Platform-specific process management.
//!
//! The stale instance reaper needs four things from the OS: whether a pid is
//! alive, which pid listens on a loopback port, what that pid's command line
//! is, and a way to stop it. Everything that shells out or touches signals
//! lives here.

use crate::error::{RefIndexError, Result};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

/// Check if a process with the given PID is alive.
///
/// # Platform Behavior
/// - **Linux/macOS**: Uses `kill(pid, 0)` signal check
/// - **Windows**: Uses `OpenProcess` with `PROCESS_QUERY_LIMITED_INFORMATION`
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // The process exists but belongs to someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(windows)]
    {
        is_process_alive_windows(pid)
    }

    #[cfg(not(any(unix, windows)))]
    {
        warn!("Process alive check not implemented for this platform");
        true
    }
}

#[cfg(windows)]
#[allow(unsafe_code)]
fn is_process_alive_windows(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};

    // SAFETY: OpenProcess has no memory preconditions; the returned handle is
    // checked for null and closed exactly once.
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if !handle.is_null() {
            CloseHandle(handle);
            true
        } else {
            false
        }
    }
}

/// Terminate a process gracefully, then forcefully if needed.
///
/// # Platform Behavior
/// - **Linux/macOS**: Sends SIGTERM, waits up to `grace`, then SIGKILL
/// - **Windows**: Uses `taskkill /PID {pid} /F /T` to kill the process tree
///
/// # Returns
/// `true` if the process is gone afterwards (or wasn't running).
pub fn terminate_process(pid: u32, grace: Duration) -> Result<bool> {
    if !is_process_alive(pid) {
        debug!("Process {} is not running", pid);
        return Ok(true);
    }

    #[cfg(unix)]
    {
        terminate_process_unix(pid, grace)
    }

    #[cfg(windows)]
    {
        let _ = grace;
        terminate_process_windows(pid)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = grace;
        Err(RefIndexError::Other(
            "Process termination not implemented for this platform".into(),
        ))
    }
}

#[cfg(unix)]
fn terminate_process_unix(pid: u32, grace: Duration) -> Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag};
    use nix::unistd::Pid;
    use std::thread::sleep;

    let raw = i32::try_from(pid)
        .map_err(|_| RefIndexError::Other(format!("pid {} out of range", pid)))?;
    let nix_pid = Pid::from_raw(raw);

    debug!("Sending SIGTERM to process {}", pid);
    if let Err(e) = kill(nix_pid, Signal::SIGTERM) {
        if e == Errno::ESRCH {
            return Ok(true);
        }
        warn!("Failed to send SIGTERM to {}: {}", pid, e);
    }

    let wait_interval = Duration::from_millis(100);
    let iterations = (grace.as_millis() / 100).max(1);

    for _ in 0..iterations {
        sleep(wait_interval);
        // Reap our own children so they do not linger as zombies.
        let _ = waitpid(nix_pid, Some(WaitPidFlag::WNOHANG));
        if !is_process_alive(pid) {
            debug!("Process {} terminated gracefully", pid);
            return Ok(true);
        }
    }

    debug!("Process {} still running, sending SIGKILL", pid);
    if let Err(e) = kill(nix_pid, Signal::SIGKILL) {
        if e == Errno::ESRCH {
            return Ok(true);
        }
        return Err(RefIndexError::Other(format!(
            "Failed to kill process {}: {}",
            pid, e
        )));
    }

    sleep(Duration::from_millis(100));
    match waitpid(nix_pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(status) => debug!("Reaped process {}: {:?}", pid, status),
        Err(e) => {
            // ECHILD: not our child, init reaps it.
            if e != Errno::ECHILD {
                debug!("waitpid({}) failed: {}", pid, e);
            }
        }
    }

    Ok(!is_process_alive(pid))
}

#[cfg(windows)]
fn terminate_process_windows(pid: u32) -> Result<bool> {
    debug!("Terminating process {} with taskkill", pid);

    let output = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/F", "/T"])
        .output()
        .map_err(|e| RefIndexError::Other(format!("Failed to run taskkill: {}", e)))?;

    if output.status.success() {
        debug!("Process {} terminated successfully", pid);
        Ok(true)
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not found") || stderr.contains("not running") {
            Ok(true)
        } else {
            warn!("taskkill failed for {}: {}", pid, stderr);
            Ok(false)
        }
    }
}

/// Check whether something accepts TCP connections on `127.0.0.1:port`.
pub fn is_port_listening(port: u16, timeout: Duration) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, timeout).is_ok()
}

/// Resolve the pid of the process listening on a local TCP port.
///
/// # Platform Behavior
/// - **Linux**: socket inode from `/proc/net/tcp{,6}`, matched against
///   `/proc/*/fd`; falls back to `lsof`
/// - **macOS**: `lsof -nP -iTCP:{port} -sTCP:LISTEN -t`
/// - **Windows**: `netstat -ano`, filtered for `:{port}` in `LISTENING` state
///
/// Returns `None` when no listener is found or the lookup tool is missing.
pub fn find_listening_pid(port: u16) -> Option<u32> {
    #[cfg(target_os = "linux")]
    {
        if let Some(pid) = procfs::listening_pid(port) {
            return Some(pid);
        }
    }

    #[cfg(unix)]
    {
        let output = match Command::new("lsof")
            .args(["-nP", &format!("-iTCP:{}", port), "-sTCP:LISTEN", "-t"])
            .output()
        {
            Ok(o) => o,
            Err(e) => {
                debug!("Failed to run lsof: {}", e);
                return None;
            }
        };
        parse_lsof_pids(&String::from_utf8_lossy(&output.stdout))
    }

    #[cfg(windows)]
    {
        let output = match Command::new("cmd")
            .args(["/C", &format!("netstat -ano | findstr :{}", port)])
            .output()
        {
            Ok(o) => o,
            Err(e) => {
                debug!("Failed to run netstat: {}", e);
                return None;
            }
        };
        parse_netstat_pid(&String::from_utf8_lossy(&output.stdout), port)
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = port;
        None
    }
}

/// First pid printed by `lsof -t`.
#[cfg_attr(not(unix), allow(dead_code))]
fn parse_lsof_pids(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .next()
}

/// Pid of the `LISTENING` row whose local address ends in `:{port}`.
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_netstat_pid(stdout: &str, port: u16) -> Option<u32> {
    let suffix = format!(":{}", port);
    stdout.lines().find_map(|line| {
        let cols: Vec<&str> = line.split_whitespace().collect();
        // Proto  Local Address  Foreign Address  State  PID
        if cols.len() < 5 || !cols[3].eq_ignore_ascii_case("LISTENING") {
            return None;
        }
        if !cols[1].ends_with(&suffix) {
            return None;
        }
        cols.last()?.parse().ok()
    })
}

/// Full command line of a process, if it can be read.
///
/// # Platform Behavior
/// - **Linux**: `/proc/{pid}/cmdline`, falling back to `ps`
/// - **macOS**: Uses `ps -o args= -p {pid}`
/// - **Windows**: Uses `wmic process where processid={pid} get commandline`
pub fn process_command_line(pid: u32) -> Option<String> {
    #[cfg(target_os = "linux")]
    {
        if let Some(cmdline) = procfs::command_line(pid) {
            return Some(cmdline);
        }
    }

    #[cfg(unix)]
    let output = Command::new("ps")
        .args(["-o", "args=", "-p", &pid.to_string()])
        .output();

    #[cfg(windows)]
    let output = Command::new("wmic")
        .args([
            "process",
            "where",
            &format!("processid={}", pid),
            "get",
            "commandline",
            "/format:list",
        ])
        .output();

    #[cfg(not(any(unix, windows)))]
    let output: std::io::Result<std::process::Output> = Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "no process listing on this platform",
    ));

    let output = match output {
        Ok(o) => o,
        Err(e) => {
            debug!("Failed to read command line of {}: {}", pid, e);
            return None;
        }
    };
    if !output.status.success() {
        return None;
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let cmdline = stdout
        .lines()
        .map(|line| line.trim())
        .map(|line| line.strip_prefix("CommandLine=").unwrap_or(line))
        .find(|line| !line.is_empty())?;
    Some(cmdline.to_string())
}

#[cfg(target_os = "linux")]
mod procfs {
    use std::path::Path;

    const TCP_LISTEN: &str = "0A";

    /// Inodes of sockets listening on `port` in a `/proc/net/tcp` table.
    pub(super) fn listening_inodes(table: &str, port: u16) -> Vec<u64> {
        table
            .lines()
            .skip(1)
            .filter_map(|line| {
                let cols: Vec<&str> = line.split_whitespace().collect();
                // sl local_address rem_address st tx:rx tr:when retrnsmt uid timeout inode
                if cols.len() < 10 || cols[3] != TCP_LISTEN {
                    return None;
                }
                let (_, local_port) = cols[1].rsplit_once(':')?;
                if u16::from_str_radix(local_port, 16).ok()? != port {
                    return None;
                }
                cols[9].parse().ok().filter(|inode| *inode != 0)
            })
            .collect()
    }

    pub(super) fn listening_pid(port: u16) -> Option<u32> {
        let inodes: Vec<u64> = ["/proc/net/tcp", "/proc/net/tcp6"]
            .iter()
            .filter_map(|table| std::fs::read_to_string(table).ok())
            .flat_map(|table| listening_inodes(&table, port))
            .collect();
        if inodes.is_empty() {
            return None;
        }
        let wanted: Vec<String> = inodes.iter().map(|i| format!("socket:[{i}]")).collect();

        std::fs::read_dir("/proc")
            .ok()?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let pid: u32 = entry.file_name().to_str()?.parse().ok()?;
                owns_socket(&entry.path(), &wanted).then_some(pid)
            })
            .next()
    }

    fn owns_socket(proc_dir: &Path, wanted: &[String]) -> bool {
        let Ok(fds) = std::fs::read_dir(proc_dir.join("fd")) else {
            return false;
        };
        fds.filter_map(|fd| fd.ok())
            .filter_map(|fd| std::fs::read_link(fd.path()).ok())
            .any(|target| wanted.iter().any(|w| target.as_os_str() == w.as_str()))
    }

    pub(super) fn command_line(pid: u32) -> Option<String> {
        let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
        let args: Vec<String> = raw
            .split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect();
        (!args.is_empty()).then(|| args.join(" "))
    }
}
