use crate::paths::Paths;
use crate::process::ProcessError;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs;
use std::io;

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

pub fn parse_signal(name: &str) -> Result<Signal, ProcessError> {
    use std::str::FromStr;
    let upper = name.trim().to_uppercase();
    let normalized = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&normalized).map_err(|_| ProcessError::InvalidSignal(name.to_string()))
}

pub fn send_signal(pid: u32, sig: Signal) -> io::Result<()> {
    signal::kill(Pid::from_raw(pid as i32), sig).map_err(io::Error::other)
}

pub fn is_pid_alive(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

pub async fn signal_shutdown() {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut sigterm), Ok(mut sigint)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) else {
        tracing::warn!("could not install signal handlers, waiting for kill request only");
        std::future::pending::<()>().await;
        return;
    };

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

// ---------------------------------------------------------------------------
// Pid file
// ---------------------------------------------------------------------------

pub fn write_pid_file(paths: &Paths) -> io::Result<()> {
    fs::write(paths.pid_file(), std::process::id().to_string())
}

pub fn read_pid_file(paths: &Paths) -> Option<u32> {
    fs::read_to_string(paths.pid_file())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

pub fn remove_pid_file(paths: &Paths) {
    let _ = fs::remove_file(paths.pid_file());
}

pub fn is_daemon_running(paths: &Paths) -> bool {
    let Some(pid) = read_pid_file(paths) else {
        return false;
    };
    if is_pid_alive(pid) {
        return true;
    }
    // stale
    remove_pid_file(paths);
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal_variants() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("term").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("INT").unwrap(), Signal::SIGINT);
        assert_eq!(parse_signal("sigkill").unwrap(), Signal::SIGKILL);
    }

    #[test]
    fn test_parse_signal_invalid() {
        assert!(matches!(
            parse_signal("SIGNOPE"),
            Err(ProcessError::InvalidSignal(_))
        ));
    }

    #[test]
    fn test_write_and_read_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());

        write_pid_file(&paths).unwrap();
        assert_eq!(read_pid_file(&paths), Some(std::process::id()));
        assert!(is_daemon_running(&paths));

        remove_pid_file(&paths);
        assert_eq!(read_pid_file(&paths), None);
    }

    #[test]
    fn test_stale_pid_file_removed() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());

        fs::write(paths.pid_file(), "4294967").unwrap();
        assert!(!is_daemon_running(&paths));
        assert!(!paths.pid_file().exists());
    }
}
