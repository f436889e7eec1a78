//! Spawning strategies for the three child kinds.
//!
//! All children are spawned into their own process group so the kill
//! ladder reaches grandchildren (the consensus binary's ML helper in
//! particular).

use std::{process::Stdio, time::Duration};

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::{debug, warn};

use super::config::{ExecutableKind, ServiceConfig, StdioMode, resolve_interpreter};

/// Descriptor number the IPC channel occupies in interpreted children.
#[cfg(unix)]
pub const IPC_FD: i32 = 4;

/// Grace period between SIGTERM and SIGKILL when stopping a child.
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Bundled interpreter not found")]
    InterpreterNotFound,

    #[error("Failed to spawn '{0}': {1}")]
    Spawn(String, std::io::Error),

    #[error("Interpreted children are not supported on this platform")]
    UnsupportedPlatform,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A freshly spawned child plus, for interpreted kinds, the supervisor
/// side of its IPC socket.
pub struct Spawned {
    pub child: AsyncGroupChild,
    #[cfg(unix)]
    pub ipc: Option<tokio::net::UnixStream>,
}

/// Environment overlay injected into every port-requiring child: the
/// generic `PORT` plus the service-specific variable. This is the only
/// sanctioned port discovery mechanism.
pub fn port_environment(config: &ServiceConfig, port: Option<u16>) -> Vec<(String, String)> {
    let Some(port) = port else {
        return Vec::new();
    };
    vec![
        ("PORT".to_string(), port.to_string()),
        (config.port_env_var(), port.to_string()),
    ]
}

/// Argument list for a terminal-server child: listen port, loopback-only
/// bind, writable flag, then the command. With an initial command the
/// shell sleeps briefly (the webview needs a moment to attach), runs it,
/// then drops into an interactive shell.
pub fn terminal_server_args(config: &ServiceConfig, port: u16, shell: &str) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        port.to_string(),
        "-i".to_string(),
        "127.0.0.1".to_string(),
        "-W".to_string(),
    ];
    args.extend(config.args.iter().cloned());

    match &config.initial_command {
        Some(command) => {
            args.push("sh".to_string());
            args.push("-c".to_string());
            args.push(format!("sleep 0.5; {command}; exec {shell} -i"));
        }
        None => args.push(shell.to_string()),
    }
    args
}

pub fn spawn_child(config: &ServiceConfig, port: Option<u16>) -> Result<Spawned, SpawnError> {
    match config.kind {
        ExecutableKind::InterpretedScript => spawn_interpreted(config, port),
        ExecutableKind::NativeBinary => spawn_native(config, port),
        ExecutableKind::TerminalServer => spawn_terminal_server(config, port),
    }
}

fn apply_common(cmd: &mut Command, config: &ServiceConfig, port: Option<u16>) {
    cmd.args(&config.args);
    cmd.envs(config.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    cmd.envs(port_environment(config, port));
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }
}

#[cfg(unix)]
fn spawn_interpreted(config: &ServiceConfig, port: Option<u16>) -> Result<Spawned, SpawnError> {
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};

    let interpreter = resolve_interpreter().ok_or(SpawnError::InterpreterNotFound)?;

    // Both ends are close-on-exec; the dup2 below clears the flag on the
    // child's copy only, so unrelated children never inherit the socket.
    let (parent_fd, child_fd) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .map_err(std::io::Error::from)?;

    let mut cmd = Command::new(&interpreter);
    cmd.arg(&config.executable);
    apply_common(&mut cmd, config, port);
    cmd.env("LOOM_IPC_FD", IPC_FD.to_string());

    match config.stdio_mode {
        StdioMode::Inherit => {
            cmd.stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
        }
        StdioMode::PipeWithIpc => {
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());
        }
    }

    let raw_child_fd = child_fd.as_raw_fd();
    unsafe {
        cmd.pre_exec(move || {
            if raw_child_fd == IPC_FD {
                // dup2 onto itself leaves CLOEXEC set; clear it by hand.
                let flags = libc::fcntl(IPC_FD, libc::F_GETFD);
                if flags == -1
                    || libc::fcntl(IPC_FD, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1
                {
                    return Err(std::io::Error::last_os_error());
                }
            } else if libc::dup2(raw_child_fd, IPC_FD) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd
        .group_spawn()
        .map_err(|e| SpawnError::Spawn(config.executable.display().to_string(), e))?;
    drop(child_fd);

    if config.stdio_mode == StdioMode::PipeWithIpc {
        drain_stdio(&mut child, &config.name);
    }

    let std_stream: std::os::unix::net::UnixStream = parent_fd.into();
    std_stream.set_nonblocking(true)?;
    let stream = tokio::net::UnixStream::from_std(std_stream)?;

    Ok(Spawned {
        child,
        ipc: Some(stream),
    })
}

#[cfg(not(unix))]
fn spawn_interpreted(_config: &ServiceConfig, _port: Option<u16>) -> Result<Spawned, SpawnError> {
    Err(SpawnError::UnsupportedPlatform)
}

fn spawn_native(config: &ServiceConfig, port: Option<u16>) -> Result<Spawned, SpawnError> {
    let mut cmd = Command::new(&config.executable);
    apply_common(&mut cmd, config, port);
    // Inherited descriptors are how the binary's own subprocesses talk
    // to it; register() rejects any other stdio mode for this kind.
    cmd.stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let child = cmd
        .group_spawn()
        .map_err(|e| SpawnError::Spawn(config.executable.display().to_string(), e))?;

    Ok(Spawned {
        child,
        #[cfg(unix)]
        ipc: None,
    })
}

fn spawn_terminal_server(config: &ServiceConfig, port: Option<u16>) -> Result<Spawned, SpawnError> {
    let port = port.unwrap_or_default();
    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    let args = terminal_server_args(config, port, &shell);

    let mut cmd = Command::new(&config.executable);
    cmd.args(&args);
    cmd.envs(config.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    cmd.envs(port_environment(config, Some(port)));
    if let Some(dir) = &config.working_dir {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .group_spawn()
        .map_err(|e| SpawnError::Spawn(config.executable.display().to_string(), e))?;
    drain_stdio(&mut child, &config.name);

    Ok(Spawned {
        child,
        #[cfg(unix)]
        ipc: None,
    })
}

/// Forward a piped child's output into our log. Diagnostic only: no
/// readiness decision is ever made from these lines.
fn drain_stdio(child: &mut AsyncGroupChild, service: &str) {
    if let Some(stdout) = child.inner().stdout.take() {
        let service = service.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(service = %service, "stdout: {line}");
            }
        });
    }
    if let Some(stderr) = child.inner().stderr.take() {
        let service = service.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(service = %service, "stderr: {line}");
            }
        });
    }
}

/// Polite-then-forceful termination of a child's process group.
pub async fn kill_process_group(child: &mut AsyncGroupChild) {
    #[cfg(unix)]
    {
        use nix::{
            sys::signal::{Signal, killpg},
            unistd::{Pid, getpgid},
        };

        if let Some(pid) = child.inner().id() {
            let pgid = getpgid(Some(Pid::from_raw(pid as i32))).ok();
            for sig in [Signal::SIGTERM, Signal::SIGKILL] {
                if let Some(pgid) = pgid
                    && let Err(e) = killpg(pgid, sig)
                {
                    warn!("Failed to send {:?} to process group {}: {}", sig, pgid, e);
                }
                if tokio::time::timeout(STOP_GRACE, child.wait()).await.is_ok() {
                    return;
                }
            }
        }
    }

    // Always ensure we try to kill and wait, even if signalling failed.
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::supervisor::config::ExecutableKind;

    fn terminal_config() -> ServiceConfig {
        ServiceConfig::new("terminal-1", ExecutableKind::TerminalServer, "/opt/loom/bin/ttyd")
    }

    #[test]
    fn test_port_environment_sets_both_variables() {
        let config = ServiceConfig::new("memory-service", ExecutableKind::NativeBinary, "svc")
            .with_pool("memory-service");
        let env = port_environment(&config, Some(40100));
        assert!(env.contains(&("PORT".to_string(), "40100".to_string())));
        assert!(env.contains(&("MEMORY_SERVICE_PORT".to_string(), "40100".to_string())));
    }

    #[test]
    fn test_port_environment_empty_without_port() {
        let config = ServiceConfig::new("tools", ExecutableKind::NativeBinary, "svc");
        assert!(port_environment(&config, None).is_empty());
    }

    #[test]
    fn test_terminal_args_bind_loopback_writable() {
        let args = terminal_server_args(&terminal_config(), 40211, "/bin/zsh");
        assert_eq!(args[0..5], ["-p", "40211", "-i", "127.0.0.1", "-W"]);
        // No initial command: straight into the user's shell.
        assert_eq!(args.last().unwrap(), "/bin/zsh");
    }

    #[test]
    fn test_terminal_args_with_initial_command() {
        let config = terminal_config().with_initial_command("claude --continue");
        let args = terminal_server_args(&config, 40212, "/bin/bash");

        let script = args.last().unwrap();
        assert!(script.starts_with("sleep 0.5; "));
        assert!(script.contains("claude --continue"));
        assert!(script.ends_with("exec /bin/bash -i"));
        assert_eq!(args[args.len() - 3], "sh");
        assert_eq!(args[args.len() - 2], "-c");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_native_spawn_and_group_kill() {
        let config = ServiceConfig::new("sleeper", ExecutableKind::NativeBinary, "/bin/sleep")
            .with_args(["30"]);
        let mut spawned = spawn_child(&config, None).unwrap();
        assert!(spawned.child.inner().id().is_some());

        kill_process_group(&mut spawned.child).await;
        // After the ladder the child has been reaped.
        assert!(spawned.child.inner().try_wait().unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_missing_executable_fails() {
        let config = ServiceConfig::new(
            "ghost",
            ExecutableKind::NativeBinary,
            "/nonexistent/loom-backend",
        );
        assert!(matches!(
            spawn_child(&config, None),
            Err(SpawnError::Spawn(_, _))
        ));
    }
}
