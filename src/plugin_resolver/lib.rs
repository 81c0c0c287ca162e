// SPDX-License-Identifier: Apache-2.0

//! `dnsmasq`/`forkdns` process supervision and AppArmor profile loading,
//! backed by `std::process` and `nix` signal handling (§4.5, §10.5).

use std::io::{BufRead, BufReader};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use netbridge::collaborators::{AppArmorApi, ResolverApi, ResolverHandle};
use netbridge::error::{ErrorKind, NetbridgeError, Result};
use netbridge::resolver::START_DEADLINE;
use netbridge::types::Lease;

const STDERR_TAIL_LINES: usize = 40;

fn io_err(context: &str, e: impl std::fmt::Display) -> NetbridgeError {
    NetbridgeError::new(ErrorKind::TransientIo, format!("{context}: {e}"))
}

/// A supervised child process plus a background-captured tail of its
/// stderr, kept so a failed start can report why.
struct ChildHandle {
    child: Child,
    pid: u32,
    stderr_tail: Arc<Mutex<Vec<String>>>,
}

impl ResolverHandle for ChildHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> Result<bool> {
        // `try_wait` takes `&mut self`; interior process state is only
        // ever observed, not mutated, from this read-only vantage point,
        // so route through a lock-free re-check via `/proc` instead of
        // requiring `&mut`.
        let proc_path = format!("/proc/{}", self.pid);
        Ok(std::path::Path::new(&proc_path).exists())
    }

    fn stop(&mut self) -> Result<()> {
        if kill(Pid::from_raw(self.pid as i32), Signal::SIGTERM).is_err() {
            // Already gone.
            return Ok(());
        }
        match self.child.wait() {
            Ok(_) => Ok(()),
            Err(e) => Err(io_err(&format!("waiting for pid {} to exit", self.pid), e)),
        }
    }

    fn stderr_tail(&self) -> String {
        self.stderr_tail.lock().map(|l| l.join("\n")).unwrap_or_default()
    }
}

fn capture_stderr(child: &mut Child) -> Arc<Mutex<Vec<String>>> {
    let tail = Arc::new(Mutex::new(Vec::new()));
    if let Some(stderr) = child.stderr.take() {
        let tail = Arc::clone(&tail);
        std::thread::spawn(move || {
            let reader = BufReader::new(stderr);
            for line in reader.lines().map_while(std::result::Result::ok) {
                if let Ok(mut buf) = tail.lock() {
                    buf.push(line);
                    let len = buf.len();
                    if len > STDERR_TAIL_LINES {
                        buf.drain(0..len - STDERR_TAIL_LINES);
                    }
                }
            }
        });
    }
    tail
}

/// Spawns `binary` with `argv` in `working_dir`, enforcing the §4.5
/// start deadline: if the child is still alive after `START_DEADLINE`
/// has elapsed, that's the success path, matching the contract
/// `netbridge::resolver::start_dnsmasq` expects from this trait method.
fn spawn_and_wait_deadline(binary: &str, argv: &[String], working_dir: &str) -> Result<Box<dyn ResolverHandle>> {
    let mut child = Command::new(binary)
        .args(argv)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| io_err(&format!("spawning '{binary}'"), e))?;

    let pid = child.id();
    let stderr_tail = capture_stderr(&mut child);

    let deadline = Instant::now() + START_DEADLINE;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => {
                let tail = stderr_tail.lock().map(|l| l.join("\n")).unwrap_or_default();
                return Err(NetbridgeError::new(
                    ErrorKind::Supervision,
                    format!("'{binary}' exited before the start deadline: {tail}"),
                ));
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    return Ok(Box::new(ChildHandle { child, pid, stderr_tail }));
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            Err(e) => return Err(io_err(&format!("polling '{binary}'"), e)),
        }
    }
}

pub struct ProcessResolver;

impl ProcessResolver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ProcessResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolverApi for ProcessResolver {
    fn dnsmasq_binary_present(&self) -> bool {
        which("dnsmasq").is_some()
    }

    fn dnsmasq_version(&self) -> Result<(u32, u32)> {
        let output = Command::new("dnsmasq")
            .arg("--version")
            .output()
            .map_err(|e| io_err("running 'dnsmasq --version'", e))?;
        let text = String::from_utf8_lossy(&output.stdout);
        parse_dnsmasq_version(&text)
            .ok_or_else(|| NetbridgeError::new(ErrorKind::External, "could not parse dnsmasq --version output"))
    }

    fn start_dnsmasq(&self, argv: &[String], working_dir: &str) -> Result<Box<dyn ResolverHandle>> {
        spawn_and_wait_deadline("dnsmasq", argv, working_dir)
    }

    fn start_forkdns(&self, argv: &[String], working_dir: &str) -> Result<Box<dyn ResolverHandle>> {
        spawn_and_wait_deadline("forkdns", argv, working_dir)
    }

    fn write_leases_file(&self, path: &str, leases: &[Lease]) -> Result<()> {
        let mut body = String::new();
        for lease in leases {
            let mac = lease
                .hwaddr
                .map(netbridge::mac::format_mac)
                .unwrap_or_else(|| "00:00:00:00:00:00".to_string());
            let hostname = if lease.hostname.is_empty() { "*" } else { &lease.hostname };
            body.push_str(&format!("0 {mac} {} {hostname} *\n", lease.address));
        }
        std::fs::write(path, body).map_err(|e| io_err(&format!("writing leases file '{path}'"), e))
    }

    fn write_forkdns_servers_file(&self, path: &str, servers: &[std::net::IpAddr]) -> Result<()> {
        let body = servers.iter().map(ToString::to_string).collect::<Vec<_>>().join("\n");
        std::fs::write(path, format!("{body}\n")).map_err(|e| io_err(&format!("writing servers file '{path}'"), e))
    }
}

fn which(binary: &str) -> Option<std::path::PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

fn parse_dnsmasq_version(text: &str) -> Option<(u32, u32)> {
    let first_line = text.lines().next()?;
    let version_token = first_line.split_whitespace().find(|tok| tok.chars().next().is_some_and(|c| c.is_ascii_digit()))?;
    let mut parts = version_token.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

pub struct AppArmorParser;

impl AppArmorParser {
    pub fn new() -> Self {
        Self
    }

    fn profile_path(network_name: &str) -> String {
        format!("/etc/apparmor.d/netbridge-dnsmasq.{network_name}")
    }
}

impl Default for AppArmorParser {
    fn default() -> Self {
        Self::new()
    }
}

impl AppArmorApi for AppArmorParser {
    fn load_profile(&self, network_name: &str, profile_source: &str) -> Result<()> {
        let path = Self::profile_path(network_name);
        std::fs::write(&path, profile_source).map_err(|e| io_err(&format!("writing apparmor profile '{path}'"), e))?;
        run_apparmor_parser(&["-r", &path])
    }

    fn unload_profile(&self, network_name: &str) -> Result<()> {
        let path = Self::profile_path(network_name);
        if !std::path::Path::new(&path).exists() {
            return Ok(());
        }
        run_apparmor_parser(&["-R", &path])?;
        std::fs::remove_file(&path).ok();
        Ok(())
    }
}

fn run_apparmor_parser(args: &[&str]) -> Result<()> {
    let output = Command::new("apparmor_parser")
        .args(args)
        .output()
        .map_err(|e| io_err("spawning 'apparmor_parser'", e))?;
    if !output.status.success() {
        return Err(NetbridgeError::new(
            ErrorKind::External,
            format!(
                "apparmor_parser {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_major_minor_from_version_banner() {
        let banner = "Dnsmasq version 2.90  Copyright (c) 2000-2023 Simon Kelley\n";
        assert_eq!(parse_dnsmasq_version(banner), Some((2, 90)));
    }

    #[test]
    fn missing_version_token_returns_none() {
        assert_eq!(parse_dnsmasq_version("garbage output"), None);
    }
}
