use std::collections::HashSet;
use std::fmt;

#[cfg(target_os = "linux")]
use anyhow::Context;
use anyhow::{bail, Result};
#[cfg(target_os = "linux")]
use tracing::debug;
use tracing::warn;

use crate::config::DiscoveryConfig;

/// How a monitored service was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// A running systemd service, identified by its unit name.
    SystemdUnit,
    /// A plain process, identified by its comm name.
    Process,
}

impl ServiceKind {
    /// Returns the kind label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SystemdUnit => "systemd",
            Self::Process => "process",
        }
    }
}

/// One monitored service for the current cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceIdentity {
    pub name: String,
    pub pid: u32,
    pub kind: ServiceKind,
}

impl ServiceIdentity {
    pub fn new(name: impl Into<String>, pid: u32, kind: ServiceKind) -> Self {
        Self {
            name: name.into(),
            pid,
            kind,
        }
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name, self.pid)
    }
}

/// Service discovery trait, called once per sampling cycle.
pub trait Discovery: Send + Sync {
    /// Enumerate the services to sample.
    fn discover(&self) -> Result<Vec<ServiceIdentity>>;
}

/// Composite discovery combining systemd, process-name and cgroup sources.
pub struct CompositeDiscovery {
    systemd: Option<SystemdDiscovery>,
    process_names: Vec<String>,
    cgroup_path: String,
}

impl CompositeDiscovery {
    /// Create a new composite discovery from config.
    pub fn new(cfg: &DiscoveryConfig) -> Self {
        let systemd = cfg
            .systemd
            .then(|| SystemdDiscovery::new(cfg.exclude_prefixes.clone()));

        Self {
            systemd,
            process_names: cfg.process_names.clone(),
            cgroup_path: cfg.cgroup_path.clone(),
        }
    }

    /// Number of enabled sources.
    fn source_count(&self) -> usize {
        usize::from(self.systemd.is_some())
            + usize::from(!self.process_names.is_empty())
            + usize::from(!self.cgroup_path.is_empty())
    }
}

impl Discovery for CompositeDiscovery {
    fn discover(&self) -> Result<Vec<ServiceIdentity>> {
        let sources = self.source_count();
        if sources == 0 {
            bail!("no discovery source enabled");
        }

        let mut seen = HashSet::with_capacity(64);
        let mut result = Vec::with_capacity(64);
        let mut failures = Vec::new();

        let mut merge = |label: &str, found: Result<Vec<ServiceIdentity>>| match found {
            Ok(services) => {
                for svc in services {
                    if seen.insert(svc.pid) {
                        result.push(svc);
                    }
                }
            }
            Err(e) => {
                warn!(source = label, error = %e, "service discovery source failed");
                failures.push(format!("{label}: {e:#}"));
            }
        };

        if let Some(systemd) = &self.systemd {
            merge("systemd", systemd.discover());
        }
        if !self.process_names.is_empty() {
            merge("process", discover_by_process_name(&self.process_names));
        }
        if !self.cgroup_path.is_empty() {
            merge("cgroup", discover_by_cgroup(&self.cgroup_path));
        }

        if failures.len() == sources {
            bail!("all discovery sources failed: {}", failures.join("; "));
        }

        Ok(result)
    }
}

/// Enumerates running systemd services through `systemctl`.
pub struct SystemdDiscovery {
    exclude_prefixes: Vec<String>,
}

impl SystemdDiscovery {
    pub fn new(exclude_prefixes: Vec<String>) -> Self {
        Self { exclude_prefixes }
    }

    fn is_excluded(&self, unit: &str) -> bool {
        self.exclude_prefixes
            .iter()
            .any(|prefix| unit.starts_with(prefix.as_str()))
    }

    /// Turns `systemctl show -p Id -p MainPID` output into identities.
    ///
    /// Property blocks are separated by blank lines. Units without a main
    /// process (MainPID=0) or with an unparseable pid are skipped.
    pub fn parse_show_output(&self, text: &str) -> Vec<ServiceIdentity> {
        let mut services = Vec::new();

        for block in text.split("\n\n") {
            let mut id = None;
            let mut main_pid = None;

            for line in block.lines() {
                match line.trim().split_once('=') {
                    Some(("Id", v)) => id = Some(v.trim()),
                    Some(("MainPID", v)) => main_pid = Some(v.trim()),
                    _ => {}
                }
            }

            let (Some(id), Some(main_pid)) = (id, main_pid) else {
                continue;
            };

            if id.is_empty() || self.is_excluded(id) {
                continue;
            }

            match main_pid.parse::<u32>() {
                Ok(0) => {}
                Ok(pid) => services.push(ServiceIdentity::new(id, pid, ServiceKind::SystemdUnit)),
                Err(_) => warn!(unit = id, main_pid, "unparseable MainPID"),
            }
        }

        services
    }

    #[cfg(target_os = "linux")]
    fn run_systemctl(args: &[&str]) -> Result<String> {
        let output = std::process::Command::new("systemctl")
            .args(args)
            .output()
            .context("running systemctl")?;

        if !output.status.success() {
            bail!(
                "systemctl {} exited with {}: {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
            );
        }

        String::from_utf8(output.stdout).context("decoding systemctl output")
    }
}

/// Extracts unit names from `systemctl list-units --plain --no-legend` output.
pub fn parse_list_units(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|unit| unit.ends_with(".service"))
        .map(str::to_string)
        .collect()
}

impl Discovery for SystemdDiscovery {
    #[cfg(target_os = "linux")]
    fn discover(&self) -> Result<Vec<ServiceIdentity>> {
        let listing = Self::run_systemctl(&[
            "list-units",
            "--type=service",
            "--state=running",
            "--plain",
            "--no-legend",
            "--no-pager",
        ])?;

        let units: Vec<String> = parse_list_units(&listing)
            .into_iter()
            .filter(|u| !self.is_excluded(u))
            .collect();

        if units.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["show", "-p", "Id", "-p", "MainPID", "--"];
        args.extend(units.iter().map(String::as_str));
        let show = Self::run_systemctl(&args)?;

        let services = self.parse_show_output(&show);
        debug!(count = services.len(), "discovered systemd services");

        Ok(services)
    }

    #[cfg(not(target_os = "linux"))]
    fn discover(&self) -> Result<Vec<ServiceIdentity>> {
        warn!("systemd discovery is only supported on Linux");
        Ok(Vec::new())
    }
}

/// Scan /proc for processes matching the given names.
#[cfg(target_os = "linux")]
fn discover_by_process_name(names: &[String]) -> Result<Vec<ServiceIdentity>> {
    let name_set: HashSet<&str> = names.iter().map(|s| s.as_str()).collect();

    let entries = std::fs::read_dir("/proc").context("reading /proc")?;

    let mut services = Vec::with_capacity(16);

    for entry in entries.flatten() {
        let pid: u32 = match entry.file_name().to_string_lossy().parse() {
            Ok(p) => p,
            Err(_) => continue,
        };

        let Ok(comm) = read_proc_comm(pid) else {
            continue;
        };

        if name_set.contains(comm.as_str()) {
            debug!(pid, comm = %comm, "found matching process");
            services.push(ServiceIdentity::new(comm, pid, ServiceKind::Process));
        }
    }

    Ok(services)
}

#[cfg(not(target_os = "linux"))]
fn discover_by_process_name(_names: &[String]) -> Result<Vec<ServiceIdentity>> {
    warn!("process discovery is only supported on Linux");
    Ok(Vec::new())
}

/// Read PIDs from a cgroup v2 cgroup.procs file.
#[cfg(target_os = "linux")]
fn discover_by_cgroup(cgroup_path: &str) -> Result<Vec<ServiceIdentity>> {
    let procs_path = std::path::Path::new(cgroup_path).join("cgroup.procs");
    let content = std::fs::read_to_string(&procs_path)
        .with_context(|| format!("reading {}", procs_path.display()))?;

    let mut services = Vec::with_capacity(16);

    for pid in parse_cgroup_procs(&content) {
        let name = read_proc_comm(pid).unwrap_or_else(|_| pid.to_string());
        services.push(ServiceIdentity::new(name, pid, ServiceKind::Process));
    }

    Ok(services)
}

#[cfg(not(target_os = "linux"))]
fn discover_by_cgroup(_cgroup_path: &str) -> Result<Vec<ServiceIdentity>> {
    warn!("cgroup discovery is only supported on Linux");
    Ok(Vec::new())
}

fn parse_cgroup_procs(content: &str) -> Vec<u32> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match line.parse::<u32>() {
            Ok(pid) => Some(pid),
            Err(_) => {
                warn!(line, "non-numeric line in cgroup.procs");
                None
            }
        })
        .collect()
}

/// Read /proc/<pid>/comm, returning the trimmed process name.
#[cfg(target_os = "linux")]
fn read_proc_comm(pid: u32) -> Result<String> {
    let path = format!("/proc/{pid}/comm");
    let data = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    Ok(data.trim().to_string())
}
