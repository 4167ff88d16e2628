//! [`DiagnosticsSource`] backed by the running system.
//!
//! RAM is reported against a per-process limit when one matches the current
//! process, else as system-wide usage. Graphics memory comes from a
//! Broadcom-style core table (`/proc/brcm/core`). Both keep their last
//! known value when a read fails.

use crate::threshold::DiagnosticsSource;
use globset::GlobBuilder;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

pub const DEFAULT_GPU_MEMORY_FILE: &str = "/proc/brcm/core";
pub const MEMORY_LIMITS_ENV: &str = "PIPESCOPE_POLL_MAX_MEMORY";
pub const GPU_MEMORY_FILE_ENV: &str = "PIPESCOPE_GPU_MEMORY_FILE";
const MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMemoryLimit {
    pub pattern: String,
    pub bytes: u64,
}

/// Parse `name:500M,*watch:150K,other:4096`. Names are lowercased glob
/// patterns anchored at the end of the process name; malformed entries are
/// skipped.
pub fn parse_memory_limits(text: &str) -> Vec<ProcessMemoryLimit> {
    let mut limits = Vec::new();
    for entry in text.split(',') {
        let parts: Vec<&str> = entry.split(':').collect();
        let [name, value] = parts.as_slice() else {
            continue;
        };
        let name = name.trim().to_lowercase();
        let pattern = if name.starts_with('*') {
            name
        } else {
            format!("*{name}")
        };
        let value = value.trim().to_lowercase();
        let (digits, units) = if let Some(rest) = value.strip_suffix('k') {
            (rest, 1024)
        } else if let Some(rest) = value.strip_suffix('m') {
            (rest, 1024 * 1024)
        } else {
            (value.as_str(), 1)
        };
        match digits.parse::<u64>() {
            Ok(size) => limits.push(ProcessMemoryLimit {
                pattern,
                bytes: size.saturating_mul(units),
            }),
            Err(_) => {
                warn!(event = "memory_limit_skipped", entry = %entry.trim());
            }
        }
    }
    limits
}

/// First limit whose pattern matches `process_name`, case-insensitively.
pub fn limit_for_process(limits: &[ProcessMemoryLimit], process_name: &str) -> Option<u64> {
    let process_name = process_name.to_lowercase();
    limits.iter().find_map(|limit| {
        let glob = GlobBuilder::new(&limit.pattern)
            .case_insensitive(true)
            .build()
            .ok()?;
        glob.compile_matcher()
            .is_match(&process_name)
            .then_some(limit.bytes)
    })
}

/// Read one column of the GFX row from a core table. The value sits at the
/// same offset from the `GFX` token as `column` sits from the `name` header.
pub fn parse_core_table(text: &str, column: &str) -> Option<u64> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let name_idx = tokens.iter().position(|token| *token == "name")?;
    let column_idx = tokens.iter().position(|token| *token == column)?;
    let gfx_idx = tokens.iter().position(|token| token.contains("GFX"))?;
    let value_idx = gfx_idx as i64 - (name_idx as i64 - column_idx as i64);
    let token = tokens.get(usize::try_from(value_idx).ok()?)?;
    token.parse::<u64>().ok()
}

/// Graphics memory in use in MB: the GFX row's size times its `used`
/// percentage.
pub fn gfx_used_mb(text: &str) -> Option<f64> {
    let total = parse_core_table(text, "MB")?;
    let used = parse_core_table(text, "used")?;
    Some(total as f64 * used as f64 * 0.01)
}

pub struct SystemDiagnostics {
    system: Mutex<System>,
    pid: Option<Pid>,
    process_limit: Option<u64>,
    gpu_file: PathBuf,
    last_gfx: Mutex<f64>,
    last_gfx_mb: Mutex<f64>,
}

impl SystemDiagnostics {
    pub fn new(memory_limits: Option<&str>, gpu_file: impl Into<PathBuf>) -> Self {
        let mut system = System::new();
        let pid = sysinfo::get_current_pid().ok();
        let process_limit = match (memory_limits, pid) {
            (Some(limits), Some(pid)) => {
                system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                let name = system
                    .process(pid)
                    .map(|process| process.name().to_string_lossy().into_owned())
                    .unwrap_or_default();
                let limit = limit_for_process(&parse_memory_limits(limits), &name);
                debug!(event = "memory_limit_resolved", process = %name, limit = ?limit);
                limit
            }
            _ => None,
        };
        Self {
            system: Mutex::new(system),
            pid,
            process_limit: process_limit.filter(|limit| *limit > 0),
            gpu_file: gpu_file.into(),
            last_gfx: Mutex::new(0.0),
            last_gfx_mb: Mutex::new(0.0),
        }
    }

    pub fn from_env() -> Self {
        let limits = std::env::var(MEMORY_LIMITS_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty());
        let gpu_file = std::env::var(GPU_MEMORY_FILE_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_GPU_MEMORY_FILE.to_string());
        Self::new(limits.as_deref(), gpu_file)
    }

    pub fn process_limit(&self) -> Option<u64> {
        self.process_limit
    }

    pub fn gpu_file(&self) -> &Path {
        &self.gpu_file
    }

    fn read_gfx(&self, last: &Mutex<f64>, read: impl FnOnce(&str) -> Option<f64>) -> f64 {
        let mut last = match last.lock() {
            Ok(last) => last,
            Err(poisoned) => poisoned.into_inner(),
        };
        match std::fs::read_to_string(&self.gpu_file)
            .ok()
            .and_then(|text| read(&text))
        {
            Some(value) => *last = value,
            None => debug!(
                event = "gpu_memory_unavailable",
                path = %self.gpu_file.display(),
                last = *last
            ),
        }
        *last
    }
}

impl DiagnosticsSource for SystemDiagnostics {
    fn used_ram_percent(&self) -> f64 {
        let mut system = match self.system.lock() {
            Ok(system) => system,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let (Some(limit), Some(pid)) = (self.process_limit, self.pid) {
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            if let Some(process) = system.process(pid) {
                return process.memory() as f64 / limit as f64 * 100.0;
            }
        }
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        system.used_memory() as f64 / total as f64 * 100.0
    }

    fn used_gfx_percent(&self) -> f64 {
        self.read_gfx(&self.last_gfx, |text| {
            parse_core_table(text, "used").map(|value| value as f64)
        })
    }

    fn used_ram_mb(&self) -> f64 {
        let mut system = match self.system.lock() {
            Ok(system) => system,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(pid) = self.pid {
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            if let Some(process) = system.process(pid) {
                return process.memory() as f64 / MB;
            }
        }
        system.refresh_memory();
        system.used_memory() as f64 / MB
    }

    fn used_gfx_mb(&self) -> f64 {
        self.read_gfx(&self.last_gfx_mb, gfx_used_mb)
    }
}
