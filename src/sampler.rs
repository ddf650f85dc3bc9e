//! Raw resource readings for a process (sysinfo-backed).

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use std::path::PathBuf;
use std::time::Duration;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

pub const DEFAULT_CPU_SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

/// Metrics that depend on OS support, probed once when a sampler is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformCapabilities {
    pub handle_count: bool,
    pub thread_count: bool,
}

/// Everything a snapshot needs except its timestamp and tracer data.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResourceReading {
    pub process_id: u32,
    pub rss_mb: f64,
    pub vms_mb: f64,
    pub percent: f64,
    pub available_mb: f64,
    pub total_mb: f64,
    pub num_threads: u64,
    pub num_fds: Option<u64>,
    pub cpu_percent: f64,
}

pub trait Sampler: Send {
    /// Full reading. Missing data degrades to zero / `None`, never an error.
    fn read(&mut self) -> ResourceReading;

    /// Cheap resident-memory read used by component markers.
    fn resident_mb(&mut self) -> f64;

    fn capabilities(&self) -> PlatformCapabilities;
}

pub struct SysinfoSampler {
    system: System,
    pid: Pid,
    cpu_interval: Duration,
    capabilities: PlatformCapabilities,
}

impl SysinfoSampler {
    /// Samples the current process.
    pub fn current(cpu_interval: Duration) -> Self {
        Self::for_pid(std::process::id(), cpu_interval)
    }

    pub fn for_pid(pid: u32, cpu_interval: Duration) -> Self {
        let pid = Pid::from_u32(pid);
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            ProcessRefreshKind::new().with_memory().with_cpu(),
        );
        let capabilities = PlatformCapabilities {
            handle_count: fd_dir(pid).is_some_and(|p| std::fs::read_dir(p).is_ok()),
            thread_count: system.process(pid).is_some_and(|p| p.tasks().is_some()),
        };
        tracing::debug!(pid = pid.as_u32(), ?capabilities, "sampler ready");
        Self {
            system,
            pid,
            cpu_interval,
            capabilities,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_u32()
    }

    fn refresh_process(&mut self) {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            ProcessRefreshKind::new().with_memory().with_cpu(),
        );
    }

    fn handle_count(&self) -> Option<u64> {
        if !self.capabilities.handle_count {
            return None;
        }
        let dir = fd_dir(self.pid)?;
        std::fs::read_dir(dir).ok().map(|entries| entries.count() as u64)
    }
}

impl Sampler for SysinfoSampler {
    fn read(&mut self) -> ResourceReading {
        self.system.refresh_memory();
        self.refresh_process();
        if !self.cpu_interval.is_zero() {
            std::thread::sleep(self.cpu_interval);
            self.refresh_process();
        }

        let total_bytes = self.system.total_memory();
        let available_bytes = self.system.available_memory();
        let mut reading = ResourceReading {
            process_id: self.pid.as_u32(),
            available_mb: available_bytes as f64 / BYTES_PER_MB,
            total_mb: total_bytes as f64 / BYTES_PER_MB,
            num_fds: self.handle_count(),
            ..ResourceReading::default()
        };

        if let Some(process) = self.system.process(self.pid) {
            reading.rss_mb = process.memory() as f64 / BYTES_PER_MB;
            reading.vms_mb = process.virtual_memory() as f64 / BYTES_PER_MB;
            reading.cpu_percent = f64::from(process.cpu_usage());
            reading.num_threads = process.tasks().map(|t| t.len() as u64).unwrap_or(0);
            if total_bytes > 0 {
                reading.percent = process.memory() as f64 / total_bytes as f64 * 100.0;
            }
        } else {
            tracing::debug!(pid = self.pid.as_u32(), "process not visible to sampler");
        }
        reading
    }

    fn resident_mb(&mut self) -> f64 {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            ProcessRefreshKind::new().with_memory(),
        );
        self.system
            .process(self.pid)
            .map(|p| p.memory() as f64 / BYTES_PER_MB)
            .unwrap_or(0.0)
    }

    fn capabilities(&self) -> PlatformCapabilities {
        self.capabilities
    }
}

fn fd_dir(pid: Pid) -> Option<PathBuf> {
    if cfg!(target_os = "linux") {
        Some(PathBuf::from(format!("/proc/{}/fd", pid.as_u32())))
    } else {
        None
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use super::*;

    /// Replays a fixed list of resident-memory values; repeats the last one.
    #[derive(Debug, Clone)]
    pub struct ScriptedSampler {
        rss: VecDeque<f64>,
        last: f64,
        capabilities: PlatformCapabilities,
    }

    impl ScriptedSampler {
        pub fn new(rss: impl IntoIterator<Item = f64>) -> Self {
            Self {
                rss: rss.into_iter().collect(),
                last: 0.0,
                capabilities: PlatformCapabilities {
                    handle_count: true,
                    thread_count: true,
                },
            }
        }

        pub fn without_handles(mut self) -> Self {
            self.capabilities.handle_count = false;
            self
        }

        fn next_rss(&mut self) -> f64 {
            if let Some(v) = self.rss.pop_front() {
                self.last = v;
            }
            self.last
        }
    }

    impl Sampler for ScriptedSampler {
        fn read(&mut self) -> ResourceReading {
            let rss_mb = self.next_rss();
            ResourceReading {
                process_id: 4242,
                rss_mb,
                vms_mb: rss_mb * 3.0,
                percent: rss_mb / 16_384.0 * 100.0,
                available_mb: 16_384.0 - rss_mb,
                total_mb: 16_384.0,
                num_threads: 8,
                num_fds: self.capabilities.handle_count.then_some(16),
                cpu_percent: 2.5,
            }
        }

        fn resident_mb(&mut self) -> f64 {
            self.next_rss()
        }

        fn capabilities(&self) -> PlatformCapabilities {
            self.capabilities
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysinfo_sampler_reads_current_process() {
        let mut sampler = SysinfoSampler::current(Duration::ZERO);
        let reading = sampler.read();
        assert_eq!(reading.process_id, std::process::id());
        assert!(reading.total_mb > 0.0);
        assert!(reading.rss_mb > 0.0);
        if !sampler.capabilities().handle_count {
            assert_eq!(reading.num_fds, None);
        }
    }

    #[test]
    fn unknown_pid_degrades_to_zero() {
        let mut sampler = SysinfoSampler::for_pid(u32::MAX - 1, Duration::ZERO);
        let reading = sampler.read();
        assert_eq!(reading.rss_mb, 0.0);
        assert_eq!(reading.num_threads, 0);
        assert_eq!(sampler.resident_mb(), 0.0);
        assert_eq!(reading.num_fds, None);
    }
}
