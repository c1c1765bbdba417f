use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::queue::Strategy;

/// Managed bed cooldown between prints.
///
/// When enabled the driver runs the COOLDOWN hook after each print and waits
/// until the bed is below the threshold, or the timeout passes, before
/// clearing the bed.
#[derive(Debug, Clone, PartialEq)]
pub struct CooldownConfig {
    pub enabled: bool,
    /// Bed temperature (°C) considered cool enough to clear.
    pub threshold_c: f64,
    /// Give up waiting after this many minutes.
    pub timeout_minutes: f64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold_c: 30.0,
            timeout_minutes: 60.0,
        }
    }
}

impl CooldownConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64((self.timeout_minutes * 60.0).max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    /// Attempts per set before a failing print stops the queue.
    pub max_retries: u32,
    /// Cancel and retry prints paused by a spaghetti detector.
    pub retry_on_pause: bool,
    /// Only retry paused prints that ran for less than this.
    pub retry_threshold: Duration,
    /// Consecutive start failures tolerated before going inactive.
    pub max_startup_attempts: u32,
    /// How long the printer must sit idle before a missed event is assumed.
    pub long_idle: Duration,
    pub cooldown: CooldownConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_on_pause: false,
            retry_threshold: Duration::from_secs(60 * 60),
            max_startup_attempts: 3,
            long_idle: Duration::from_secs(15),
            cooldown: CooldownConfig::default(),
        }
    }
}

impl DriverConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_on_pause(mut self, threshold: Duration) -> Self {
        self.retry_on_pause = true;
        self.retry_threshold = threshold;
        self
    }

    pub fn with_long_idle(mut self, long_idle: Duration) -> Self {
        self.long_idle = long_idle;
        self
    }

    pub fn with_cooldown(mut self, threshold_c: f64, timeout_minutes: f64) -> Self {
        self.cooldown = CooldownConfig {
            enabled: true,
            threshold_c,
            timeout_minutes,
        };
        self
    }
}

/// A local queue owned by this node.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub name: String,
    pub strategy: Strategy,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            strategy: Strategy::InOrder,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Printer name advertised to peers.
    pub printer_name: String,
    /// Printer profile matched against set profile tags.
    pub profile: String,
    /// Queue stores and run history live here.
    pub data_dir: PathBuf,
    /// Root that queued file paths are relative to.
    pub upload_dir: PathBuf,
    /// Directory the printer picks files up from.
    pub watch_dir: Option<PathBuf>,
    /// Directory of `<hook>.gcode` scripts.
    pub script_dir: Option<PathBuf>,
    pub tick_interval: Duration,
    pub dashboard_addr: Option<SocketAddr>,
    pub queues: Vec<QueueConfig>,
    pub driver: DriverConfig,
    pub reconnect_base: Duration,
    pub reconnect_cap: u32,
    /// Finished runs kept in the history file.
    pub run_history: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            printer_name: "printer".to_string(),
            profile: String::new(),
            data_dir: PathBuf::from("data"),
            upload_dir: PathBuf::from("uploads"),
            watch_dir: None,
            script_dir: None,
            tick_interval: Duration::from_secs(5),
            dashboard_addr: None,
            queues: Vec::new(),
            driver: DriverConfig::default(),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: 6,
            run_history: 500,
        }
    }
}

impl NodeConfig {
    pub fn new(printer_name: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            printer_name: printer_name.into(),
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = profile.into();
        self
    }

    pub fn with_upload_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.upload_dir = dir.into();
        self
    }

    pub fn with_watch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.watch_dir = Some(dir.into());
        self
    }

    pub fn with_script_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.script_dir = Some(dir.into());
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queues.push(queue);
        self
    }

    /// Configured local queues, or a single `local` queue if none are.
    pub fn local_queues(&self) -> Vec<QueueConfig> {
        if self.queues.is_empty() {
            vec![QueueConfig::new("local")]
        } else {
            self.queues.clone()
        }
    }

    pub fn with_run_history(mut self, runs: usize) -> Self {
        self.run_history = runs;
        self
    }

    pub fn with_driver(mut self, driver: DriverConfig) -> Self {
        self.driver = driver;
        self
    }

    pub fn store_path(&self, queue: &str) -> PathBuf {
        self.data_dir.join(format!("{queue}.json"))
    }

    pub fn runs_path(&self) -> PathBuf {
        self.data_dir.join("runs.json")
    }
}
