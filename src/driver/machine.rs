use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::DriverConfig;
use crate::driver::state::{first_mismatch, Action, DriverState, PrinterState, StatusType, Telemetry};
use crate::queue::{MultiQueue, Queue};
use crate::script::{Hook, ScriptContext, ScriptRunner};
use crate::storage::RunResult;

/// Presentation snapshot of the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSnapshot {
    pub state: String,
    pub status: String,
    pub status_type: StatusType,
    pub retries: u32,
}

/// The continuous-print state machine.
///
/// Each call to [`Driver::action`] runs the handler of the current state
/// once. A handler may name a successor state; entering a state does not
/// run it, except for `start_print` which is attempted immediately.
pub struct Driver {
    config: DriverConfig,
    queue: MultiQueue,
    runner: Box<dyn ScriptRunner>,
    state: DriverState,
    status: String,
    status_type: StatusType,
    ctx: ScriptContext,
    retries: u32,
    start_failures: u32,
    idle_since: Option<Instant>,
    cooldown_start: Option<Instant>,
    update_ui: bool,
}

impl Driver {
    pub fn new(config: DriverConfig, queue: MultiQueue, runner: Box<dyn ScriptRunner>) -> Self {
        Self {
            config,
            queue,
            runner,
            state: DriverState::Inactive,
            status: "Initializing".to_string(),
            status_type: StatusType::Normal,
            ctx: ScriptContext::default(),
            retries: 0,
            start_failures: 0,
            idle_since: None,
            cooldown_start: None,
            update_ui: true,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn status_type(&self) -> StatusType {
        self.status_type
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn queue(&self) -> &MultiQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut MultiQueue {
        &mut self.queue
    }

    pub fn context(&self) -> &ScriptContext {
        &self.ctx
    }

    /// Sets an `external.*` value visible to hook scripts.
    pub fn set_external(&mut self, key: impl Into<String>, value: Value) {
        self.ctx.external.insert(key.into(), value);
    }

    pub fn snapshot(&self) -> DriverSnapshot {
        DriverSnapshot {
            state: self.state.to_string(),
            status: self.status.clone(),
            status_type: self.status_type,
            retries: self.retries,
        }
    }

    /// Feeds one event to the state machine. Returns true if the state or
    /// status changed and the UI should refresh.
    pub fn action(&mut self, a: Action, p: PrinterState, telemetry: &Telemetry) -> bool {
        self.latch(telemetry);
        self.observe_idle(p);

        let next = if a == Action::Deactivate {
            self.queue.release();
            (self.state != DriverState::Inactive).then(|| self.enter_inactive())
        } else {
            self.dispatch(a, p)
        };

        if let Some(next) = next {
            if next != self.state {
                info!(from = %self.state, to = %next, action = %a, printer = %p, "Driver transition");
                self.idle_since = None;
                self.update_ui = true;
            }
            self.state = next;
        }
        std::mem::take(&mut self.update_ui)
    }

    fn dispatch(&mut self, a: Action, p: PrinterState) -> Option<DriverState> {
        match self.state {
            DriverState::Inactive => self.inactive(a, p),
            DriverState::Activating => self.activating(a, p),
            DriverState::Idle => self.idle(a, p),
            DriverState::Preprint => self.preprint(a, p),
            DriverState::StartPrint { run_pre_script } => self.start_print(p, run_pre_script),
            DriverState::AwaitingMaterial => self.awaiting_material(a, p),
            DriverState::Printing => self.printing(a, p),
            DriverState::Paused => self.paused(a, p),
            DriverState::SpaghettiRecovery => self.spaghetti_recovery(a, p),
            DriverState::Failure => self.failure(a, p),
            DriverState::Success => self.success(a, p),
            DriverState::StartClearing => self.start_clearing(a, p),
            DriverState::Cooldown => self.cooldown(a, p),
            DriverState::Clearing => self.clearing(a, p),
            DriverState::StartFinishing => self.start_finishing(a, p),
            DriverState::Finishing => self.finishing(a, p),
        }
    }

    fn latch(&mut self, t: &Telemetry) {
        if let Some(path) = &t.path {
            self.ctx.current.path = Some(path.clone());
        }
        if !t.materials.is_empty() {
            self.ctx.current.materials = t.materials.clone();
        }
        if let Some(temp) = t.bed_temp {
            self.ctx.current.bed_temp = Some(temp);
        }
    }

    fn observe_idle(&mut self, p: PrinterState) {
        if p == PrinterState::Idle {
            self.idle_since.get_or_insert_with(Instant::now);
        } else {
            self.idle_since = None;
        }
    }

    /// Printer has sat idle in this state long enough to assume an event was missed.
    fn long_idle(&self) -> bool {
        self.idle_since
            .is_some_and(|since| since.elapsed() >= self.config.long_idle)
    }

    fn set_status(&mut self, status: impl Into<String>, status_type: StatusType) {
        let status = status.into();
        if status != self.status || status_type != self.status_type {
            debug!(status = %status, kind = ?status_type, "Driver status");
            self.status = status;
            self.status_type = status_type;
            self.update_ui = true;
        }
    }

    fn refresh_metadata(&mut self) {
        let meta = &mut self.ctx.metadata;
        meta.clear();
        if let Some(q) = self.queue.active_queue() {
            meta.insert("queue".into(), Value::from(q.name()));
        }
        if let Some(job) = self.queue.get_job() {
            meta.insert("job".into(), Value::from(job.name.clone()));
        }
        if let Some(set) = self.queue.get_set() {
            meta.insert("path".into(), Value::from(set.path.clone()));
            meta.insert("remaining".into(), Value::from(set.remaining));
        }
    }

    /// Runs a hook. True if the printer has something to do before the
    /// driver should move on; failed hooks count as pausing.
    fn run_hook(&mut self, hook: Hook) -> bool {
        self.refresh_metadata();
        match self.runner.run_script_for_event(hook, &self.ctx) {
            Ok(Some(path)) => {
                debug!(hook = %hook, path = %path.display(), "Hook running");
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!(hook = %hook, error = %e, "Hook script failed");
                self.set_status(format!("{hook} script failed: {e}"), StatusType::Error);
                true
            }
        }
    }

    fn enter_inactive(&mut self) -> DriverState {
        self.run_hook(Hook::Deactivate);
        self.queue.release();
        DriverState::Inactive
    }

    fn enter_start_print(&mut self, p: PrinterState, run_pre_script: bool) -> DriverState {
        self.start_failures = 0;
        self.start_print(p, run_pre_script)
            .unwrap_or(DriverState::StartPrint { run_pre_script })
    }

    fn enter_clearing(&mut self) -> DriverState {
        self.run_hook(Hook::PrintSuccess);
        self.set_status("Clearing bed", StatusType::Normal);
        DriverState::Clearing
    }

    fn inactive(&mut self, a: Action, p: PrinterState) -> Option<DriverState> {
        self.queue.release();
        self.retries = 0;

        if a == Action::Activate {
            if self.run_hook(Hook::Activate) {
                self.set_status("Running activation script", StatusType::Normal);
                return Some(DriverState::Activating);
            }
            if p != PrinterState::Idle {
                // Adopt the print already running
                return Some(DriverState::Printing);
            }
            return Some(self.enter_start_print(p, true));
        }

        if self.status_type != StatusType::Error {
            let status = if p == PrinterState::Idle {
                "Inactive (activate to start the queue)"
            } else {
                "Inactive (current print runs unmanaged)"
            };
            self.set_status(status, StatusType::Normal);
        }
        None
    }

    fn activating(&mut self, a: Action, _p: PrinterState) -> Option<DriverState> {
        if a == Action::Success || self.long_idle() {
            return Some(DriverState::Idle);
        }
        None
    }

    fn idle(&mut self, _a: Action, p: PrinterState) -> Option<DriverState> {
        if self.queue.get_set_or_acquire().is_none() {
            self.set_status("Idle (awaiting printable job)", StatusType::Normal);
            return None;
        }
        Some(self.enter_start_print(p, true))
    }

    fn preprint(&mut self, a: Action, p: PrinterState) -> Option<DriverState> {
        self.set_status("Running pre-print script", StatusType::Normal);
        if a == Action::Success || self.long_idle() {
            return Some(self.enter_start_print(p, false));
        }
        None
    }

    fn start_print(&mut self, p: PrinterState, run_pre_script: bool) -> Option<DriverState> {
        if p != PrinterState::Idle {
            self.set_status("Waiting for printer to be ready", StatusType::Normal);
            return None;
        }
        let Some(set) = self.queue.get_set_or_acquire().cloned() else {
            self.set_status("No work to do; going idle", StatusType::Normal);
            return Some(DriverState::Idle);
        };

        if let Some((tool, material)) = first_mismatch(&set.material_keys, &self.ctx.current.materials) {
            self.run_hook(Hook::AwaitingMaterial);
            self.set_status(
                format!("Waiting for {material} in tool {tool}"),
                StatusType::NeedsAction,
            );
            return Some(DriverState::AwaitingMaterial);
        }

        if run_pre_script && self.run_hook(Hook::PrintStart) {
            return Some(DriverState::Preprint);
        }

        self.refresh_metadata();
        let started = self
            .queue
            .begin_run()
            .and_then(|()| self.runner.start_print(&set, &self.ctx));
        match started {
            Ok(true) => {
                info!(path = %set.path, remaining = set.remaining, "Print started");
                self.set_status(format!("Printing {}", set.path), StatusType::Normal);
                Some(DriverState::Printing)
            }
            Ok(false) => self.fail_start(&format!("could not start {}", set.path)),
            Err(e) => self.fail_start(&e.to_string()),
        }
    }

    fn fail_start(&mut self, reason: &str) -> Option<DriverState> {
        self.start_failures += 1;
        let max = self.config.max_startup_attempts;
        if self.start_failures >= max {
            error!(attempts = self.start_failures, reason, "Giving up starting print");
            self.set_status(
                format!("Failed to start print after {max} attempts: {reason}"),
                StatusType::Error,
            );
            return Some(self.enter_inactive());
        }
        warn!(attempt = self.start_failures, max, reason, "Print start failed");
        self.set_status(
            format!("Start attempt {}/{max} failed: {reason}", self.start_failures),
            StatusType::Error,
        );
        None
    }

    fn awaiting_material(&mut self, _a: Action, p: PrinterState) -> Option<DriverState> {
        let Some(set) = self.queue.get_set_or_acquire() else {
            self.set_status("No work to do; going idle", StatusType::Normal);
            return Some(DriverState::Idle);
        };
        match first_mismatch(&set.material_keys, &self.ctx.current.materials) {
            None => Some(self.enter_start_print(p, true)),
            Some((tool, material)) => {
                let status = format!("Waiting for {material} in tool {tool}");
                self.set_status(status, StatusType::NeedsAction);
                None
            }
        }
    }

    /// Where a finished print goes next: counted if it was ours, otherwise
    /// just cleared off the bed.
    fn finished_print(&self) -> DriverState {
        let ours = match (self.queue.get_set(), self.ctx.current.path.as_deref()) {
            (Some(set), Some(path)) => set.matches_path(path),
            _ => false,
        };
        if ours {
            DriverState::Success
        } else {
            info!(path = ?self.ctx.current.path, "Finished print was not started by the queue");
            DriverState::StartClearing
        }
    }

    fn printing(&mut self, a: Action, p: PrinterState) -> Option<DriverState> {
        match a {
            Action::Failure => return Some(DriverState::Failure),
            Action::Spaghetti => {
                let elapsed = self
                    .queue
                    .get_run()
                    .map(|r| r.elapsed().to_std().unwrap_or_default());
                return match elapsed {
                    Some(e) if self.config.retry_on_pause && e < self.config.retry_threshold => {
                        info!(elapsed_secs = e.as_secs(), "Cancelling print paused early for spaghetti");
                        self.set_status("Cancelling print (spaghetti early in print)", StatusType::Error);
                        Some(DriverState::SpaghettiRecovery)
                    }
                    _ => {
                        self.set_status(
                            "Print paused for spaghetti; resume or cancel it",
                            StatusType::NeedsAction,
                        );
                        Some(DriverState::Paused)
                    }
                };
            }
            Action::Success => return Some(self.finished_print()),
            _ => {}
        }

        match p {
            PrinterState::Busy => {
                let status = match self.queue.get_set() {
                    Some(set) => format!("Printing {}", set.path),
                    None => "Printing".to_string(),
                };
                self.set_status(status, StatusType::Normal);
                None
            }
            PrinterState::Paused => Some(DriverState::Paused),
            PrinterState::Idle => self.long_idle().then(|| self.finished_print()),
        }
    }

    fn paused(&mut self, _a: Action, p: PrinterState) -> Option<DriverState> {
        if self.long_idle() {
            self.set_status("Print ended while paused; stopping", StatusType::NeedsAction);
            return Some(self.enter_inactive());
        }
        if p == PrinterState::Busy {
            return Some(DriverState::Printing);
        }
        if self.status_type == StatusType::Normal {
            self.set_status("Queue paused", StatusType::NeedsAction);
        }
        None
    }

    fn spaghetti_recovery(&mut self, _a: Action, p: PrinterState) -> Option<DriverState> {
        if p != PrinterState::Paused {
            return None;
        }
        self.run_hook(Hook::PrintCancel);
        Some(DriverState::Failure)
    }

    fn failure(&mut self, _a: Action, p: PrinterState) -> Option<DriverState> {
        if p != PrinterState::Idle {
            self.set_status("Print failed; waiting for printer", StatusType::Error);
            return None;
        }
        let max = self.config.max_retries;
        if self.retries + 1 < max {
            self.retries += 1;
            warn!(retry = self.retries, max, "Retrying failed print");
            self.set_status(
                format!("Print failed; retrying ({}/{max})", self.retries),
                StatusType::Error,
            );
            return Some(DriverState::StartClearing);
        }
        self.queue.end_run(RunResult::Failure);
        error!(attempts = max, "Print failed too many times; stopping");
        self.set_status("Print failed (max retries exceeded)", StatusType::Error);
        Some(self.enter_inactive())
    }

    fn success(&mut self, _a: Action, _p: PrinterState) -> Option<DriverState> {
        self.queue.end_run(RunResult::Success);
        self.retries = 0;
        if self.queue.get_set_or_acquire().is_some() {
            Some(DriverState::StartClearing)
        } else {
            Some(DriverState::StartFinishing)
        }
    }

    fn start_clearing(&mut self, _a: Action, p: PrinterState) -> Option<DriverState> {
        if p != PrinterState::Idle {
            self.set_status("Waiting for printer to be ready", StatusType::Normal);
            return None;
        }
        if self.config.cooldown.enabled {
            self.run_hook(Hook::Cooldown);
            self.cooldown_start = Some(Instant::now());
            info!(
                threshold_c = self.config.cooldown.threshold_c,
                timeout_minutes = self.config.cooldown.timeout_minutes,
                "Waiting for bed to cool"
            );
            self.set_status("Cooling down", StatusType::Normal);
            return Some(DriverState::Cooldown);
        }
        Some(self.enter_clearing())
    }

    fn cooldown(&mut self, _a: Action, _p: PrinterState) -> Option<DriverState> {
        let cfg = &self.config.cooldown;
        let bed = self.ctx.current.bed_temp;
        let done = if bed.is_some_and(|t| t < cfg.threshold_c) {
            info!(bed_temp = ?bed, "Bed cooled below threshold");
            true
        } else if self
            .cooldown_start
            .map_or(true, |start| start.elapsed() >= cfg.timeout())
        {
            info!(bed_temp = ?bed, "Cooldown timed out");
            true
        } else {
            false
        };

        if done {
            self.cooldown_start = None;
            return Some(self.enter_clearing());
        }
        let status = match bed {
            Some(t) => format!("Cooling down (bed {t:.1}°C, target {:.1}°C)", self.config.cooldown.threshold_c),
            None => "Cooling down".to_string(),
        };
        self.set_status(status, StatusType::Normal);
        None
    }

    fn clearing(&mut self, a: Action, p: PrinterState) -> Option<DriverState> {
        match a {
            Action::Success => return Some(self.enter_start_print(p, true)),
            Action::Failure => {
                self.set_status("Error when clearing bed; stopping", StatusType::Error);
                return Some(self.enter_inactive());
            }
            _ => {}
        }
        if self.long_idle() {
            return Some(self.enter_start_print(p, true));
        }
        self.set_status("Clearing bed", StatusType::Normal);
        None
    }

    fn start_finishing(&mut self, _a: Action, p: PrinterState) -> Option<DriverState> {
        if p != PrinterState::Idle {
            self.set_status("Waiting for printer to be ready", StatusType::Normal);
            return None;
        }
        self.run_hook(Hook::Finish);
        self.set_status("Finishing up", StatusType::Normal);
        Some(DriverState::Finishing)
    }

    fn finishing(&mut self, a: Action, _p: PrinterState) -> Option<DriverState> {
        if a == Action::Failure {
            self.set_status("Error when finishing up; stopping", StatusType::Error);
            return Some(self.enter_inactive());
        }
        if a == Action::Success || self.long_idle() {
            return Some(DriverState::Idle);
        }
        self.set_status("Finishing up", StatusType::Normal);
        None
    }
}
