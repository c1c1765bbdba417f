use std::fs;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::driver::{Action, Driver, DriverSnapshot, DriverState, PrinterState, Telemetry};
use crate::error::{BedloopError, Result};
use crate::printer::{PrinterControl, ReconnectBackoff, Ticker, WatchedFolderPrinter};
use crate::queue::{LocalQueue, MultiQueue, QueueKind, QueueSnapshot, Strategy};
use crate::script::FileScriptRunner;
use crate::storage::{FileLocator, JobManifest, JobStore, RunLog};

/// Requests served by the node's driver task.
pub enum DriverMessage {
    Action {
        action: Action,
        printer: PrinterState,
        telemetry: Telemetry,
        reply: oneshot::Sender<DriverSnapshot>,
    },
    State {
        reply: oneshot::Sender<NodeState>,
    },
    ResetJobs {
        queue: String,
        ids: Vec<Uuid>,
        reply: oneshot::Sender<Result<usize>>,
    },
    RemoveJobs {
        queue: String,
        ids: Vec<Uuid>,
        reply: oneshot::Sender<Result<usize>>,
    },
    ImportJob {
        queue: String,
        manifest: Box<JobManifest>,
        reply: oneshot::Sender<Result<Uuid>>,
    },
}

/// Everything the dashboard shows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub driver: DriverSnapshot,
    pub queues: Vec<QueueSnapshot>,
}

/// Cloneable client for a running [`Node`].
#[derive(Clone)]
pub struct DriverHandle {
    tx: mpsc::Sender<DriverMessage>,
}

impl DriverHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> DriverMessage) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| BedloopError::Internal("driver task stopped".to_string()))?;
        rx.await
            .map_err(|_| BedloopError::Internal("driver task dropped request".to_string()))
    }

    pub async fn action(
        &self,
        action: Action,
        printer: PrinterState,
        telemetry: Telemetry,
    ) -> Result<DriverSnapshot> {
        self.request(|reply| DriverMessage::Action {
            action,
            printer,
            telemetry,
            reply,
        })
        .await
    }

    pub async fn state(&self) -> Result<NodeState> {
        self.request(|reply| DriverMessage::State { reply }).await
    }

    pub async fn reset_jobs(&self, queue: String, ids: Vec<Uuid>) -> Result<usize> {
        self.request(|reply| DriverMessage::ResetJobs { queue, ids, reply })
            .await?
    }

    pub async fn remove_jobs(&self, queue: String, ids: Vec<Uuid>) -> Result<usize> {
        self.request(|reply| DriverMessage::RemoveJobs { queue, ids, reply })
            .await?
    }

    /// Adds a job to a queue of the running node. The node owns its queue
    /// stores, so this is the only safe way to add work while it runs.
    pub async fn import_job(&self, queue: String, manifest: JobManifest) -> Result<Uuid> {
        self.request(|reply| DriverMessage::ImportJob {
            queue,
            manifest: Box::new(manifest),
            reply,
        })
        .await?
    }
}

/// One printer: the driver, the printer it controls and the task that
/// feeds it ticks and requests.
pub struct Node {
    config: NodeConfig,
    driver: Driver,
    printer: Arc<dyn PrinterControl>,
    handle: DriverHandle,
    last_printer: PrinterState,
    backoff: ReconnectBackoff,
    retry_at: Option<Instant>,
    last_tick: Option<(DriverState, String)>,
}

impl Node {
    /// Builds a node with one local queue per configured queue, feeding a
    /// watched-folder printer.
    pub fn new(config: NodeConfig) -> Result<(Self, mpsc::Receiver<DriverMessage>)> {
        fs::create_dir_all(&config.data_dir)?;
        let locator = FileLocator::new(&config.upload_dir);

        let runs = RunLog::open(config.runs_path())?.with_limit(config.run_history);
        let mut queue = MultiQueue::new(Strategy::InOrder, runs)?;
        for qc in config.local_queues() {
            let store = JobStore::open(config.store_path(&qc.name))?;
            let local = LocalQueue::new(
                qc.name.as_str(),
                qc.strategy,
                config.profile.as_str(),
                store,
                locator.clone(),
            )?;
            queue.add_queue(QueueKind::Local(local))?;
        }

        let watch_dir = config
            .watch_dir
            .clone()
            .unwrap_or_else(|| config.data_dir.join("printer"));
        let printer = Arc::new(WatchedFolderPrinter::new(watch_dir));

        let mut runner = FileScriptRunner::new(config.data_dir.join("hooks"), locator, printer.clone());
        if let Some(dir) = &config.script_dir {
            runner = runner.load_scripts(dir)?;
        }

        let driver = Driver::new(config.driver.clone(), queue, Box::new(runner));
        Ok(Self::with_driver(config, driver, printer))
    }

    /// Wraps an already-assembled driver.
    pub fn with_driver(
        config: NodeConfig,
        driver: Driver,
        printer: Arc<dyn PrinterControl>,
    ) -> (Self, mpsc::Receiver<DriverMessage>) {
        let (tx, rx) = mpsc::channel(100);
        let backoff = ReconnectBackoff::new(config.reconnect_base, config.reconnect_cap);
        let node = Self {
            config,
            driver,
            printer,
            handle: DriverHandle { tx },
            last_printer: PrinterState::Idle,
            backoff,
            retry_at: None,
            last_tick: None,
        };
        (node, rx)
    }

    pub fn handle(&self) -> DriverHandle {
        self.handle.clone()
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// Ticks and requests share one loop, so the driver handles exactly one
    /// event at a time.
    pub async fn run(mut self, mut rx: mpsc::Receiver<DriverMessage>, shutdown: CancellationToken) {
        if let Some(addr) = self.config.dashboard_addr {
            let state = DashboardState::new(self.handle());
            tokio::spawn(async move {
                run_dashboard(addr, state).await;
            });
        }

        let (tick_tx, mut tick_rx) = mpsc::channel(1);
        let ticker = Ticker::new(self.config.tick_interval);
        tokio::spawn(async move {
            ticker.run(tick_tx).await;
        });

        if !self.check_connection() {
            tracing::warn!("Printer not reachable yet");
        }

        tracing::info!(
            printer = %self.config.printer_name,
            profile = %self.config.profile,
            tick_ms = self.config.tick_interval.as_millis() as u64,
            "Node started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Node shutting down");
                    break;
                }
                Some(()) = tick_rx.recv() => self.on_tick(),
                Some(msg) = rx.recv() => self.on_message(msg),
            }
        }
    }

    fn on_tick(&mut self) {
        if !self.check_connection() {
            return;
        }
        self.driver
            .action(Action::Tick, self.last_printer, &Telemetry::default());

        let outcome = (self.driver.state(), self.driver.status().to_string());
        if self.last_tick.as_ref() != Some(&outcome) {
            tracing::debug!(state = %outcome.0, status = %outcome.1, "Tick");
            self.last_tick = Some(outcome);
        }
    }

    /// True if the printer is reachable. Otherwise schedules reconnect
    /// attempts with backoff.
    fn check_connection(&mut self) -> bool {
        if self.printer.is_connected() {
            if self.backoff.attempts() > 0 {
                tracing::info!(attempts = self.backoff.attempts(), "Printer reconnected");
                self.backoff.reset();
                self.retry_at = None;
            }
            return true;
        }

        let now = Instant::now();
        if self.retry_at.is_some_and(|at| now < at) {
            return false;
        }
        if let Err(e) = self.printer.reconnect() {
            tracing::warn!(error = %e, attempt = self.backoff.attempts() + 1, "Printer reconnect failed");
        }
        let delay = self.backoff.next_delay();
        self.retry_at = Some(now + delay);
        self.printer.is_connected()
    }

    fn on_message(&mut self, msg: DriverMessage) {
        match msg {
            DriverMessage::Action {
                action,
                printer,
                telemetry,
                reply,
            } => {
                tracing::debug!(action = %action, printer = %printer, "Driver event");
                self.last_printer = printer;
                self.driver.action(action, printer, &telemetry);
                let _ = reply.send(self.driver.snapshot());
            }
            DriverMessage::State { reply } => {
                let _ = reply.send(NodeState {
                    driver: self.driver.snapshot(),
                    queues: self.driver.queue().as_dict(),
                });
            }
            DriverMessage::ResetJobs { queue, ids, reply } => {
                let _ = reply.send(self.driver.queue_mut().reset_jobs(&queue, &ids));
            }
            DriverMessage::RemoveJobs { queue, ids, reply } => {
                let _ = reply.send(self.driver.queue_mut().remove_jobs(&queue, &ids));
            }
            DriverMessage::ImportJob {
                queue,
                manifest,
                reply,
            } => {
                let result = self.driver.queue_mut().import_job(&queue, &manifest);
                if let Err(e) = &result {
                    tracing::warn!(queue = %queue, job = %manifest.name, error = %e, "Import rejected");
                }
                let _ = reply.send(result);
            }
        }
    }
}
