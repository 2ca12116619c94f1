//! Dev mode: initial build, then watch and serve until cancelled.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::core::dag::TaskGraph;
use crate::core::request::RunRequest;
use crate::error::Result;
use crate::orchestration::scheduler::{RunResult, Scheduler, SchedulerEvent};
use crate::orchestration::server::{DevServer, Reloader};
use crate::orchestration::watch::WatchCoordinator;
use crate::transform::TransformRegistry;
use crate::util::format_duration;
use crate::{klog, klog_error};

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

/// One console line for a scheduler event.
pub fn status_line(event: &SchedulerEvent) -> String {
    match event {
        SchedulerEvent::TaskStarted { task } => format!("[{}] start   {}", timestamp(), task),
        SchedulerEvent::TaskSucceeded { task, files, duration } => format!(
            "[{}] ok      {} ({} files, {})",
            timestamp(),
            task,
            files,
            format_duration(*duration)
        ),
        SchedulerEvent::TaskFailed { task, error } => {
            format!("[{}] FAILED  {}: {}", timestamp(), task, error)
        }
        SchedulerEvent::TaskSkipped { task, cause } => {
            format!("[{}] skipped {} ({} failed)", timestamp(), task, cause)
        }
        SchedulerEvent::RunFinished { success, duration } => format!(
            "[{}] {} in {}",
            timestamp(),
            if *success { "finished" } else { "finished with errors" },
            format_duration(*duration)
        ),
    }
}

/// Print scheduler events as they arrive.
///
/// Once `reloader` is set, every successful task also reloads connected
/// browsers. Ends when every event sender is dropped.
pub fn spawn_status_printer(
    mut events: mpsc::UnboundedReceiver<SchedulerEvent>,
    reloader: Arc<OnceLock<Reloader>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match &event {
                SchedulerEvent::TaskFailed { .. } => eprintln!("{}", status_line(&event)),
                _ => println!("{}", status_line(&event)),
            }
            if let (SchedulerEvent::TaskSucceeded { .. }, Some(reloader)) = (&event, reloader.get()) {
                reloader.notify_clients();
            }
        }
    })
}

/// A dev-mode session: owns the scheduler, the watcher and the server.
pub struct DevSession {
    config: PipelineConfig,
    graph: Arc<TaskGraph>,
    scheduler: Arc<Scheduler>,
    events: mpsc::UnboundedReceiver<SchedulerEvent>,
    port: u16,
    ready: Option<oneshot::Sender<SocketAddr>>,
}

impl DevSession {
    pub fn new(
        config: PipelineConfig,
        graph: Arc<TaskGraph>,
        registry: Arc<TransformRegistry>,
        jobs: usize,
    ) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(graph.clone(), registry)
            .with_jobs(jobs)
            .with_events(tx);
        let port = config.server.port;
        Self {
            config,
            graph,
            scheduler: Arc::new(scheduler),
            events,
            port,
            ready: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Receive the server's bound address once it is listening.
    pub fn with_ready(mut self, ready: oneshot::Sender<SocketAddr>) -> Self {
        self.ready = Some(ready);
        self
    }

    /// Build once, then watch and serve until `cancel` fires.
    ///
    /// The initial build may fail; the session keeps watching so the next
    /// change can fix it. The watcher and server are released on every exit.
    ///
    /// # Errors
    /// Configuration errors in the watch bindings, a server that cannot bind
    /// or a watcher that cannot watch any root.
    pub async fn run(self, cancel: CancellationToken) -> Result<RunResult> {
        let Self {
            config,
            graph,
            scheduler,
            events,
            port,
            ready,
        } = self;

        let coordinator = WatchCoordinator::from_config(&config, &graph)?;
        let reloader = Arc::new(OnceLock::new());
        let printer = spawn_status_printer(events, reloader.clone());

        let initial = scheduler.run(&RunRequest::all()).await?;

        let server = match DevServer::start(&graph.paths().output, &config.server.host, port, cancel.child_token()).await {
            Ok(server) => server,
            Err(e) => {
                drop(scheduler);
                let _ = printer.await;
                return Err(e);
            }
        };
        let _ = reloader.set(server.reloader());
        if let Some(ready) = ready {
            let _ = ready.send(server.local_addr());
        }
        println!("[{}] Serving {} at {}", timestamp(), graph.paths().output.display(), server.url());
        println!("[{}] Watching for changes, press Ctrl-C to stop", timestamp());

        let watched = coordinator
            .run(scheduler.clone(), cancel.clone(), |result| {
                if !result.success() {
                    for report in result.failed() {
                        klog_error!("{}: {}", report.name, report.outcome);
                    }
                }
            })
            .await;

        cancel.cancel();
        let stopped = server.shutdown().await;
        drop(scheduler);
        let _ = printer.await;
        klog!("Dev session ended");

        watched?;
        stopped?;
        Ok(initial)
    }
}

/// Cancel `token` on Ctrl-C.
pub fn cancel_on_ctrl_c(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if res.is_ok() {
                    klog!("Ctrl-C received, shutting down");
                    token.cancel();
                }
            }
            _ = token.cancelled() => {}
        }
    })
}
