//! The compiler pool.
//!
//! The pool owns every [`ProcessHost`] of a build session. Hosts are
//! deduplicated by *launch identity* - two routes whose pipeline entries
//! resolve to the same `(working dir, executable, arguments)` tuple share
//! one worker process. Each host carries an unbounded FIFO queue of jobs
//! with a single dispatch slot: a job is begun by emitting
//! [`PoolEvent::Started`] and sending a build request, and the next job
//! begins only once the result for the head of the queue arrived.
//!
//! The pool is consumed serially through [`CompilerPool::next_event`];
//! per host, completions arrive in submission order.

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
};

use kiln_project::Pipeline;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    process_host::{HostId, ProcessConfig, ProcessEvent, ProcessHost},
    protocol::{BuildRequest, BuildResult, Message, DEFAULT_PROTOCOL_VERSION},
};

/// One unit of work submitted to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileJob {
    /// Absolute path of the source file.
    pub source_path: PathBuf,
    /// Absolute output stem for the worker.
    pub target_path: PathBuf,
    /// Resource type, the first half of the route key.
    pub resource_type: String,
    /// Platform the job builds for.
    pub platform: String,
}

/// What the pool reports to its consumer.
#[derive(Debug)]
pub enum PoolEvent {
    /// Every worker of the pipeline definition reported its first start.
    Ready,
    /// A worker began `job`.
    Started {
        /// The job now occupying its worker's dispatch slot.
        job: CompileJob,
    },
    /// A worker answered the job at the head of its queue.
    Complete {
        /// The finished job.
        job: CompileJob,
        /// The worker's reported outcome.
        result: BuildResult,
    },
    /// A job was not dispatched at all.
    Skipped {
        /// The undispatched job.
        job: CompileJob,
        /// Human-readable reason.
        reason: String,
    },
    /// A worker executable could not be spawned.
    Error {
        /// The spawn error, rendered.
        message: String,
    },
    /// A worker exited terminally with jobs still queued; no build result
    /// will ever arrive for them.
    Exited {
        /// The jobs that died with the worker.
        lost: Vec<CompileJob>,
    },
    /// The last worker exited after a [`CompilerPool::shutdown`] request.
    Terminated,
}

/// Launch identity used to deduplicate workers.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct LaunchKey {
    working_dir: Option<PathBuf>,
    executable: PathBuf,
    arguments: Vec<String>,
}

struct Worker {
    host: ProcessHost,
    executable: PathBuf,
    routes: Vec<String>,
    queue: VecDeque<CompileJob>,
    version: u32,
    started: bool,
    alive: bool,
}

/// The set of workers of one build session.
pub struct CompilerPool {
    workers: Vec<Worker>,
    by_launch_key: HashMap<LaunchKey, HostId>,
    by_route: HashMap<String, HostId>,
    events_tx: mpsc::UnboundedSender<(HostId, ProcessEvent)>,
    events_rx: mpsc::UnboundedReceiver<(HostId, ProcessEvent)>,
    pending: VecDeque<PoolEvent>,
    pending_starts: usize,
    ready_emitted: bool,
    alive: usize,
    shutting_down: bool,
    terminated_emitted: bool,
}

impl Default for CompilerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl CompilerPool {
    /// Creates an empty pool; call [`Self::startup`] to launch workers.
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            workers: vec![],
            by_launch_key: HashMap::new(),
            by_route: HashMap::new(),
            events_tx,
            events_rx,
            pending: VecDeque::new(),
            pending_starts: 0,
            ready_emitted: false,
            alive: 0,
            shutting_down: false,
            terminated_emitted: false,
        }
    }

    /// Launches one worker per unique launch identity of `pipeline`,
    /// resolving relative executable paths under `compiler_root`.
    /// [`PoolEvent::Ready`] is emitted once every new worker reported its
    /// first start; an empty pipeline is ready immediately.
    pub fn startup(&mut self, compiler_root: &Path, pipeline: &Pipeline) {
        for (route, launch) in &pipeline.routes {
            let executable = if launch.path.is_absolute() {
                launch.path.clone()
            } else {
                compiler_root.join(&launch.path)
            };
            let key = LaunchKey {
                working_dir: launch.working_directory.clone(),
                executable,
                arguments: launch.arguments.clone(),
            };

            let id = match self.by_launch_key.get(&key) {
                Some(&id) => {
                    debug!("route '{}' shares worker {}", route, id);
                    id
                }
                None => {
                    let id = self.workers.len();
                    let host = ProcessHost::start(
                        ProcessConfig {
                            executable_path: key.executable.clone(),
                            arguments: launch.arguments.clone(),
                            working_directory: launch.working_directory.clone(),
                            env_additions: launch.extra_environment.clone(),
                            env_hides: launch.hide_environment.clone(),
                            max_restarts: launch.max_restart_count,
                            suppress_stdio: launch.suppress_stdio,
                        },
                        id,
                        self.events_tx.clone(),
                    );
                    self.workers.push(Worker {
                        host,
                        executable: key.executable.clone(),
                        routes: vec![],
                        queue: VecDeque::new(),
                        version: DEFAULT_PROTOCOL_VERSION,
                        started: false,
                        alive: true,
                    });
                    self.by_launch_key.insert(key, id);
                    self.pending_starts += 1;
                    self.alive += 1;
                    id
                }
            };

            self.workers[id].routes.push(route.clone());
            self.by_route.insert(route.clone(), id);
        }

        if self.pending_starts == 0 && !self.ready_emitted {
            self.ready_emitted = true;
            self.pending.push_back(PoolEvent::Ready);
        }
    }

    /// Resolves the worker serving `resource_type` on `platform`: the
    /// platform-specific route wins over the generic one.
    pub fn find_compiler(&self, resource_type: &str, platform: &str) -> Option<HostId> {
        self.by_route
            .get(&format!("{resource_type}.{platform}"))
            .or_else(|| self.by_route.get(resource_type))
            .copied()
    }

    /// Enqueues `job` on its worker's queue, or emits
    /// [`PoolEvent::Skipped`] when no route serves it. Submitting into an
    /// empty queue begins the job immediately.
    pub fn submit(&mut self, job: CompileJob) {
        match self.find_compiler(&job.resource_type, &job.platform) {
            None => {
                let reason = format!(
                    "No data compiler for resource type {}",
                    job.resource_type
                );
                self.pending.push_back(PoolEvent::Skipped { job, reason });
            }
            Some(id) => {
                let worker = &mut self.workers[id];
                if !worker.alive {
                    // the route's worker is gone for good; queueing the
                    // job would leave its outcome pending forever.
                    self.pending.push_back(PoolEvent::Exited { lost: vec![job] });
                    return;
                }
                worker.queue.push_back(job);
                if worker.queue.len() == 1 && worker.started {
                    self.begin_head(id);
                }
            }
        }
    }

    /// Requests terminal stop of every worker; [`PoolEvent::Terminated`]
    /// follows once the last one exited.
    pub fn shutdown(&mut self) {
        self.shutting_down = true;
        if self.alive == 0 {
            if !self.terminated_emitted {
                self.terminated_emitted = true;
                self.pending.push_back(PoolEvent::Terminated);
            }
            return;
        }
        for worker in &self.workers {
            if worker.alive {
                worker.host.stop(false);
            }
        }
    }

    /// Delivers the next pool event, processing worker events until one
    /// surfaces. Events are delivered in a single serial stream.
    pub async fn next_event(&mut self) -> Option<PoolEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let (id, event) = self.events_rx.recv().await?;
            self.handle(id, event);
        }
    }

    /// Number of distinct worker processes.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// The cached protocol version of a worker, [`DEFAULT_PROTOCOL_VERSION`]
    /// until it answered a version query.
    pub fn worker_version(&self, id: HostId) -> Option<u32> {
        self.workers.get(id).map(|w| w.version)
    }

    /// The executable a worker was launched from.
    pub fn worker_executable(&self, id: HostId) -> Option<&Path> {
        self.workers.get(id).map(|w| w.executable.as_path())
    }

    /// Emits `Started` for the head of `id`'s queue and sends the build
    /// request.
    fn begin_head(&mut self, id: HostId) {
        let worker = &self.workers[id];
        let Some(job) = worker.queue.front() else {
            return;
        };
        self.pending.push_back(PoolEvent::Started { job: job.clone() });
        worker.host.send(Message::BuildRequest(BuildRequest {
            source_path: job.source_path.clone(),
            target_path: job.target_path.clone(),
            platform: job.platform.clone(),
        }));
    }

    fn handle(&mut self, id: HostId, event: ProcessEvent) {
        match event {
            ProcessEvent::Started => {
                {
                    let worker = &mut self.workers[id];
                    worker.started = true;
                    worker.host.send(Message::VersionQuery);
                }
                if self.pending_starts > 0 {
                    self.pending_starts -= 1;
                    if self.pending_starts == 0 && !self.ready_emitted {
                        self.ready_emitted = true;
                        self.pending.push_back(PoolEvent::Ready);
                    }
                }
                // a job may have been queued before the worker came up.
                if !self.workers[id].queue.is_empty() {
                    self.begin_head(id);
                }
            }
            ProcessEvent::Restarted => {
                let worker = &self.workers[id];
                worker.host.send(Message::VersionQuery);
                // the request for the head job was or may have been lost
                // with the previous process; send it again. `Started` was
                // already reported for it.
                if let Some(job) = worker.queue.front() {
                    info!(
                        "re-dispatching '{}' after worker restart",
                        job.source_path.display()
                    );
                    worker.host.send(Message::BuildRequest(BuildRequest {
                        source_path: job.source_path.clone(),
                        target_path: job.target_path.clone(),
                        platform: job.platform.clone(),
                    }));
                }
            }
            ProcessEvent::Message(Message::VersionData(data)) => {
                debug!("worker {} speaks protocol version {}", id, data.version);
                self.workers[id].version = data.version;
            }
            ProcessEvent::Message(Message::BuildResult(result)) => {
                // results are attributed to the head of the queue; a
                // payload naming another source is a duplicate or a
                // protocol violation and must not consume the head.
                let head_matches = self.workers[id]
                    .queue
                    .front()
                    .map(|job| job.source_path == result.source_path);
                match head_matches {
                    Some(true) => {
                        if let Some(job) = self.workers[id].queue.pop_front() {
                            self.pending.push_back(PoolEvent::Complete { job, result });
                        }
                        if !self.workers[id].queue.is_empty() {
                            self.begin_head(id);
                        }
                    }
                    Some(false) => warn!(
                        "worker {} answered for '{}' which is not at the head of its queue",
                        id,
                        result.source_path.display()
                    ),
                    None => warn!("worker {} answered with no job in flight", id),
                }
            }
            ProcessEvent::Message(_) => {
                warn!("worker {} sent an engine-to-worker message", id);
            }
            ProcessEvent::SpawnFailed { error } => {
                self.pending.push_back(PoolEvent::Error { message: error });
            }
            ProcessEvent::Stopping => {}
            ProcessEvent::Exited => {
                let worker = &mut self.workers[id];
                if worker.alive {
                    worker.alive = false;
                    self.alive -= 1;
                }
                let lost: Vec<_> = worker.queue.drain(..).collect();
                if !lost.is_empty() {
                    self.pending.push_back(PoolEvent::Exited { lost });
                }
                if self.shutting_down && self.alive == 0 && !self.terminated_emitted {
                    self.terminated_emitted = true;
                    self.pending.push_back(PoolEvent::Terminated);
                }
            }
        }
    }
}
