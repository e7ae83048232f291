use log::{debug, error, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};

use crate::accumulator::Accumulator;
use crate::config::{get_hostname, AgentConfig};
use crate::error::{AgentError, Result};
use crate::plugin::{PluginDecl, RunningOutput, RunningPlugin};
use crate::point::Point;
use crate::registry;

/// Capacity of the channel shared by every collector task. A full channel
/// pauses collectors instead of dropping points.
const POINT_CHANNEL_CAPACITY: usize = 1000;

/// Delay before retrying a failed output connection at startup
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Grace before the flusher arms its ticker, so the first gather pass can
/// land points inside the first flush window
const FLUSH_STARTUP_DELAY: Duration = Duration::from_millis(100);

/// Pause between the two gather passes of the cpu collector in test mode;
/// it reports deltas and needs two samples
const TEST_MODE_RESAMPLE_DELAY: Duration = Duration::from_millis(500);

/// The agent supervisor. Owns the running collectors and outputs, wires
/// the point channel, and drives startup, steady state and shutdown.
///
/// Lifecycle: construct, [`load_outputs`](Agent::load_outputs),
/// [`load_plugins`](Agent::load_plugins), [`connect`](Agent::connect),
/// [`run`](Agent::run) (or [`test`](Agent::test)), [`close`](Agent::close).
pub struct Agent {
    config: AgentConfig,
    tags: HashMap<String, String>,
    plugins: Vec<Arc<RunningPlugin>>,
    outputs: Vec<Arc<RunningOutput>>,
}

impl Agent {
    /// Build an agent from its resolved configuration. The `host` default
    /// tag is taken from the config tag map if present, otherwise from the
    /// configured hostname, otherwise from the OS.
    pub fn new(config: AgentConfig) -> Result<Self> {
        let hostname = if config.hostname.is_empty() {
            get_hostname()?
        } else {
            config.hostname.clone()
        };

        let mut tags = config.tags.clone();
        tags.entry("host".to_string()).or_insert(hostname);

        Ok(Self {
            config,
            tags,
            plugins: Vec::new(),
            outputs: Vec::new(),
        })
    }

    /// Instantiate the declared outputs that match the filter set (an
    /// empty filter enables all of them). Returns the enabled names
    /// sorted, so startup logs are deterministic.
    pub fn load_outputs(&mut self, filters: &[String], declared: &[String]) -> Result<Vec<String>> {
        let mut names = Vec::new();

        for name in declared {
            if !filters.is_empty() && !filters.contains(name) {
                continue;
            }
            if self.outputs.iter().any(|o| &o.name == name) {
                return Err(AgentError::Config(format!(
                    "Output declared more than once: {}",
                    name
                )));
            }

            let sink = registry::new_sink(name)?;
            if self.config.debug {
                debug!("Output enabled: {}", name);
            }
            self.outputs.push(Arc::new(RunningOutput {
                name: name.clone(),
                sink,
            }));
            names.push(name.clone());
        }

        names.sort();
        Ok(names)
    }

    /// Instantiate the declared collectors that match the filter set,
    /// pairing each with its resolved configuration. Returns the enabled
    /// names sorted.
    pub fn load_plugins(
        &mut self,
        filters: &[String],
        declared: &[PluginDecl],
    ) -> Result<Vec<String>> {
        let mut names = Vec::new();

        for decl in declared {
            if !filters.is_empty() && !filters.contains(&decl.name) {
                continue;
            }
            if self.plugins.iter().any(|p| p.name == decl.name) {
                return Err(AgentError::Config(format!(
                    "Plugin declared more than once: {}",
                    decl.name
                )));
            }

            let collector = registry::new_collector(&decl.name)?;
            self.plugins.push(Arc::new(RunningPlugin {
                name: decl.name.clone(),
                collector,
                config: decl.config.clone(),
            }));
            names.push(decl.name.clone());
        }

        names.sort();
        Ok(names)
    }

    /// Connect every loaded output. A failed connection is retried once
    /// after a 15 second delay; a second failure aborts startup.
    pub async fn connect(&self) -> Result<()> {
        for output in &self.outputs {
            if self.config.debug {
                debug!("Attempting connection to output: {}", output.name);
            }
            if let Err(err) = output.sink.connect().await {
                error!(
                    "Failed to connect to output {}, retrying in {:?}: {}",
                    output.name, CONNECT_RETRY_DELAY, err
                );
                time::sleep(CONNECT_RETRY_DELAY).await;
                output.sink.connect().await?;
            }
            if self.config.debug {
                debug!("Successfully connected to output: {}", output.name);
            }
        }
        Ok(())
    }

    /// Close every loaded output, reporting the last error
    pub async fn close(&self) -> Result<()> {
        let mut result = Ok(());
        for output in &self.outputs {
            if let Err(err) = output.sink.close().await {
                result = Err(err);
            }
        }
        result
    }

    /// Run the agent until `shutdown` observes a true value (or its sender
    /// is dropped). Every task spawned along the way has completed by the
    /// time this returns.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let (tx, rx) = mpsc::channel(POINT_CHANNEL_CAPACITY);

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        tasks.push(tokio::spawn(flusher(
            self.outputs.clone(),
            rx,
            shutdown.clone(),
            self.config.flush_interval,
            self.config.flush_retries,
        )));

        // Service collectors run a background task between start and stop;
        // a start failure unwinds the ones already started, in reverse.
        let mut started: Vec<Arc<RunningPlugin>> = Vec::new();
        for plugin in &self.plugins {
            if let Some(service) = plugin.collector.as_service() {
                if let Err(err) = service.start().await {
                    error!(
                        "Service for plugin {} failed to start, exiting: {}",
                        plugin.name, err
                    );
                    stop_services(&started).await;
                    drop(tx);
                    for task in tasks {
                        let _ = task.await;
                    }
                    return Err(err);
                }
                started.push(Arc::clone(plugin));
            }
        }

        // Collectors with their own interval gather independently of the
        // global tick and of each other.
        for plugin in &self.plugins {
            if let Some(interval) = plugin.config.interval {
                let acc = self.accumulator(plugin, tx.clone());
                tasks.push(tokio::spawn(gather_separate(
                    Arc::clone(plugin),
                    acc,
                    interval,
                    shutdown.clone(),
                )));
            }
        }

        let mut ticker = time::interval_at(
            time::Instant::now() + self.config.interval,
            self.config.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.gather_parallel(&tx).await;

            tokio::select! {
                _ = wait_shutdown(&mut shutdown) => break,
                _ = ticker.tick() => continue,
            }
        }

        stop_services(&started).await;

        drop(tx);
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    /// One-shot verification mode: gather each collector exactly once
    /// (the cpu collector twice, since it reports deltas between passes)
    /// with a debug accumulator, then wind the flusher down. Collector
    /// errors propagate instead of being swallowed.
    pub async fn test(&self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, rx) = mpsc::channel(POINT_CHANNEL_CAPACITY);

        let flusher_task = tokio::spawn(flusher(
            self.outputs.clone(),
            rx,
            shutdown_rx,
            self.config.flush_interval,
            self.config.flush_retries,
        ));

        let mut result = Ok(());
        for plugin in &self.plugins {
            let mut acc = Accumulator::new(plugin.config.clone(), tx.clone());
            acc.set_debug(true);
            acc.set_prefix(format!("{}_", plugin.name));
            acc.set_precision(self.config.precision);

            info!("* Plugin: {}, Collection 1", plugin.name);
            if let Some(interval) = plugin.config.interval {
                info!("* Interval: {:?}", interval);
            }

            if let Err(err) = plugin.collector.gather(&acc).await {
                result = Err(err);
                break;
            }

            if plugin.name == "cpu" {
                time::sleep(TEST_MODE_RESAMPLE_DELAY).await;
                info!("* Plugin: {}, Collection 2", plugin.name);
                if let Err(err) = plugin.collector.gather(&acc).await {
                    result = Err(err);
                    break;
                }
            }
        }

        drop(tx);
        let _ = shutdown_tx.send(true);
        let _ = flusher_task.await;
        result
    }

    /// Gather every collector on the global interval, in lockstep. The
    /// next tick may not begin until all collectors of this tick have
    /// returned.
    async fn gather_parallel(&self, tx: &mpsc::Sender<Point>) {
        let start = Instant::now();

        let mut handles = Vec::new();
        for plugin in &self.plugins {
            if plugin.config.interval.is_some() {
                continue;
            }

            let acc = self.accumulator(plugin, tx.clone());
            let plugin = Arc::clone(plugin);
            handles.push(tokio::spawn(async move {
                if let Err(err) = plugin.collector.gather(&acc).await {
                    error!("Error in plugin [{}]: {}", plugin.name, err);
                }
            }));
        }

        let counter = handles.len();
        for handle in handles {
            let _ = handle.await;
        }

        info!(
            "Gathered metrics, ({:?} interval), from {} plugins in {:?}",
            self.config.interval,
            counter,
            start.elapsed()
        );
    }

    fn accumulator(&self, plugin: &RunningPlugin, tx: mpsc::Sender<Point>) -> Accumulator {
        let mut acc = Accumulator::new(plugin.config.clone(), tx);
        acc.set_debug(self.config.debug);
        acc.set_prefix(format!("{}_", plugin.name));
        acc.set_default_tags(self.tags.clone());
        acc.set_precision(self.config.precision);
        acc
    }
}

/// Stop started services in reverse start order
async fn stop_services(started: &[Arc<RunningPlugin>]) {
    for plugin in started.iter().rev() {
        if let Some(service) = plugin.collector.as_service() {
            service.stop().await;
        }
    }
}

/// Resolve once the shutdown flag is raised or its sender is gone
async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Dedicated gather loop for one collector with its own interval
async fn gather_separate(
    plugin: Arc<RunningPlugin>,
    acc: Accumulator,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let start = Instant::now();

        if let Err(err) = plugin.collector.gather(&acc).await {
            error!("Error in plugin [{}]: {}", plugin.name, err);
        }

        info!(
            "Gathered metrics, (separate {:?} interval), from {} in {:?}",
            interval,
            plugin.name,
            start.elapsed()
        );

        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => return,
            _ = ticker.tick() => continue,
        }
    }
}

/// Buffer points off the shared channel and dispatch a snapshot batch to
/// every output on each flush tick. On shutdown, the buffered remainder is
/// flushed once, then every in-flight writer is drained.
async fn flusher(
    outputs: Vec<Arc<RunningOutput>>,
    mut rx: mpsc::Receiver<Point>,
    mut shutdown: watch::Receiver<bool>,
    flush_interval: Duration,
    retries: usize,
) {
    time::sleep(FLUSH_STARTUP_DELAY).await;

    let mut ticker = time::interval_at(time::Instant::now() + flush_interval, flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut points: Vec<Point> = Vec::new();
    let mut writers: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => {
                info!("Hang on, flushing any cached points before shutdown");
                flush(
                    &outputs,
                    std::mem::take(&mut points),
                    &shutdown,
                    flush_interval,
                    retries,
                    &mut writers,
                );
                break;
            }
            _ = ticker.tick() => {
                flush(
                    &outputs,
                    std::mem::take(&mut points),
                    &shutdown,
                    flush_interval,
                    retries,
                    &mut writers,
                );
            }
            point = rx.recv() => match point {
                Some(point) => points.push(point),
                // Every collector handle is gone; drain and wind down
                None => {
                    flush(
                        &outputs,
                        std::mem::take(&mut points),
                        &shutdown,
                        flush_interval,
                        retries,
                        &mut writers,
                    );
                    break;
                }
            },
            // Reap finished writers so completed tasks do not pile up
            Some(_) = writers.join_next(), if !writers.is_empty() => {}
        }
    }

    while writers.join_next().await.is_some() {}
}

/// Dispatch one snapshot batch to every output, one writer task each.
/// Empty snapshots are not dispatched.
fn flush(
    outputs: &[Arc<RunningOutput>],
    points: Vec<Point>,
    shutdown: &watch::Receiver<bool>,
    flush_interval: Duration,
    retries: usize,
    writers: &mut JoinSet<()>,
) {
    if points.is_empty() {
        return;
    }

    let batch = Arc::new(points);
    for output in outputs {
        writers.spawn(write_output(
            Arc::clone(&batch),
            Arc::clone(output),
            shutdown.clone(),
            flush_interval,
            retries,
        ));
    }
}

/// Write one batch to one output with bounded retries. Attempts are spaced
/// by the flush interval; shutdown cancels the spacing sleep and ends the
/// writer without another attempt. After `retries + 1` failures the batch
/// is dropped. Ordering across consecutive batches to the same output is
/// not guaranteed.
async fn write_output(
    points: Arc<Vec<Point>>,
    output: Arc<RunningOutput>,
    mut shutdown: watch::Receiver<bool>,
    flush_interval: Duration,
    retries: usize,
) {
    let start = Instant::now();
    let mut attempt = 0;

    loop {
        let result = output.sink.write(&points).await;

        if *shutdown.borrow() {
            return;
        }

        match result {
            Ok(()) => {
                info!(
                    "Flushed {} metrics to output {} in {:?}",
                    points.len(),
                    output.name,
                    start.elapsed()
                );
                return;
            }
            Err(_) if attempt >= retries => {
                error!(
                    "FATAL: Write to output [{}] failed {} times, dropping {} metrics",
                    output.name,
                    retries + 1,
                    points.len()
                );
                return;
            }
            Err(err) => {
                error!(
                    "Error in output [{}]: {}, retrying in {:?}",
                    output.name, err, flush_interval
                );
                tokio::select! {
                    _ = wait_shutdown(&mut shutdown) => return,
                    _ = time::sleep(flush_interval) => {}
                }
            }
        }

        attempt += 1;
    }
}
