// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! Workflow executor
//!
//! Runs a validated graph once per run instance. Instances run on a
//! bounded worker pool; within an instance, independent branches run
//! concurrently up to `node_concurrency`. A failed node fails its
//! descendants and nothing else.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use colored::Colorize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cache::{cache_key, ExecutionRecord, InputDigest, InvalidationMode, NodeStatus, RecordStore};
use crate::errors::{FailureKind, FlowError, FlowResult};
use crate::executors::{create_default_executors, ExecutionResult, Executor, NodeInputs};
use crate::params::RunInstance;
use crate::pipeline::{Cancellation, InputSource, ValidatedGraph};
use crate::resolver::Resolver;
use crate::utils::create_progress_bar;

/// Workflow execution options
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Run instances processed in parallel
    pub workers: usize,
    /// Nodes of one instance running at once
    pub node_concurrency: usize,
    /// Timeout for nodes that do not set their own
    pub default_timeout: Option<Duration>,
    /// Reuse matching execution records
    pub use_cache: bool,
    /// How external inputs enter cache keys
    pub invalidation: InvalidationMode,
    /// Only show what would be done
    pub dry_run: bool,
    /// Show a progress bar over run instances
    pub show_progress: bool,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            node_concurrency: 1,
            default_timeout: None,
            use_cache: true,
            invalidation: InvalidationMode::default(),
            dry_run: false,
            show_progress: false,
        }
    }
}

/// Outcome of one run instance
#[derive(Debug, Clone)]
pub struct InstanceResult {
    pub instance: RunInstance,
    /// One record per node, in declaration order
    pub records: Vec<ExecutionRecord>,
    pub duration: Duration,
}

impl InstanceResult {
    /// Whether every node succeeded or was reused
    pub fn success(&self) -> bool {
        self.records.iter().all(|r| r.status.is_success())
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    /// Records of nodes that failed on their own, not because of upstream
    pub fn root_failures(&self) -> impl Iterator<Item = &ExecutionRecord> {
        self.records.iter().filter(|r| {
            r.status == NodeStatus::Failed
                && r.error.as_ref().map(|e| e.kind)
                    != Some(FailureKind::UpstreamFailed)
        })
    }

    pub fn record(&self, node: &str) -> Option<&ExecutionRecord> {
        self.records.iter().find(|r| r.node == node)
    }

    pub fn was_cancelled(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.error.as_ref().map(|e| e.kind) == Some(FailureKind::Cancelled))
    }
}

/// Result of executing a workflow over all run instances
#[derive(Debug)]
pub struct PipelineResult {
    /// Results for each instance, in input order
    pub instances: Vec<InstanceResult>,
    /// Total execution time
    pub duration: Duration,
    /// Whether all instances succeeded
    pub success: bool,
}

impl PipelineResult {
    pub fn failed_instances(&self) -> usize {
        self.instances.iter().filter(|r| !r.success()).count()
    }
}

/// What to do with a node once its dependencies are satisfied
enum Prepared {
    /// Finished without running: reused, or failed during resolution
    Done(ExecutionRecord),
    /// Needs its action run with these inputs
    Run(ExecutionRecord, NodeInputs),
}

/// Workflow executor
#[derive(Clone)]
pub struct PipelineExecutor {
    /// Registered executors by action kind
    executors: HashMap<String, Arc<dyn Executor>>,
    /// Record store for idempotent re-runs
    store: Option<Arc<dyn RecordStore>>,
    cancellation: Cancellation,
}

impl PipelineExecutor {
    /// Create an executor with no action executors registered
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
            store: None,
            cancellation: Cancellation::new(),
        }
    }

    /// Create an executor with the command and function executors
    pub fn with_default_executors() -> Self {
        Self {
            executors: create_default_executors(),
            ..Self::new()
        }
    }

    /// Register an executor for an action kind
    pub fn register_executor(&mut self, kind: &str, executor: Arc<dyn Executor>) {
        self.executors.insert(kind.to_string(), executor);
    }

    /// Set the record store
    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share an existing cancellation handle
    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    fn executor_for(&self, kind: &str) -> FlowResult<Arc<dyn Executor>> {
        self.executors
            .get(kind)
            .cloned()
            .ok_or_else(|| FlowError::ExecutorNotFound {
                kind: kind.to_string(),
            })
    }

    /// Check every node has an executor that accepts it
    pub fn preflight(&self, graph: &ValidatedGraph) -> FlowResult<()> {
        for node in &graph.graph().nodes {
            self.executor_for(node.action_kind())?.validate_node(node)?;
        }
        Ok(())
    }

    /// Names of nodes whose tools are not available on this machine
    pub async fn check_tools(&self, graph: &ValidatedGraph) -> FlowResult<Vec<String>> {
        let mut missing = Vec::new();

        for node in &graph.graph().nodes {
            let available = match self.executors.get(node.action_kind()) {
                Some(executor) => executor.check_available(node).await.unwrap_or(false),
                None => false,
            };
            if !available {
                missing.push(node.name.clone());
            }
        }

        Ok(missing)
    }

    /// Execute the graph for every run instance
    pub async fn execute(
        &self,
        graph: Arc<ValidatedGraph>,
        instances: Vec<RunInstance>,
        resolver: Arc<Resolver>,
        work_root: &Path,
        options: &ExecutionOptions,
    ) -> FlowResult<PipelineResult> {
        let start = Instant::now();

        self.preflight(&graph)?;
        self.print_execution_plan(&graph, instances.len());

        if options.dry_run {
            return Ok(PipelineResult {
                instances: Vec::new(),
                duration: start.elapsed(),
                success: true,
            });
        }

        let progress = options
            .show_progress
            .then(|| create_progress_bar(instances.len() as u64, "Run instances"));

        let semaphore = Arc::new(Semaphore::new(options.workers.max(1)));
        let mut join_set: JoinSet<(usize, InstanceResult)> = JoinSet::new();

        for (index, instance) in instances.iter().cloned().enumerate() {
            let executor = self.clone();
            let graph = graph.clone();
            let resolver = resolver.clone();
            let semaphore = semaphore.clone();
            let instance_dir = work_root.join(instance.dir_name());
            let options = options.clone();

            join_set.spawn(async move {
                // Held for the whole instance
                let _permit = semaphore.acquire_owned().await.ok();
                let result = executor
                    .execute_instance(&graph, instance, &resolver, &instance_dir, &options)
                    .await;
                (index, result)
            });
        }

        let mut results: Vec<Option<InstanceResult>> = vec![None; instances.len()];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => {
                    if let Some(pb) = &progress {
                        pb.inc(1);
                    }
                    results[index] = Some(result);
                }
                Err(e) => tracing::error!(error = %e, "Run instance worker failed"),
            }
        }

        if let Some(pb) = progress {
            pb.finish_and_clear();
        }

        // A worker that died leaves its instance without a result
        let instances: Vec<InstanceResult> = results
            .into_iter()
            .zip(instances)
            .map(|(result, instance)| {
                result.unwrap_or_else(|| Self::abandoned(&graph, instance))
            })
            .collect();

        let success = instances.iter().all(InstanceResult::success);
        let duration = start.elapsed();

        tracing::info!(
            instances = instances.len(),
            failed = instances.iter().filter(|r| !r.success()).count(),
            elapsed_ms = duration.as_millis() as u64,
            "Workflow finished"
        );

        Ok(PipelineResult {
            instances,
            duration,
            success,
        })
    }

    fn abandoned(graph: &ValidatedGraph, instance: RunInstance) -> InstanceResult {
        let error = FlowError::Io {
            message: "worker task terminated unexpectedly".into(),
        };
        let records = graph
            .graph()
            .nodes
            .iter()
            .map(|node| {
                let mut record = ExecutionRecord::pending(&node.name, instance.clone());
                record.fail(&error);
                record
            })
            .collect();

        InstanceResult {
            instance,
            records,
            duration: Duration::ZERO,
        }
    }

    /// Execute every node of the graph for one run instance
    async fn execute_instance(
        &self,
        graph: &Arc<ValidatedGraph>,
        instance: RunInstance,
        resolver: &Resolver,
        instance_dir: &Path,
        options: &ExecutionOptions,
    ) -> InstanceResult {
        let start = Instant::now();
        let dag = graph.dag();
        let count = dag.len();

        tracing::info!(instance = %instance, "Starting run instance");

        let mut records: Vec<ExecutionRecord> = graph
            .graph()
            .nodes
            .iter()
            .map(|n| ExecutionRecord::pending(&n.name, instance.clone()))
            .collect();

        let mut waiting_on: Vec<usize> = (0..count).map(|i| dag.predecessors(i).len()).collect();
        let mut ready: BinaryHeap<Reverse<usize>> =
            (0..count).filter(|&i| waiting_on[i] == 0).map(Reverse).collect();

        let mut running: JoinSet<(usize, FlowResult<ExecutionResult>)> = JoinSet::new();
        let limit = options.node_concurrency.max(1);

        loop {
            while running.len() < limit && !self.cancellation.is_cancelled() {
                let Some(Reverse(idx)) = ready.pop() else {
                    break;
                };

                match self.prepare(graph, idx, &instance, &records, resolver, options).await {
                    Prepared::Done(record) => {
                        if record.status == NodeStatus::Failed {
                            self.persist(&record).await;
                        }
                        records[idx] = record;
                        Self::settle(graph, idx, &mut records, &mut waiting_on, &mut ready);
                    }
                    Prepared::Run(record, inputs) => {
                        self.persist(&record).await;
                        records[idx] = record;
                        self.spawn_node(graph, idx, inputs, instance_dir, options, &mut running);
                    }
                }
            }

            let Some(joined) = running.join_next().await else {
                break;
            };

            match joined {
                Ok((idx, outcome)) => {
                    Self::complete(graph, idx, &mut records[idx], outcome);
                    self.persist(&records[idx]).await;
                    Self::settle(graph, idx, &mut records, &mut waiting_on, &mut ready);
                }
                // Node tasks never panic: spawn_node isolates the action
                Err(e) => tracing::error!(error = %e, "Node task failed to join"),
            }
        }

        // Whatever never started was cut off by cancellation
        for (idx, record) in records.iter_mut().enumerate() {
            if matches!(record.status, NodeStatus::Pending | NodeStatus::Running) {
                record.fail(&FlowError::Cancelled {
                    node: dag.name(idx).to_string(),
                });
            }
        }

        let result = InstanceResult {
            instance,
            records,
            duration: start.elapsed(),
        };

        if result.success() {
            tracing::info!(
                instance = %result.instance,
                cached = result.count(NodeStatus::Cached),
                elapsed_ms = result.duration.as_millis() as u64,
                "Run instance succeeded"
            );
        } else {
            tracing::warn!(
                instance = %result.instance,
                failed = result.count(NodeStatus::Failed),
                "Run instance failed"
            );
        }

        result
    }

    /// Gather inputs, compute the cache key and look for a reusable record
    async fn prepare(
        &self,
        graph: &ValidatedGraph,
        idx: usize,
        instance: &RunInstance,
        records: &[ExecutionRecord],
        resolver: &Resolver,
        options: &ExecutionOptions,
    ) -> Prepared {
        let node = graph.node(idx);
        let mut record = ExecutionRecord::pending(&node.name, instance.clone());
        record.started_at = Some(SystemTime::now());

        let gathered = Self::gather_inputs(graph, idx, instance, records, resolver, options);
        let (inputs, key) = match gathered {
            Ok(gathered) => gathered,
            Err(e) => {
                tracing::warn!(node = %node.name, instance = %instance, error = %e, "Input resolution failed");
                record.fail(&e);
                return Prepared::Done(record);
            }
        };

        record.cache_key = key;
        record.inputs = inputs.clone();

        if options.use_cache {
            if let Some(store) = &self.store {
                match store.load(instance, &node.name).await {
                    Ok(Some(previous)) if previous.is_reusable(&record.cache_key) => {
                        tracing::info!(node = %node.name, instance = %instance, "Reusing previous result");
                        let mut cached = previous;
                        cached.status = NodeStatus::Cached;
                        return Prepared::Done(cached);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(node = %node.name, error = %e, "Failed to load record"),
                }
            }
        }

        record.status = NodeStatus::Running;
        Prepared::Run(record, inputs)
    }

    /// Resolve each input port and fold them into the node's cache key
    fn gather_inputs(
        graph: &ValidatedGraph,
        idx: usize,
        instance: &RunInstance,
        records: &[ExecutionRecord],
        resolver: &Resolver,
        options: &ExecutionOptions,
    ) -> FlowResult<(NodeInputs, String)> {
        let node = graph.node(idx);
        let mut inputs = NodeInputs::new();
        let mut external = BTreeMap::new();

        for (port, source) in graph.inputs_of(idx) {
            match source {
                InputSource::Edge { node: upstream, port: upstream_port } => {
                    let value = records[*upstream]
                        .outputs
                        .get(upstream_port)
                        .ok_or_else(|| FlowError::MissingOutput {
                            node: graph.node(*upstream).name.clone(),
                            port: upstream_port.clone(),
                        })?;
                    inputs.insert(port.clone(), value.clone());
                }
                InputSource::Template(template) => {
                    let kind = node
                        .input_port(port)
                        .map(|p| p.kind)
                        .ok_or_else(|| FlowError::UnknownPort {
                            node: node.name.clone(),
                            port: port.clone(),
                            direction: "input".into(),
                        })?;
                    let value = resolver.resolve(template, kind, instance)?;
                    external.insert(port.clone(), value.clone());
                    inputs.insert(port.clone(), value);
                }
            }
        }

        let mut digests: BTreeMap<String, InputDigest<'_>> = BTreeMap::new();
        for (port, source) in graph.inputs_of(idx) {
            let digest = match source {
                InputSource::Edge { node: upstream, port: upstream_port } => InputDigest::Upstream {
                    cache_key: &records[*upstream].cache_key,
                    port: upstream_port,
                },
                InputSource::Template(_) => match external.get(port) {
                    Some(value) => InputDigest::External(value),
                    None => continue,
                },
            };
            digests.insert(port.clone(), digest);
        }

        let key = cache_key(node, &digests, options.invalidation)?;
        Ok((inputs, key))
    }

    /// Start a node's action on the node pool
    fn spawn_node(
        &self,
        graph: &ValidatedGraph,
        idx: usize,
        inputs: NodeInputs,
        instance_dir: &Path,
        options: &ExecutionOptions,
        running: &mut JoinSet<(usize, FlowResult<ExecutionResult>)>,
    ) {
        let node = graph.node(idx).clone();
        let executor = self.executor_for(node.action_kind());
        let work_dir = instance_dir.join(&node.name);
        let timeout = node
            .timeout_secs
            .map(Duration::from_secs)
            .or(options.default_timeout);
        let cancellation = self.cancellation.clone();

        tracing::info!(node = %node.name, work_dir = %work_dir.display(), "Starting node");

        running.spawn(async move {
            let name = node.name.clone();
            let action = tokio::spawn(async move {
                let executor = executor?;
                run_action(executor, &node, &inputs, &work_dir, timeout, &cancellation).await
            });

            let outcome = match action.await {
                Ok(outcome) => outcome,
                Err(e) => Err(FlowError::ToolExecutionFailed {
                    tool: name,
                    error: format!("action task failed: {}", e),
                    help: None,
                }),
            };
            (idx, outcome)
        });
    }

    /// Turn an action outcome into the node's final record state
    fn complete(
        graph: &ValidatedGraph,
        idx: usize,
        record: &mut ExecutionRecord,
        outcome: FlowResult<ExecutionResult>,
    ) {
        let node = graph.node(idx);

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(node = %node.name, instance = %record.instance, error = %e, "Node failed");
                record.fail(&e);
                return;
            }
        };

        record.command = result.command.clone();

        if !result.success {
            let error = FlowError::process_failed(&node.name, result.exit_code, &result.stderr);
            tracing::warn!(node = %node.name, instance = %record.instance, exit_code = result.exit_code, "Node failed");
            record.fail(&error);
            return;
        }

        record.outputs = result.outputs;

        let missing = node
            .outputs
            .iter()
            .find(|p| !p.optional && !record.outputs.contains_key(&p.name));
        if let Some(port) = missing {
            record.fail(&FlowError::MissingOutput {
                node: node.name.clone(),
                port: port.name.clone(),
            });
            return;
        }

        record.status = NodeStatus::Succeeded;
        record.finished_at = Some(SystemTime::now());
        tracing::info!(
            node = %node.name,
            instance = %record.instance,
            elapsed_ms = result.duration.as_millis() as u64,
            "Node succeeded"
        );
    }

    /// Release dependents of a finished node, or fail them if it failed
    fn settle(
        graph: &ValidatedGraph,
        idx: usize,
        records: &mut [ExecutionRecord],
        waiting_on: &mut [usize],
        ready: &mut BinaryHeap<Reverse<usize>>,
    ) {
        let dag = graph.dag();

        if records[idx].status.is_success() {
            for succ in dag.successors(idx) {
                waiting_on[succ] -= 1;
                if waiting_on[succ] == 0 && records[succ].status == NodeStatus::Pending {
                    ready.push(Reverse(succ));
                }
            }
            return;
        }

        let upstream = dag.name(idx).to_string();
        for desc in dag.descendants(idx) {
            if records[desc].status == NodeStatus::Pending {
                records[desc].fail(&FlowError::UpstreamFailed {
                    node: dag.name(desc).to_string(),
                    upstream: upstream.clone(),
                });
            }
        }
    }

    async fn persist(&self, record: &ExecutionRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.store(record).await {
                tracing::warn!(node = %record.node, error = %e, "Failed to persist record");
            }
        }
    }

    /// Print the execution plan
    fn print_execution_plan(&self, graph: &ValidatedGraph, instances: usize) {
        let dag = graph.dag();
        let order = dag.topological_order();

        println!();
        println!("{}: {}", "Workflow".bold(), graph.graph().name);
        println!("{}", "═".repeat(50));
        println!(
            "Execution plan ({} node{} × {} run instance{}):",
            order.len(),
            if order.len() == 1 { "" } else { "s" },
            instances,
            if instances == 1 { "" } else { "s" }
        );
        println!();

        for (i, idx) in order.into_iter().enumerate() {
            let node = graph.node(idx);
            let deps: Vec<&str> = dag.predecessors(idx).into_iter().map(|d| dag.name(d)).collect();

            print!("  {}. {} ({})", i + 1, node.name.bold(), node.action_kind());

            if !deps.is_empty() {
                print!(" {}", format!("[depends: {}]", deps.join(", ")).dimmed());
            }

            println!();
        }

        println!();
    }
}

impl Default for PipelineExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one action with its timeout, racing cancellation
async fn run_action(
    executor: Arc<dyn Executor>,
    node: &crate::pipeline::Node,
    inputs: &NodeInputs,
    work_dir: &Path,
    timeout: Option<Duration>,
    cancellation: &Cancellation,
) -> FlowResult<ExecutionResult> {
    if cancellation.is_cancelled() {
        return Err(FlowError::Cancelled {
            node: node.name.clone(),
        });
    }

    // Stale files from an earlier attempt must not pass as fresh outputs
    if work_dir.exists() {
        tokio::fs::remove_dir_all(work_dir)
            .await
            .map_err(|e| FlowError::FileWriteError {
                path: work_dir.to_path_buf(),
                error: e.to_string(),
            })?;
    }
    tokio::fs::create_dir_all(work_dir)
        .await
        .map_err(|e| FlowError::FileWriteError {
            path: work_dir.to_path_buf(),
            error: e.to_string(),
        })?;

    let action = executor.execute(node, inputs, work_dir);

    tokio::select! {
        _ = cancellation.cancelled() => Err(FlowError::Cancelled { node: node.name.clone() }),
        outcome = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, action)
                    .await
                    .unwrap_or_else(|_| Err(FlowError::Timeout {
                        node: node.name.clone(),
                        seconds: limit.as_secs(),
                    })),
                None => action.await,
            }
        } => outcome,
    }
}
