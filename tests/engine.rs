// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 petflow contributors

//! End-to-end scheduling tests over a small BIDS dataset

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use petflow::cache::{FilesystemRecordStore, NodeStatus};
use petflow::collector::{LinkMode, OutputCollector};
use petflow::errors::FailureKind;
use petflow::executors::{FunctionCall, FunctionExecutor};
use petflow::params::{BidsLayout, ParameterSpace, RunInstance};
use petflow::pipeline::{
    ExecutionOptions, Graph, Node, PipelineExecutor, PipelineResult, PortKind, PortValue,
    ValidatedGraph,
};
use petflow::resolver::Resolver;
use petflow::{FlowError, FlowResult};
use tempfile::TempDir;

const PET_TEMPLATE: &str = "sub-{subject_id}/ses-{session_id}/pet/*_pet.nii.gz";

struct Fixture {
    root: TempDir,
    calls: BTreeMap<&'static str, Arc<AtomicUsize>>,
}

impl Fixture {
    /// Dataset with subjects 01 and 02, each with sessions A and B
    fn new() -> Self {
        let fixture = Self {
            root: TempDir::new().unwrap(),
            calls: ["first", "second", "label"]
                .into_iter()
                .map(|name| (name, Arc::new(AtomicUsize::new(0))))
                .collect(),
        };

        for subject in ["01", "02"] {
            for session in ["A", "B"] {
                fixture.write_pet(subject, session, &format!("{subject}{session}"));
            }
        }
        fixture
    }

    fn data_dir(&self) -> PathBuf {
        self.root.path().join("data")
    }

    fn work_dir(&self) -> PathBuf {
        self.root.path().join("working_dir")
    }

    fn output_dir(&self) -> PathBuf {
        self.root.path().join("output_dir")
    }

    fn write_pet(&self, subject: &str, session: &str, content: &str) {
        let dir = self
            .data_dir()
            .join(format!("sub-{subject}"))
            .join(format!("ses-{session}"))
            .join("pet");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("sub-{subject}_ses-{session}_pet.nii.gz")), content).unwrap();
    }

    fn calls(&self, name: &str) -> usize {
        self.calls[name].load(Ordering::SeqCst)
    }

    fn instances(&self) -> Vec<RunInstance> {
        let layout = BidsLayout::new(self.data_dir()).unwrap();
        ParameterSpace::discover(&layout).unwrap().expand().collect()
    }

    fn executor(&self) -> PipelineExecutor {
        let mut functions = FunctionExecutor::with_builtins();

        let counter = self.calls["first"].clone();
        functions.register("first", move |call: &FunctionCall| {
            counter.fetch_add(1, Ordering::SeqCst);
            append(call, "first")
        });

        let counter = self.calls["second"].clone();
        functions.register("second", move |call: &FunctionCall| {
            counter.fetch_add(1, Ordering::SeqCst);
            append(call, "second")
        });

        let counter = self.calls["label"].clone();
        functions.register("label", move |call: &FunctionCall| {
            counter.fetch_add(1, Ordering::SeqCst);
            let subject = call.input("subject_id")?.to_string();
            Ok(BTreeMap::from([(
                "value".to_string(),
                PortValue::Scalar(format!("subject {subject}")),
            )]))
        });

        let mut executor = PipelineExecutor::new();
        executor.register_executor("function", Arc::new(functions));

        let store = FilesystemRecordStore::new(self.work_dir()).unwrap();
        executor.with_store(Arc::new(store))
    }

    async fn run(&self, options: &ExecutionOptions) -> PipelineResult {
        self.executor()
            .execute(
                Arc::new(graph()),
                self.instances(),
                Arc::new(Resolver::new(self.data_dir()).unwrap()),
                &self.work_dir(),
                options,
            )
            .await
            .unwrap()
    }
}

/// Read `in_file`, append a tag and write it to the node's work dir
fn append(call: &FunctionCall, tag: &str) -> FlowResult<BTreeMap<String, PortValue>> {
    let PortValue::FilePath(input) = call.input("in_file")? else {
        return Err(FlowError::config("in_file is not a file"));
    };

    let content = std::fs::read_to_string(input)?;
    if content.contains("corrupt") {
        return Err(FlowError::config(format!("{} is corrupt", input.display())));
    }

    let output = call.work_dir.join(format!("{tag}.txt"));
    std::fs::write(&output, format!("{content}+{tag}"))?;
    Ok(BTreeMap::from([("out_file".to_string(), PortValue::FilePath(output))]))
}

/// first -> second, plus an independent label branch
fn graph() -> ValidatedGraph {
    let mut graph = Graph::new("engine");
    graph
        .add_node(
            Node::function("first", "first")
                .input("in_file", PortKind::FilePath)
                .output("out_file", PortKind::FilePath, ""),
        )
        .unwrap();
    graph
        .add_node(
            Node::function("second", "second")
                .input("in_file", PortKind::FilePath)
                .output("out_file", PortKind::FilePath, ""),
        )
        .unwrap();
    graph
        .add_node(
            Node::function("label", "label")
                .input("subject_id", PortKind::Scalar)
                .output("value", PortKind::Scalar, ""),
        )
        .unwrap();

    graph.bind("first", "in_file", PET_TEMPLATE).unwrap();
    graph.connect("first", "out_file", "second", "in_file").unwrap();
    graph.bind("label", "subject_id", "{subject_id}").unwrap();

    graph.collect("second", "out_file", "preproc/result.txt").unwrap();
    graph.collect("label", "value", "label.txt").unwrap();

    graph.validate().unwrap()
}

fn statuses(result: &PipelineResult, index: usize) -> Vec<NodeStatus> {
    result.instances[index].records.iter().map(|r| r.status).collect()
}

#[tokio::test]
async fn test_instances_follow_cross_product_order() {
    let fixture = Fixture::new();
    let result = fixture.run(&ExecutionOptions::default()).await;

    let order: Vec<String> = result.instances.iter().map(|r| r.instance.to_string()).collect();
    assert_eq!(
        order,
        vec![
            "{subject_id=01, session_id=A}",
            "{subject_id=01, session_id=B}",
            "{subject_id=02, session_id=A}",
            "{subject_id=02, session_id=B}",
        ]
    );
    assert!(result.success);
}

#[tokio::test]
async fn test_second_run_is_fully_cached() {
    let fixture = Fixture::new();

    let first = fixture.run(&ExecutionOptions::default()).await;
    assert!(first.success);
    assert_eq!(fixture.calls("first"), 4);
    assert_eq!(fixture.calls("second"), 4);
    assert_eq!(fixture.calls("label"), 4);

    let second = fixture.run(&ExecutionOptions::default()).await;
    assert!(second.success);
    for instance in &second.instances {
        assert_eq!(instance.count(NodeStatus::Cached), 3, "{}", instance.instance);
    }
    assert_eq!(fixture.calls("first"), 4);
    assert_eq!(fixture.calls("second"), 4);
    assert_eq!(fixture.calls("label"), 4);
}

#[tokio::test]
async fn test_changed_input_reruns_only_dependents() {
    let fixture = Fixture::new();
    fixture.run(&ExecutionOptions::default()).await;

    fixture.write_pet("01", "B", "01B-reacquired");
    let result = fixture.run(&ExecutionOptions::default()).await;

    assert_eq!(
        statuses(&result, 1),
        vec![NodeStatus::Succeeded, NodeStatus::Succeeded, NodeStatus::Cached]
    );
    for index in [0, 2, 3] {
        assert_eq!(statuses(&result, index), vec![NodeStatus::Cached; 3]);
    }
    assert_eq!(fixture.calls("first"), 5);
    assert_eq!(fixture.calls("second"), 5);
    assert_eq!(fixture.calls("label"), 4);
}

#[tokio::test]
async fn test_disabled_cache_reruns_everything() {
    let fixture = Fixture::new();
    fixture.run(&ExecutionOptions::default()).await;

    let options = ExecutionOptions {
        use_cache: false,
        ..Default::default()
    };
    let result = fixture.run(&options).await;

    assert!(result.success);
    assert_eq!(fixture.calls("first"), 8);
    assert_eq!(result.instances[0].count(NodeStatus::Cached), 0);
}

#[tokio::test]
async fn test_failure_stays_within_its_branch_and_instance() {
    let fixture = Fixture::new();
    fixture.write_pet("02", "A", "corrupt");

    let result = fixture.run(&ExecutionOptions::default()).await;

    assert!(!result.success);
    assert_eq!(result.failed_instances(), 1);

    let failed = &result.instances[2];
    assert_eq!(
        statuses(&result, 2),
        vec![NodeStatus::Failed, NodeStatus::Failed, NodeStatus::Succeeded]
    );

    let roots: Vec<&str> = failed.root_failures().map(|r| r.node.as_str()).collect();
    assert_eq!(roots, vec!["first"]);
    assert_eq!(
        failed.record("first").unwrap().error.as_ref().unwrap().kind,
        FailureKind::Process
    );
    assert_eq!(
        failed.record("second").unwrap().error.as_ref().unwrap().kind,
        FailureKind::UpstreamFailed
    );

    for index in [0, 1, 3] {
        assert!(result.instances[index].success());
    }
    // The failing action ran once; its dependent never started
    assert_eq!(fixture.calls("first"), 4);
    assert_eq!(fixture.calls("second"), 3);
}

#[tokio::test]
async fn test_missing_input_is_a_resolution_failure() {
    let fixture = Fixture::new();
    let pet = fixture.data_dir().join("sub-01/ses-A/pet/sub-01_ses-A_pet.nii.gz");
    std::fs::remove_file(pet).unwrap();

    let result = fixture.run(&ExecutionOptions::default()).await;

    let record = result.instances[0].record("first").unwrap();
    assert_eq!(record.status, NodeStatus::Failed);
    assert_eq!(record.error.as_ref().unwrap().kind, FailureKind::Resolution);
    assert!(result.instances[0].record("label").unwrap().status.is_success());
    assert_eq!(fixture.calls("first"), 3);
}

#[tokio::test]
async fn test_failed_nodes_retry_on_next_run() {
    let fixture = Fixture::new();
    fixture.write_pet("02", "A", "corrupt");
    fixture.run(&ExecutionOptions::default()).await;

    fixture.write_pet("02", "A", "02A");
    let result = fixture.run(&ExecutionOptions::default()).await;

    assert!(result.success);
    assert_eq!(
        statuses(&result, 2),
        vec![NodeStatus::Succeeded, NodeStatus::Succeeded, NodeStatus::Cached]
    );
}

#[tokio::test]
async fn test_collects_outputs_per_instance() {
    let fixture = Fixture::new();
    fixture.write_pet("02", "B", "corrupt");
    let result = fixture.run(&ExecutionOptions::default()).await;

    let collector = OutputCollector::new(fixture.output_dir(), LinkMode::Copy);
    let bindings = graph().graph().outputs.clone();
    let reports: Vec<_> = result
        .instances
        .iter()
        .map(|r| collector.collect_result(r, &bindings))
        .collect();

    let result_file = fixture.output_dir().join("sub-01/ses-A/preproc/result.txt");
    assert_eq!(std::fs::read_to_string(result_file).unwrap(), "01A+first+second");

    let label = fixture.output_dir().join("sub-02/ses-A/label.txt");
    assert_eq!(std::fs::read_to_string(label).unwrap(), "subject 02");

    // The failed branch is skipped; the label of the same instance is still collected
    let broken = &reports[3];
    assert_eq!(broken.collected.len(), 1);
    assert_eq!(broken.skipped.len(), 1);
    assert!(broken.errors.is_empty());
    assert!(!fixture.output_dir().join("sub-02/ses-B/preproc/result.txt").exists());
}

/// Tracks how many calls of a registered function run at once
#[derive(Clone, Default)]
struct Overlap {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl Overlap {
    /// Register `name`; each call holds its slot until `want` calls overlap or `patience` elapses
    fn register(&self, functions: &mut FunctionExecutor, name: &str, want: usize, patience: Duration) {
        let overlap = self.clone();
        functions.register(name, move |call: &FunctionCall| {
            let now = overlap.active.fetch_add(1, Ordering::SeqCst) + 1;
            overlap.peak.fetch_max(now, Ordering::SeqCst);

            let deadline = Instant::now() + patience;
            while overlap.peak.load(Ordering::SeqCst) < want && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }

            overlap.active.fetch_sub(1, Ordering::SeqCst);
            Ok(BTreeMap::from([(
                "value".to_string(),
                call.input("subject_id")?.clone(),
            )]))
        });
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// One scalar node per name, all independent of each other
fn independent_nodes(names: &[&str]) -> ValidatedGraph {
    let mut graph = Graph::new("independent");
    for name in names {
        graph
            .add_node(
                Node::function(*name, "overlap")
                    .input("subject_id", PortKind::Scalar)
                    .output("value", PortKind::Scalar, ""),
            )
            .unwrap();
        graph.bind(name, "subject_id", "{subject_id}").unwrap();
        graph.collect(name, "value", format!("{name}.txt")).unwrap();
    }
    graph.validate().unwrap()
}

async fn run_overlapping(
    fixture: &Fixture,
    graph: ValidatedGraph,
    instances: Vec<RunInstance>,
    options: &ExecutionOptions,
) -> usize {
    let overlap = Overlap::default();
    let mut functions = FunctionExecutor::new();
    overlap.register(&mut functions, "overlap", 2, Duration::from_secs(1));

    let mut executor = PipelineExecutor::new();
    executor.register_executor("function", Arc::new(functions));

    let result = executor
        .execute(
            Arc::new(graph),
            instances,
            Arc::new(Resolver::new(fixture.data_dir()).unwrap()),
            &fixture.work_dir(),
            options,
        )
        .await
        .unwrap();

    assert!(result.success);
    overlap.peak()
}

#[tokio::test]
async fn test_worker_pool_runs_instances_concurrently() {
    let fixture = Fixture::new();
    let options = ExecutionOptions {
        workers: 2,
        ..Default::default()
    };

    let peak = run_overlapping(&fixture, independent_nodes(&["slow"]), fixture.instances(), &options).await;
    assert_eq!(peak, 2);
}

#[tokio::test]
async fn test_single_worker_runs_instances_one_at_a_time() {
    let fixture = Fixture::new();
    let instances = fixture.instances().into_iter().take(2).collect();

    let peak = run_overlapping(
        &fixture,
        independent_nodes(&["slow"]),
        instances,
        &ExecutionOptions::default(),
    )
    .await;
    assert_eq!(peak, 1);
}

#[tokio::test]
async fn test_node_concurrency_runs_branches_in_parallel() {
    let fixture = Fixture::new();
    let instance = fixture.instances().remove(0);

    let options = ExecutionOptions {
        node_concurrency: 2,
        ..Default::default()
    };
    let peak = run_overlapping(
        &fixture,
        independent_nodes(&["left", "right"]),
        vec![instance.clone()],
        &options,
    )
    .await;
    assert_eq!(peak, 2);

    let peak = run_overlapping(
        &fixture,
        independent_nodes(&["left", "right"]),
        vec![instance],
        &ExecutionOptions::default(),
    )
    .await;
    assert_eq!(peak, 1);
}

fn sleeper(timeout_secs: Option<u64>) -> ValidatedGraph {
    let mut node = Node::command("wait", "sleep 5 && echo done > {out_file}")
        .input("subject_id", PortKind::Scalar)
        .output("out_file", PortKind::FilePath, "done.txt");
    if let Some(secs) = timeout_secs {
        node = node.timeout(secs);
    }

    let mut graph = Graph::new("sleeper");
    graph.add_node(node).unwrap();
    graph.bind("wait", "subject_id", "{subject_id}").unwrap();
    graph.collect("wait", "out_file", "done.txt").unwrap();
    graph.validate().unwrap()
}

#[tokio::test]
async fn test_node_timeout() {
    let fixture = Fixture::new();
    let instance = fixture.instances().remove(0);

    let result = PipelineExecutor::with_default_executors()
        .execute(
            Arc::new(sleeper(Some(1))),
            vec![instance],
            Arc::new(Resolver::new(fixture.data_dir()).unwrap()),
            &fixture.work_dir(),
            &ExecutionOptions::default(),
        )
        .await
        .unwrap();

    let record = result.instances[0].record("wait").unwrap();
    assert_eq!(record.error.as_ref().unwrap().kind, FailureKind::Timeout);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancellation_stops_running_nodes() {
    let fixture = Fixture::new();
    let executor = PipelineExecutor::with_default_executors();

    let cancellation = executor.cancellation().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancellation.cancel();
    });

    let started = Instant::now();
    let result = executor
        .execute(
            Arc::new(sleeper(None)),
            fixture.instances(),
            Arc::new(Resolver::new(fixture.data_dir()).unwrap()),
            &fixture.work_dir(),
            &ExecutionOptions::default(),
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(!result.success);
    assert!(result.instances.iter().all(|r| r.was_cancelled()));
}

#[test]
fn test_work_dirs_are_per_instance() {
    let fixture = Fixture::new();
    let dirs: Vec<String> = fixture.instances().iter().map(RunInstance::dir_name).collect();

    let unique: std::collections::BTreeSet<&String> = dirs.iter().collect();
    assert_eq!(unique.len(), dirs.len());
    assert!(Path::new(&dirs[0]).components().count() == 1);
}
