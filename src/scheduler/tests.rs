//! Scheduler Module Tests
//!
//! ## Test Scopes
//! - **Execution state**: striping, requeue on failure, rotation of starved workers.
//! - **Partitioning**: row slices, cache-once placeholders, feature resolution.
//! - **Outputs**: merge order, partial chunk files, column files, checkpoints.
//! - **Progress**: summary text and change detection.
//! - **Cluster scenarios**: whole runs over an in-process group, including
//!   crashed and misbehaving workers, resume from checkpoint, cached
//!   variables and debug mode.

#[cfg(test)]
mod tests {
    use crate::checkpoint::CheckpointStore;
    use crate::config::SchedulerConfig;
    use crate::protocol::*;
    use crate::scheduler::outputs::{COLUMN_CONTENTS_FIELD, CheckpointPolicy, OutputAccumulator};
    use crate::scheduler::partition::{FEATURES_FIELD, Partitioner, open_feature_files};
    use crate::scheduler::{ExecutionState, Progress, ProgressBoard, Scheduler, SchedulerError};
    use crate::transport::{Communicator, LocalCluster, MASTER_RANK, TAG_CONTROL};
    use crate::value::{Grid, Value};
    use crate::worker::{CommandRegistry, Worker};

    use std::collections::{BTreeSet, HashMap};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use uuid::Uuid;

    fn temp_dir(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("scheduler-{}-{}", label, Uuid::new_v4()))
    }

    fn test_config(root: &Path) -> SchedulerConfig {
        SchedulerConfig {
            intelligent_parameters: false,
            batch_size: 5,
            checkpoint_variables: false,
            wait_interval_ms: 1,
            temp_dir: root.join("temp"),
            working_dir: root.join("work"),
            ..Default::default()
        }
    }

    fn doubler(job: &Job) -> JobOutput {
        let mut output = JobOutput::for_job(job);
        let input = job.input("Input");
        let mut result = Grid::new(input.dimensions().0, 1);
        for &index in &job.indices {
            if let Some(value) = input.as_grid().and_then(|grid| grid.get(index, 0).scalar()) {
                result.set(index, 0, Value::Scalar(value * 2.0));
            }
        }
        output.set("Output", Value::Grid(result));
        output
    }

    fn doubling_registry() -> Arc<CommandRegistry> {
        let registry = CommandRegistry::new();
        registry.register("double", doubler);
        registry
    }

    /// Spawns a worker loop for every communicator.
    fn spawn_workers(
        comms: Vec<Arc<Communicator>>,
        registry: &Arc<CommandRegistry>,
    ) -> Vec<JoinHandle<()>> {
        comms
            .into_iter()
            .map(|comm| {
                let worker = Worker::new(comm, registry.clone(), "test-host");
                tokio::spawn(async move {
                    let _ = worker.run().await;
                })
            })
            .collect()
    }

    fn doubling_job(n: usize) -> Job {
        Job::new("double")
            .with_indices(0..n)
            .with_variable("Input", Value::column((0..n).map(|i| i as f64)))
    }

    fn assert_doubled(output: &JobOutput, n: usize) {
        let grid = output.get("Output").as_grid().expect("Output should be a grid");
        for i in 0..n {
            assert_eq!(grid.get(i, 0), &Value::Scalar(i as f64 * 2.0), "row {}", i);
        }
    }

    // ============================================================
    // EXECUTION STATE
    // ============================================================

    #[test]
    fn test_assign_round_stripes_without_overlap() {
        let mut state = ExecutionState::new(0..20, &[1, 2, 3, 4], 5);

        let assigned = state.assign_round();

        assert_eq!(assigned.len(), 4);
        assert_eq!(assigned[0], (1, vec![0, 4, 8, 12, 16]));
        let mut seen = BTreeSet::new();
        for (_, indices) in &assigned {
            for index in indices {
                assert!(seen.insert(*index), "index {} assigned twice", index);
            }
        }
        assert_eq!(state.pending().len(), 20);
        assert_eq!(state.available().count(), 0);
    }

    #[test]
    fn test_dead_worker_indices_are_requeued() {
        let mut state = ExecutionState::new([3, 7, 9, 10], &[1, 2], 3);
        let assigned = state.assign_round();
        let (worker, indices) = assigned[0].clone();
        assert_eq!(indices, vec![3, 9]);

        let requeued = state.mark_dead(worker);

        assert_eq!(requeued, vec![3, 9]);
        assert!(!state.pending().contains(&3) && !state.pending().contains(&9));
        assert!(!state.completed().contains(&3));
        assert!(state.incomplete().contains(&3) && state.incomplete().contains(&9));
        assert!(state.assignment(worker).is_none());
        assert!(state.mark_dead(worker).is_empty(), "second mark is a no-op");
        assert_eq!(state.live_workers(), 1);
    }

    #[test]
    fn test_requeue_of_three_indices() {
        let mut state = ExecutionState::new([3, 7, 9], &[1], 3);
        let assigned = state.assign_round();
        assert_eq!(assigned, vec![(1, vec![3, 7, 9])]);

        state.mark_dead(1);

        assert!(state.pending().is_empty());
        assert!(state.completed().is_empty());
        assert_eq!(state.incomplete(), vec![3, 7, 9]);
    }

    #[test]
    fn test_unreported_indices_are_requeued_on_completion() {
        let mut state = ExecutionState::new(0..4, &[1], 4);
        state.assign_round();

        let requeued = state.complete(1, &[0, 2]);

        assert_eq!(requeued, vec![1, 3]);
        assert_eq!(state.completed().iter().copied().collect::<Vec<_>>(), vec![0, 2]);
        assert!(state.pending().is_empty());
        assert_eq!(state.available().collect::<Vec<_>>(), vec![1]);
        assert!(state.is_primed(1));
    }

    #[test]
    fn test_starved_worker_rotates_to_front() {
        let mut state = ExecutionState::new(0..1, &[1, 2], 5);

        let assigned = state.assign_round();

        assert_eq!(assigned, vec![(1, vec![0])]);
        assert_eq!(state.available().collect::<Vec<_>>(), vec![2]);

        state.complete(1, &[0]);
        assert!(state.is_complete());
        // Freed workers go to the back, starved ones stay at the front.
        assert_eq!(state.available().collect::<Vec<_>>(), vec![2, 1]);
    }

    #[test]
    fn test_retired_worker_is_not_requeued_for_work() {
        let mut state = ExecutionState::new(0..6, &[1, 2], 3);
        state.assign_round();

        let requeued = state.retire(2);
        state.complete(2, &[]);

        assert_eq!(requeued.len(), 3);
        assert_eq!(state.live_workers(), 1);
        assert!(!state.available().any(|w| w == 2));
        assert!(state.dead().is_empty());
    }

    // ============================================================
    // PARTITIONING
    // ============================================================

    #[test]
    fn test_partial_rows_slice_only_selected_rows() {
        let job = Job::new("c")
            .with_variable("Rows", Value::column((0..10).map(|i| i as f64 + 1.0)))
            .with_kind("Rows", VariableKind::PartialRows);
        let features = HashMap::new();
        let partitioner = Partitioner {
            template: &job,
            feature_files: &features,
            feature_dimensions: None,
            all_indices_at_once: false,
        };

        let dispatched = partitioner.build(&[5, 2], false);

        let grid = dispatched.input("Rows").as_grid().unwrap();
        assert_eq!(grid.rows(), 10);
        assert_eq!(grid.populated(), 2);
        assert_eq!(grid.get(2, 0), &Value::Scalar(3.0));
        assert_eq!(grid.get(5, 0), &Value::Scalar(6.0));
        assert_eq!(dispatched.indices, vec![5, 2]);
    }

    #[test]
    fn test_cached_variable_is_sent_once_per_worker() {
        let job = Job::new("c")
            .with_variable("Model", Value::Scalar(42.0))
            .with_variable("Plain", Value::Scalar(1.0))
            .with_kind("Model", VariableKind::Cached);
        let features = HashMap::new();
        let partitioner = Partitioner {
            template: &job,
            feature_files: &features,
            feature_dimensions: None,
            all_indices_at_once: true,
        };

        let first = partitioner.build(&[0], false);
        let later = partitioner.build(&[1], true);

        assert_eq!(first.input("Model"), &Value::Scalar(42.0));
        assert!(later.input("Model").is_empty());
        assert!(later.variables.contains_key("Model"), "placeholder is still sent");
        assert_eq!(later.input("Plain"), &Value::Scalar(1.0));
        assert_eq!(names_in(later.input(CACHED_VARIABLES_FIELD)), vec!["Model".to_string()]);
        assert!(later.is_all_indices_at_once());
    }

    /// Writes four 2-wide vectors `[k, k + 0.5]` and a job whose rows 0, 1
    /// and 2 point at offsets 3, 0 and 2.
    fn feature_fixture(root: &Path) -> (PathBuf, Job) {
        std::fs::create_dir_all(root).unwrap();
        let path = root.join("boxes.features.bin");
        let bytes: Vec<u8> = (0..4)
            .flat_map(|k| [k as f32, k as f32 + 0.5])
            .flat_map(f32::to_le_bytes)
            .collect();
        std::fs::write(&path, bytes).unwrap();

        let mut cells = Grid::new(3, 1);
        for (row, offset) in [(0, 3.0), (1, 0.0), (2, 2.0)] {
            cells.set(row, 0, Value::record([(FEATURES_FIELD, Value::Scalar(offset))]));
        }
        let job = Job::new("c")
            .with_variable("Boxes", Value::Grid(cells))
            .with_kind("Boxes", VariableKind::FeatureStrippedRow);
        (path, job)
    }

    #[test]
    fn test_feature_offsets_are_resolved_from_side_file() {
        let root = temp_dir("features");
        let (path, job) = feature_fixture(&root);
        let features = open_feature_files(&HashMap::from([("Boxes".to_string(), path)]));
        let partitioner = Partitioner {
            template: &job,
            feature_files: &features,
            feature_dimensions: Some(2),
            all_indices_at_once: false,
        };

        let dispatched = partitioner.build(&[2, 0], false);

        let grid = dispatched.input("Boxes").as_grid().unwrap();
        assert_eq!(grid.get(0, 0).field(FEATURES_FIELD), &Value::Vector(vec![3.0, 3.5]));
        assert_eq!(grid.get(2, 0).field(FEATURES_FIELD), &Value::Vector(vec![2.0, 2.5]));
        assert!(grid.get(1, 0).is_empty(), "unselected row stays unset");

        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn test_feature_file_stays_open_across_dispatches() {
        let root = temp_dir("features-open");
        let (path, job) = feature_fixture(&root);
        let features = open_feature_files(&HashMap::from([("Boxes".to_string(), path.clone())]));
        let partitioner = Partitioner {
            template: &job,
            feature_files: &features,
            feature_dimensions: Some(2),
            all_indices_at_once: false,
        };

        let first = partitioner.build(&[2, 0], false);
        // Reads keep going through the handle opened for the run.
        std::fs::remove_file(&path).ok();
        let second = partitioner.build(&[1], false);

        let grid = first.input("Boxes").as_grid().unwrap();
        assert_eq!(grid.get(0, 0).field(FEATURES_FIELD), &Value::Vector(vec![3.0, 3.5]));
        // A lower offset after a higher one needs the file rewound.
        let grid = second.input("Boxes").as_grid().unwrap();
        assert_eq!(grid.get(1, 0).field(FEATURES_FIELD), &Value::Vector(vec![0.0, 0.5]));

        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn test_unopenable_feature_file_skips_the_variable() {
        let root = temp_dir("features-missing");
        let (_, job) = feature_fixture(&root);
        let missing = root.join("absent.features.bin");
        let features = open_feature_files(&HashMap::from([("Boxes".to_string(), missing)]));
        let partitioner = Partitioner {
            template: &job,
            feature_files: &features,
            feature_dimensions: Some(2),
            all_indices_at_once: false,
        };

        let dispatched = partitioner.build(&[0], false);

        assert!(features.is_empty());
        assert!(!dispatched.variables.contains_key("Boxes"));
        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn test_feature_variable_without_dimensions_is_skipped() {
        let job = Job::new("c")
            .with_variable("Boxes", Value::column([0.0]))
            .with_kind("Boxes", VariableKind::FeatureStrippedRow);
        let features = HashMap::new();
        let partitioner = Partitioner {
            template: &job,
            feature_files: &features,
            feature_dimensions: None,
            all_indices_at_once: false,
        };

        let dispatched = partitioner.build(&[0], false);

        assert!(!dispatched.variables.contains_key("Boxes"));
    }

    // ============================================================
    // OUTPUTS
    // ============================================================

    fn output_with(indices: &[usize], name: &str, value: Value) -> JobOutput {
        let mut output = JobOutput::new("c");
        output.indices = indices.to_vec();
        output.set(name, value);
        output
    }

    fn cell_grid(rows: usize, entries: &[(usize, f64)]) -> Value {
        let mut grid = Grid::new(rows, 1);
        for &(row, value) in entries {
            grid.set(row, 0, Value::Scalar(value));
        }
        Value::Grid(grid)
    }

    #[test]
    fn test_merge_order_does_not_matter() {
        let root = temp_dir("merge");
        let config = test_config(&root);
        let a = output_with(&[0], "Out", cell_grid(4, &[(0, 1.0)]));
        let b = output_with(&[3], "Out", cell_grid(4, &[(3, 4.0)]));

        let mut forward = OutputAccumulator::new(HashMap::new(), &config, None);
        forward.absorb(&a);
        forward.absorb(&b);
        let mut backward = OutputAccumulator::new(HashMap::new(), &config, None);
        backward.absorb(&b);
        backward.absorb(&a);

        assert_eq!(forward.outputs(), backward.outputs());
    }

    #[test]
    fn test_partial_outputs_are_flushed_in_chunks() {
        let root = temp_dir("chunks");
        let config = SchedulerConfig {
            partial_chunk_size: 2,
            ..test_config(&root)
        };
        let kinds = HashMap::from([("Rows".to_string(), VariableKind::PartialRows)]);
        let mut outputs = OutputAccumulator::new(kinds, &config, None);

        outputs.absorb(&output_with(&[0, 1], "Rows", cell_grid(5, &[(0, 1.0), (1, 2.0)])));
        assert_eq!(outputs.chunks_written(), 1);
        assert!(!outputs.outputs().contains_key("Rows"));

        outputs.absorb(&output_with(&[4], "Rows", cell_grid(5, &[(4, 5.0)])));
        let result = outputs.finish();

        // The residual is returned and also written as the final chunk.
        assert_eq!(result.get("Rows").unwrap().as_grid().unwrap().populated(), 1);
        let first = Value::load_from_file(&root.join("temp/Rows/0.bin")).unwrap();
        assert_eq!(first.as_grid().unwrap().populated(), 2);
        assert!(root.join("temp/Rows/1.bin").exists());

        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn test_column_outputs_are_written_per_index() {
        let root = temp_dir("columns");
        let config = test_config(&root);
        let stale = root.join("work/Scores/99.bin");
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, b"old").unwrap();

        let kinds = HashMap::from([("Scores".to_string(), VariableKind::DsWorkColumn)]);
        let mut outputs = OutputAccumulator::new(kinds, &config, None);
        let mut grid = Grid::new(3, 2);
        grid.set(0, 1, Value::Scalar(7.0));
        grid.set(2, 1, Value::Scalar(9.0));

        outputs.absorb(&output_with(&[0, 1], "Scores", Value::Grid(grid)));

        assert!(!stale.exists(), "directory is reset on first write");
        assert!(!root.join("work/Scores/1.bin").exists(), "empty column 0 is skipped");
        let column = Value::load_from_file(&root.join("work/Scores/2.bin")).unwrap();
        assert_eq!(column.field("data1"), &Value::Scalar(7.0));
        assert_eq!(column.field("data3"), &Value::Scalar(9.0));
        assert_eq!(column.field(COLUMN_CONTENTS_FIELD), &Value::column([1.0, 3.0]));
        assert!(outputs.outputs().is_empty(), "column outputs are not accumulated");

        std::fs::remove_dir_all(root).ok();
    }

    #[test]
    fn test_checkpoint_written_at_interval() {
        let root = temp_dir("interval");
        let config = test_config(&root);
        let store = CheckpointStore::new(root.join("ckpt"));
        let policy = CheckpointPolicy {
            store: store.clone(),
            interval: 3,
        };
        let mut outputs = OutputAccumulator::new(HashMap::new(), &config, Some(policy));

        outputs.absorb(&output_with(&[0, 1], "Out", cell_grid(4, &[(0, 1.0), (1, 1.0)])));
        assert!(!store.value_path("Out").exists());

        outputs.absorb(&output_with(&[2], "Out", cell_grid(4, &[(2, 1.0)])));
        let restored = store.load(&["Out".to_string()]);
        assert_eq!(restored.covered, BTreeSet::from([0, 1, 2]));

        std::fs::remove_dir_all(root).ok();
    }

    // ============================================================
    // PROGRESS
    // ============================================================

    #[test]
    fn test_progress_summary_lists_every_count() {
        let progress = Progress {
            command: "double".to_string(),
            pending: 4,
            completed: 5,
            total: 20,
            available: 1,
            running: 2,
            dead: 1,
            finished: false,
        };

        assert_eq!(
            progress.to_string(),
            "double: 5/20 completed (25.0%), 4 pending, 1 available, 2 running, 1 dead"
        );
    }

    #[test]
    fn test_progress_board_reports_changes_only() {
        let board = ProgressBoard::new();
        let progress = Progress {
            command: "double".to_string(),
            total: 3,
            ..Default::default()
        };

        assert!(board.publish(progress.clone()));
        assert!(!board.publish(progress.clone()));
        assert!(board.publish(Progress {
            completed: 1,
            ..progress
        }));
        assert_eq!(board.snapshot().completed, 1);
    }

    // ============================================================
    // CLUSTER SCENARIOS
    // ============================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_four_workers_double_twenty_indices() {
        let root = temp_dir("scenario");
        let registry = doubling_registry();
        let mut group = LocalCluster::build(5);
        let master = group.remove(0);
        let tasks = spawn_workers(group, &registry);

        let scheduler = Scheduler::new(master, test_config(&root));
        let output = scheduler.execute(&doubling_job(20)).await.unwrap();

        assert_eq!(output.indices, (0..20).collect::<Vec<_>>());
        assert_doubled(&output, 20);
        assert_eq!(scheduler.progress().snapshot().completed, 20);

        assert_eq!(scheduler.finish().await, 4);
        for task in tasks {
            task.await.unwrap();
        }
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_crashed_worker_indices_are_recomputed() {
        let root = temp_dir("crash");
        let registry = doubling_registry();
        let mut group = LocalCluster::build(4);
        let master = group.remove(0);
        let crasher = group.remove(0);
        let tasks = spawn_workers(group, &registry);

        // Rank 1 takes the first batch, then disappears without answering.
        let crash_task = tokio::spawn(async move {
            let job = receive_job(&crasher, MASTER_RANK).await.unwrap();
            drop(crasher);
            job.indices
        });

        let scheduler = Scheduler::new(master, test_config(&root));
        let output = scheduler.execute(&doubling_job(12)).await.unwrap();

        let lost = crash_task.await.unwrap();
        assert!(!lost.is_empty());
        assert_eq!(output.indices, (0..12).collect::<Vec<_>>());
        assert_doubled(&output, 12);
        assert_eq!(scheduler.dead_workers(), BTreeSet::from([1]));

        assert_eq!(scheduler.finish().await, 2);
        for task in tasks {
            task.await.unwrap();
        }
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn test_no_workers_is_an_error() {
        let mut group = LocalCluster::build(1);
        let scheduler = Scheduler::new(group.remove(0), SchedulerConfig::default());

        let err = scheduler.execute(&doubling_job(3)).await.unwrap_err();

        assert!(matches!(err, SchedulerError::NoWorkers));
    }

    #[tokio::test]
    async fn test_all_workers_dead_is_an_error() {
        let root = temp_dir("dead");
        let mut group = LocalCluster::build(3);
        let master = group.remove(0);
        drop(group);

        let scheduler = Scheduler::new(master, test_config(&root));
        let err = scheduler.execute(&doubling_job(6)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NoLiveWorkers { remaining: 6 }));
        assert_eq!(scheduler.dead_workers(), BTreeSet::from([1, 2]));

        // The dead set carries over to the next call.
        let err = scheduler.execute(&doubling_job(2)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NoLiveWorkers { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resume_skips_checkpointed_indices() {
        let root = temp_dir("resume");
        let config = SchedulerConfig {
            resume_from: vec!["Output".to_string()],
            ..test_config(&root)
        };
        let saved = Value::column((0..14).map(|i| i as f64 * 2.0));
        CheckpointStore::new(config.checkpoint_dir())
            .checkpoint("Output", &saved, &(0..14).collect::<Vec<_>>())
            .unwrap();

        let registry = CommandRegistry::new();
        registry.register("double", |_: &Job| -> JobOutput {
            panic!("nothing should be dispatched")
        });
        let mut group = LocalCluster::build(2);
        let master = group.remove(0);
        let tasks = spawn_workers(group, &registry);

        let scheduler = Scheduler::new(master, config);
        let output = scheduler.execute(&doubling_job(14)).await.unwrap();

        assert_eq!(output.indices, (0..14).collect::<Vec<_>>());
        assert_eq!(output.get("Output"), &saved);

        scheduler.finish().await;
        for task in tasks {
            task.await.unwrap();
        }
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_debug_mode_uses_one_node_and_one_index() {
        let root = temp_dir("debug");
        let config = SchedulerConfig {
            debug_node: Some(2),
            debug_single_index: Some(4),
            ..test_config(&root)
        };
        let registry = CommandRegistry::new();
        registry.register("whoami", |job: &Job| {
            let mut output = JobOutput::for_job(job);
            output.set("Seen", Value::Scalar(job.indices[0] as f64));
            output
        });
        let mut group = LocalCluster::build(3);
        let master = group.remove(0);
        let tasks = spawn_workers(group, &registry);

        let scheduler = Scheduler::new(master, config);
        let hosts = scheduler.identify_workers().await;
        assert_eq!(hosts.len(), 2);

        let output = scheduler
            .execute(&Job::new("whoami").with_indices(0..10))
            .await
            .unwrap();

        assert_eq!(output.indices, vec![4]);
        assert_eq!(output.get("Seen"), &Value::Scalar(4.0));

        assert_eq!(scheduler.finish().await, 2);
        for task in tasks {
            task.await.unwrap();
        }
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resumed_run_is_sized_from_remaining_indices() {
        let root = temp_dir("resume-sizing");
        let config = SchedulerConfig {
            intelligent_parameters: true,
            checkpoint_variables: true,
            all_indices_at_once: true,
            resume_from: vec!["Output".to_string()],
            ..test_config(&root)
        };
        let mut saved = Grid::new(500, 1);
        for row in 0..490 {
            saved.set(row, 0, Value::Scalar(row as f64 * 2.0));
        }
        let store = CheckpointStore::new(config.checkpoint_dir());
        store
            .checkpoint("Output", &Value::Grid(saved), &(0..490).collect::<Vec<_>>())
            .unwrap();

        let batches = Arc::new(Mutex::new(Vec::new()));
        let seen = batches.clone();
        let registry = CommandRegistry::new();
        registry.register("double", move |job: &Job| {
            seen.lock().unwrap().push(job.indices.len());
            doubler(job)
        });
        let mut group = LocalCluster::build(2);
        let master = group.remove(0);
        let tasks = spawn_workers(group, &registry);

        let scheduler = Scheduler::new(master, config);
        let output = scheduler.execute(&doubling_job(500)).await.unwrap();

        // 10 left on one worker: batch 3, checkpoint every 6 indices.
        assert_eq!(*batches.lock().unwrap(), vec![3, 3, 3, 1]);
        assert_eq!(output.indices, (0..500).collect::<Vec<_>>());
        assert_doubled(&output, 500);
        let covered = store.load(&["Output".to_string()]).covered;
        assert!(covered.contains(&495), "second batch completes the first interval");
        assert!(!covered.contains(&496));

        scheduler.finish().await;
        for task in tasks {
            task.await.unwrap();
        }
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_worker_with_broken_stream_is_never_contacted_again() {
        let root = temp_dir("retired");
        let registry = doubling_registry();
        let mut group = LocalCluster::build(3);
        let master = group.remove(0);
        let garbled = group.remove(0);
        let tasks = spawn_workers(group, &registry);

        // Rank 1 takes a batch, then answers with an envelope that announces
        // more indices than it carries.
        let garbled_task = tokio::spawn(async move {
            let job = receive_job(&garbled, MASTER_RANK).await.unwrap();
            signal_done(&garbled).await.unwrap();
            wait_for_ack(&garbled).await.unwrap();
            garbled.send_string(MASTER_RANK, &job.command).await.unwrap();
            garbled.send_int(MASTER_RANK, TAG_CONTROL, 3).await.unwrap();
            garbled.send_indices(MASTER_RANK, TAG_CONTROL, &[job.indices[0]]).await.unwrap();
            garbled
        });

        let scheduler = Scheduler::new(master, test_config(&root));
        let output = scheduler.execute(&doubling_job(10)).await.unwrap();
        let garbled = garbled_task.await.unwrap();

        assert_eq!(output.indices, (0..10).collect::<Vec<_>>());
        assert_doubled(&output, 10);
        assert_eq!(scheduler.retired_workers(), BTreeSet::from([1]));
        assert!(scheduler.dead_workers().is_empty());

        // Later calls only talk to rank 2.
        let second_job = doubling_job(4);
        let second = scheduler.execute(&second_job);
        let output = tokio::time::timeout(Duration::from_secs(10), second)
            .await
            .expect("retired worker must not be dispatched to")
            .unwrap();
        assert_eq!(output.indices, (0..4).collect::<Vec<_>>());
        assert_eq!(scheduler.identify_workers().await.len(), 1);
        assert_eq!(scheduler.finish().await, 1);

        let stray = garbled.recv_string(MASTER_RANK);
        let stray = tokio::time::timeout(Duration::from_millis(100), stray).await;
        assert!(stray.is_err(), "rank 1 received another message");

        for task in tasks {
            task.await.unwrap();
        }
        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cached_variable_placeholder_after_first_completion() {
        let root = temp_dir("cached");
        let config = SchedulerConfig {
            batch_size: 1,
            ..test_config(&root)
        };
        let mut group = LocalCluster::build(2);
        let master = group.remove(0);
        let node = group.remove(0);

        // Bare job loop that records what arrives for the cached variable.
        let observer = tokio::spawn(async move {
            let mut placeholders = Vec::new();
            loop {
                let job = receive_job(&node, MASTER_RANK).await.unwrap();
                if job.command == FINISH_COMMAND {
                    acknowledge_finish(&node).await.unwrap();
                    return placeholders;
                }
                placeholders.push(job.input("Model").is_empty());
                signal_done(&node).await.unwrap();
                wait_for_ack(&node).await.unwrap();
                send_output(&node, MASTER_RANK, &JobOutput::for_job(&job)).await.unwrap();
            }
        });

        let job = Job::new("score")
            .with_indices(0..3)
            .with_variable("Model", Value::Scalar(42.0))
            .with_kind("Model", VariableKind::Cached);
        let scheduler = Scheduler::new(master, config);
        let output = scheduler.execute(&job).await.unwrap();
        assert_eq!(scheduler.finish().await, 1);

        assert_eq!(output.indices, vec![0, 1, 2]);
        assert_eq!(observer.await.unwrap(), vec![false, true, true]);
        std::fs::remove_dir_all(root).ok();
    }
}
