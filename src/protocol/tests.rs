//! Protocol Module Tests
//!
//! ## Test Scopes
//! - **Envelopes**: jobs and outputs arrive intact, including empty ones.
//! - **Handshake**: done, ack and output happen in order.
//! - **Integrity**: mismatched announced lengths are rejected.

#[cfg(test)]
mod tests {
    use crate::protocol::*;
    use crate::transport::{LocalCluster, MASTER_RANK, TAG_CONTROL, TAG_STRING};
    use crate::value::Value;

    // ============================================================
    // ENVELOPES
    // ============================================================

    #[tokio::test]
    async fn test_job_arrives_intact() {
        let group = LocalCluster::build(2);
        let job = Job::new("features")
            .with_indices([4, 9, 2])
            .with_variable("Threshold", Value::Scalar(0.5))
            .with_variable("Labels", Value::text("cats"))
            .with_kind("Threshold", VariableKind::Cached);

        let _handle = start_job(&group[0], 1, &job).await.unwrap();
        let received = receive_job(&group[1], MASTER_RANK).await.unwrap();

        assert_eq!(received.command, "features");
        assert_eq!(received.indices, vec![4, 9, 2]);
        assert_eq!(received.input("Threshold"), &Value::Scalar(0.5));
        assert_eq!(received.input("Labels").as_text(), Some("cats"));
        // Kinds stay on the master.
        assert!(received.kinds.is_empty());
    }

    #[tokio::test]
    async fn test_empty_job_arrives_intact() {
        let group = LocalCluster::build(2);

        let _handle = start_job(&group[0], 1, &Job::new("noop")).await.unwrap();
        let received = receive_job(&group[1], MASTER_RANK).await.unwrap();

        assert_eq!(received.command, "noop");
        assert!(received.indices.is_empty());
        assert!(received.variables.is_empty());
        assert!(received.input("Anything").is_empty());
    }

    #[tokio::test]
    async fn test_back_to_back_jobs_do_not_interleave() {
        let group = LocalCluster::build(2);

        let a = Job::new("a").with_indices([1]).with_variable("X", Value::Scalar(1.0));
        let b = Job::new("b").with_indices([2]).with_variable("X", Value::Scalar(2.0));
        let _a = start_job(&group[0], 1, &a).await.unwrap();
        let _b = start_job(&group[0], 1, &b).await.unwrap();

        let first = receive_job(&group[1], MASTER_RANK).await.unwrap();
        let second = receive_job(&group[1], MASTER_RANK).await.unwrap();
        assert_eq!((first.command.as_str(), first.input("X")), ("a", &Value::Scalar(1.0)));
        assert_eq!((second.command.as_str(), second.input("X")), ("b", &Value::Scalar(2.0)));
    }

    // ============================================================
    // HANDSHAKE
    // ============================================================

    #[tokio::test]
    async fn test_completion_handshake() {
        let group = LocalCluster::build(2);
        let master = group[0].clone();
        let worker = group[1].clone();

        let job = Job::new("square").with_indices([3]);
        let mut handle = start_job(&master, 1, &job).await.unwrap();
        assert!(handle.poll().is_none(), "worker has not finished yet");

        let worker_task = tokio::spawn(async move {
            let job = receive_job(&worker, MASTER_RANK).await.unwrap();
            let mut output = JobOutput::for_job(&job);
            output.set("Result", Value::Scalar(9.0));

            signal_done(&worker).await.unwrap();
            wait_for_ack(&worker).await.unwrap();
            send_output(&worker, MASTER_RANK, &output).await.unwrap();
        });

        assert_eq!(handle.wait().await.unwrap(), 1);
        let output = collect_output(&master, 1).await.unwrap();
        worker_task.await.unwrap();

        assert_eq!(output.command, "square");
        assert_eq!(output.indices, vec![3]);
        assert_eq!(output.get("Result"), &Value::Scalar(9.0));
    }

    #[tokio::test]
    async fn test_identify_round_trip() {
        let group = LocalCluster::build(2);
        let worker = group[1].clone();

        let worker_task = tokio::spawn(async move {
            let job = receive_job(&worker, MASTER_RANK).await.unwrap();
            assert_eq!(job.command, IDENTIFY_COMMAND);
            worker.send_string(MASTER_RANK, "rack-7").await.unwrap();
        });

        assert_eq!(request_identity(&group[0], 1).await.unwrap(), "rack-7");
        worker_task.await.unwrap();
    }

    // ============================================================
    // INTEGRITY
    // ============================================================

    #[tokio::test]
    async fn test_index_count_mismatch_is_codec_error() {
        let group = LocalCluster::build(2);

        // Hand-built envelope announcing 3 indices but carrying 2.
        group[0].send_string(1, "bad").await.unwrap();
        group[0].send_int(1, TAG_CONTROL, 3).await.unwrap();
        group[0].send_indices(1, TAG_CONTROL, &[1, 2]).await.unwrap();

        let err = receive_job(&group[1], MASTER_RANK).await.unwrap_err();
        assert!(!err.is_peer_dead());
    }

    #[tokio::test]
    async fn test_payload_length_mismatch_is_codec_error() {
        let group = LocalCluster::build(2);
        let payload = Value::Scalar(1.0).to_bytes().unwrap();

        group[0].send_string(1, "bad").await.unwrap();
        group[0].send_int(1, TAG_CONTROL, 0).await.unwrap();
        group[0].send_indices(1, TAG_CONTROL, &[]).await.unwrap();
        group[0].send_int(1, TAG_CONTROL, 1).await.unwrap();
        group[0].send(1, TAG_STRING, b"X".to_vec()).await.unwrap();
        group[0].send_int(1, TAG_CONTROL, payload.len() as u64 + 5).await.unwrap();
        group[0]
            .send(1, crate::transport::TAG_VARIABLE_BASE, payload)
            .await
            .unwrap();

        let err = receive_job(&group[1], MASTER_RANK).await.unwrap_err();
        assert!(matches!(err, crate::transport::TransportError::Codec { rank: 0, .. }));
    }

    // ============================================================
    // TYPES
    // ============================================================

    #[test]
    fn test_reserved_commands() {
        assert!(is_reserved_command(FINISH_COMMAND));
        assert!(is_reserved_command(IDENTIFY_COMMAND));
        assert!(!is_reserved_command("double"));
    }

    #[test]
    fn test_name_list_round_trip() {
        let encoded = name_list(["Features", "Model"]);

        assert_eq!(encoded.dimensions(), (2, 1));
        assert_eq!(names_in(&encoded), vec!["Features".to_string(), "Model".to_string()]);
        assert_eq!(names_in(&Value::text("Solo")), vec!["Solo".to_string()]);
        assert!(names_in(&Value::Scalar(1.0)).is_empty());
    }

    #[test]
    fn test_absorb_merges_indices_and_values() {
        let mut left = JobOutput::new("c");
        left.indices = vec![0, 1];
        let mut grid = crate::value::Grid::new(3, 1);
        grid.set(0, 0, Value::Scalar(1.0));
        left.set("Out", Value::Grid(grid));

        let mut right = JobOutput::new("c");
        right.indices = vec![1, 2];
        let mut grid = crate::value::Grid::new(3, 1);
        grid.set(2, 0, Value::Scalar(3.0));
        right.set("Out", Value::Grid(grid));

        left.absorb(right);

        assert_eq!(left.indices, vec![0, 1, 2]);
        let merged = left.get("Out").as_grid().unwrap();
        assert_eq!(merged.get(0, 0), &Value::Scalar(1.0));
        assert_eq!(merged.get(2, 0), &Value::Scalar(3.0));
        assert!(merged.get(1, 0).is_empty());
    }
}
