use std::time::Duration;

use bytes::Bytes;
use rivus::{ConsumerAction, ConsumerConfig, StreamConfig};

mod helpers;
use helpers::*;

fn durable_cfg() -> ConsumerConfig {
    ConsumerConfig {
        durable_name: Some("keeper".to_string()),
        ack_wait: Duration::from_millis(100),
        ..Default::default()
    }
}

#[cfg(test)]
mod durability_tests {
    use super::*;

    #[tokio::test]
    async fn test_durable_cursor_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream_cfg = StreamConfig::new("DUR");
        stream_cfg.state_dir = Some(dir.path().to_path_buf());

        // First life: deliver two, ack the first.
        {
            let mut h = setup_stream_with_config(stream_cfg.clone());
            h.stream.publish("x", Bytes::from_static(b"m1"));
            h.stream.publish("x", Bytes::from_static(b"m2"));
            let consumer = h
                .stream
                .create_consumer(durable_cfg(), ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.d", pull_body(2, Duration::from_secs(2)));
            let e1 = recv_envelope(&mut h.outbound, 1000).await;
            let _e2 = recv_envelope(&mut h.outbound, 1000).await;
            consumer.process_ack_message(&e1.reply, "", Bytes::new());
            tokio::time::sleep(Duration::from_millis(50)).await;
            consumer.stop().await;
        }

        // Second life: same state dir, fresh process-equivalent.
        let mut h = setup_stream_with_config(stream_cfg);
        h.stream.publish("x", Bytes::from_static(b"m1"));
        h.stream.publish("x", Bytes::from_static(b"m2"));
        let consumer = h
            .stream
            .create_consumer(durable_cfg(), ConsumerAction::Create)
            .unwrap();

        let info = consumer.info();
        assert_eq!(info.delivered.stream_seq, 2);
        assert_eq!(info.ack_floor.stream_seq, 1);
        assert_eq!(info.num_ack_pending, 1);

        // The unacked message comes back as a redelivery, not a fresh one.
        consumer.process_next_request("inbox.d2", pull_body(1, Duration::from_secs(2)));
        let env = recv_envelope(&mut h.outbound, 1000).await;
        let (dc, sseq, _, _) = ack_tokens(&env);
        assert_eq!((dc, sseq), (2, 2));
    }

    #[tokio::test]
    async fn test_delete_removes_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream_cfg = StreamConfig::new("DUR2");
        stream_cfg.state_dir = Some(dir.path().to_path_buf());

        let h = setup_stream_with_config(stream_cfg);
        h.stream.publish("x", Bytes::from_static(b"m1"));
        h.stream
            .create_consumer(durable_cfg(), ConsumerAction::Create)
            .unwrap();

        let state_file = dir.path().join("keeper.state");
        assert!(state_file.exists());

        h.stream.delete_consumer("keeper").await.unwrap();
        assert!(!state_file.exists());
    }
}
