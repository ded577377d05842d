use std::time::{Duration, Instant};

use bytes::Bytes;
use rivus::consumer::waiting::NextRequest;
use rivus::{AckPolicy, ConsumerAction, ConsumerConfig, DeliverPolicy, ReplayPolicy};

mod helpers;
use helpers::*;

fn pull_cfg(name: &str) -> ConsumerConfig {
    ConsumerConfig {
        durable_name: Some(name.to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod consumer_tests {
    use super::*;

    mod pull_flow {
        use super::*;

        #[tokio::test]
        async fn test_pull_explicit_happy_path() {
            let mut h = setup_stream("S1");
            for i in 1..=3 {
                h.stream.publish("x", Bytes::from(format!("m{}", i)));
            }
            let consumer = h
                .stream
                .create_consumer(pull_cfg("c1"), ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.c1", pull_body(3, Duration::from_secs(2)));

            // Three envelopes, ack suffixes .1.<sseq>.<dseq>.*.<remaining>
            let mut replies = Vec::new();
            for expect in [(1, 1, 1, 2), (1, 2, 2, 1), (1, 3, 3, 0)] {
                let env = recv_envelope(&mut h.outbound, 1000).await;
                assert_eq!(env.deliver_to, "inbox.c1");
                assert_eq!(env.subject, "x");
                assert_eq!(ack_tokens(&env), expect);
                replies.push(env.reply);
            }

            for reply in &replies {
                consumer.process_ack_message(reply, "", Bytes::from_static(b"+ACK"));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;

            let info = consumer.info();
            assert_eq!(info.ack_floor.consumer_seq, 3);
            assert_eq!(info.ack_floor.stream_seq, 3);
            assert_eq!(info.num_ack_pending, 0);

            // Fully acked: nothing should be redelivered.
            consumer.process_next_request("inbox.c1", pull_body(1, Duration::from_millis(200)));
            let env = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(envelope_status(&env), Some(408));
        }

        #[tokio::test]
        async fn test_batch_served_across_requests() {
            let mut h = setup_stream("S2");
            let consumer = h
                .stream
                .create_consumer(pull_cfg("c1"), ConsumerAction::Create)
                .unwrap();

            // Request first, then publish: delivery should follow the signal.
            consumer.process_next_request("inbox.a", pull_body(1, Duration::from_secs(2)));
            tokio::time::sleep(Duration::from_millis(20)).await;
            h.stream.publish("x", Bytes::from_static(b"late"));

            let env = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(env.payload, Bytes::from_static(b"late"));
        }

        #[tokio::test]
        async fn test_no_wait_gets_404_when_drained() {
            let mut h = setup_stream("S3");
            let consumer = h
                .stream
                .create_consumer(pull_cfg("c1"), ConsumerAction::Create)
                .unwrap();

            let req = NextRequest {
                batch: 1,
                no_wait: true,
                ..Default::default()
            };
            consumer.process_next_request("inbox.nw", Bytes::from(serde_json::to_vec(&req).unwrap()));

            let env = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(env.deliver_to, "inbox.nw");
            assert_eq!(envelope_status(&env), Some(404));
        }

        #[tokio::test]
        async fn test_request_expiry_sends_408_with_remaining_budget() {
            let mut h = setup_stream("S4");
            let consumer = h
                .stream
                .create_consumer(pull_cfg("c1"), ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.exp", pull_body(2, Duration::from_millis(150)));

            let env = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(envelope_status(&env), Some(408));
            assert_eq!(header_value(&env, "Nats-Pending-Messages").as_deref(), Some("2"));
            assert_eq!(header_value(&env, "Nats-Pending-Bytes").as_deref(), Some("0"));
        }

        #[tokio::test]
        async fn test_max_bytes_budget_closes_request() {
            let mut h = setup_stream("S5");
            h.stream.publish("x", Bytes::from(vec![0u8; 64]));
            h.stream.publish("x", Bytes::from(vec![0u8; 64]));
            let consumer = h
                .stream
                .create_consumer(pull_cfg("c1"), ConsumerAction::Create)
                .unwrap();

            let req = NextRequest {
                batch: 10,
                max_bytes: 100,
                expires: Duration::from_secs(2).as_nanos() as i64,
                ..Default::default()
            };
            consumer.process_next_request("inbox.mb", Bytes::from(serde_json::to_vec(&req).unwrap()));

            // First 64-byte message fits, the second overflows the budget.
            let env = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(ack_tokens(&env).1, 1);
            let env = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(envelope_status(&env), Some(409));
        }
    }

    mod redelivery {
        use super::*;

        #[tokio::test]
        async fn test_ack_wait_redelivery_increments_dc() {
            let mut h = setup_stream("R1");
            h.stream.publish("x", Bytes::from_static(b"m1"));
            let mut cfg = pull_cfg("c1");
            cfg.ack_wait = Duration::from_millis(100);
            cfg.max_ack_pending = 1;
            let consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.r", pull_body(2, Duration::from_secs(2)));

            let first = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(ack_tokens(&first), (1, 1, 1, 0));

            // No ack: seq 1 comes back with dc=2 after the ack wait.
            let again = recv_envelope(&mut h.outbound, 1000).await;
            let (dc, sseq, dseq, _) = ack_tokens(&again);
            assert_eq!((dc, sseq, dseq), (2, 1, 2));

            consumer.process_ack_message(&again.reply, "", Bytes::new());
            tokio::time::sleep(Duration::from_millis(50)).await;
            let info = consumer.info();
            assert_eq!(info.num_ack_pending, 0);
            assert_eq!(info.ack_floor.consumer_seq, 2);
        }

        #[tokio::test]
        async fn test_nak_with_delay_schedules_precisely() {
            let mut h = setup_stream("R2");
            h.stream.publish("x", Bytes::from_static(b"m1"));
            let consumer = h
                .stream
                .create_consumer(pull_cfg("c1"), ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.nak", pull_body(2, Duration::from_secs(5)));
            let first = recv_envelope(&mut h.outbound, 1000).await;
            let start = Instant::now();
            consumer.process_ack_message(&first.reply, "", Bytes::from_static(b"-NAK 250ms"));

            let again = recv_envelope(&mut h.outbound, 2000).await;
            let elapsed = start.elapsed();
            assert_eq!(ack_tokens(&again).0, 2);
            assert!(
                elapsed >= Duration::from_millis(240),
                "redelivered too early: {:?}",
                elapsed
            );
        }

        #[tokio::test]
        async fn test_nak_without_delay_redelivers_immediately() {
            let mut h = setup_stream("R3");
            h.stream.publish("x", Bytes::from_static(b"m1"));
            let consumer = h
                .stream
                .create_consumer(pull_cfg("c1"), ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.nak2", pull_body(2, Duration::from_secs(2)));
            let first = recv_envelope(&mut h.outbound, 1000).await;
            consumer.process_ack_message(&first.reply, "", Bytes::from_static(b"-NAK"));

            let again = recv_envelope(&mut h.outbound, 500).await;
            assert_eq!(ack_tokens(&again).0, 2);
        }

        #[tokio::test]
        async fn test_progress_extends_ack_wait() {
            let mut h = setup_stream("R4");
            h.stream.publish("x", Bytes::from_static(b"m1"));
            let mut cfg = pull_cfg("c1");
            cfg.ack_wait = Duration::from_millis(200);
            let consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.wpi", pull_body(2, Duration::from_secs(5)));
            let first = recv_envelope(&mut h.outbound, 1000).await;

            tokio::time::sleep(Duration::from_millis(120)).await;
            consumer.process_ack_message(&first.reply, "", Bytes::from_static(b"+WPI"));

            // The clock restarted at ~120ms, so nothing before ~320ms.
            expect_quiet(&mut h.outbound, 150).await;
            let again = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(ack_tokens(&again).0, 2);
        }

        #[tokio::test]
        async fn test_term_suppresses_and_advises() {
            let mut h = setup_stream("R5");
            h.stream.publish("x", Bytes::from_static(b"poison"));
            let mut cfg = pull_cfg("c1");
            cfg.ack_wait = Duration::from_millis(100);
            let consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.term", pull_body(2, Duration::from_secs(2)));
            let first = recv_envelope(&mut h.outbound, 1000).await;
            consumer.process_ack_message(&first.reply, "", Bytes::from_static(b"+TERM schema error"));

            let adv = wait_advisory(&mut h.advisories, "MSG_TERMINATED", 1000).await;
            let json = serde_json::to_string(&adv).unwrap();
            assert!(json.contains("schema error"));

            // Terminated counts as acked: no redelivery.
            expect_quiet(&mut h.outbound, 250).await;
            assert_eq!(consumer.info().num_ack_pending, 0);
        }

        #[tokio::test]
        async fn test_max_deliver_emits_single_advisory_and_drops() {
            let mut h = setup_stream("R6");
            h.stream.publish("x", Bytes::from_static(b"m1"));
            let mut cfg = pull_cfg("c1");
            cfg.ack_wait = Duration::from_millis(80);
            cfg.max_deliver = 2;
            let consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.md", pull_body(5, Duration::from_secs(5)));
            let first = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(ack_tokens(&first).0, 1);
            let second = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(ack_tokens(&second).0, 2);

            // Third delivery would exceed the limit: advisory, then nothing.
            let adv = wait_advisory(&mut h.advisories, "MAX_DELIVERIES", 2000).await;
            let json = serde_json::to_string(&adv).unwrap();
            assert!(json.contains("max_deliver"));
            expect_quiet(&mut h.outbound, 250).await;
            assert_eq!(consumer.info().num_ack_pending, 0);
        }

        #[tokio::test]
        async fn test_ack_is_idempotent() {
            let mut h = setup_stream("R7");
            h.stream.publish("x", Bytes::from_static(b"m1"));
            h.stream.publish("x", Bytes::from_static(b"m2"));
            let consumer = h
                .stream
                .create_consumer(pull_cfg("c1"), ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.idem", pull_body(2, Duration::from_secs(2)));
            let e1 = recv_envelope(&mut h.outbound, 1000).await;
            let _e2 = recv_envelope(&mut h.outbound, 1000).await;

            consumer.process_ack_message(&e1.reply, "", Bytes::new());
            tokio::time::sleep(Duration::from_millis(30)).await;
            let floor = consumer.info().ack_floor;

            // A duplicate ack must not regress or advance anything.
            consumer.process_ack_message(&e1.reply, "", Bytes::new());
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert_eq!(consumer.info().ack_floor, floor);
            assert_eq!(consumer.info().num_ack_pending, 1);
        }
    }

    mod policies {
        use super::*;

        #[tokio::test]
        async fn test_ack_all_advances_through_lower_sequences() {
            let mut h = setup_stream("P1");
            for i in 1..=5 {
                h.stream.publish("x", Bytes::from(format!("m{}", i)));
            }
            let mut cfg = pull_cfg("c1");
            cfg.ack_policy = AckPolicy::All;
            let consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.all", pull_body(5, Duration::from_secs(2)));
            let mut third = None;
            for i in 1..=5 {
                let env = recv_envelope(&mut h.outbound, 1000).await;
                if i == 3 {
                    third = Some(env);
                }
            }

            consumer.process_ack_message(&third.unwrap().reply, "", Bytes::new());
            tokio::time::sleep(Duration::from_millis(50)).await;
            let info = consumer.info();
            assert_eq!(info.ack_floor.stream_seq, 3);
            assert_eq!(info.num_ack_pending, 2);
        }

        #[tokio::test]
        async fn test_ack_none_needs_no_acks() {
            let mut h = setup_stream("P2");
            for i in 1..=3 {
                h.stream.publish("x", Bytes::from(format!("m{}", i)));
            }
            let mut cfg = pull_cfg("c1");
            cfg.ack_policy = AckPolicy::None;
            let consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.none", pull_body(3, Duration::from_secs(2)));
            for _ in 0..3 {
                recv_envelope(&mut h.outbound, 1000).await;
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
            let info = consumer.info();
            assert_eq!(info.num_ack_pending, 0);
            assert_eq!(info.ack_floor.stream_seq, 3);
        }

        #[tokio::test]
        async fn test_filtered_delivery_skips_non_matching() {
            let mut h = setup_stream("P3");
            h.stream.publish("a.1", Bytes::from_static(b"m1"));
            h.stream.publish("c.1", Bytes::from_static(b"m2"));
            h.stream.publish("b.1", Bytes::from_static(b"m3"));
            let mut cfg = pull_cfg("c1");
            cfg.filter_subjects = vec!["a.>".to_string(), "b.>".to_string()];
            let consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.f", pull_body(2, Duration::from_secs(2)));
            let e1 = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!((e1.subject.as_str(), ack_tokens(&e1).1), ("a.1", 1));
            let e2 = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!((e2.subject.as_str(), ack_tokens(&e2).1), ("b.1", 3));
        }

        #[tokio::test]
        async fn test_deliver_policy_new_skips_existing() {
            let mut h = setup_stream("P4");
            h.stream.publish("x", Bytes::from_static(b"old"));
            let mut cfg = pull_cfg("c1");
            cfg.deliver_policy = DeliverPolicy::New;
            let consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.new", pull_body(1, Duration::from_secs(2)));
            tokio::time::sleep(Duration::from_millis(30)).await;
            h.stream.publish("x", Bytes::from_static(b"fresh"));

            let env = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(env.payload, Bytes::from_static(b"fresh"));
            assert_eq!(ack_tokens(&env).1, 2);
        }

        #[tokio::test]
        async fn test_deliver_policy_by_start_sequence() {
            let mut h = setup_stream("P5");
            for i in 1..=4 {
                h.stream.publish("x", Bytes::from(format!("m{}", i)));
            }
            let mut cfg = pull_cfg("c1");
            cfg.deliver_policy = DeliverPolicy::ByStartSequence;
            cfg.opt_start_seq = 3;
            let consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.seq", pull_body(1, Duration::from_secs(2)));
            let env = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(ack_tokens(&env).1, 3);
        }

        #[tokio::test]
        async fn test_last_per_subject_warmup_then_resume() {
            let mut h = setup_stream("P6");
            h.stream.publish("a.1", Bytes::from_static(b"v1"));
            h.stream.publish("a.1", Bytes::from_static(b"v2"));
            h.stream.publish("a.2", Bytes::from_static(b"w1"));
            let mut cfg = pull_cfg("c1");
            cfg.deliver_policy = DeliverPolicy::LastPerSubject;
            cfg.filter_subject = Some("a.>".to_string());
            let consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.lps", pull_body(3, Duration::from_secs(2)));
            let e1 = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!((ack_tokens(&e1).1, e1.payload.clone()), (2, Bytes::from_static(b"v2")));
            let e2 = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(ack_tokens(&e2).1, 3);

            // Past the snapshot the cursor resumes with new messages only.
            h.stream.publish("a.1", Bytes::from_static(b"v3"));
            let e3 = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(ack_tokens(&e3).1, 4);
        }

        #[tokio::test]
        async fn test_replay_original_paces_deliveries() {
            let mut h = setup_stream("P7");
            h.stream.publish("x", Bytes::from_static(b"m1"));
            tokio::time::sleep(Duration::from_millis(150)).await;
            h.stream.publish("x", Bytes::from_static(b"m2"));

            let mut cfg = pull_cfg("c1");
            cfg.replay_policy = ReplayPolicy::Original;
            let consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.rp", pull_body(2, Duration::from_secs(5)));
            let _e1 = recv_envelope(&mut h.outbound, 1000).await;
            let start = Instant::now();
            let _e2 = recv_envelope(&mut h.outbound, 2000).await;
            assert!(
                start.elapsed() >= Duration::from_millis(100),
                "second delivery should keep the original spacing, got {:?}",
                start.elapsed()
            );
        }

        #[tokio::test]
        async fn test_headers_only_strips_payload() {
            let mut h = setup_stream("P8");
            h.stream.publish("x", Bytes::from_static(b"hello"));
            let mut cfg = pull_cfg("c1");
            cfg.headers_only = true;
            let consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.ho", pull_body(1, Duration::from_secs(2)));
            let env = recv_envelope(&mut h.outbound, 1000).await;
            assert!(env.payload.is_empty());
            assert_eq!(header_value(&env, "Nats-Msg-Size").as_deref(), Some("5"));
        }

        #[tokio::test]
        async fn test_min_last_seq_gates_delivery() {
            let mut h = setup_stream("P9");
            h.stream.publish("x", Bytes::from_static(b"m1"));
            let mut cfg = pull_cfg("c1");
            cfg.min_last_seq = 3;
            let consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.mls", pull_body(1, Duration::from_secs(5)));
            expect_quiet(&mut h.outbound, 150).await;

            h.stream.publish("x", Bytes::from_static(b"m2"));
            h.stream.publish("x", Bytes::from_static(b"m3"));
            let env = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(ack_tokens(&env).1, 1);
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_create_then_create_conflicts() {
            let h = setup_stream("L1");
            h.stream
                .create_consumer(pull_cfg("dup"), ConsumerAction::Create)
                .unwrap();
            let err = h
                .stream
                .create_consumer(pull_cfg("dup"), ConsumerAction::Create)
                .unwrap_err();
            assert!(err.to_string().contains("already exists"));

            // Create-or-update against the live consumer is fine.
            h.stream
                .create_consumer(pull_cfg("dup"), ConsumerAction::CreateOrUpdate)
                .unwrap();
        }

        #[tokio::test]
        async fn test_update_missing_consumer_fails() {
            let h = setup_stream("L2");
            let err = h
                .stream
                .create_consumer(pull_cfg("ghost"), ConsumerAction::Update)
                .unwrap_err();
            assert_eq!(err, rivus::ConsumerError::NotFound);
        }

        #[tokio::test]
        async fn test_delete_drains_waiting_with_409() {
            let mut h = setup_stream("L3");
            let consumer = h
                .stream
                .create_consumer(pull_cfg("c1"), ConsumerAction::Create)
                .unwrap();
            consumer.process_next_request("inbox.del", pull_body(1, Duration::from_secs(10)));
            tokio::time::sleep(Duration::from_millis(30)).await;

            h.stream.delete_consumer("c1").await.unwrap();
            let env = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(envelope_status(&env), Some(409));
            assert_eq!(h.stream.consumer_count(), 0);
        }

        #[tokio::test]
        async fn test_ephemeral_inactivity_gc() {
            let mut h = setup_stream("L4");
            let cfg = ConsumerConfig {
                inactive_threshold: Some(Duration::from_millis(150)),
                ..Default::default()
            };
            let consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();
            assert!(consumer.name().len() >= 8);
            assert_eq!(h.stream.consumer_count(), 1);

            wait_advisory(&mut h.advisories, "DELETED", 2000).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(h.stream.consumer_count(), 0);
        }

        #[tokio::test]
        async fn test_pause_blocks_delivery_until_deadline() {
            let mut h = setup_stream("L5");
            h.stream.publish("x", Bytes::from_static(b"m1"));
            let consumer = h
                .stream
                .create_consumer(pull_cfg("c1"), ConsumerAction::Create)
                .unwrap();

            consumer.pause(chrono::Utc::now() + chrono::Duration::milliseconds(250));
            assert!(consumer.is_paused());
            let info = consumer.info();
            assert!(info.paused);
            let remaining = info.pause_remaining.expect("paused consumer reports time left");
            assert!(remaining <= Duration::from_millis(250));
            consumer.process_next_request("inbox.p", pull_body(1, Duration::from_secs(5)));
            expect_quiet(&mut h.outbound, 120).await;

            // Unpause timer re-arms delivery on its own.
            let env = recv_envelope(&mut h.outbound, 2000).await;
            assert_eq!(ack_tokens(&env).1, 1);
            assert!(!consumer.is_paused());
            let info = consumer.info();
            assert!(!info.paused);
            assert_eq!(info.pause_remaining, None);

            // An explicit resume clears the window the same way.
            consumer.pause(chrono::Utc::now() + chrono::Duration::seconds(30));
            assert!(consumer.info().pause_remaining.is_some());
            consumer.resume();
            assert_eq!(consumer.info().pause_remaining, None);
        }

        #[tokio::test]
        async fn test_config_update_rejects_policy_changes() {
            let h = setup_stream("L6");
            h.stream
                .create_consumer(pull_cfg("c1"), ConsumerAction::Create)
                .unwrap();

            let mut update = pull_cfg("c1");
            update.ack_policy = AckPolicy::None;
            let err = h
                .stream
                .create_consumer(update, ConsumerAction::Update)
                .unwrap_err();
            assert!(err.to_string().contains("ack policy"));

            // Tuning knobs are updatable.
            let mut update = pull_cfg("c1");
            update.max_ack_pending = 7;
            h.stream
                .create_consumer(update, ConsumerAction::Update)
                .unwrap();
            let consumer = h.stream.lookup_consumer("c1").unwrap();
            assert_eq!(consumer.config().max_ack_pending, 7);
        }
    }

    mod admission {
        use super::*;

        #[tokio::test]
        async fn test_push_consumer_rejects_pull_requests() {
            let mut h = setup_stream("A1");
            let cfg = ConsumerConfig {
                durable_name: Some("pusher".to_string()),
                deliver_subject: Some("deliver.here".to_string()),
                ..Default::default()
            };
            let consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.bad", pull_body(1, Duration::from_secs(1)));
            let env = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(envelope_status(&env), Some(409));
            assert!(String::from_utf8_lossy(env.headers.as_ref().unwrap())
                .contains("Consumer is push based"));
        }

        #[tokio::test]
        async fn test_exceeded_max_request_batch() {
            let mut h = setup_stream("A2");
            let mut cfg = pull_cfg("c1");
            cfg.max_request_batch = 2;
            let consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.big", pull_body(5, Duration::from_secs(1)));
            let env = recv_envelope(&mut h.outbound, 1000).await;
            assert!(String::from_utf8_lossy(env.headers.as_ref().unwrap())
                .contains("Exceeded MaxRequestBatch"));
        }

        #[tokio::test]
        async fn test_exceeded_max_waiting() {
            let mut h = setup_stream("A3");
            let mut cfg = pull_cfg("c1");
            cfg.max_waiting = 1;
            let consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            consumer.process_next_request("inbox.w1", pull_body(1, Duration::from_secs(5)));
            tokio::time::sleep(Duration::from_millis(30)).await;
            consumer.process_next_request("inbox.w2", pull_body(1, Duration::from_secs(5)));

            let env = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(env.deliver_to, "inbox.w2");
            assert!(String::from_utf8_lossy(env.headers.as_ref().unwrap())
                .contains("Exceeded MaxWaiting"));
        }

        #[tokio::test]
        async fn test_heartbeat_needs_headroom_in_expires() {
            let mut h = setup_stream("A4");
            let consumer = h
                .stream
                .create_consumer(pull_cfg("c1"), ConsumerAction::Create)
                .unwrap();

            let req = NextRequest {
                batch: 1,
                expires: Duration::from_millis(150).as_nanos() as i64,
                idle_heartbeat: Duration::from_millis(100).as_nanos() as i64,
                ..Default::default()
            };
            consumer.process_next_request("inbox.hb", Bytes::from(serde_json::to_vec(&req).unwrap()));
            let env = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(envelope_status(&env), Some(400));
        }

        #[tokio::test]
        async fn test_pull_heartbeats_fire_while_waiting() {
            let mut h = setup_stream("A5");
            let consumer = h
                .stream
                .create_consumer(pull_cfg("c1"), ConsumerAction::Create)
                .unwrap();

            let req = NextRequest {
                batch: 1,
                expires: Duration::from_secs(2).as_nanos() as i64,
                idle_heartbeat: Duration::from_millis(100).as_nanos() as i64,
                ..Default::default()
            };
            consumer.process_next_request("inbox.hb2", Bytes::from(serde_json::to_vec(&req).unwrap()));

            let hb = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(envelope_status(&hb), Some(100));
            assert!(header_value(&hb, "Nats-Last-Consumer").is_some());
            assert!(header_value(&hb, "Nats-Last-Stream").is_some());
        }
    }

    mod push_mode {
        use super::*;

        #[tokio::test]
        async fn test_push_delivers_on_publish() {
            let mut h = setup_stream("U1");
            let cfg = ConsumerConfig {
                durable_name: Some("pusher".to_string()),
                deliver_subject: Some("deliver.u1".to_string()),
                ..Default::default()
            };
            let _consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            h.stream.publish("orders.eu", Bytes::from_static(b"m1"));
            let env = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(env.deliver_to, "deliver.u1");
            assert_eq!(env.subject, "orders.eu");
            assert_eq!(ack_tokens(&env), (1, 1, 1, 0));
        }

        #[tokio::test]
        async fn test_push_idle_heartbeats() {
            let mut h = setup_stream("U2");
            let cfg = ConsumerConfig {
                durable_name: Some("pusher".to_string()),
                deliver_subject: Some("deliver.u2".to_string()),
                idle_heartbeat: Some(Duration::from_millis(100)),
                ..Default::default()
            };
            let _consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            let hb = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(envelope_status(&hb), Some(100));
            assert_eq!(hb.deliver_to, "deliver.u2");
        }

        #[tokio::test]
        async fn test_push_interest_loss_stops_delivery() {
            let mut h = setup_stream("U3");
            let cfg = ConsumerConfig {
                durable_name: Some("pusher".to_string()),
                deliver_subject: Some("deliver.u3".to_string()),
                ..Default::default()
            };
            let consumer = h
                .stream
                .create_consumer(cfg, ConsumerAction::Create)
                .unwrap();

            consumer.push_interest_change(false);
            h.stream.publish("x", Bytes::from_static(b"m1"));
            expect_quiet(&mut h.outbound, 150).await;

            consumer.push_interest_change(true);
            let env = recv_envelope(&mut h.outbound, 1000).await;
            assert_eq!(ack_tokens(&env).1, 1);
        }
    }
}
