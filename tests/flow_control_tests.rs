//! Push flow-control window behavior. Runs as its own binary so the
//! flow-control ceiling can be pinned through the environment before the
//! global config is first read.

use std::time::Duration;

use bytes::Bytes;
use rivus::{ConsumerAction, ConsumerConfig};

mod helpers;
use helpers::*;

#[tokio::test]
async fn test_flow_control_probe_stall_and_resume() {
    std::env::set_var("CONSUMER_FC_MAX_BYTES", "4096");

    let mut h = setup_stream("FC1");
    let cfg = ConsumerConfig {
        durable_name: Some("fc".to_string()),
        deliver_subject: Some("deliver.fc".to_string()),
        flow_control: true,
        idle_heartbeat: Some(Duration::from_secs(5)),
        ..Default::default()
    };
    let consumer = h
        .stream
        .create_consumer(cfg, ConsumerAction::Create)
        .unwrap();

    const TOTAL: usize = 6;
    for i in 0..TOTAL {
        h.stream
            .publish("x", Bytes::from(vec![i as u8; 600]));
    }

    // Drain until the window stalls: we must see a flow-control probe and
    // strictly fewer than TOTAL data messages.
    let mut probe_reply = None;
    let mut data_before_stall = 0;
    loop {
        let got = tokio::time::timeout(Duration::from_millis(300), h.outbound.recv()).await;
        match got {
            Ok(Some(env)) => {
                if env.reply.starts_with("$JS.FC.") {
                    assert_eq!(envelope_status(&env), Some(100));
                    probe_reply = Some(env.reply.clone());
                } else {
                    data_before_stall += 1;
                }
            }
            _ => break, // stalled
        }
    }
    let probe_reply = probe_reply.expect("expected a flow-control probe before the stall");
    assert!(
        data_before_stall < TOTAL,
        "window should stall before all {} messages, got {}",
        TOTAL,
        data_before_stall
    );

    // Answering the probe shrinks the outstanding window and doubles the
    // ceiling; the rest of the backlog flows.
    consumer.process_flow_control_response(&probe_reply);
    let mut data_after = 0;
    loop {
        let got = tokio::time::timeout(Duration::from_millis(500), h.outbound.recv()).await;
        match got {
            Ok(Some(env)) => {
                if !env.reply.starts_with("$JS.FC.") {
                    data_after += 1;
                }
                if data_before_stall + data_after == TOTAL {
                    break;
                }
            }
            _ => panic!(
                "backlog did not resume: {}/{} delivered",
                data_before_stall + data_after,
                TOTAL
            ),
        }
    }
    assert_eq!(data_before_stall + data_after, TOTAL);
}
