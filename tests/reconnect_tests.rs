use std::time::Duration;
use telemux::mux::{CommandAck, ConnectivityStatus, HubEvent};
use tokio::time::Instant;

mod helpers;
use helpers::*;

/// Gaps between consecutive connect attempts, in ms.
fn gaps(attempts: &[Instant]) -> Vec<u64> {
    attempts.windows(2).map(|w| (w[1] - w[0]).as_millis() as u64).collect()
}

fn assert_close(actual: u64, expected: u64) {
    assert!(
        actual >= expected && actual <= expected + 5,
        "expected ~{} ms, got {} ms",
        expected,
        actual
    );
}

#[cfg(test)]
mod reconnect_tests {
    use super::*;

    mod backoff {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_delays_follow_capped_exponential() {
            let (hub, broker) = setup_hub();
            broker.set_reachable(false);
            let mut a = hub.attach().await.unwrap();
            a.connect(device_config()).await.unwrap();

            for _ in 0..6 {
                wait_status(&mut a, ConnectivityStatus::Error).await;
            }

            let attempts = broker.connect_attempts();
            assert_eq!(attempts.len(), 6);
            for (got, expected) in gaps(&attempts).into_iter().zip([2000, 3400, 5780, 9826, 15000]) {
                assert_close(got, expected);
            }
        }

        #[tokio::test(start_paused = true)]
        async fn test_retry_shows_reconnecting_then_error_detail() {
            let (hub, broker) = setup_hub();
            broker.set_reachable(false);
            let mut a = hub.attach().await.unwrap();
            a.connect(device_config()).await.unwrap();

            wait_status(&mut a, ConnectivityStatus::Connecting).await;
            match next_event(&mut a).await {
                HubEvent::Status { status, detail } => {
                    assert_eq!(status, ConnectivityStatus::Error);
                    assert_eq!(detail.as_deref(), Some("connection refused"));
                }
                other => panic!("expected error status, got {:?}", other),
            }
            assert_eq!(next_event(&mut a).await, HubEvent::status(ConnectivityStatus::Reconnecting));
        }

        #[tokio::test(start_paused = true)]
        async fn test_success_resets_delay() {
            let (hub, broker) = setup_hub();
            broker.set_reachable(false);
            let mut a = hub.attach().await.unwrap();
            a.connect(device_config()).await.unwrap();

            for _ in 0..3 {
                wait_status(&mut a, ConnectivityStatus::Error).await;
            }
            broker.set_reachable(true);
            wait_status(&mut a, ConnectivityStatus::Connected).await;

            broker.drop_connections("connection reset");
            match wait_status(&mut a, ConnectivityStatus::Reconnecting).await {
                HubEvent::Status { detail, .. } => assert_eq!(detail.as_deref(), Some("connection reset")),
                _ => unreachable!(),
            }
            wait_status(&mut a, ConnectivityStatus::Connected).await;

            let gaps = gaps(&broker.connect_attempts());
            assert_eq!(gaps.len(), 4);
            assert_close(gaps[2], 5780);
            // first failure after a success waits the base delay again
            assert_close(gaps[3], 2000);
        }

        #[tokio::test(start_paused = true)]
        async fn test_same_config_during_backoff_retries_now() {
            let (hub, broker) = setup_hub();
            broker.set_reachable(false);
            let mut a = hub.attach().await.unwrap();
            a.connect(device_config()).await.unwrap();
            wait_status(&mut a, ConnectivityStatus::Error).await;

            tokio::time::sleep(Duration::from_millis(500)).await;
            broker.set_reachable(true);
            a.connect(device_config()).await.unwrap();
            wait_status(&mut a, ConnectivityStatus::Connected).await;

            let gaps = gaps(&broker.connect_attempts());
            assert_eq!(gaps.len(), 1);
            assert_close(gaps[0], 500);
        }
    }

    mod network {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_restore_mid_backoff_attempts_immediately() {
            let (hub, broker) = setup_hub();
            broker.set_reachable(false);
            let mut a = hub.attach().await.unwrap();
            a.connect(device_config()).await.unwrap();

            // five failures: the wait now in progress is the capped 15 s one
            for _ in 0..5 {
                wait_status(&mut a, ConnectivityStatus::Error).await;
            }
            tokio::time::sleep(Duration::from_secs(6)).await;

            broker.set_reachable(true);
            hub.set_network(false).await.unwrap();
            wait_status(&mut a, ConnectivityStatus::Offline).await;
            hub.set_network(true).await.unwrap();
            wait_status(&mut a, ConnectivityStatus::Connected).await;

            let attempts = broker.connect_attempts();
            assert_eq!(attempts.len(), 6);
            // 6 s into the 15 s wait, not after the remaining 9 s
            assert_close((attempts[5] - attempts[4]).as_millis() as u64, 6000);
        }

        #[tokio::test(start_paused = true)]
        async fn test_no_attempts_while_offline() {
            let (hub, broker) = setup_hub();
            let mut a = hub.attach().await.unwrap();
            a.connect(device_config()).await.unwrap();
            wait_status(&mut a, ConnectivityStatus::Connected).await;

            a.set_network(false).await.unwrap();
            wait_status(&mut a, ConnectivityStatus::Offline).await;
            assert_eq!(broker.live_sessions(), 0);

            tokio::time::sleep(Duration::from_secs(120)).await;
            assert_eq!(broker.connect_attempts().len(), 1);

            a.set_network(true).await.unwrap();
            wait_status(&mut a, ConnectivityStatus::Reconnecting).await;
            wait_status(&mut a, ConnectivityStatus::Connected).await;
            assert_eq!(broker.connect_attempts().len(), 2);
        }

        #[tokio::test(start_paused = true)]
        async fn test_connect_while_offline_waits_for_network() {
            let (hub, broker) = setup_hub();
            let mut a = hub.attach().await.unwrap();
            hub.set_network(false).await.unwrap();
            wait_status(&mut a, ConnectivityStatus::Offline).await;

            a.connect(device_config()).await.unwrap();
            sync(&hub).await;
            assert!(broker.connect_attempts().is_empty());
            assert_eq!(hub.status().await.unwrap(), ConnectivityStatus::Offline);

            hub.set_network(true).await.unwrap();
            wait_status(&mut a, ConnectivityStatus::Connected).await;
            assert_eq!(broker.connect_attempts().len(), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn test_link_loss_queues_then_flushes_in_order() {
            let (hub, broker) = setup_hub();
            let mut a = hub.attach().await.unwrap();
            a.connect(device_config()).await.unwrap();
            wait_status(&mut a, ConnectivityStatus::Connected).await;

            broker.drop_connections("keepalive timeout");
            wait_status(&mut a, ConnectivityStatus::Reconnecting).await;

            a.publish("lig_hours", 12).await.unwrap();
            a.publish("temp_night", 17).await.unwrap();
            assert_eq!(
                next_event(&mut a).await,
                HubEvent::Queued(CommandAck { key: "lig_hours".into(), value: "12".into() })
            );
            assert_eq!(
                next_event(&mut a).await,
                HubEvent::Queued(CommandAck { key: "temp_night".into(), value: "17".into() })
            );

            wait_status(&mut a, ConnectivityStatus::Connected).await;
            assert_eq!(
                next_event(&mut a).await,
                HubEvent::Published(CommandAck { key: "lig_hours".into(), value: "12".into() })
            );
            assert_eq!(
                next_event(&mut a).await,
                HubEvent::Published(CommandAck { key: "temp_night".into(), value: "17".into() })
            );

            let topics: Vec<_> = broker.published().into_iter().map(|(t, _)| t).collect();
            assert_eq!(topics, vec!["gh/one/set/lig_hours", "gh/one/set/temp_night"]);
        }
    }
}
