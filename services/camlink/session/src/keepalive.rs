//! Periodic ACK while the session is connected.
//!
//! The camera drops a session it has not heard from, so the receiver keeps
//! sending ACK on a fixed interval whether or not frames are flowing.

use camlink_wire::ControlMessage;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::session::SessionState;
use crate::stats::SessionCounters;
use crate::transport::send_control;

/// Send ACK to `peer` every `interval` until the state leaves `Connected`.
///
/// The first keepalive goes out immediately. Returns the number sent.
pub async fn run_keepalive(
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    interval: Duration,
    mut state: watch::Receiver<SessionState>,
    counters: Arc<SessionCounters>,
) -> u64 {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sent = 0;

    debug!("Keepalive to {} every {:?}", peer, interval);
    loop {
        if *state.borrow_and_update() != SessionState::Connected {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {
                // State may have changed while waiting for the tick
                if *state.borrow() != SessionState::Connected {
                    break;
                }
                match send_control(&socket, peer, &ControlMessage::Ack).await {
                    Ok(()) => {
                        sent += 1;
                        counters.keepalive_sent();
                    }
                    Err(e) => warn!("Failed to send keepalive to {}: {}", peer, e),
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!("Keepalive to {} stopped after {} messages", peer, sent);
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::bind_udp;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_keepalive_stops_on_disconnect() {
        let receiver = Arc::new(bind_udp("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let camera = bind_udp("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let counters = Arc::new(SessionCounters::new());
        let (state_tx, state_rx) = watch::channel(SessionState::Connected);

        let task = tokio::spawn(run_keepalive(
            receiver,
            camera.local_addr().unwrap(),
            Duration::from_millis(20),
            state_rx,
            counters.clone(),
        ));

        let mut buf = [0u8; 16];
        for _ in 0..3 {
            let (len, _) = timeout(Duration::from_secs(1), camera.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..len], b"ACK");
        }

        state_tx.send_replace(SessionState::Disconnected);
        let sent = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(sent >= 3);
        assert_eq!(counters.snapshot().keepalives_sent, sent);
    }

    #[tokio::test]
    async fn test_keepalive_not_sent_unless_connected() {
        let receiver = Arc::new(bind_udp("127.0.0.1:0".parse().unwrap()).await.unwrap());
        let (_state_tx, state_rx) = watch::channel(SessionState::HelloSent);

        let sent = run_keepalive(
            receiver,
            "127.0.0.1:9".parse().unwrap(),
            Duration::from_millis(10),
            state_rx,
            Arc::new(SessionCounters::new()),
        )
        .await;
        assert_eq!(sent, 0);
    }
}
