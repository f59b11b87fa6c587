//! Periodic reunion driver.
//!
//! Runs beside the tick loop on its own interval. It idles until the peer
//! activates reunion (immediately on the root, after the first parent on a
//! leaf) and then calls [`Peer::reunion_round`] every period.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::peer::{Peer, ReunionOutcome};

pub struct ReunionScheduler {
    peer: Arc<Peer>,
    interval: Duration,
}

impl ReunionScheduler {
    pub fn new(peer: Arc<Peer>, interval: Duration) -> Self {
        Self { peer, interval }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut active = self.peer.reunion_watch();
        let activated = async { active.wait_for(|on| *on).await.is_ok() };
        tokio::select! {
            _ = cancel.cancelled() => return,
            ok = activated => {
                if !ok {
                    return;
                }
            }
        }
        info!(
            "💓 Reunion started for {} every {}s",
            self.peer.address(),
            self.interval.as_secs()
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Reunion scheduler stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match self.peer.reunion_round(Instant::now()) {
                        ReunionOutcome::RootSweep { expired } if !expired.is_empty() => {
                            debug!("Reunion sweep expired {} node(s)", expired.len());
                        }
                        ReunionOutcome::Failed => debug!("Reunion failed, re-advertise queued"),
                        _ => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::error::TransportError;
    use crate::network::client::Transport;
    use crate::network::message::Packet;
    use crate::peer::PeerOptions;
    use async_trait::async_trait;
    use bytes::Bytes;

    struct NullTransport;

    #[async_trait]
    impl Transport for NullTransport {
        async fn send(&self, _to: Address, _frame: Bytes) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn leaf() -> Arc<Peer> {
        Arc::new(Peer::leaf(
            Address::new([10, 0, 0, 2], 6002),
            Address::new([10, 0, 0, 1], 5050),
            Arc::new(NullTransport),
            PeerOptions::default(),
        ))
    }

    #[tokio::test]
    async fn test_idle_until_attached() {
        let peer = leaf();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            ReunionScheduler::new(peer.clone(), Duration::from_millis(10)).run(cancel.clone()),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(peer.connections().connection_count(), 0);

        let parent = Address::new([10, 0, 0, 3], 6003);
        peer.handle_packet(Packet::advertise_response(peer.root_address(), parent));
        // Join plus at least one hello queued on the parent connection
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(peer.connections().pending(parent, false) >= 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_before_activation() {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            ReunionScheduler::new(leaf(), Duration::from_secs(4)).run(cancel.clone()),
        );
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
