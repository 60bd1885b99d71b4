use std::net::SocketAddr;
use std::sync::Arc;
use async_trait::async_trait;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, Mutex};
use tracing::trace;
use crate::link::{DatagramRx, DatagramTx, PeerLink};

/// Decides per datagram whether it is lost in transit (`true` means the datagram is dropped)
pub type DropFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// Drops each datagram with the given probability. The seed makes the loss pattern repeatable.
pub fn random_loss(probability: f64, seed: u64) -> DropFilter {
    let mut rng = StdRng::seed_from_u64(seed);
    Box::new(move |_| rng.random_bool(probability))
}

/// Drops the first `n` datagrams that match the predicate, and nothing else
pub fn drop_first_matching(n: usize, predicate: impl Fn(&[u8]) -> bool + Send + 'static) -> DropFilter {
    let mut remaining = n;
    Box::new(move |buf| {
        if remaining > 0 && predicate(buf) {
            remaining -= 1;
            return true;
        }
        false
    })
}

/// The sending half of an in-memory link. It records every datagram it is asked to send,
///  including those its filter drops.
pub struct MemoryTx {
    sender: mpsc::UnboundedSender<Bytes>,
    filter: Mutex<Option<DropFilter>>,
    tracker: Arc<Mutex<Vec<Bytes>>>,
}

#[async_trait]
impl DatagramTx for MemoryTx {
    async fn send_datagram(&self, buf: &[u8]) -> anyhow::Result<()> {
        let datagram = Bytes::copy_from_slice(buf);
        self.tracker.lock().await.push(datagram.clone());

        if let Some(filter) = self.filter.lock().await.as_mut() {
            if filter(buf) {
                trace!("dropping datagram {:?}", datagram);
                return Ok(());
            }
        }

        // a peer that finished its transfer has dropped its receiver, which is datagram loss as well
        let _ = self.sender.send(datagram);
        Ok(())
    }
}

#[async_trait]
impl DatagramRx for mpsc::UnboundedReceiver<Bytes> {
    async fn recv_datagram(&mut self) -> anyhow::Result<Bytes> {
        match self.recv().await {
            Some(buf) => Ok(buf),
            None => anyhow::bail!("in-memory link was closed"),
        }
    }
}

/// Two connected in-memory endpoints `a` and `b`
pub struct MemoryLinkPair {
    pub a: PeerLink,
    pub b: PeerLink,
    sent_by_a: Arc<Mutex<Vec<Bytes>>>,
    sent_by_b: Arc<Mutex<Vec<Bytes>>>,
}

impl MemoryLinkPair {
    pub fn new() -> MemoryLinkPair {
        Self::with_filters(None, None)
    }

    pub fn with_filters(a_to_b: Option<DropFilter>, b_to_a: Option<DropFilter>) -> MemoryLinkPair {
        let addr_a = SocketAddr::from(([127, 0, 0, 1], 1001));
        let addr_b = SocketAddr::from(([127, 0, 0, 1], 1002));

        let (send_a_to_b, recv_a_to_b) = mpsc::unbounded_channel();
        let (send_b_to_a, recv_b_to_a) = mpsc::unbounded_channel();
        let sent_by_a: Arc<Mutex<Vec<Bytes>>> = Default::default();
        let sent_by_b: Arc<Mutex<Vec<Bytes>>> = Default::default();

        let tx_a = MemoryTx {
            sender: send_a_to_b,
            filter: Mutex::new(a_to_b),
            tracker: sent_by_a.clone(),
        };
        let tx_b = MemoryTx {
            sender: send_b_to_a,
            filter: Mutex::new(b_to_a),
            tracker: sent_by_b.clone(),
        };

        MemoryLinkPair {
            a: PeerLink::new(addr_b, Arc::new(tx_a), Box::new(recv_b_to_a)),
            b: PeerLink::new(addr_a, Arc::new(tx_b), Box::new(recv_a_to_b)),
            sent_by_a,
            sent_by_b,
        }
    }

    /// Splits off the endpoints, keeping access to the recorded datagrams
    pub fn split(self) -> (PeerLink, PeerLink, SentDatagrams) {
        let sent = SentDatagrams {
            by_a: self.sent_by_a,
            by_b: self.sent_by_b,
        };
        (self.a, self.b, sent)
    }
}

impl Default for MemoryLinkPair {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything sent through a [MemoryLinkPair], dropped datagrams included
#[derive(Clone)]
pub struct SentDatagrams {
    by_a: Arc<Mutex<Vec<Bytes>>>,
    by_b: Arc<Mutex<Vec<Bytes>>>,
}

impl SentDatagrams {
    pub async fn by_a(&self) -> Vec<Bytes> {
        self.by_a.lock().await.clone()
    }

    pub async fn by_b(&self) -> Vec<Bytes> {
        self.by_b.lock().await.clone()
    }

    pub async fn count_by_a(&self, predicate: impl Fn(&[u8]) -> bool) -> usize {
        self.by_a.lock().await.iter().filter(|d| predicate(&d[..])).count()
    }

    pub async fn count_by_b(&self, predicate: impl Fn(&[u8]) -> bool) -> usize {
        self.by_b.lock().await.iter().filter(|d| predicate(&d[..])).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivers_in_both_directions() {
        let (mut a, mut b, sent) = MemoryLinkPair::new().split();

        a.tx.send_datagram(b"ECHO hi").await.unwrap();
        b.tx.send_datagram(b"hi").await.unwrap();

        assert_eq!(b.rx.recv_datagram().await.unwrap().as_ref(), b"ECHO hi");
        assert_eq!(a.rx.recv_datagram().await.unwrap().as_ref(), b"hi");
        assert_eq!(sent.by_a().await, vec![Bytes::from_static(b"ECHO hi")]);
        assert_eq!(a.peer, SocketAddr::from(([127, 0, 0, 1], 1002)));
    }

    #[tokio::test]
    async fn test_drop_first_matching() {
        let filter = drop_first_matching(2, |buf| buf.starts_with(b"ACK"));
        let (a, mut b, sent) = MemoryLinkPair::with_filters(Some(filter), None).split();

        for msg in [&b"ACK:0"[..], &b"EOF"[..], &b"ACK:1"[..], &b"ACK:2"[..]] {
            a.tx.send_datagram(msg).await.unwrap();
        }

        assert_eq!(b.rx.recv_datagram().await.unwrap().as_ref(), b"EOF");
        assert_eq!(b.rx.recv_datagram().await.unwrap().as_ref(), b"ACK:2");
        assert_eq!(sent.count_by_a(|d| d.starts_with(b"ACK")).await, 3);
    }

    #[test]
    fn test_random_loss_is_repeatable() {
        let mut first = random_loss(0.5, 17);
        let mut second = random_loss(0.5, 17);
        let pattern_1 = (0..100).map(|_| first(&b"x"[..])).collect::<Vec<_>>();
        let pattern_2 = (0..100).map(|_| second(&b"x"[..])).collect::<Vec<_>>();
        assert_eq!(pattern_1, pattern_2);
        assert!(pattern_1.iter().any(|&dropped| dropped));
        assert!(pattern_1.iter().any(|&dropped| !dropped));
    }
}
