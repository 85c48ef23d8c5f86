use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, broadcast};

use crate::mjpeg::{CLIENT_BUFFER_FRAMES, ServerEvent};

/// Bounded JPEG queue for one viewer.
///
/// `push` never waits: when the queue is full the oldest frame is
/// discarded to make room, so a stalled viewer holds at most
/// [`CLIENT_BUFFER_FRAMES`] frames and never slows the producer.
#[derive(Debug)]
pub struct FrameBuffer {
    frames: Mutex<VecDeque<Bytes>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
    dropped_since_read: AtomicU64,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            dropped_since_read: AtomicU64::new(0),
        }
    }

    /// Queue `jpeg`. Returns `true` when an older frame was dropped.
    pub fn push(&self, jpeg: Bytes) -> bool {
        let dropped = {
            let mut frames = self.frames.lock();
            let dropped = if frames.len() >= self.capacity {
                frames.pop_front();
                true
            } else {
                false
            };
            frames.push_back(jpeg);
            dropped
        };
        if dropped {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            self.dropped_since_read.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    pub fn try_pop(&self) -> Option<Bytes> {
        let frame = self.frames.lock().pop_front();
        if frame.is_some() {
            self.dropped_since_read.store(0, Ordering::Relaxed);
        }
        frame
    }

    /// Wait for the next frame.
    pub async fn pop(&self) -> Bytes {
        loop {
            let notified = self.notify.notified();
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frames currently queued, oldest first.
    pub fn snapshot(&self) -> Vec<Bytes> {
        self.frames.lock().iter().cloned().collect()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Frames lost since the viewer last took one.
    pub fn dropped_since_read(&self) -> u64 {
        self.dropped_since_read.load(Ordering::Relaxed)
    }
}

/// Snapshot of one connected viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStats {
    pub id: u64,
    pub addr: SocketAddr,
    pub connected_at: SystemTime,
    pub bytes_sent: u64,
    pub frames_dropped: u64,
    /// The viewer lost frames since it last read one.
    pub slow: bool,
}

/// A viewer with an open multipart stream.
#[derive(Debug)]
pub struct Client {
    pub id: u64,
    pub addr: SocketAddr,
    connected_at: SystemTime,
    bytes_sent: AtomicU64,
    pub(crate) buffer: FrameBuffer,
}

impl Client {
    pub fn add_bytes(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            id: self.id,
            addr: self.addr,
            connected_at: self.connected_at,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            frames_dropped: self.buffer.dropped(),
            slow: self.buffer.dropped_since_read() > 0,
        }
    }
}

/// Connected multipart viewers.
///
/// Registration changes are published as [`ServerEvent::ClientCount`].
#[derive(Debug, Clone)]
pub struct ClientRegistry {
    clients: Arc<RwLock<HashMap<u64, Arc<Client>>>>,
    next_id: Arc<AtomicU64>,
    events: broadcast::Sender<ServerEvent>,
}

impl ClientRegistry {
    pub fn new(events: broadcast::Sender<ServerEvent>) -> Self {
        Self {
            clients: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            events,
        }
    }

    pub fn register(&self, addr: SocketAddr) -> Arc<Client> {
        let client = Arc::new(Client {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            addr,
            connected_at: SystemTime::now(),
            bytes_sent: AtomicU64::new(0),
            buffer: FrameBuffer::new(CLIENT_BUFFER_FRAMES),
        });
        let count = {
            let mut clients = self.clients.write();
            clients.insert(client.id, client.clone());
            clients.len()
        };
        tracing::info!(client_id = client.id, %addr, count, "viewer connected");
        let _ = self.events.send(ServerEvent::ClientCount(count));
        client
    }

    pub fn remove(&self, id: u64) {
        let (removed, count) = {
            let mut clients = self.clients.write();
            let removed = clients.remove(&id);
            (removed, clients.len())
        };
        if let Some(client) = removed {
            tracing::info!(
                client_id = id,
                addr = %client.addr,
                bytes_sent = client.stats().bytes_sent,
                count,
                "viewer disconnected"
            );
            let _ = self.events.send(ServerEvent::ClientCount(count));
        }
    }

    /// Hand `jpeg` to every viewer without waiting on any of them.
    pub fn broadcast(&self, jpeg: &Bytes) {
        for client in self.clients.read().values() {
            if client.buffer.push(jpeg.clone()) {
                tracing::trace!(client_id = client.id, "slow viewer, dropped oldest frame");
            }
        }
    }

    pub fn stats(&self) -> Vec<ClientStats> {
        let mut stats: Vec<_> = self.clients.read().values().map(|c| c.stats()).collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let had = {
            let mut clients = self.clients.write();
            let had = !clients.is_empty();
            clients.clear();
            had
        };
        if had {
            let _ = self.events.send(ServerEvent::ClientCount(0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(n: u8) -> Bytes {
        Bytes::from(vec![0xff, 0xd8, n])
    }

    #[test]
    fn stalled_buffer_keeps_newest_two() {
        let buffer = FrameBuffer::new(CLIENT_BUFFER_FRAMES);
        assert!(!buffer.push(jpeg(1)));
        assert!(!buffer.push(jpeg(2)));
        assert!(buffer.push(jpeg(3)));
        assert!(buffer.push(jpeg(4)));

        assert_eq!(buffer.snapshot(), vec![jpeg(3), jpeg(4)]);
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.dropped_since_read(), 2);

        assert_eq!(buffer.try_pop(), Some(jpeg(3)));
        assert_eq!(buffer.dropped_since_read(), 0);
        assert_eq!(buffer.dropped(), 2);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let buffer = Arc::new(FrameBuffer::new(2));
        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.pop().await })
        };
        tokio::task::yield_now().await;
        buffer.push(jpeg(7));
        assert_eq!(waiter.await.unwrap(), jpeg(7));
    }

    #[test]
    fn registry_publishes_counts_and_stats() {
        let (tx, mut rx) = broadcast::channel(8);
        let registry = ClientRegistry::new(tx);
        let a = registry.register("10.0.0.1:5000".parse().unwrap());
        let b = registry.register("10.0.0.2:5000".parse().unwrap());
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::ClientCount(1));
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::ClientCount(2));

        for n in 0..3 {
            registry.broadcast(&jpeg(n));
        }
        b.buffer.try_pop();
        a.add_bytes(100);

        let stats = registry.stats();
        assert_eq!(stats[0].bytes_sent, 100);
        assert!(stats[0].slow);
        assert_eq!(stats[0].frames_dropped, 1);
        assert!(!stats[1].slow);

        registry.remove(a.id);
        registry.remove(a.id);
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::ClientCount(1));
        assert!(rx.try_recv().is_err());
    }
}
