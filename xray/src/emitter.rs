//! Datagram emission to the daemon.
//!
//! Completed documents travel over a bounded channel to a single worker
//! thread that owns the UDP socket. The channel never blocks producers: on
//! overflow the newest submission is dropped and counted, and the count rides
//! along as an annotation on the next document that does get out.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, error, warn};

use crate::schema::SegmentDocument;

/// Every datagram starts with this line so the daemon can identify the
/// payload format.
pub(crate) const DAEMON_HEADER: &str = "{\"format\":\"json\",\"version\":1}";

const DEFAULT_QUEUE_CAPACITY: usize = 8192;
const BACKOFF_MIN: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

pub(crate) struct Emitter {
    sender: Sender<Box<SegmentDocument>>,
    dropped: Arc<AtomicU64>,
}

impl Emitter {
    pub(crate) fn new(addr: SocketAddr) -> Emitter {
        Emitter::with_capacity(addr, DEFAULT_QUEUE_CAPACITY)
    }

    pub(crate) fn with_capacity(addr: SocketAddr, capacity: usize) -> Emitter {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        let _ = thread::Builder::new()
            .name("xray-emitter".to_string())
            .spawn(move || worker(receiver, addr));
        Emitter { sender, dropped }
    }

    /// Queues a document. Never blocks; a full queue drops the document and
    /// bumps the counter instead. Returns whether the document was queued.
    pub(crate) fn submit(&self, doc: SegmentDocument) -> bool {
        match self.sender.try_send(Box::new(doc)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(total, "emission queue is full, dropping segment");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(total, "emitter worker is gone, dropping segment");
                false
            }
        }
    }

    /// Claims the accumulated drop count for attachment to an outgoing
    /// document.
    pub(crate) fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }

    /// Returns a claimed count when the carrying document was itself dropped.
    pub(crate) fn restore_dropped(&self, count: u64) {
        self.dropped.fetch_add(count, Ordering::Relaxed);
    }

    /// Channel without a worker, so tests can observe queueing behavior.
    #[cfg(test)]
    pub(crate) fn detached(capacity: usize) -> (Emitter, Receiver<Box<SegmentDocument>>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (
            Emitter {
                sender,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }
}

/// Frames a document for the wire: format header, newline, JSON body.
fn frame(doc: &SegmentDocument) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(doc)?;
    let mut datagram = Vec::with_capacity(DAEMON_HEADER.len() + 1 + body.len());
    datagram.extend_from_slice(DAEMON_HEADER.as_bytes());
    datagram.push(b'\n');
    datagram.extend_from_slice(&body);
    Ok(datagram)
}

fn worker(receiver: Receiver<Box<SegmentDocument>>, addr: SocketAddr) {
    let mut socket: Option<UdpSocket> = None;
    let mut backoff = BACKOFF_MIN;

    while let Ok(doc) = receiver.recv() {
        let datagram = match frame(&doc) {
            Ok(datagram) => datagram,
            Err(err) => {
                error!(%err, "cannot serialize segment, dropping");
                continue;
            }
        };

        if socket.is_none() {
            match open_socket(addr) {
                Ok(sock) => socket = Some(sock),
                Err(err) => {
                    error!(%err, %addr, "cannot open daemon socket, dropping segment");
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                    continue;
                }
            }
        }

        let Some(sock) = socket.as_ref() else { continue };
        match sock.send(&datagram) {
            Ok(_) => {
                backoff = BACKOFF_MIN;
                debug!(bytes = datagram.len(), "sent segment datagram");
            }
            Err(err) => {
                error!(%err, %addr, "failed to send segment datagram, dropping");
                socket = None;
            }
        }
    }
}

fn open_socket(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))?;
    socket.connect(addr)?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn doc(name: &str) -> SegmentDocument {
        SegmentDocument {
            name: name.to_string(),
            id: "53995c3f42cd8ad8".to_string(),
            start_time: 1.0,
            end_time: Some(2.0),
            ..SegmentDocument::default()
        }
    }

    #[test]
    fn datagram_framing() {
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        listener
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let emitter = Emitter::new(listener.local_addr().unwrap());
        emitter.submit(doc("Test"));

        let mut buf = [0u8; 64 * 1024];
        let n = listener.recv(&mut buf).unwrap();
        let payload = &buf[..n];

        let newline = payload
            .iter()
            .position(|&b| b == b'\n')
            .expect("datagram has a header line");
        assert_eq!(&payload[..newline], DAEMON_HEADER.as_bytes());

        let body: SegmentDocument = serde_json::from_slice(&payload[newline + 1..]).unwrap();
        assert_eq!(body.name, "Test");
        // exactly one newline: the body is a single JSON document
        assert!(!payload[newline + 1..].contains(&b'\n'));
    }

    #[test]
    fn overflow_drops_newest_and_counts() {
        let (emitter, receiver) = Emitter::detached(2);
        emitter.submit(doc("a"));
        emitter.submit(doc("b"));
        emitter.submit(doc("c"));
        emitter.submit(doc("d"));

        assert_eq!(emitter.take_dropped(), 2);
        assert_eq!(emitter.take_dropped(), 0);
        // the oldest submissions survive
        assert_eq!(receiver.try_recv().unwrap().name, "a");
        assert_eq!(receiver.try_recv().unwrap().name, "b");
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn restore_dropped_accumulates() {
        let (emitter, _receiver) = Emitter::detached(1);
        emitter.restore_dropped(3);
        emitter.restore_dropped(2);
        assert_eq!(emitter.take_dropped(), 5);
    }
}
