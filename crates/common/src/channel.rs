//! Reply channel between completion context and the guest side
//!
//! Completions are delivered on threads owned by the host transport, which
//! must never block on the guest. The queue side is therefore unbounded and
//! non-blocking; the bridge side can be drained blocking or from async code.

use async_channel::{Receiver, Sender, unbounded};
use protocol::RequestId;

/// A reply destined for the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Correlation id of the request being answered
    pub request: RequestId,
    /// Signed result code
    pub result: i32,
}

/// Receiving end, held by whoever forwards replies to the guest
#[derive(Clone)]
pub struct ReplyBridge {
    reply_rx: Receiver<Reply>,
}

impl ReplyBridge {
    /// Receive the next reply
    pub async fn recv_reply(&self) -> crate::Result<Reply> {
        self.reply_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive the next reply, blocking the current thread
    pub fn recv_reply_blocking(&self) -> crate::Result<Reply> {
        self.reply_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a reply without blocking
    pub fn try_recv_reply(&self) -> Option<Reply> {
        self.reply_rx.try_recv().ok()
    }

    /// Number of replies waiting
    pub fn pending(&self) -> usize {
        self.reply_rx.len()
    }
}

/// Sending end, used from completion context
#[derive(Clone)]
pub struct ReplyQueue {
    reply_tx: Sender<Reply>,
}

impl ReplyQueue {
    /// Enqueue a reply without blocking
    pub fn enqueue(&self, reply: Reply) -> crate::Result<()> {
        self.reply_tx
            .try_send(reply)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the reply channel
///
/// Returns (ReplyBridge for the guest side, ReplyQueue for completion context)
pub fn create_reply_bridge() -> (ReplyBridge, ReplyQueue) {
    let (reply_tx, reply_rx) = unbounded();

    (ReplyBridge { reply_rx }, ReplyQueue { reply_tx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reply_bridge() {
        let (bridge, queue) = create_reply_bridge();

        // Enqueue from a plain thread, the way a completion would
        let handle = std::thread::spawn(move || {
            queue
                .enqueue(Reply {
                    request: RequestId(5),
                    result: 64,
                })
                .is_ok()
        });
        assert!(handle.join().unwrap());

        let reply = bridge.recv_reply().await.unwrap();
        assert_eq!(reply.request, RequestId(5));
        assert_eq!(reply.result, 64);
    }

    #[test]
    fn test_enqueue_after_bridge_dropped() {
        let (bridge, queue) = create_reply_bridge();
        drop(bridge);

        let result = queue.enqueue(Reply {
            request: RequestId(1),
            result: 0,
        });
        assert!(matches!(result, Err(crate::Error::Channel(_))));
    }

    #[test]
    fn test_try_recv_empty() {
        let (bridge, _queue) = create_reply_bridge();
        assert!(bridge.try_recv_reply().is_none());
        assert_eq!(bridge.pending(), 0);
    }
}
