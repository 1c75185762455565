//! Reply delivery from completion threads to the guest side

use common::{ChannelKernel, GuestKernel, Reply, ReplyBridge, create_reply_bridge};
use protocol::{RequestId, TRANSFER_STALLED};
use std::sync::Arc;
use std::time::Duration;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn create_kernel() -> (Arc<ChannelKernel>, ReplyBridge) {
    let (bridge, queue) = create_reply_bridge();
    (Arc::new(ChannelKernel::new(4096, queue)), bridge)
}

async fn next_reply(bridge: &ReplyBridge) -> Reply {
    tokio::time::timeout(RECV_TIMEOUT, bridge.recv_reply())
        .await
        .expect("no reply in time")
        .expect("reply channel closed")
}

#[tokio::test]
async fn test_replies_from_many_threads() {
    let (kernel, bridge) = create_kernel();

    let workers: Vec<_> = (0..4u64)
        .map(|worker| {
            let kernel = Arc::clone(&kernel);
            std::thread::spawn(move || {
                for i in 0..25u64 {
                    kernel.enqueue_reply(RequestId(worker * 100 + i), i as i32);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..100 {
        let reply = next_reply(&bridge).await;
        received.push(reply.request.0);
    }
    received.sort_unstable();
    received.dedup();
    assert_eq!(received.len(), 100);
    assert_eq!(bridge.pending(), 0);
}

#[tokio::test]
async fn test_per_thread_order_is_preserved() {
    let (kernel, bridge) = create_kernel();

    let producer = std::thread::spawn(move || {
        for i in 0..10u64 {
            kernel.enqueue_reply(RequestId(i), 0);
        }
    });
    producer.join().unwrap();

    for i in 0..10u64 {
        let reply = next_reply(&bridge).await;
        assert_eq!(reply.request, RequestId(i));
    }
}

#[test]
fn test_blocking_receive() {
    let (bridge, queue) = create_reply_bridge();
    let kernel = ChannelKernel::new(0, queue);

    kernel.enqueue_reply(RequestId(8), TRANSFER_STALLED);

    assert_eq!(
        bridge.recv_reply_blocking().unwrap(),
        Reply {
            request: RequestId(8),
            result: TRANSFER_STALLED,
        }
    );
}

#[test]
fn test_closed_channel_is_an_error() {
    let (bridge, queue) = create_reply_bridge();
    drop(queue);

    assert!(bridge.recv_reply_blocking().is_err());
}

#[test]
fn test_memory_is_shared_across_threads() {
    let (kernel, _bridge) = create_kernel();

    let writer = {
        let kernel = Arc::clone(&kernel);
        std::thread::spawn(move || kernel.write_memory(0x40, &[1, 2, 3]))
    };
    writer.join().unwrap();

    let mut buf = [0u8; 3];
    kernel.read_memory(0x40, &mut buf);
    assert_eq!(buf, [1, 2, 3]);
}
