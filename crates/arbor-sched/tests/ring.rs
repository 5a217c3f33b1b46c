//! Ring invariants: occupancy bounds, the `count + 1` convention, blocking
//! enqueue under a full ring.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arbor_bufs::{BufRef, BufferPool};
use arbor_sched::{DispatchQueue, EnqueueError};
use arbor_types::{CancelToken, ClientId, ContextId};

use proptest::prelude::*;

fn buffers(n: usize) -> Vec<BufRef> {
    let pool = BufferPool::new();
    pool.add_bufs(12, n).unwrap();
    (0..n)
        .map(|_| pool.try_allocate(12, ClientId(1)).unwrap().unwrap())
        .collect()
}

/// A ring of capacity 7 takes exactly 7 buffers; the 8th
/// enqueue blocks until one is dequeued.
#[test]
fn eighth_enqueue_blocks_until_dequeue() {
    let queue = Arc::new(DispatchQueue::new(ContextId(1), 7));
    let bufs = buffers(8);
    for buf in bufs.iter().take(7) {
        queue.try_enqueue(buf.clone()).unwrap();
    }

    let blocked = {
        let queue = queue.clone();
        let buf = bufs[7].clone();
        thread::spawn(move || queue.enqueue(buf, &CancelToken::new()))
    };
    thread::sleep(Duration::from_millis(20));
    assert_eq!(queue.occupancy(), 7, "writer still blocked");

    let first = queue.dequeue().unwrap();
    assert_eq!(first.index(), bufs[0].index());
    blocked.join().unwrap().unwrap();
    assert_eq!(queue.occupancy(), 7);
}

#[test]
fn full_enqueue_is_interruptible() {
    let queue = Arc::new(DispatchQueue::new(ContextId(1), 1));
    let bufs = buffers(2);
    queue.try_enqueue(bufs[0].clone()).unwrap();

    let cancel = CancelToken::new();
    let blocked = {
        let queue = queue.clone();
        let buf = bufs[1].clone();
        let cancel = cancel.clone();
        thread::spawn(move || queue.enqueue(buf, &cancel))
    };
    thread::sleep(Duration::from_millis(10));
    cancel.cancel();
    assert_eq!(blocked.join().unwrap(), Err(EnqueueError::Interrupted));
    assert_eq!(queue.occupancy(), 1);
}

proptest! {
    /// Random enqueue/dequeue interleavings against a model queue:
    /// occupancy stays within `0..=depth`, FIFO order holds, and no slot is
    /// ever overwritten or read twice.
    #[test]
    fn ring_matches_model(depth in 1usize..9, ops in prop::collection::vec(any::<bool>(), 1..200)) {
        let queue = DispatchQueue::new(ContextId(1), depth);
        let bufs = buffers(16);
        let mut model: std::collections::VecDeque<usize> = Default::default();
        let mut next = 0usize;

        for op in ops {
            if op {
                let buf = bufs[next % bufs.len()].clone();
                match queue.try_enqueue(buf) {
                    Ok(()) => {
                        prop_assert!(model.len() < depth, "accepted a push past capacity");
                        model.push_back(next % bufs.len());
                        next += 1;
                    }
                    Err(EnqueueError::Full) => prop_assert_eq!(model.len(), depth),
                    Err(other) => prop_assert!(false, "unexpected error {:?}", other),
                }
            } else {
                match (queue.dequeue(), model.pop_front()) {
                    (Some(buf), Some(expect)) => prop_assert_eq!(buf.index(), bufs[expect].index()),
                    (None, None) => {}
                    (got, want) => prop_assert!(false, "ring/model diverged: {:?} vs {:?}", got.map(|b| b.index()), want),
                }
            }
            prop_assert_eq!(queue.occupancy(), model.len());
            prop_assert!(queue.occupancy() <= depth);
        }
    }
}
