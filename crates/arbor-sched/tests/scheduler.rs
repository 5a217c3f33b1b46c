//! Scheduler behaviour: two-phase context switches, round-robin fairness,
//! priority bypass, reclaim discard.

use std::sync::{Arc, Mutex};

use arbor_bufs::{BufRef, BufState, BufferPool};
use arbor_sched::{HardwareBackend, Scheduler, Serviced};
use arbor_types::{CancelToken, ClientId, ContextId};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Switch { from: u32, to: u32 },
    Submit { context: u32, index: usize },
}

#[derive(Default)]
struct RecordingBackend {
    events: Mutex<Vec<Event>>,
}

impl RecordingBackend {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl HardwareBackend for RecordingBackend {
    fn context_switch(&self, from: ContextId, to: ContextId) {
        self.events.lock().unwrap().push(Event::Switch {
            from: from.0,
            to: to.0,
        });
    }

    fn submit(&self, context: ContextId, buf: &BufRef) {
        self.events.lock().unwrap().push(Event::Submit {
            context: context.0,
            index: buf.index(),
        });
    }
}

struct Rig {
    backend: Arc<RecordingBackend>,
    pool: Arc<BufferPool>,
    sched: Scheduler,
}

fn rig(buf_count: usize) -> Rig {
    let backend = Arc::new(RecordingBackend::default());
    let pool = Arc::new(BufferPool::new());
    pool.add_bufs(12, buf_count).unwrap();
    let sched = Scheduler::new(backend.clone(), pool.clone());
    Rig {
        backend,
        pool,
        sched,
    }
}

/// Allocates a buffer for `client`, stamps it for `context`, and moves it to
/// the queued state the way the command surface does.
fn queued_buf(rig: &Rig, client: ClientId, context: ContextId) -> BufRef {
    let buf = rig.pool.try_allocate(12, client).unwrap().unwrap();
    buf.set_context(context);
    buf.transition(BufState::None, BufState::Wait).unwrap();
    buf
}

#[test]
fn two_phase_switch_dispatches_exactly_once() {
    let mut r = rig(4);
    let ctx = ContextId(1);
    let queue = r.sched.create_context(ctx, 4, false).unwrap();
    let buf = queued_buf(&r, ClientId(1), ctx);
    queue.enqueue(buf.clone(), &CancelToken::new()).unwrap();

    // Phase one: the scheduler issues the switch and parks the buffer.
    assert_eq!(r.sched.service(), Serviced::SwitchIssued(ctx));
    assert_eq!(r.backend.events(), vec![Event::Switch { from: 0, to: 1 }]);
    assert_eq!(buf.state(), BufState::Wait);

    // Nothing moves while the switch is outstanding.
    assert_eq!(r.sched.service(), Serviced::AwaitingSwitch);
    assert_eq!(r.backend.events().len(), 1);

    // Phase two: completion resumes the parked buffer, exactly once.
    r.sched.switch_complete();
    assert_eq!(
        r.backend.events(),
        vec![
            Event::Switch { from: 0, to: 1 },
            Event::Submit {
                context: 1,
                index: buf.index()
            }
        ]
    );
    assert_eq!(buf.state(), BufState::Pend);
    assert_eq!(r.sched.last_context(), ctx);

    // A spurious second completion must not duplicate the submission.
    r.sched.switch_complete();
    assert_eq!(r.backend.events().len(), 2);

    r.sched.buffer_complete(&buf);
    assert_eq!(buf.state(), BufState::Free);
    let stats = r.sched.stats();
    assert_eq!((stats.dispatched, stats.context_switches), (1, 1));
}

#[test]
fn preserved_context_skips_hardware_reload() {
    let mut r = rig(2);
    let ctx = ContextId(3);
    let queue = r.sched.create_context(ctx, 4, true).unwrap();
    let buf = queued_buf(&r, ClientId(1), ctx);
    queue.try_enqueue(buf.clone()).unwrap();

    assert_eq!(r.sched.service(), Serviced::Dispatched(ctx));
    assert_eq!(
        r.backend.events(),
        vec![Event::Submit {
            context: 3,
            index: buf.index()
        }]
    );
    assert_eq!(r.sched.stats().context_switches, 0);
}

#[test]
fn round_robin_alternates_between_contexts() {
    let mut r = rig(4);
    let (a, b) = (ContextId(1), ContextId(2));
    // Preserved queues so no switch phases interleave with the ordering
    // being tested.
    let qa = r.sched.create_context(a, 4, true).unwrap();
    let qb = r.sched.create_context(b, 4, true).unwrap();

    let a1 = queued_buf(&r, ClientId(1), a);
    let a2 = queued_buf(&r, ClientId(1), a);
    let b1 = queued_buf(&r, ClientId(2), b);
    let b2 = queued_buf(&r, ClientId(2), b);
    qa.try_enqueue(a1.clone()).unwrap();
    qa.try_enqueue(a2.clone()).unwrap();
    qb.try_enqueue(b1.clone()).unwrap();
    qb.try_enqueue(b2.clone()).unwrap();

    for _ in 0..4 {
        assert!(matches!(r.sched.service(), Serviced::Dispatched(_)));
    }
    let submitted: Vec<usize> = r
        .backend
        .events()
        .iter()
        .filter_map(|e| match e {
            Event::Submit { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(
        submitted,
        vec![a1.index(), b1.index(), a2.index(), b2.index()],
        "service starts from the context after the last one serviced"
    );
    assert_eq!(r.sched.service(), Serviced::Idle);
}

#[test]
fn reclaimed_buffer_is_discarded_not_dispatched() {
    let mut r = rig(2);
    let ctx = ContextId(1);
    let client = ClientId(7);
    let queue = r.sched.create_context(ctx, 4, true).unwrap();
    let buf = queued_buf(&r, client, ctx);
    queue.try_enqueue(buf.clone()).unwrap();

    // Owner closes its handle while the buffer is still queued.
    let summary = r.pool.reclaim_for_owner(client);
    assert_eq!(summary.marked, 1);
    assert_eq!(buf.state(), BufState::Reclaim);

    assert_eq!(r.sched.service(), Serviced::Idle);
    assert!(r.backend.events().is_empty(), "hardware never touched");
    assert_eq!(buf.state(), BufState::Free);
    assert_eq!(r.sched.stats().discarded, 1);
}

#[test]
fn priority_path_jumps_the_rings() {
    let mut r = rig(3);
    let ctx = ContextId(1);
    let queue = r.sched.create_context(ctx, 4, true).unwrap();

    let normal = queued_buf(&r, ClientId(1), ctx);
    queue.try_enqueue(normal.clone()).unwrap();

    let urgent = r.pool.try_allocate(12, ClientId(2)).unwrap().unwrap();
    urgent.set_context(ctx);
    urgent.transition(BufState::None, BufState::Prio).unwrap();
    r.sched.submit_priority(urgent.clone());

    assert_eq!(r.sched.service(), Serviced::Dispatched(ctx));
    assert_eq!(
        r.backend.events()[0],
        Event::Submit {
            context: 1,
            index: urgent.index()
        }
    );
    assert_eq!(r.sched.service(), Serviced::Dispatched(ctx));
    assert_eq!(r.backend.events().len(), 2);
}

#[test]
fn destroy_context_recycles_waiting_buffers() {
    let mut r = rig(2);
    let ctx = ContextId(1);
    let queue = r.sched.create_context(ctx, 4, true).unwrap();
    let buf = queued_buf(&r, ClientId(1), ctx);
    queue.try_enqueue(buf.clone()).unwrap();

    r.sched.destroy_context(ctx).unwrap();
    assert_eq!(buf.state(), BufState::Free);
    assert_eq!(r.pool.census().free, 2);
    assert!(r.sched.queue(ctx).is_none());
}

#[test]
fn kernel_context_cannot_have_a_queue() {
    let mut r = rig(1);
    assert!(r
        .sched
        .create_context(arbor_types::KERNEL_CONTEXT, 4, false)
        .is_err());
}
