//! End-to-end arbitration tests over the assembled device: registry, lock,
//! buffer pool, scheduler and vblank working together the way a real client
//! mix would drive them.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use arbor_agp::{AgpBackend, AgpError, AgpInfo, BackendKey};
use arbor_bufs::BufRef;
use arbor_device::{ArbError, Command, Device, DeviceConfig, DeviceRegistry};
use arbor_lock::NullSignalMask;
use arbor_sched::HardwareBackend;
use arbor_types::{CancelToken, ClientId, ContextId, DeviceId};
use arbor_vblank::NullSignalSink;
use arbor_wire::{BufferDesc, DmaRequest, LockRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Switch(u32, u32),
    Submit(u32, usize),
}

#[derive(Default)]
struct RecordingHardware {
    events: Mutex<Vec<Event>>,
}

impl RecordingHardware {
    fn take(&self) -> Vec<Event> {
        std::mem::take(&mut self.events.lock().unwrap())
    }
}

impl HardwareBackend for RecordingHardware {
    fn context_switch(&self, from: ContextId, to: ContextId) {
        self.events.lock().unwrap().push(Event::Switch(from.0, to.0));
    }

    fn submit(&self, context: ContextId, buf: &BufRef) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Submit(context.0, buf.index()));
    }
}

#[derive(Default)]
struct NullAgp {
    next_key: AtomicU64,
}

impl AgpBackend for NullAgp {
    fn acquire(&self) -> Result<(), AgpError> {
        Ok(())
    }
    fn release(&self) {}
    fn enable(&self, _mode: u32) -> Result<(), AgpError> {
        Ok(())
    }
    fn allocate(&self, _pages: usize, _mem_type: u32) -> Result<BackendKey, AgpError> {
        Ok(self.next_key.fetch_add(1, Ordering::SeqCst))
    }
    fn free(&self, _key: BackendKey) {}
    fn bind(&self, _key: BackendKey, offset: u64) -> Result<u64, AgpError> {
        Ok(0xF000_0000 + offset)
    }
    fn unbind(&self, _key: BackendKey) -> Result<(), AgpError> {
        Ok(())
    }
    fn info(&self) -> AgpInfo {
        AgpInfo::default()
    }
}

fn register(registry: &DeviceRegistry, id: u32) -> (Arc<Device>, Arc<RecordingHardware>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let hardware = Arc::new(RecordingHardware::default());
    let device = registry
        .register(
            DeviceId(id),
            DeviceConfig {
                queue_depth: 16,
                ..DeviceConfig::default()
            },
            hardware.clone(),
            Arc::new(NullAgp::default()),
            Arc::new(NullSignalSink),
            Arc::new(NullSignalMask),
        )
        .unwrap();
    (device, hardware)
}

fn lock_cmd(context: u32) -> Command {
    Command::Lock(LockRequest { context, flags: 0 })
}

fn unlock_cmd(context: u32) -> Command {
    Command::Unlock(LockRequest { context, flags: 0 })
}

/// Many clients hammering LOCK/UNLOCK: exactly one is ever inside the
/// critical section, and every acquisition eventually succeeds.
#[test]
fn contended_lock_is_mutually_exclusive() {
    const THREADS: u32 = 8;
    const ROUNDS: u32 = 100;

    let registry = DeviceRegistry::new();
    let (device, _hw) = register(&registry, 0);
    let inside = Arc::new(AtomicBool::new(false));

    let workers: Vec<_> = (1..=THREADS)
        .map(|n| {
            let device = device.clone();
            let inside = inside.clone();
            thread::spawn(move || {
                let handle = device.open(ClientId(n));
                let cancel = CancelToken::new();
                for _ in 0..ROUNDS {
                    handle.command(lock_cmd(n), &cancel).unwrap();
                    assert!(
                        !inside.swap(true, Ordering::SeqCst),
                        "two holders inside the critical section"
                    );
                    thread::yield_now();
                    inside.store(false, Ordering::SeqCst);
                    handle.command(unlock_cmd(n), &cancel).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = device.stats();
    assert_eq!(stats.locks, u64::from(THREADS * ROUNDS));
    assert_eq!(stats.unlocks, u64::from(THREADS * ROUNDS));
}

/// Two contexts feeding the scheduler: submissions alternate round-robin,
/// every switch completes before its dispatch, and every buffer comes home.
#[test]
fn pipeline_round_trips_all_buffers() {
    let registry = DeviceRegistry::new();
    let (device, hardware) = register(&registry, 0);
    let handle = device.open(ClientId(1));
    let cancel = CancelToken::new();

    handle
        .command(
            Command::AddBufs(BufferDesc {
                agp_start: 0,
                count: 8,
                size: 4096,
                low_mark: 0,
                high_mark: 0,
                flags: 0,
                _pad: 0,
            }),
            &cancel,
        )
        .unwrap();
    device.create_context(ContextId(1), false).unwrap();
    device.create_context(ContextId(2), false).unwrap();

    // Queue two buffers per context before letting any switch complete.
    let mut submitted = Vec::new();
    for context in [1u32, 2, 1, 2] {
        let buf = device
            .request_buffer(ClientId(1), 4096, false, &cancel)
            .unwrap();
        submitted.push(buf.index());
        handle
            .command(
                Command::Dma(DmaRequest {
                    context,
                    buf_index: buf.index() as u32,
                    used: 128,
                    flags: 0,
                }),
                &cancel,
            )
            .unwrap();
    }

    // Drive switch completions and buffer completions until idle: one
    // switch per dispatch, since the two contexts alternate.
    let mut dispatched = Vec::new();
    for _ in 0..4 {
        device.context_switch_complete();
        for event in hardware.take() {
            if let Event::Submit(_, index) = event {
                device.buffer_complete(index).unwrap();
                dispatched.push(index);
            }
        }
    }
    // Round-robin preserved the interleaved submission order.
    assert_eq!(dispatched, submitted);

    let stats = device.stats();
    assert_eq!(stats.sched.dispatched, 4);
    assert_eq!(stats.sched.discarded, 0);
    // Alternation means one switch per dispatch here.
    assert_eq!(stats.sched.context_switches, 4);
    let census = stats.bufs;
    assert_eq!(census.free, census.total);
}

/// Unregistering a device unblocks a client stuck waiting for the lock with
/// a non-restartable interruption (the EINTR analogue).
#[test]
fn teardown_unblocks_a_contended_locker() {
    let registry = Arc::new(DeviceRegistry::new());
    let (device, _hw) = register(&registry, 4);
    let holder = device.open(ClientId(1));
    let cancel = CancelToken::new();
    holder.command(lock_cmd(1), &cancel).unwrap();

    let contender = {
        let device = device.clone();
        thread::spawn(move || {
            let handle = device.open(ClientId(2));
            handle.command(lock_cmd(2), &CancelToken::new())
        })
    };
    // Give the contender time to block.
    thread::sleep(Duration::from_millis(20));
    registry.unregister(DeviceId(4)).unwrap();

    let err = contender.join().unwrap().unwrap_err();
    assert_eq!(err, ArbError::Interrupted { restartable: false });
    assert_eq!(err.errno(), -4);
}

/// A signal delivered to a blocked locker surfaces as a restartable
/// interruption while the holder keeps the lock.
#[test]
fn signal_interrupts_a_blocked_locker() {
    let registry = DeviceRegistry::new();
    let (device, _hw) = register(&registry, 0);
    let holder = device.open(ClientId(1));
    holder.command(lock_cmd(1), &CancelToken::new()).unwrap();

    let cancel = CancelToken::new();
    let contender = {
        let device = device.clone();
        let cancel = cancel.clone();
        thread::spawn(move || {
            let handle = device.open(ClientId(2));
            handle.command(lock_cmd(2), &cancel)
        })
    };
    thread::sleep(Duration::from_millis(20));
    cancel.cancel();

    let err = contender.join().unwrap().unwrap_err();
    assert_eq!(err.errno(), -512);
    holder.command(unlock_cmd(1), &CancelToken::new()).unwrap();
}
