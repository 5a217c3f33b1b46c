//! Per-device assembly: hardware lock, buffer pool, scheduler, AGP ledger
//! and vblank dispatcher behind one ioctl-shaped command surface.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use arbor_agp::{AgpBackend, AgpManager};
use arbor_bufs::{BufRef, BufState, BufferPool, Census};
use arbor_lock::{DeviceLockState, HardwareLock, SignalMask, SignalShield};
use arbor_sched::{HardwareBackend, SchedStats, Scheduler, Serviced};
use arbor_types::{CancelToken, ClientId, ContextId, DeviceId, KERNEL_CONTEXT};
use arbor_vblank::{SignalSink, VblankConfig, VblankDispatcher};
use arbor_wire::{
    AgpBindingReq, AgpBufferReq, AgpInfoReply, AgpModeReq, BufferDesc, BufferFree, BufferInfo,
    BufferMapEntry, DmaFlags, DmaRequest, LockFlags, LockRequest, VblankFlags, VblankRequest,
    VblankWireReply, FREE_BATCH,
};

use crate::error::{ArbError, Result};

/// Aperture page size used to convert byte counts for the AGP back-end.
const AGP_PAGE_SIZE: u64 = 4096;

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub name: String,
    /// Usable slots per context dispatch queue.
    pub queue_depth: usize,
    pub vblank: VblankConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "card0".to_owned(),
            queue_depth: 64,
            vblank: VblankConfig::default(),
        }
    }
}

/// An ioctl-shaped command. Request structures are the wire types; see
/// `arbor-wire` for their frozen layouts.
#[derive(Debug, Clone)]
pub enum Command {
    Lock(LockRequest),
    Unlock(LockRequest),
    AddBufs(BufferDesc),
    MarkBufs(BufferDesc),
    InfoBufs,
    MapBufs,
    FreeBufs(BufferFree),
    Dma(DmaRequest),
    AgpAcquire,
    AgpRelease,
    AgpEnable(AgpModeReq),
    AgpInfo,
    AgpAlloc(AgpBufferReq),
    AgpFree(AgpBufferReq),
    AgpBind(AgpBindingReq),
    AgpUnbind(AgpBindingReq),
    WaitVblank(VblankRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    None,
    BufsAdded {
        first_index: u32,
        count: u32,
        order: u32,
    },
    BufInfo(Vec<BufferInfo>),
    BufMap(Vec<BufferMapEntry>),
    AgpAlloc(AgpBufferReq),
    AgpInfo(AgpInfoReply),
    Vblank(VblankWireReply),
}

#[derive(Debug, Default)]
struct Counters {
    locks: AtomicU64,
    lock_contentions: AtomicU64,
    unlocks: AtomicU64,
    dma_queued: AtomicU64,
    dma_discards: AtomicU64,
    vblank_irqs: AtomicU64,
}

/// Point-in-time device statistics (the proc-fs analogue; query only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub locks: u64,
    /// Lock acquisitions that found the lock held and had to sleep.
    pub lock_contentions: u64,
    pub unlocks: u64,
    pub dma_queued: u64,
    pub dma_discards: u64,
    pub vblank_irqs: u64,
    pub vblank_counter: u32,
    pub vblank_pending: usize,
    pub sched: SchedStats,
    pub bufs: Census,
    /// Orders whose freelists have drained below their low watermark.
    pub starved_orders: Vec<u32>,
}

/// Who holds the lock through the ioctl surface, plus the shield that must
/// drop when they release it.
struct LockLedger {
    state: DeviceLockState,
    context: Option<ContextId>,
    shield: Option<SignalShield>,
}

/// One arbitrated device.
pub struct Device {
    id: DeviceId,
    config: DeviceConfig,
    lock: HardwareLock,
    ledger: Mutex<LockLedger>,
    pool: Arc<BufferPool>,
    sched: Mutex<Scheduler>,
    agp: AgpManager,
    vblank: VblankDispatcher,
    signal_mask: Arc<dyn SignalMask>,
    counters: Counters,
    torn_down: AtomicBool,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .finish()
    }
}

/// Rounds a requested byte size up to its power-of-two buffer order.
fn order_for_size(size: u32) -> Result<u32> {
    if size == 0 {
        return Err(ArbError::InvalidArgument("zero-length buffer"));
    }
    let order = 32 - (size - 1).leading_zeros();
    Ok(order.max(arbor_bufs::MIN_ORDER))
}

impl Device {
    pub fn new(
        id: DeviceId,
        config: DeviceConfig,
        hardware: Arc<dyn HardwareBackend>,
        agp_backend: Arc<dyn AgpBackend>,
        signal_sink: Arc<dyn SignalSink>,
        signal_mask: Arc<dyn SignalMask>,
    ) -> Arc<Self> {
        let pool = Arc::new(BufferPool::new());
        let vblank = VblankDispatcher::new(config.vblank, signal_sink);
        Arc::new(Self {
            id,
            config,
            lock: HardwareLock::new(),
            ledger: Mutex::new(LockLedger {
                state: DeviceLockState::default(),
                context: None,
                shield: None,
            }),
            pool: pool.clone(),
            sched: Mutex::new(Scheduler::new(hardware, pool)),
            agp: AgpManager::new(agp_backend),
            vblank,
            signal_mask,
            counters: Counters::default(),
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Opens a handle for `client`. Dropping (or closing) the handle runs
    /// the reclaim protocol for everything the client still owns.
    pub fn open(self: &Arc<Self>, client: ClientId) -> FileHandle {
        tracing::debug!(device = self.id.0, client = client.0, "handle opened");
        FileHandle {
            device: self.clone(),
            client,
            closed: AtomicBool::new(false),
        }
    }

    // ---- context lifecycle (driver glue, not part of the wire surface) ----

    pub fn create_context(&self, context: ContextId, preserved: bool) -> Result<()> {
        self.sched
            .lock()
            .unwrap()
            .create_context(context, self.config.queue_depth, preserved)?;
        Ok(())
    }

    pub fn destroy_context(&self, context: ContextId) -> Result<()> {
        self.sched.lock().unwrap().destroy_context(context)?;
        Ok(())
    }

    /// Hands a free buffer of at least `size` bytes to `client` (the
    /// driver-specific "get buffer" path). Blocks interruptibly when
    /// `block`, otherwise fails busy on exhaustion.
    pub fn request_buffer(
        &self,
        client: ClientId,
        size: u32,
        block: bool,
        cancel: &CancelToken,
    ) -> Result<BufRef> {
        let order = order_for_size(size)?;
        if block {
            Ok(self.pool.allocate(order, client, cancel)?)
        } else {
            self.pool
                .try_allocate(order, client)?
                .ok_or(ArbError::Busy("buffer pool exhausted"))
        }
    }

    // ---- interrupt-context entry points ----

    /// Vblank interrupt: advances the counter, delivers due signals, wakes
    /// waiters.
    pub fn vblank_irq(&self) -> u32 {
        self.counters.vblank_irqs.fetch_add(1, Ordering::Relaxed);
        self.vblank.irq_tick()
    }

    /// Back-end notification that the outstanding hardware context switch
    /// finished; resumes the parked dispatch and keeps draining queues.
    pub fn context_switch_complete(&self) {
        let mut sched = self.sched.lock().unwrap();
        sched.switch_complete();
        sched.service_all();
    }

    /// Back-end notification that a dispatched buffer completed.
    pub fn buffer_complete(&self, index: usize) -> Result<()> {
        let buf = self
            .pool
            .buffer(index)
            .ok_or(ArbError::InvalidArgument("bad buffer index"))?;
        let mut sched = self.sched.lock().unwrap();
        sched.buffer_complete(&buf);
        sched.service_all();
        Ok(())
    }

    /// Runs the scheduler until the hardware is busy or queues drain.
    pub fn service(&self) -> Serviced {
        self.sched.lock().unwrap().service_all()
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            locks: self.counters.locks.load(Ordering::Relaxed),
            lock_contentions: self.counters.lock_contentions.load(Ordering::Relaxed),
            unlocks: self.counters.unlocks.load(Ordering::Relaxed),
            dma_queued: self.counters.dma_queued.load(Ordering::Relaxed),
            dma_discards: self.counters.dma_discards.load(Ordering::Relaxed),
            vblank_irqs: self.counters.vblank_irqs.load(Ordering::Relaxed),
            vblank_counter: self.vblank.counter(),
            vblank_pending: self.vblank.pending_count(),
            sched: self.sched.lock().unwrap().stats(),
            bufs: self.pool.census(),
            starved_orders: self.pool.starved_orders(),
        }
    }

    /// Tears the device down: every blocked wait unblocks with a
    /// non-restartable interruption and further blocking is refused.
    pub(crate) fn tear_down(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(device = self.id.0, "device teardown");
        self.lock.tear_down();
        self.pool.tear_down();
        self.sched.lock().unwrap().tear_down();
        self.vblank.tear_down();
    }

    // ---- command surface ----

    pub fn command(&self, client: ClientId, cmd: Command, cancel: &CancelToken) -> Result<Reply> {
        match cmd {
            Command::Lock(req) => self.cmd_lock(client, req, cancel),
            Command::Unlock(req) => self.cmd_unlock(client, req),
            Command::AddBufs(desc) => self.cmd_add_bufs(desc),
            Command::MarkBufs(desc) => self.cmd_mark_bufs(desc),
            Command::InfoBufs => self.cmd_info_bufs(),
            Command::MapBufs => self.cmd_map_bufs(),
            Command::FreeBufs(req) => self.cmd_free_bufs(client, req),
            Command::Dma(req) => self.cmd_dma(client, req, cancel),
            Command::AgpAcquire => {
                self.agp.acquire()?;
                Ok(Reply::None)
            }
            Command::AgpRelease => {
                self.agp.release()?;
                Ok(Reply::None)
            }
            Command::AgpEnable(req) => {
                self.agp.enable(req.mode)?;
                Ok(Reply::None)
            }
            Command::AgpInfo => Ok(Reply::AgpInfo(self.cmd_agp_info())),
            Command::AgpAlloc(req) => self.cmd_agp_alloc(req),
            Command::AgpFree(req) => {
                self.agp.free(req.handle)?;
                Ok(Reply::None)
            }
            Command::AgpBind(req) => {
                self.agp.bind(req.handle, req.offset)?;
                Ok(Reply::None)
            }
            Command::AgpUnbind(req) => {
                self.agp.unbind(req.handle)?;
                Ok(Reply::None)
            }
            Command::WaitVblank(req) => self.cmd_wait_vblank(client, req, cancel),
        }
    }

    fn cmd_lock(&self, client: ClientId, req: LockRequest, cancel: &CancelToken) -> Result<Reply> {
        let flags = LockFlags::from_bits(req.flags)
            .ok_or(ArbError::InvalidArgument("unknown lock flags"))?;
        let context = ContextId(req.context);
        if context.is_kernel() {
            return Err(ArbError::InvalidArgument(
                "client may not lock the kernel context",
            ));
        }
        if !self.lock.try_take(context) {
            self.counters.lock_contentions.fetch_add(1, Ordering::Relaxed);
            self.lock.acquire(context, cancel)?;
        }
        {
            let mut ledger = self.ledger.lock().unwrap();
            if ledger.state.last_context != context {
                ledger.state.last_context = context;
                ledger.state.last_switch = Some(Instant::now());
            }
            ledger.state.holder = Some(client);
            ledger.context = Some(context);
            // Job-control signals stay masked until the matching unlock.
            ledger.shield = Some(SignalShield::engage(self.signal_mask.clone()));
        }
        self.counters.locks.fetch_add(1, Ordering::Relaxed);
        if flags.intersects(LockFlags::FLUSH | LockFlags::FLUSH_ALL) {
            self.service();
        }
        if flags.intersects(LockFlags::READY | LockFlags::QUIESCENT) {
            // Hardware readiness/quiescence is the vendor back-end's
            // business; the generic engine has nothing to wait on.
            tracing::trace!(flags = req.flags, "lock readiness flags accepted");
        }
        Ok(Reply::None)
    }

    fn cmd_unlock(&self, client: ClientId, req: LockRequest) -> Result<Reply> {
        let context = ContextId(req.context);
        if context.is_kernel() {
            return Err(ArbError::InvalidArgument(
                "client may not unlock the kernel context",
            ));
        }
        {
            // Validate against the ledger before committing anything: a
            // holder naming the wrong context must not lose its shield
            // while the lock word stays held.
            let mut ledger = self.ledger.lock().unwrap();
            if ledger.state.holder != Some(client) || ledger.context != Some(context) {
                return Err(ArbError::InvalidArgument("unlock by non-holder"));
            }
            ledger.state.holder = None;
            ledger.context = None;
            // Restores the signal mask before the lock word is released.
            ledger.shield = None;
        }
        self.lock.free(context);
        self.counters.unlocks.fetch_add(1, Ordering::Relaxed);
        // A release is a natural dispatch point.
        self.service();
        Ok(Reply::None)
    }

    fn cmd_add_bufs(&self, desc: BufferDesc) -> Result<Reply> {
        let order = order_for_size(desc.size)?;
        let first = self.pool.add_bufs(order, desc.count as usize)?;
        if desc.low_mark != 0 || desc.high_mark != 0 {
            self.pool
                .set_marks(order, desc.low_mark as usize, desc.high_mark as usize)?;
        }
        Ok(Reply::BufsAdded {
            first_index: first as u32,
            count: desc.count,
            order,
        })
    }

    fn cmd_mark_bufs(&self, desc: BufferDesc) -> Result<Reply> {
        let order = order_for_size(desc.size)?;
        self.pool
            .set_marks(order, desc.low_mark as usize, desc.high_mark as usize)?;
        Ok(Reply::None)
    }

    fn cmd_info_bufs(&self) -> Result<Reply> {
        let info = self
            .pool
            .info()
            .into_iter()
            .map(|o| BufferInfo {
                count: o.count as u32,
                size: o.size as u32,
                low_mark: o.low_mark as u32,
                high_mark: o.high_mark as u32,
            })
            .collect();
        Ok(Reply::BufInfo(info))
    }

    fn cmd_map_bufs(&self) -> Result<Reply> {
        let mut entries = Vec::with_capacity(self.pool.total());
        for index in 0..self.pool.total() {
            if let Some(buf) = self.pool.buffer(index) {
                entries.push(BufferMapEntry {
                    // Opaque map token; unique per buffer, stable for the
                    // device lifetime.
                    token: (index as u64) << 32,
                    index: index as u32,
                    size: buf.size() as u32,
                });
            }
        }
        Ok(Reply::BufMap(entries))
    }

    fn cmd_free_bufs(&self, client: ClientId, req: BufferFree) -> Result<Reply> {
        let count = req.count as usize;
        if count > FREE_BATCH {
            return Err(ArbError::InvalidArgument("free batch too large"));
        }
        // Validate the whole batch before releasing anything so a bad entry
        // cannot commit a partial free.
        let mut batch = Vec::with_capacity(count);
        for &index in &req.indices[..count] {
            let buf = self
                .pool
                .buffer(index as usize)
                .ok_or(ArbError::InvalidArgument("bad buffer index"))?;
            if buf.owner() != client {
                return Err(ArbError::InvalidArgument("freeing buffer not owned"));
            }
            if buf.state() != BufState::None {
                return Err(ArbError::Busy("buffer is queued or on hardware"));
            }
            batch.push(buf);
        }
        for buf in &batch {
            self.pool.release(buf);
        }
        Ok(Reply::None)
    }

    fn cmd_dma(&self, client: ClientId, req: DmaRequest, cancel: &CancelToken) -> Result<Reply> {
        let flags = DmaFlags::from_bits(req.flags)
            .ok_or(ArbError::InvalidArgument("unknown dma flags"))?;
        let context = ContextId(req.context);
        if context.is_kernel() {
            return Err(ArbError::InvalidArgument("kernel context misuse"));
        }
        let buf = self
            .pool
            .buffer(req.buf_index as usize)
            .ok_or(ArbError::InvalidArgument("bad buffer index"))?;
        if buf.owner() != client {
            return Err(ArbError::InvalidArgument("submitting buffer not owned"));
        }
        if req.used as usize > buf.size() {
            return Err(ArbError::InvalidArgument("used bytes exceed buffer size"));
        }
        if flags.contains(DmaFlags::WHILE_LOCKED) {
            let ledger = self.ledger.lock().unwrap();
            if ledger.state.holder != Some(client) {
                return Err(ArbError::InvalidArgument(
                    "WHILE_LOCKED without holding the lock",
                ));
            }
        }

        // Zero used bytes: the client is handing the buffer back untouched.
        if req.used == 0 {
            if buf.state() != BufState::None {
                return Err(ArbError::Busy("buffer is queued or on hardware"));
            }
            self.pool.release(&buf);
            self.counters.dma_discards.fetch_add(1, Ordering::Relaxed);
            return Ok(Reply::None);
        }

        buf.set_context(context);
        buf.set_used(req.used);

        if flags.contains(DmaFlags::PRIORITY) {
            buf.transition(BufState::None, BufState::Prio)
                .map_err(|_| ArbError::Busy("buffer already queued"))?;
            let mut sched = self.sched.lock().unwrap();
            sched.submit_priority(buf);
            sched.service_all();
        } else {
            let queue = self
                .sched
                .lock()
                .unwrap()
                .queue(context)
                .ok_or(ArbError::InvalidArgument("unknown context"))?;
            buf.transition(BufState::None, BufState::Wait)
                .map_err(|_| ArbError::Busy("buffer already queued"))?;
            let enqueued = if flags.contains(DmaFlags::BLOCK) {
                queue.enqueue(buf.clone(), cancel)
            } else {
                queue.try_enqueue(buf.clone())
            };
            if let Err(err) = enqueued {
                // Not committed: the buffer goes back to the client intact.
                let _ = buf.transition(BufState::Wait, BufState::None);
                return Err(err.into());
            }
            self.service();
        }
        self.counters.dma_queued.fetch_add(1, Ordering::Relaxed);
        Ok(Reply::None)
    }

    fn cmd_agp_info(&self) -> AgpInfoReply {
        let info = self.agp.info();
        AgpInfoReply {
            aperture_base: info.aperture_base,
            aperture_size: info.aperture_size,
            memory_allowed: info.memory_allowed,
            memory_used: info.memory_used,
            id_vendor: info.id_vendor,
            id_device: info.id_device,
            version_major: info.version_major as u16,
            version_minor: info.version_minor as u16,
        }
    }

    fn cmd_agp_alloc(&self, req: AgpBufferReq) -> Result<Reply> {
        let pages = req.size.div_ceil(AGP_PAGE_SIZE) as usize;
        let handle = self.agp.alloc(pages, req.mem_type)?;
        Ok(Reply::AgpAlloc(AgpBufferReq { handle, ..req }))
    }

    fn cmd_wait_vblank(
        &self,
        client: ClientId,
        req: VblankRequest,
        cancel: &CancelToken,
    ) -> Result<Reply> {
        let flags = VblankFlags::from_bits(req.flags)
            .ok_or(ArbError::InvalidArgument("unknown vblank flags"))?;
        let target = if flags.contains(VblankFlags::RELATIVE) {
            self.vblank.counter().wrapping_add(req.sequence)
        } else {
            req.sequence
        };
        if flags.contains(VblankFlags::SIGNAL) {
            self.vblank.register_signal(target, req.signal, client)?;
            return Ok(Reply::Vblank(wire_reply(
                self.vblank.counter(),
                SystemTime::now(),
            )));
        }
        let reply = self.vblank.wait_for(target, cancel)?;
        Ok(Reply::Vblank(wire_reply(reply.sequence, reply.when)))
    }

    /// Close-time reclaim: recover buffers, drop signal registrations, and
    /// confiscate the hardware lock if the dying client holds it.
    fn release_client(&self, client: ClientId) {
        let dropped = self.vblank.forget_task(client);
        let summary = self.pool.reclaim_for_owner(client);
        {
            let mut ledger = self.ledger.lock().unwrap();
            if ledger.state.holder == Some(client) {
                ledger.context = None;
                ledger.state.holder = None;
                ledger.shield = None;
                ledger.state.last_switch = Some(Instant::now());
                // Confiscate as the kernel, then free, so the owner check
                // in `free` stays honest.
                self.lock.transfer(KERNEL_CONTEXT);
                self.lock.free(KERNEL_CONTEXT);
            }
        }
        tracing::debug!(
            client = client.0,
            released = summary.released,
            marked = summary.marked,
            signals_dropped = dropped,
            "client released"
        );
        // Sweep newly reclaimable work out of the rings.
        self.service();
    }
}

fn wire_reply(sequence: u32, when: SystemTime) -> VblankWireReply {
    let since_epoch = when.duration_since(UNIX_EPOCH).unwrap_or_default();
    VblankWireReply {
        sequence,
        _pad: 0,
        tval_sec: since_epoch.as_secs(),
        tval_usec: u64::from(since_epoch.subsec_micros()),
    }
}

/// An open device handle belonging to one client process.
pub struct FileHandle {
    device: Arc<Device>,
    client: ClientId,
    closed: AtomicBool,
}

impl FileHandle {
    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Issues an ioctl-shaped command on this handle.
    pub fn command(&self, cmd: Command, cancel: &CancelToken) -> Result<Reply> {
        self.device.command(self.client, cmd, cancel)
    }

    /// Explicit close; equivalent to dropping the handle.
    pub fn close(self) {
        self.run_close();
    }

    fn run_close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.device.release_client(self.client);
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.run_close();
    }
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("device", &self.device.id())
            .field("client", &self.client)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_rounds_up_to_power_of_two() {
        assert_eq!(order_for_size(1).unwrap(), arbor_bufs::MIN_ORDER);
        assert_eq!(order_for_size(4096).unwrap(), 12);
        assert_eq!(order_for_size(4097).unwrap(), 13);
        assert_eq!(
            order_for_size(0),
            Err(ArbError::InvalidArgument("zero-length buffer"))
        );
    }
}
