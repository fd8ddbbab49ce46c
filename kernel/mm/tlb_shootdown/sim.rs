//! Simulated multiprocessor for the shootdown tests.
//!
//! Each simulated CPU has an interrupt level, a posted-IPI flag, a model TLB
//! (page -> global bit), and a log of the local flushes it performed. A test
//! thread becomes CPU `n` with [`SimMachine::run_as`].
//!
//! IPIs are delivered either immediately, with the sender's thread running
//! the handler as the target, or posted, with the target's own thread taking
//! them whenever its level is low: in `restore_ipl`, `cpu_relax`, or an idle
//! loop.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use cpu_local::{AtomicCpuSet, CpuSet};
use tlb_ops::LocalFlush;

use super::{
    CpuId, FailFast, IplCookie, ShootdownConfig, SpinBackoff, TlbFeatures, TlbPlatform,
    TlbShootdown, WaitSite, WaitStrategy,
};

thread_local! {
    static CURRENT: Cell<CpuId> = const { Cell::new(0) };
}

/// Interrupt levels: everything enabled, and the shootdown IPI masked.
const IPL_NONE: u64 = 0;
const IPL_VM: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Immediate,
    Posted,
}

type Handler = Box<dyn Fn() + Send + Sync>;
type SoftIntr = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct SimCpu {
    ipl: AtomicU64,
    posted: AtomicBool,
    preemptible: AtomicBool,
    in_ipi: AtomicBool,
    ipis: AtomicU64,
    tlb: Mutex<BTreeMap<u64, bool>>,
    local_ops: Mutex<Vec<LocalFlush>>,
    ipi_ops: Mutex<Vec<Vec<LocalFlush>>>,
    soft: Mutex<Vec<SoftIntr>>,
}

pub struct SimMachine {
    ncpu: usize,
    running: AtomicCpuSet,
    features: TlbFeatures,
    delivery: Delivery,
    cpus: Vec<SimCpu>,
    handler: OnceLock<Handler>,
}

/// Shared handle to a [`SimMachine`]; this is the `TlbPlatform`.
#[derive(Clone)]
pub struct Sim(Arc<SimMachine>);

impl Deref for Sim {
    type Target = SimMachine;

    fn deref(&self) -> &SimMachine {
        &self.0
    }
}

impl Sim {
    pub fn new(ncpu: usize, features: TlbFeatures, delivery: Delivery) -> Self {
        Sim(Arc::new(SimMachine {
            ncpu,
            running: AtomicCpuSet::new(CpuSet::first(ncpu)),
            features,
            delivery,
            cpus: (0..ncpu).map(|_| SimCpu::default()).collect(),
            handler: OnceLock::new(),
        }))
    }
}

impl SimMachine {
    fn cpu(&self, cpu: CpuId) -> &SimCpu {
        &self.cpus[cpu]
    }

    fn me(&self) -> CpuId {
        CURRENT.with(|c| c.get())
    }

    /// Install the IPI handler. Called once by [`rig_with`].
    fn install(&self, handler: Handler) {
        if self.handler.set(handler).is_err() {
            panic!("sim: IPI handler installed twice");
        }
    }

    /// Run `f` on this thread as CPU `cpu`.
    pub fn run_as<R>(&self, cpu: CpuId, f: impl FnOnce() -> R) -> R {
        let prev = CURRENT.with(|c| c.replace(cpu));
        let r = f();
        CURRENT.with(|c| c.set(prev));
        r
    }

    /// Become `cpu` and take interrupts until `stop` returns true.
    pub fn idle_until(&self, cpu: CpuId, stop: impl Fn() -> bool) {
        self.run_as(cpu, || {
            while !stop() {
                self.service(cpu);
                std::thread::yield_now();
            }
            self.service(cpu);
        });
    }

    /// Take every posted IPI and soft interrupt of `cpu`.
    ///
    /// Must be called as `cpu` at a low level.
    pub fn service(&self, cpu: CpuId) {
        let c = self.cpu(cpu);
        loop {
            if c.posted.swap(false, Ordering::SeqCst) {
                self.take_ipi(cpu);
                continue;
            }
            let soft = std::mem::take(&mut *c.soft.lock().unwrap());
            if soft.is_empty() {
                return;
            }
            for intr in soft {
                intr();
            }
        }
    }

    /// Run the shootdown handler as `cpu` with the IPI masked.
    fn take_ipi(&self, cpu: CpuId) {
        let prev_cpu = CURRENT.with(|cur| cur.replace(cpu));
        let c = self.cpu(cpu);
        let prev_ipl = c.ipl.swap(IPL_VM, Ordering::SeqCst);
        c.ipis.fetch_add(1, Ordering::SeqCst);
        c.ipi_ops.lock().unwrap().push(Vec::new());
        c.in_ipi.store(true, Ordering::SeqCst);

        match self.handler.get() {
            Some(handler) => handler(),
            None => panic!("sim: IPI on cpu {} before a handler was installed", cpu),
        }

        c.in_ipi.store(false, Ordering::SeqCst);
        c.ipl.store(prev_ipl, Ordering::SeqCst);
        CURRENT.with(|cur| cur.set(prev_cpu));
    }

    fn post(&self, target: CpuId) {
        match self.delivery {
            Delivery::Immediate => self.take_ipi(target),
            Delivery::Posted => self.cpu(target).posted.store(true, Ordering::SeqCst),
        }
    }

    pub fn set_running(&self, cpus: CpuSet) {
        self.running.store(cpus, Ordering::SeqCst);
    }

    pub fn set_preemptible(&self, cpu: CpuId, on: bool) {
        self.cpu(cpu).preemptible.store(on, Ordering::SeqCst);
    }

    /// Queue `intr` to run on `cpu` the next time its level drops.
    pub fn schedule_soft(&self, cpu: CpuId, intr: SoftIntr) {
        self.cpu(cpu).soft.lock().unwrap().push(intr);
    }

    /// Put a translation for `va` in `cpu`'s model TLB.
    pub fn load(&self, cpu: CpuId, va: u64, global: bool) {
        self.cpu(cpu).tlb.lock().unwrap().insert(va, global);
    }

    pub fn cached(&self, cpu: CpuId, va: u64) -> bool {
        self.cpu(cpu).tlb.lock().unwrap().contains_key(&va)
    }

    /// Flushes `cpu` performed outside of IPI handlers.
    pub fn local_ops(&self, cpu: CpuId) -> Vec<LocalFlush> {
        self.cpu(cpu).local_ops.lock().unwrap().clone()
    }

    /// Flushes `cpu` performed, one vector per IPI taken.
    pub fn ipi_ops(&self, cpu: CpuId) -> Vec<Vec<LocalFlush>> {
        self.cpu(cpu).ipi_ops.lock().unwrap().clone()
    }

    pub fn ipis(&self, cpu: CpuId) -> u64 {
        self.cpu(cpu).ipis.load(Ordering::SeqCst)
    }
}

impl TlbPlatform for Sim {
    fn current_cpu(&self) -> CpuId {
        self.me()
    }

    fn running_cpus(&self) -> CpuSet {
        self.running.load(Ordering::SeqCst)
    }

    fn ncpu(&self) -> usize {
        self.ncpu
    }

    fn features(&self) -> TlbFeatures {
        self.features
    }

    fn preemption_disabled(&self) -> bool {
        !self.cpu(self.me()).preemptible.load(Ordering::SeqCst)
    }

    fn raise_ipl(&self) -> IplCookie {
        let c = self.cpu(self.me());
        IplCookie(c.ipl.fetch_max(IPL_VM, Ordering::SeqCst))
    }

    fn restore_ipl(&self, cookie: IplCookie) {
        let me = self.me();
        self.cpu(me).ipl.store(cookie.0, Ordering::SeqCst);
        if cookie.0 == IPL_NONE {
            self.service(me);
        }
    }

    fn send_shootdown_ipi(&self, cpu: CpuId) {
        self.post(cpu);
    }

    fn broadcast_shootdown_ipi(&self) {
        for target in self.running_cpus().without(self.me()) {
            self.post(target);
        }
    }

    fn invalidate(&self, op: LocalFlush) {
        let c = self.cpu(self.me());
        {
            let mut tlb = c.tlb.lock().unwrap();
            match op {
                LocalFlush::Page(va) => {
                    tlb.remove(&va.as_u64());
                }
                LocalFlush::AllNonGlobal => tlb.retain(|_, global| *global),
                LocalFlush::AllIncludingGlobal => tlb.clear(),
            }
        }
        if c.in_ipi.load(Ordering::SeqCst) {
            if let Some(group) = c.ipi_ops.lock().unwrap().last_mut() {
                group.push(op);
            }
        } else {
            c.local_ops.lock().unwrap().push(op);
        }
    }

    fn cpu_relax(&self) {
        std::hint::spin_loop();
        let me = self.me();
        if self.cpu(me).ipl.load(Ordering::SeqCst) == IPL_NONE {
            self.service(me);
        }
        std::thread::yield_now();
    }
}

type Step = Box<dyn FnOnce() + Send>;

/// Wait strategy for hand-ordered interleavings.
///
/// The first `Await` poll after [`on_await`](Scripted::on_await) runs the
/// queued step, standing in for another processor acting while this one
/// spins. Otherwise it behaves like [`FailFast`].
pub struct Scripted {
    step: Mutex<Option<Step>>,
    limit: FailFast,
}

impl Scripted {
    pub fn new(limit: u32) -> Self {
        Scripted {
            step: Mutex::new(None),
            limit: FailFast::new(limit),
        }
    }

    pub fn on_await(&self, step: Step) {
        *self.step.lock().unwrap() = Some(step);
    }
}

impl WaitStrategy for Scripted {
    fn pause(&self, site: WaitSite, attempt: u32, relax: &dyn Fn()) {
        if site == WaitSite::Await {
            let step = self.step.lock().unwrap().take();
            if let Some(step) = step {
                step();
            }
        }
        self.limit.pause(site, attempt, relax);
    }
}

/// A simulated machine wired to a coordinator.
pub struct Rig<W: WaitStrategy = SpinBackoff> {
    pub sim: Sim,
    pub tlb: Arc<TlbShootdown<Sim, W>>,
}

pub fn rig(ncpu: usize, features: TlbFeatures, delivery: Delivery) -> Rig {
    rig_with(ncpu, features, delivery, SpinBackoff::default())
}

pub fn rig_with<W>(ncpu: usize, features: TlbFeatures, delivery: Delivery, wait: W) -> Rig<W>
where
    W: WaitStrategy + Send + 'static,
{
    let sim = Sim::new(ncpu, features, delivery);
    let tlb = Arc::new(TlbShootdown::new(sim.clone(), wait, ShootdownConfig::X86_64));
    let weak = Arc::downgrade(&tlb);
    sim.install(Box::new(move || {
        if let Some(tlb) = weak.upgrade() {
            tlb.handle_ipi();
        }
    }));
    Rig { sim, tlb }
}
