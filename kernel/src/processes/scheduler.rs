//! Round-robin scheduling.
//!
//! READY processes wait in a FIFO. The running process gives up the CPU when its quantum
//! runs out or when it yields, and goes to the back of the queue. When nothing is runnable
//! the idle context runs on the kernel address space.

use arrayvec::ArrayVec;
use log::trace;

use crate::{
    constants::processes::{MAX_PROCESSES, QUANTUM_TICKS},
    memory::Vmm,
    processes::{
        context::{restore_context, save_context, TrapFrame},
        process::{Pid, ProcessError, ProcessState, ProcessTable},
    },
};

/// Fixed-capacity FIFO of READY PIDs. Never allocates, so it is safe to touch mid-switch.
#[derive(Debug, Default)]
pub struct ReadyQueue {
    pids: ArrayVec<Pid, MAX_PROCESSES>,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            pids: ArrayVec::new(),
        }
    }

    pub fn push(&mut self, pid: Pid) -> Result<(), ProcessError> {
        self.pids.try_push(pid).map_err(|_| ProcessError::TableFull)
    }

    pub fn pop(&mut self) -> Option<Pid> {
        if self.pids.is_empty() {
            None
        } else {
            Some(self.pids.remove(0))
        }
    }

    pub fn remove(&mut self, pid: Pid) -> bool {
        match self.pids.iter().position(|&p| p == pid) {
            Some(i) => {
                self.pids.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.pids.is_full()
    }

    pub fn iter(&self) -> impl Iterator<Item = Pid> + '_ {
        self.pids.iter().copied()
    }
}

impl ProcessTable {
    /// Picks the next process and rewrites `frame` so the interrupt returns into it.
    ///
    /// `frame` must hold the state of whatever was interrupted: the running process, the
    /// idle loop, or the boot path. The latter two are discarded.
    pub fn schedule(
        &mut self,
        frame: &mut TrapFrame,
        vmm: &mut Vmm,
    ) -> Result<(), ProcessError> {
        if self.ready.is_empty() {
            if let Some(pid) = self.current {
                let pcb = self.get_mut(pid).ok_or(ProcessError::NoSuchProcess(pid))?;
                pcb.quantum = QUANTUM_TICKS;
            } else {
                vmm.switch_to_kernel();
                restore_context(frame, &self.idle);
            }
            return Ok(());
        }

        if let Some(pid) = self.current.take() {
            let pcb = self.get_mut(pid).ok_or(ProcessError::NoSuchProcess(pid))?;
            pcb.context = save_context(frame);
            pcb.state = ProcessState::Ready;
            self.ready.push(pid)?;
        }

        let next = self.ready.pop().ok_or(ProcessError::TableFull)?;
        let pcb = self.get_mut(next).ok_or(ProcessError::NoSuchProcess(next))?;
        if pcb.state != ProcessState::Ready {
            return Err(ProcessError::NotReady(next));
        }
        pcb.state = ProcessState::Running;
        pcb.quantum = QUANTUM_TICKS;
        vmm.switch_to(pcb.space());
        restore_context(frame, &pcb.context);
        self.current = Some(next);

        trace!("Switched to process {}", next);
        Ok(())
    }

    /// Accounts one timer tick and preempts the running process once its quantum is spent.
    pub fn timer_tick(
        &mut self,
        frame: &mut TrapFrame,
        vmm: &mut Vmm,
    ) -> Result<(), ProcessError> {
        self.uptime += 1;

        let Some(pid) = self.current else {
            if self.ready.is_empty() {
                return Ok(());
            }
            return self.schedule(frame, vmm);
        };

        let pcb = self.get_mut(pid).ok_or(ProcessError::NoSuchProcess(pid))?;
        pcb.ticks += 1;
        pcb.quantum = pcb.quantum.saturating_sub(1);
        if pcb.quantum == 0 {
            return self.schedule(frame, vmm);
        }
        Ok(())
    }

    /// Gives up the rest of the running process's quantum.
    pub fn yield_current(
        &mut self,
        frame: &mut TrapFrame,
        vmm: &mut Vmm,
    ) -> Result<(), ProcessError> {
        self.schedule(frame, vmm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::{
            heap::LockedHeap,
            test_support::{HeapArena, PhysArena},
            BitmapFrameAllocator,
        },
        processes::context::Context,
    };
    use alloc::{boxed::Box, vec::Vec};

    const IDLE_RIP: u64 = 0x1d1e;

    extern "C" fn task_a() {}
    extern "C" fn task_b() {}
    extern "C" fn task_c() {}

    struct Fixture {
        _arena: PhysArena,
        _heap_arena: HeapArena,
        frames: Box<BitmapFrameAllocator>,
        vmm: Vmm,
        heap: LockedHeap,
        table: ProcessTable,
    }

    fn fixture() -> Fixture {
        let arena = PhysArena::new(128);
        let mut frames = arena.frame_allocator();
        let mut vmm = Vmm::new(arena.phys_offset(), None, &mut frames).unwrap();
        vmm.enable().unwrap();
        let heap_arena = HeapArena::new(256 * 1024);
        let heap = LockedHeap::empty();
        unsafe { heap.init(heap_arena.start(), heap_arena.size()) };

        Fixture {
            _arena: arena,
            _heap_arena: heap_arena,
            frames,
            vmm,
            heap,
            table: ProcessTable::new(Context::new(IDLE_RIP, 0x9000)),
        }
    }

    impl Fixture {
        fn spawn(&mut self, entry: extern "C" fn()) -> Pid {
            self.table
                .create(entry, "t", &mut self.frames, &mut self.vmm, &self.heap)
                .unwrap()
        }

        /// Runs ticks until the current process changes; returns the new one.
        fn run_until_switch(&mut self, frame: &mut TrapFrame) -> Option<Pid> {
            let before = self.table.current();
            for _ in 0..QUANTUM_TICKS {
                self.table.timer_tick(frame, &mut self.vmm).unwrap();
                if self.table.current() != before {
                    break;
                }
            }
            self.table.current()
        }
    }

    #[test]
    fn test_ready_queue_is_fifo() {
        let mut queue = ReadyQueue::new();
        for pid in 1..=3 {
            queue.push(pid).unwrap();
        }
        assert!(queue.remove(2));
        assert!(!queue.remove(9));
        assert_eq!(queue.pop(), Some(1));
        queue.push(4).unwrap();
        assert_eq!(queue.iter().collect::<Vec<_>>(), [3, 4]);
    }

    #[test]
    fn test_ready_queue_capacity() {
        let mut queue = ReadyQueue::new();
        for pid in 0..MAX_PROCESSES as Pid {
            queue.push(pid).unwrap();
        }
        assert!(queue.is_full());
        assert_eq!(queue.push(99), Err(ProcessError::TableFull));
    }

    #[test]
    fn test_round_robin_order() {
        let mut fx = fixture();
        let a = fx.spawn(task_a);
        let b = fx.spawn(task_b);
        let c = fx.spawn(task_c);

        let mut frame = TrapFrame::default();
        fx.table.schedule(&mut frame, &mut fx.vmm).unwrap();
        assert_eq!(fx.table.current(), Some(a));
        assert_eq!(frame.rip, task_a as usize as u64);

        let mut order = Vec::new();
        for _ in 0..6 {
            order.push(fx.run_until_switch(&mut frame).unwrap());
        }
        assert_eq!(order, [b, c, a, b, c, a]);
    }

    #[test]
    fn test_every_ready_process_runs_within_one_round() {
        let mut fx = fixture();
        let pids: Vec<Pid> = (0..5).map(|_| fx.spawn(task_a)).collect();

        let mut frame = TrapFrame::default();
        let mut seen = Vec::new();
        for _ in 0..pids.len() {
            fx.table.yield_current(&mut frame, &mut fx.vmm).unwrap();
            seen.push(fx.table.current().unwrap());
        }
        seen.sort();
        assert_eq!(seen, pids);
    }

    #[test]
    fn test_preempted_context_is_resumed() {
        let mut fx = fixture();
        let a = fx.spawn(task_a);
        fx.spawn(task_b);

        let mut frame = TrapFrame::default();
        fx.table.schedule(&mut frame, &mut fx.vmm).unwrap();

        // `a` makes some progress before the quantum ends
        frame.regs.rbx = 42;
        frame.rip += 0x10;
        let progressed = frame;

        fx.run_until_switch(&mut frame);
        assert_ne!(fx.table.current(), Some(a));
        assert_eq!(fx.table.get(a).unwrap().state(), ProcessState::Ready);

        fx.run_until_switch(&mut frame);
        assert_eq!(fx.table.current(), Some(a));
        assert_eq!(frame, progressed);
        assert_eq!(fx.vmm.active_root(), Some(fx.table.get(a).unwrap().space().root()));
    }

    #[test]
    fn test_single_process_keeps_running() {
        let mut fx = fixture();
        let a = fx.spawn(task_a);

        let mut frame = TrapFrame::default();
        fx.table.schedule(&mut frame, &mut fx.vmm).unwrap();
        frame.regs.rcx = 7;
        let running = frame;

        for _ in 0..3 * QUANTUM_TICKS {
            fx.table.timer_tick(&mut frame, &mut fx.vmm).unwrap();
        }
        assert_eq!(fx.table.current(), Some(a));
        assert_eq!(frame, running);
        assert_eq!(fx.table.get(a).unwrap().ticks(), 3 * QUANTUM_TICKS as u64);
        assert_eq!(fx.table.ticks(), 3 * QUANTUM_TICKS as u64);
    }

    #[test]
    fn test_idle_until_work_arrives() {
        let mut fx = fixture();
        let mut frame = TrapFrame::default();

        fx.table.schedule(&mut frame, &mut fx.vmm).unwrap();
        assert_eq!(fx.table.current(), None);
        assert_eq!(frame.rip, IDLE_RIP);
        assert_eq!(fx.vmm.active_root(), Some(fx.vmm.kernel_space().root()));

        fx.table.timer_tick(&mut frame, &mut fx.vmm).unwrap();
        assert_eq!(frame.rip, IDLE_RIP);

        let a = fx.spawn(task_a);
        fx.table.timer_tick(&mut frame, &mut fx.vmm).unwrap();
        assert_eq!(fx.table.current(), Some(a));
        assert_eq!(fx.table.get(a).unwrap().state(), ProcessState::Running);
    }

    #[test]
    fn test_exactly_one_running() {
        let mut fx = fixture();
        for _ in 0..4 {
            fx.spawn(task_a);
        }

        let mut frame = TrapFrame::default();
        for _ in 0..40 {
            fx.table.timer_tick(&mut frame, &mut fx.vmm).unwrap();
            let running = fx
                .table
                .list()
                .filter(|p| p.state == ProcessState::Running)
                .count();
            assert_eq!(running, 1);
            assert!(fx
                .table
                .ready
                .iter()
                .all(|pid| fx.table.get(pid).unwrap().state() == ProcessState::Ready));
        }
    }
}
