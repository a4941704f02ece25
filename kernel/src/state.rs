//! The kernel's mutable state, owned in one place.
//!
//! Boot code builds a `Kernel` and parks it in `KERNEL`; the timer and syscall entry stubs
//! borrow it with interrupts masked for the length of one handler.

use alloc::boxed::Box;

use log::{error, info, warn};

use crate::{
    devices::Console,
    error::KernelError,
    memory::{BitmapFrameAllocator, LockedHeap, Vmm},
    processes::{
        context::{Context, TrapFrame},
        process::EntryPoint,
        Pid, ProcessTable,
    },
    syscalls,
};

pub struct Kernel {
    pub frames: Box<BitmapFrameAllocator>,
    pub vmm: Vmm,
    pub heap: &'static LockedHeap,
    pub processes: ProcessTable,
    pub console: Box<dyn Console + Send>,
}

impl Kernel {
    /// `idle` runs whenever no process is READY.
    pub fn new(
        frames: Box<BitmapFrameAllocator>,
        vmm: Vmm,
        heap: &'static LockedHeap,
        idle: Context,
        console: Box<dyn Console + Send>,
    ) -> Self {
        Self {
            frames,
            vmm,
            heap,
            processes: ProcessTable::new(idle),
            console,
        }
    }

    pub fn spawn(&mut self, entry: EntryPoint, name: &str) -> Result<Pid, KernelError> {
        let pid = self
            .processes
            .create(entry, name, &mut self.frames, &mut self.vmm, self.heap)?;
        Ok(pid)
    }

    /// Timer interrupt body.
    pub fn timer_tick(&mut self, frame: &mut TrapFrame) {
        if let Err(err) = self.processes.timer_tick(frame, &mut self.vmm) {
            let err = KernelError::from(err);
            if err.is_fatal() {
                self.fatal(&err);
            }
            warn!("Timer tick: {}", err);
        }
    }

    /// Syscall interrupt body.
    pub fn syscall(&mut self, frame: &mut TrapFrame) {
        syscalls::entry(self, frame);
    }

    /// Frames held by the kernel address space and every live process.
    pub fn owned_frames(&self) -> usize {
        self.vmm.kernel_space().frame_count() + self.processes.owned_frames()
    }

    pub fn dump_stats(&self) {
        let frames = self.frames.stats();
        info!(
            "Frames: {} total, {} used, {} free",
            frames.total, frames.used, frames.free
        );

        let heap = self.heap.stats();
        info!(
            "Heap: {} bytes, {} used, {} free in {} of {} blocks (largest {})",
            heap.total, heap.used, heap.free, heap.free_blocks, heap.blocks, heap.largest_free
        );

        info!(
            "Processes: {} live, current {:?}, uptime {} ticks",
            self.processes.len(),
            self.processes.current(),
            self.processes.ticks()
        );
        for process in self.processes.list() {
            info!(
                "  PID {}: {} {:?}, {} ticks",
                process.pid, process.name, process.state, process.ticks
            );
        }
    }

    /// Logs what the kernel knows, then stops.
    pub fn fatal(&self, err: &KernelError) -> ! {
        error!("Fatal kernel error: {}", err);
        self.dump_stats();
        panic!("{}", err);
    }
}

#[cfg(target_os = "none")]
pub static KERNEL: spin::Mutex<Option<Kernel>> = spin::Mutex::new(None);

/// Runs `f` on the kernel state with interrupts masked.
#[cfg(target_os = "none")]
pub fn with_kernel<F, R>(f: F) -> R
where
    F: FnOnce(&mut Kernel) -> R,
{
    crate::cpu::without_interrupts(|| {
        let mut guard = KERNEL.lock();
        match guard.as_mut() {
            Some(kernel) => f(kernel),
            None => panic!("Kernel state used before boot finished"),
        }
    })
}
