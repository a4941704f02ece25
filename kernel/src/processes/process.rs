//! Process control blocks and the process table.
//!
//! Every process runs in ring 0 on a kernel stack carved from the heap and owns one
//! address space, which holds a private data page at `PROCESS_DATA_START`. PIDs start at 1,
//! increase monotonically, and are never handed out twice; 0 means "no process".

use core::fmt;

use arrayvec::ArrayString;
use log::{debug, info};
use x86_64::{structures::paging::Page, VirtAddr};

use crate::{
    constants::processes::{
        MAX_PROCESSES, PROCESS_DATA_START, PROCESS_NAME_LEN, PROCESS_STACK_SIZE, QUANTUM_TICKS,
    },
    memory::{
        address_space::USER_DATA,
        heap::{HeapError, HeapHandle, LockedHeap},
        paging::VmmError,
        AddressSpace, BitmapFrameAllocator, Vmm,
    },
    processes::{
        context::{save_context, Context, TrapFrame},
        process_return,
        scheduler::ReadyQueue,
    },
};

pub type Pid = u32;

pub type ProcessName = ArrayString<PROCESS_NAME_LEN>;

/// Function a process starts in. Returning from it exits the process with status 0.
pub type EntryPoint = extern "C" fn();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    New,
    Ready,
    Running,
    Blocked,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    TableFull,
    OutOfMemory,
    /// Only the running process may exit or block itself.
    NotCurrent(Pid),
    NoSuchProcess(Pid),
    /// A PID came off the ready queue in some state other than READY.
    NotReady(Pid),
    Vmm(VmmError),
    Heap(HeapError),
}

impl ProcessError {
    pub fn is_fatal(&self) -> bool {
        match self {
            ProcessError::TableFull
            | ProcessError::OutOfMemory
            | ProcessError::NotCurrent(_)
            | ProcessError::NoSuchProcess(_) => false,
            ProcessError::NotReady(_) => true,
            ProcessError::Vmm(err) => err.is_fatal(),
            ProcessError::Heap(err) => err.is_fatal(),
        }
    }
}

impl From<VmmError> for ProcessError {
    fn from(err: VmmError) -> Self {
        match err {
            VmmError::OutOfMemory => ProcessError::OutOfMemory,
            other => ProcessError::Vmm(other),
        }
    }
}

impl From<HeapError> for ProcessError {
    fn from(err: HeapError) -> Self {
        match err {
            HeapError::OutOfMemory => ProcessError::OutOfMemory,
            other => ProcessError::Heap(other),
        }
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::TableFull => write!(f, "Process table is full"),
            ProcessError::OutOfMemory => write!(f, "Out of memory while creating a process"),
            ProcessError::NotCurrent(pid) => write!(f, "Process {} is not running", pid),
            ProcessError::NoSuchProcess(pid) => write!(f, "No process with PID {}", pid),
            ProcessError::NotReady(pid) => {
                write!(f, "Process {} was queued without being READY", pid)
            }
            ProcessError::Vmm(err) => write!(f, "{}", err),
            ProcessError::Heap(err) => write!(f, "{}", err),
        }
    }
}

#[derive(Debug)]
pub struct Pcb {
    pid: Pid,
    name: ProcessName,
    pub(super) state: ProcessState,
    pub(super) context: Context,
    space: AddressSpace,
    stack: HeapHandle,
    pub(super) quantum: u32,
    pub(super) ticks: u64,
}

impl Pcb {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    /// Lowest address of the kernel stack.
    pub fn stack(&self) -> HeapHandle {
        self.stack
    }

    pub fn quantum(&self) -> u32 {
        self.quantum
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

/// One row of the process listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub name: ProcessName,
    pub state: ProcessState,
    pub ticks: u64,
}

pub struct ProcessTable {
    slots: [Option<Pcb>; MAX_PROCESSES],
    pub(super) ready: ReadyQueue,
    pub(super) current: Option<Pid>,
    next_pid: Pid,
    pub(super) uptime: u64,
    pub(super) idle: Context,
}

impl ProcessTable {
    /// An empty table. `idle` is resumed whenever nothing is runnable.
    pub fn new(idle: Context) -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
            ready: ReadyQueue::new(),
            current: None,
            next_pid: 1,
            uptime: 0,
            idle,
        }
    }

    /// Builds a process that starts at `entry` and appends it to the ready queue.
    ///
    /// Nothing is left allocated if any step fails.
    pub fn create(
        &mut self,
        entry: EntryPoint,
        name: &str,
        frames: &mut BitmapFrameAllocator,
        vmm: &mut Vmm,
        heap: &LockedHeap,
    ) -> Result<Pid, ProcessError> {
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .filter(|_| !self.ready.is_full())
            .ok_or(ProcessError::TableFull)?;

        let mut space = vmm.create_address_space(frames)?;
        if let Err(err) = map_data_page(&mut space, frames, vmm) {
            vmm.destroy_address_space(space, frames)?;
            return Err(err);
        }

        let stack = match heap.alloc(PROCESS_STACK_SIZE) {
            Ok(stack) => stack,
            Err(err) => {
                vmm.destroy_address_space(space, frames)?;
                return Err(err.into());
            }
        };

        // a return from `entry` pops this address and lands in exit(0)
        let stack_top = (stack.addr() + PROCESS_STACK_SIZE) as u64;
        let return_slot = stack_top - core::mem::size_of::<u64>() as u64;
        unsafe { (return_slot as *mut u64).write(process_return as usize as u64) };

        let pid = self.next_pid;
        self.next_pid += 1;

        let mut pcb = Pcb {
            pid,
            name: truncated_name(name),
            state: ProcessState::New,
            context: Context::new(entry as usize as u64, return_slot),
            space,
            stack,
            quantum: QUANTUM_TICKS,
            ticks: 0,
        };

        self.ready.push(pid)?;
        pcb.state = ProcessState::Ready;
        self.slots[slot] = Some(pcb);

        info!("Created process {} ({})", pid, name);
        Ok(pid)
    }

    /// Terminates the running process `pid` and switches to whatever runs next.
    ///
    /// `frame` belongs to the exiting process and is rewritten to resume the next one.
    /// It sits at the top of the stack being released; nothing allocates before the
    /// interrupt returns, so the bytes stay intact until then.
    pub fn exit(
        &mut self,
        pid: Pid,
        code: i32,
        frame: &mut TrapFrame,
        frames: &mut BitmapFrameAllocator,
        vmm: &mut Vmm,
        heap: &LockedHeap,
    ) -> Result<(), ProcessError> {
        if self.current != Some(pid) {
            return Err(ProcessError::NotCurrent(pid));
        }

        let slot = self.slot_of(pid).ok_or(ProcessError::NoSuchProcess(pid))?;
        let mut pcb = self.slots[slot]
            .take()
            .ok_or(ProcessError::NoSuchProcess(pid))?;
        pcb.state = ProcessState::Terminated;
        self.ready.remove(pid);
        self.current = None;

        vmm.switch_to_kernel();
        let released = vmm.destroy_address_space(pcb.space, frames)?;
        heap.free(pcb.stack)?;

        info!(
            "Process {} ({}) exited with status {}, {} frames released",
            pid, pcb.name, code, released
        );

        self.schedule(frame, vmm)
    }

    /// Parks the running process until `unblock` is called for it.
    pub fn block_current(
        &mut self,
        frame: &mut TrapFrame,
        vmm: &mut Vmm,
    ) -> Result<(), ProcessError> {
        let pid = self.current.ok_or(ProcessError::NotCurrent(0))?;
        let pcb = self.get_mut(pid).ok_or(ProcessError::NoSuchProcess(pid))?;
        pcb.context = save_context(frame);
        pcb.state = ProcessState::Blocked;
        self.current = None;

        debug!("Process {} blocked", pid);
        self.schedule(frame, vmm)
    }

    pub fn unblock(&mut self, pid: Pid) -> Result<(), ProcessError> {
        let pcb = self.get_mut(pid).ok_or(ProcessError::NoSuchProcess(pid))?;
        if pcb.state != ProcessState::Blocked {
            return Err(ProcessError::NotReady(pid));
        }
        pcb.state = ProcessState::Ready;
        self.ready.push(pid)
    }

    /// PID of the running process, if any.
    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    pub fn current_pcb(&self) -> Option<&Pcb> {
        self.current.and_then(|pid| self.get(pid))
    }

    /// Timer ticks since the scheduler started counting.
    pub fn ticks(&self) -> u64 {
        self.uptime
    }

    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.slots.iter().flatten().find(|pcb| pcb.pid == pid)
    }

    pub(super) fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.slots.iter_mut().flatten().find(|pcb| pcb.pid == pid)
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> impl Iterator<Item = ProcessInfo> + '_ {
        self.slots.iter().flatten().map(|pcb| ProcessInfo {
            pid: pcb.pid,
            name: pcb.name,
            state: pcb.state,
            ticks: pcb.ticks,
        })
    }

    /// Frames held by every live process's address space.
    pub fn owned_frames(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .map(|pcb| pcb.space.frame_count())
            .sum()
    }

    fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|pcb| pcb.pid == pid))
    }
}

fn map_data_page(
    space: &mut AddressSpace,
    frames: &mut BitmapFrameAllocator,
    vmm: &mut Vmm,
) -> Result<(), ProcessError> {
    let page = Page::containing_address(VirtAddr::new(PROCESS_DATA_START));
    let frame = frames.allocate().map_err(VmmError::from)?;
    if let Err(err) = vmm.map(space, page, frame, USER_DATA, frames) {
        frames.free(frame).map_err(VmmError::from)?;
        return Err(err.into());
    }
    Ok(())
}

fn truncated_name(name: &str) -> ProcessName {
    let mut truncated = ProcessName::new();
    for c in name.chars() {
        if truncated.try_push(c).is_err() {
            break;
        }
    }
    truncated
}
