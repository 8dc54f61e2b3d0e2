//! Process model.
//!
//! A process owns an address space, its threads (at least a main thread),
//! a file-descriptor table, an environment, and resource limits.  The
//! process manager assigns pids (smallest unused positive integer), tracks
//! every live process, and reaps zombies: destruction marks a process
//! Zombie, and the next `cleanup_zombies` frees its threads and then its
//! address space, in that order.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::thread::{Thread, ThreadRef, ThreadState};
use crate::config::{KERNEL_STACK_SIZE, PAGE_SIZE, TLS_SIZE};
use crate::kernel_singleton;
use crate::memory::{self, AddressSpaceRef};

/// Shared handle to a process.
pub type ProcessRef = Arc<Mutex<Process>>;

/// Process lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Ready,
    Running,
    Blocked,
    Sleeping,
    Zombie,
    Dead,
}

/// Per-process resource limits.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub memory_limit: u64,
    pub threads_limit: usize,
    pub open_files: usize,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        ProcessLimits {
            memory_limit: 256 * 1024 * 1024,
            threads_limit: 64,
            open_files: 256,
        }
    }
}

/// Cumulative per-process accounting.
#[derive(Debug, Default, Clone)]
pub struct ProcessStats {
    pub cpu_time_used: u64,
    pub memory_used: u64,
    pub context_switches: u64,
    pub page_faults: u64,
}

/// Opaque handle into the external filesystem layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHandle(pub u64);

/// A process.
pub struct Process {
    pid: u64,
    parent_pid: u64,
    name: String,
    state: ProcessState,
    exit_code: u64,
    address_space: Option<AddressSpaceRef>,
    threads: Vec<ThreadRef>,
    main_thread: Option<ThreadRef>,
    open_files: BTreeMap<u32, FileHandle>,
    environment: BTreeMap<String, String>,
    arguments: Vec<String>,
    limits: ProcessLimits,
    stats: ProcessStats,
    creation_time: u64,
    termination_time: u64,
}

impl Process {
    fn new(
        pid: u64,
        parent_pid: u64,
        name: &str,
        address_space: Option<AddressSpaceRef>,
        now: u64,
    ) -> Process {
        Process {
            pid,
            parent_pid,
            name: String::from(name),
            state: ProcessState::Created,
            exit_code: 0,
            address_space,
            threads: Vec::new(),
            main_thread: None,
            open_files: BTreeMap::new(),
            environment: BTreeMap::new(),
            arguments: Vec::new(),
            limits: ProcessLimits::default(),
            stats: ProcessStats::default(),
            creation_time: now,
            termination_time: 0,
        }
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn parent_pid(&self) -> u64 {
        self.parent_pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn set_state(&mut self, state: ProcessState) {
        self.state = state;
    }

    pub fn is_zombie(&self) -> bool {
        self.state == ProcessState::Zombie
    }

    pub fn is_dead(&self) -> bool {
        self.state == ProcessState::Dead
    }

    pub fn exit_code(&self) -> u64 {
        self.exit_code
    }

    pub fn set_exit_code(&mut self, code: u64) {
        self.exit_code = code;
    }

    pub fn address_space(&self) -> Option<&AddressSpaceRef> {
        self.address_space.as_ref()
    }

    pub fn threads(&self) -> &[ThreadRef] {
        &self.threads
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    pub fn main_thread(&self) -> Option<ThreadRef> {
        self.main_thread.clone()
    }

    pub fn limits(&self) -> &ProcessLimits {
        &self.limits
    }

    pub fn set_limits(&mut self, limits: ProcessLimits) {
        self.limits = limits;
    }

    pub fn stats(&self) -> &ProcessStats {
        &self.stats
    }

    pub fn creation_time(&self) -> u64 {
        self.creation_time
    }

    pub fn termination_time(&self) -> u64 {
        self.termination_time
    }

    /// Charge CPU time consumed by one of this process's threads.
    pub fn update_statistics(&mut self, cpu_time_delta: u64) {
        self.stats.cpu_time_used += cpu_time_delta;
        self.stats.context_switches += 1;
    }

    // ── File descriptor table ───────────────────────────────

    pub fn add_open_file(&mut self, fd: u32, file: FileHandle) -> bool {
        if self.open_files.len() >= self.limits.open_files {
            return false;
        }
        self.open_files.insert(fd, file);
        true
    }

    pub fn remove_open_file(&mut self, fd: u32) -> bool {
        self.open_files.remove(&fd).is_some()
    }

    pub fn get_open_file(&self, fd: u32) -> Option<FileHandle> {
        self.open_files.get(&fd).copied()
    }

    // ── Environment and arguments ───────────────────────────

    pub fn set_environment(&mut self, key: &str, value: &str) {
        self.environment
            .insert(String::from(key), String::from(value));
    }

    pub fn get_environment(&self, key: &str) -> Option<&str> {
        self.environment.get(key).map(String::as_str)
    }

    pub fn set_arguments(&mut self, args: Vec<String>) {
        self.arguments = args;
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }
}

/// Spawn a thread in `process`: allocate its kernel stack and TLS from the
/// kernel heap, seed the register snapshot, and register it with the
/// process.  Returns `None` when the thread limit is hit or allocation
/// fails.
pub fn spawn_thread(process: &ProcessRef, entry_point: u64, stack_size: usize) -> Option<ThreadRef> {
    let stack_size = stack_size.div_ceil(PAGE_SIZE) * PAGE_SIZE;

    let pid = {
        let proc = process.lock();
        if proc.threads.len() >= proc.limits.threads_limit {
            crate::error!("PROC", "thread limit reached for process {}", proc.pid);
            return None;
        }
        proc.pid
    };

    let stack_base = match memory::kmalloc_aligned(stack_size, PAGE_SIZE) {
        Some(base) => base,
        None => {
            crate::error!("PROC", "failed to allocate stack for thread in {}", pid);
            return None;
        }
    };

    let now = crate::time::now();
    let mut thread = Thread::new(
        pid,
        Arc::downgrade(process),
        entry_point,
        stack_base,
        stack_size,
        now,
    );

    // TLS failure is tolerated; the thread just runs without it.
    if let Some(tls_base) = memory::kmalloc_aligned(TLS_SIZE, PAGE_SIZE) {
        thread.set_tls(tls_base, TLS_SIZE);
    }

    // Seed the stack so the first voluntary switch "returns" into the
    // entry point.
    if entry_point != 0 {
        if let Some(space) = memory::current_space() {
            let guard = space.lock();
            let stack_top = stack_base + stack_size as u64 - 128;
            if let Some(sp) = super::context::prepare_initial_stack(&guard, stack_top, entry_point)
            {
                thread.registers.rsp = sp;
            }
        }
    }

    let thread = Arc::new(Mutex::new(thread));

    let mut proc = process.lock();
    proc.threads.push(thread.clone());
    if proc.main_thread.is_none() {
        proc.main_thread = Some(thread.clone());
    }
    crate::debug!(
        "PROC",
        "created thread {} in process {}, entry {:#x}",
        thread.lock().id(),
        pid,
        entry_point
    );
    Some(thread)
}

// ── Process manager ─────────────────────────────────────────

/// Owns every live process and the pid namespace.
pub struct ProcessManager {
    processes: BTreeMap<u64, ProcessRef>,
    kernel_process: Option<ProcessRef>,
}

impl ProcessManager {
    pub const fn new() -> Self {
        ProcessManager {
            processes: BTreeMap::new(),
            kernel_process: None,
        }
    }

    /// Smallest unused positive pid.
    fn allocate_pid(&self) -> u64 {
        let mut pid = 1;
        while self.processes.contains_key(&pid) {
            pid += 1;
        }
        pid
    }
}

kernel_singleton!(
    PROCESS_MANAGER,
    SpinLock,
    ProcessManager,
    ProcessManager::new(),
    pub with_process_manager
);

/// Create a process: fresh pid, its own address space, and a main thread.
/// Any allocation failure unwinds and returns `None`.
pub fn create_process(name: &str, parent_pid: u64) -> Option<ProcessRef> {
    let address_space = memory::create_address_space();
    if address_space.is_none() {
        crate::error!("PROC", "failed to create address space for '{}'", name);
        return None;
    }

    let now = crate::time::now();
    let process = with_process_manager(|pm| {
        let pid = pm.allocate_pid();
        let process = Arc::new(Mutex::new(Process::new(
            pid,
            parent_pid,
            name,
            address_space.clone(),
            now,
        )));
        pm.processes.insert(pid, process.clone());
        process
    });
    let pid = process.lock().pid();

    // The main thread; its stack comes from the kernel heap.
    if spawn_thread(&process, 0, KERNEL_STACK_SIZE).is_none() {
        with_process_manager(|pm| pm.processes.remove(&pid));
        if let Some(space) = address_space.as_ref() {
            memory::destroy_address_space(space);
        }
        return None;
    }

    process.lock().set_state(ProcessState::Ready);
    crate::info!("PROC", "created process {} ('{}')", pid, name);
    Some(process)
}

/// Look up a process by pid.
pub fn get_process(pid: u64) -> Option<ProcessRef> {
    with_process_manager(|pm| pm.processes.get(&pid).cloned())
}

/// Number of live (unreaped) processes.
pub fn process_count() -> usize {
    with_process_manager(|pm| pm.processes.len())
}

/// Record the kernel's own process.
pub fn set_kernel_process(process: ProcessRef) {
    with_process_manager(|pm| pm.kernel_process = Some(process));
}

pub fn kernel_process() -> Option<ProcessRef> {
    with_process_manager(|pm| pm.kernel_process.clone())
}

/// Mark a process for reaping.  The pid stays claimed and the resources
/// stay allocated until the next `cleanup_zombies`.
pub fn destroy_process(pid: u64) -> bool {
    match get_process(pid) {
        Some(process) => {
            let mut proc = process.lock();
            proc.state = ProcessState::Zombie;
            proc.termination_time = crate::time::now();
            true
        }
        None => false,
    }
}

/// Reap every zombie: threads first (stacks and TLS back to the kernel
/// heap), then the address space.
pub fn cleanup_zombies() {
    let zombies: Vec<ProcessRef> = with_process_manager(|pm| {
        let pids: Vec<u64> = pm
            .processes
            .iter()
            .filter(|(_, p)| p.lock().is_zombie())
            .map(|(&pid, _)| pid)
            .collect();
        pids.iter().filter_map(|pid| pm.processes.remove(pid)).collect()
    });

    for process in zombies {
        let mut proc = process.lock();

        for thread in proc.threads.drain(..) {
            let mut t = thread.lock();
            t.set_state(ThreadState::Dead);
            if t.stack_base() != 0 {
                memory::kfree(t.stack_base());
            }
            if t.tls_base() != 0 {
                memory::kfree(t.tls_base());
            }
        }
        proc.main_thread = None;

        if let Some(space) = proc.address_space.take() {
            memory::destroy_address_space(&space);
        }

        proc.state = ProcessState::Dead;
        crate::info!("PROC", "destroyed process {}", proc.pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_memory() {
        crate::memory::init_for_tests(0x100000, 0x1000000);
    }

    #[test]
    fn pids_are_smallest_unused() {
        setup_memory();
        let a = create_process("a", 0).unwrap();
        let b = create_process("b", 0).unwrap();
        assert_eq!(a.lock().pid(), 1);
        assert_eq!(b.lock().pid(), 2);

        // Reaping pid 1 makes it the smallest unused again.
        destroy_process(1);
        cleanup_zombies();
        let c = create_process("c", 0).unwrap();
        assert_eq!(c.lock().pid(), 1);
    }

    #[test]
    fn create_spawns_main_thread_with_stack() {
        setup_memory();
        let p = create_process("svc", 0).unwrap();
        let proc = p.lock();
        assert_eq!(proc.state(), ProcessState::Ready);
        assert_eq!(proc.thread_count(), 1);
        let main = proc.main_thread().unwrap();
        let t = main.lock();
        assert_ne!(t.stack_base(), 0);
        assert_eq!(t.stack_size(), KERNEL_STACK_SIZE);
        assert_ne!(t.registers.rsp, 0);
    }

    #[test]
    fn destroy_defers_reaping_to_cleanup() {
        setup_memory();
        let p = create_process("doomed", 0).unwrap();
        let pid = p.lock().pid();

        assert!(destroy_process(pid));
        // Still present, but a zombie with a termination timestamp.
        let still = get_process(pid).unwrap();
        assert!(still.lock().is_zombie());
        assert!(still.lock().termination_time() > 0);

        cleanup_zombies();
        assert!(get_process(pid).is_none());
        // Threads were freed, then the address space.
        assert_eq!(p.lock().thread_count(), 0);
        assert!(p.lock().address_space().is_none());
    }

    #[test]
    fn thread_limit_is_enforced() {
        setup_memory();
        let p = create_process("limited", 0).unwrap();
        p.lock().set_limits(ProcessLimits {
            threads_limit: 2,
            ..ProcessLimits::default()
        });

        assert!(spawn_thread(&p, 0x1000, 8192).is_some());
        assert!(spawn_thread(&p, 0x1000, 8192).is_none());
    }

    #[test]
    fn fd_table_respects_limit() {
        setup_memory();
        let p = create_process("files", 0).unwrap();
        let mut proc = p.lock();
        proc.set_limits(ProcessLimits {
            open_files: 2,
            ..ProcessLimits::default()
        });

        assert!(proc.add_open_file(0, FileHandle(10)));
        assert!(proc.add_open_file(1, FileHandle(11)));
        assert!(!proc.add_open_file(2, FileHandle(12)));
        assert_eq!(proc.get_open_file(1), Some(FileHandle(11)));
        assert!(proc.remove_open_file(0));
        assert!(proc.add_open_file(2, FileHandle(12)));
    }

    #[test]
    fn environment_roundtrip() {
        setup_memory();
        let p = create_process("env", 0).unwrap();
        let mut proc = p.lock();
        proc.set_environment("PATH", "/bin");
        assert_eq!(proc.get_environment("PATH"), Some("/bin"));
        assert_eq!(proc.get_environment("HOME"), None);
    }

    #[test]
    fn thread_back_reference_dies_with_process() {
        setup_memory();
        let p = create_process("parent", 0).unwrap();
        let pid = p.lock().pid();
        let thread = p.lock().main_thread().unwrap();
        assert!(thread.lock().process().is_some());

        destroy_process(pid);
        cleanup_zombies();
        drop(p);
        assert!(thread.lock().process().is_none());
    }
}
