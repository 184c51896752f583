//! # Thread & Process Registry
//!
//! Id allocation and the non-owning back-reference tables: threads are
//! owned by `Arc`s held here (and borrowed by run queues and wait
//! channels while queued); processes are lightweight groupings carrying
//! the per-process critical-section count and thread list used by the
//! scoped priority operations.

use alloc::sync::Arc;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU32, Ordering};

use hashbrown::HashMap;
use orion_hal::sync::TicketLock;

use crate::thread::{ProcessId, Thread, ThreadId};

// =============================================================================
// Process Record
// =============================================================================

/// A process as the scheduler sees it: an id, its threads, and the
/// critical-section depth.
#[derive(Debug)]
pub struct Process {
    /// Process id.
    pub id: ProcessId,
    critsec_count: AtomicU32,
    threads: TicketLock<Vec<ThreadId>>,
}

impl Process {
    fn new(id: ProcessId) -> Self {
        Self {
            id,
            critsec_count: AtomicU32::new(0),
            threads: TicketLock::new(Vec::new()),
        }
    }

    /// Current critical-section depth.
    pub fn critsec_depth(&self) -> u32 {
        self.critsec_count.load(Ordering::Acquire)
    }

    /// Raise the critical-section depth; returns the new depth.
    pub fn critsec_enter(&self) -> u32 {
        self.critsec_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Lower the critical-section depth; `None` on underflow (the
    /// count is left untouched).
    pub fn critsec_exit(&self) -> Option<u32> {
        let mut current = self.critsec_count.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match self.critsec_count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current - 1),
                Err(observed) => current = observed,
            }
        }
    }

    /// Snapshot of the process's thread ids.
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.threads.lock().clone()
    }

    fn attach(&self, tid: ThreadId) {
        self.threads.lock().push(tid);
    }

    fn detach(&self, tid: ThreadId) {
        let mut threads = self.threads.lock();
        if let Some(pos) = threads.iter().position(|&t| t == tid) {
            threads.swap_remove(pos);
        }
    }
}

// =============================================================================
// Tables
// =============================================================================

static NEXT_TID: AtomicU32 = AtomicU32::new(1);

static THREADS: spin::Lazy<TicketLock<HashMap<u32, Arc<Thread>>>> =
    spin::Lazy::new(|| TicketLock::new(HashMap::new()));

static PROCESSES: spin::Lazy<TicketLock<HashMap<u32, Arc<Process>>>> =
    spin::Lazy::new(|| TicketLock::new(HashMap::new()));

static THREAD_COUNT: AtomicU32 = AtomicU32::new(0);

/// Allocate a fresh thread id.
pub fn allocate_tid() -> ThreadId {
    ThreadId(NEXT_TID.fetch_add(1, Ordering::Relaxed))
}

/// Publish a thread and attach it to its process (when registered).
pub fn insert_thread(thread: Arc<Thread>) {
    if let Some(process) = lookup_process(thread.process) {
        process.attach(thread.id);
    }
    THREADS.lock().insert(thread.id.0, thread);
    THREAD_COUNT.fetch_add(1, Ordering::SeqCst);
}

/// Find a thread by id.
pub fn lookup_thread(tid: ThreadId) -> Option<Arc<Thread>> {
    THREADS.lock().get(&tid.0).cloned()
}

/// Remove a thread (reaping); detaches it from its process.
pub fn remove_thread(tid: ThreadId) -> Option<Arc<Thread>> {
    let thread = THREADS.lock().remove(&tid.0)?;
    if let Some(process) = lookup_process(thread.process) {
        process.detach(tid);
    }
    THREAD_COUNT.fetch_sub(1, Ordering::SeqCst);
    Some(thread)
}

/// System-wide thread count.
pub fn thread_count() -> u32 {
    THREAD_COUNT.load(Ordering::Relaxed)
}

/// Register (or fetch) a process record.
pub fn register_process(pid: ProcessId) -> Arc<Process> {
    let mut processes = PROCESSES.lock();
    if let Some(process) = processes.get(&pid.0) {
        return Arc::clone(process);
    }
    let process = Arc::new(Process::new(pid));
    processes.insert(pid.0, Arc::clone(&process));
    process
}

/// Find a process by id.
pub fn lookup_process(pid: ProcessId) -> Option<Arc<Process>> {
    PROCESSES.lock().get(&pid.0).cloned()
}

/// Threads of a process, resolved to records.
pub fn process_threads(pid: ProcessId) -> Vec<Arc<Thread>> {
    let Some(process) = lookup_process(pid) else {
        return Vec::new();
    };
    process
        .thread_ids()
        .into_iter()
        .filter_map(lookup_thread)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadFlags;

    fn make_thread(pid: ProcessId) -> Arc<Thread> {
        Arc::new(Thread::new(
            allocate_tid(),
            pid,
            "reg-test",
            ThreadFlags::empty(),
            None,
            0,
        ))
    }

    #[test]
    fn test_thread_insert_lookup_remove() {
        let t = make_thread(ProcessId(900));
        let tid = t.id;
        insert_thread(Arc::clone(&t));
        assert!(lookup_thread(tid).is_some());
        assert!(remove_thread(tid).is_some());
        assert!(lookup_thread(tid).is_none());
    }

    #[test]
    fn test_process_thread_list() {
        let pid = ProcessId(901);
        register_process(pid);
        let a = make_thread(pid);
        let b = make_thread(pid);
        insert_thread(Arc::clone(&a));
        insert_thread(Arc::clone(&b));

        let threads = process_threads(pid);
        assert_eq!(threads.len(), 2);

        remove_thread(a.id);
        assert_eq!(process_threads(pid).len(), 1);
        remove_thread(b.id);
    }

    #[test]
    fn test_critsec_depth() {
        let process = register_process(ProcessId(902));
        assert_eq!(process.critsec_depth(), 0);
        assert_eq!(process.critsec_enter(), 1);
        assert_eq!(process.critsec_enter(), 2);
        assert_eq!(process.critsec_exit(), Some(1));
        assert_eq!(process.critsec_exit(), Some(0));
        // Underflow leaves the count untouched.
        assert_eq!(process.critsec_exit(), None);
        assert_eq!(process.critsec_depth(), 0);
    }

    #[test]
    fn test_register_process_idempotent() {
        let first = register_process(ProcessId(903));
        let second = register_process(ProcessId(903));
        assert!(Arc::ptr_eq(&first, &second));
    }
}
