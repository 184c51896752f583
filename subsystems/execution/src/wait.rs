//! # Wait Channels
//!
//! Blocking and waking against opaque channel addresses. Channels live
//! in a sharded hash table (64 shards, keyed by the channel address) so
//! unrelated wakeups do not contend on one lock. Timed sleeps
//! additionally register in a sleeper list the tick handler sweeps;
//! `kill` and explicit unblock deliver a cancellation result instead of
//! the normal wake.
//!
//! Wakers apply a small transient priority boost so freshly unblocked
//! threads get back on a CPU promptly.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use orion_hal::sync::TicketLock;

use crate::registry;
use crate::sched;
use crate::thread::{Thread, ThreadId, ThreadState, WAIT_CANCELLED, WAIT_OK};

// =============================================================================
// Constants
// =============================================================================

/// Number of channel shards.
const WAIT_SHARDS: usize = 64;

/// Boost applied by wake paths.
const WAKE_BOOST: i8 = 2;

/// Ticks until the wake boost decays.
const WAKE_BOOST_TICKS: u8 = 8;

/// Channel used by timed sleeps with no explicit channel.
static SLEEP_CHANNEL_CELL: u8 = 0;

/// Address of the dedicated timer-sleep channel.
pub fn sleep_channel() -> usize {
    &SLEEP_CHANNEL_CELL as *const u8 as usize
}

// =============================================================================
// Tables
// =============================================================================

struct Shard {
    channels: HashMap<usize, VecDeque<ThreadId>>,
}

static SHARDS: spin::Lazy<[TicketLock<Shard>; WAIT_SHARDS]> = spin::Lazy::new(|| {
    core::array::from_fn(|_| {
        TicketLock::new(Shard {
            channels: HashMap::new(),
        })
    })
});

/// Timed sleepers: (thread, absolute deadline ns).
static SLEEPERS: spin::Lazy<TicketLock<Vec<(ThreadId, u64)>>> =
    spin::Lazy::new(|| TicketLock::new(Vec::new()));

#[inline]
fn shard_for(channel: usize) -> &'static TicketLock<Shard> {
    // Low bits are alignment noise for typical channel objects.
    &SHARDS[(channel >> 4) % WAIT_SHARDS]
}

// =============================================================================
// Blocking
// =============================================================================

/// Park a thread on a channel. The thread transitions to Blocked and is
/// appended to the channel's FIFO; with a deadline it also joins the
/// sleeper list.
///
/// The caller (running as `thread`) must follow up with `schedule()`;
/// [`block_current`] bundles the sequence.
pub fn park(thread: &Arc<Thread>, channel: usize, deadline_ns: Option<u64>) {
    thread.set_wait_channel(channel);
    thread.set_wait_result(WAIT_OK);
    thread.set_state(ThreadState::Blocked);

    shard_for(channel)
        .lock()
        .channels
        .entry(channel)
        .or_default()
        .push_back(thread.id);

    if let Some(deadline) = deadline_ns {
        thread.set_wake_time(deadline);
        SLEEPERS.lock().push((thread.id, deadline));
    }
}

/// Block the calling thread on a channel and schedule away; returns the
/// wait result delivered by the waker.
pub fn block_current(channel: usize, deadline_ns: Option<u64>) -> i32 {
    let Some(current) = sched::current_thread() else {
        return WAIT_CANCELLED;
    };

    // Preemption is held across the state transition so the tick
    // handler cannot dispatch away a half-parked thread; schedule()
    // itself always honors a Blocked current.
    sched::preempt_disable();
    park(&current, channel, deadline_ns);
    sched::preempt_enable();

    sched::schedule();
    current.wait_result()
}

// =============================================================================
// Waking
// =============================================================================

fn unpark(thread: &Arc<Thread>, result: i32) {
    thread.set_wait_channel(0);
    thread.set_wait_result(result);
    thread.apply_boost(WAKE_BOOST, WAKE_BOOST_TICKS);
    thread.set_state(ThreadState::Ready);
    sched::enqueue_thread(Arc::clone(thread));
}

fn take_from_channel(channel: usize, all: bool) -> Vec<ThreadId> {
    let mut shard = shard_for(channel).lock();
    let Some(queue) = shard.channels.get_mut(&channel) else {
        return Vec::new();
    };
    let taken: Vec<ThreadId> = if all {
        queue.drain(..).collect()
    } else {
        queue.pop_front().into_iter().collect()
    };
    if queue.is_empty() {
        shard.channels.remove(&channel);
    }
    taken
}

fn wake_ids(ids: Vec<ThreadId>, result: i32) -> usize {
    let mut woken = 0;
    for tid in ids {
        let Some(thread) = registry::lookup_thread(tid) else {
            continue;
        };
        if thread.state() != ThreadState::Blocked {
            continue;
        }
        cancel_timed_wait(&thread);
        unpark(&thread, result);
        woken += 1;
    }
    woken
}

/// Wake every thread parked on a channel; returns how many ran.
pub fn wake_all(channel: usize) -> usize {
    wake_ids(take_from_channel(channel, true), WAIT_OK)
}

/// Wake the longest-waiting thread on a channel.
pub fn wake_one(channel: usize) -> bool {
    wake_ids(take_from_channel(channel, false), WAIT_OK) == 1
}

/// Cancel a specific thread's wait (kill or explicit unblock): it is
/// pulled off its channel and sleeper entry and wakes with the
/// cancellation result.
pub fn cancel_wait(thread: &Arc<Thread>) -> bool {
    if thread.state() != ThreadState::Blocked {
        return false;
    }

    let channel = thread.wait_channel();
    if channel != 0 {
        let mut shard = shard_for(channel).lock();
        if let Some(queue) = shard.channels.get_mut(&channel) {
            queue.retain(|&tid| tid != thread.id);
            if queue.is_empty() {
                shard.channels.remove(&channel);
            }
        }
    }
    cancel_timed_wait(thread);
    unpark(thread, WAIT_CANCELLED);
    true
}

/// Drop a thread's sleeper entry, if any.
pub fn cancel_timed_wait(thread: &Arc<Thread>) {
    SLEEPERS.lock().retain(|&(tid, _)| tid != thread.id);
}

/// Wake sleepers whose deadline has passed. Called from the tick path
/// with the run-queue clock.
pub fn sweep_sleepers(now_ns: u64) {
    let due: Vec<ThreadId> = {
        let mut sleepers = SLEEPERS.lock();
        let mut due = Vec::new();
        sleepers.retain(|&(tid, deadline)| {
            if deadline <= now_ns {
                due.push(tid);
                false
            } else {
                true
            }
        });
        due
    };

    for tid in due {
        let Some(thread) = registry::lookup_thread(tid) else {
            continue;
        };
        if thread.state() != ThreadState::Blocked {
            continue;
        }
        // Pull it off its channel as well.
        let channel = thread.wait_channel();
        if channel != 0 {
            let mut shard = shard_for(channel).lock();
            if let Some(queue) = shard.channels.get_mut(&channel) {
                queue.retain(|&t| t != tid);
                if queue.is_empty() {
                    shard.channels.remove(&channel);
                }
            }
        }
        unpark(&thread, WAIT_OK);
    }
}

/// Number of threads currently parked on a channel.
pub fn waiter_count(channel: usize) -> usize {
    shard_for(channel)
        .lock()
        .channels
        .get(&channel)
        .map(|q| q.len())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{init_cpu, runqueue};
    use crate::test_guard;
    use crate::thread::{ProcessId, SchedClass, ThreadFlags};

    fn blocked_thread(id: u32) -> Arc<Thread> {
        let t = Arc::new(Thread::new(
            ThreadId(20_000 + id),
            ProcessId(2),
            "wait-test",
            ThreadFlags::empty(),
            None,
            0,
        ));
        t.set_priority(SchedClass::Regular, 16);
        registry::insert_thread(Arc::clone(&t));
        t
    }

    fn ensure_cpu0() {
        let _ = init_cpu(0, 0);
        orion_hal::arch::x86_64::smp::set_cpu_online(0, true);
    }

    fn drain_cpu0() {
        if let Some(rq) = runqueue(0) {
            let mut inner = rq.lock();
            while inner.take_next().is_some() {}
        }
    }

    #[test]
    fn test_park_and_wake_all() {
        let _guard = test_guard();
        ensure_cpu0();
        drain_cpu0();

        let channel = 0x1000_usize;
        let a = blocked_thread(1);
        let b = blocked_thread(2);
        park(&a, channel, None);
        park(&b, channel, None);
        assert_eq!(a.state(), ThreadState::Blocked);
        assert_eq!(waiter_count(channel), 2);

        assert_eq!(wake_all(channel), 2);
        assert_eq!(waiter_count(channel), 0);
        assert_eq!(a.state(), ThreadState::Ready);
        assert_eq!(a.wait_result(), WAIT_OK);
        // Wake boost is transient but visible immediately.
        assert!(a.dynamic_priority() > 32 + 16);

        registry::remove_thread(a.id);
        registry::remove_thread(b.id);
        drain_cpu0();
    }

    #[test]
    fn test_wake_one_is_fifo() {
        let _guard = test_guard();
        ensure_cpu0();
        drain_cpu0();

        let channel = 0x2000_usize;
        let first = blocked_thread(3);
        let second = blocked_thread(4);
        park(&first, channel, None);
        park(&second, channel, None);

        assert!(wake_one(channel));
        assert_eq!(first.state(), ThreadState::Ready);
        assert_eq!(second.state(), ThreadState::Blocked);

        assert!(wake_one(channel));
        assert!(!wake_one(channel));

        registry::remove_thread(first.id);
        registry::remove_thread(second.id);
        drain_cpu0();
    }

    #[test]
    fn test_cancel_delivers_cancellation_result() {
        let _guard = test_guard();
        ensure_cpu0();
        drain_cpu0();

        let channel = 0x3000_usize;
        let t = blocked_thread(5);
        park(&t, channel, Some(5 * 1_000_000));

        assert!(cancel_wait(&t));
        assert_eq!(t.state(), ThreadState::Ready);
        assert_eq!(t.wait_result(), WAIT_CANCELLED);
        assert_eq!(waiter_count(channel), 0);
        // Sleeper entry is gone: a sweep past the deadline wakes no one
        // twice.
        sweep_sleepers(u64::MAX);
        assert_eq!(t.state(), ThreadState::Ready);

        registry::remove_thread(t.id);
        drain_cpu0();
    }

    #[test]
    fn test_sleeper_sweep_wakes_due_only() {
        let _guard = test_guard();
        ensure_cpu0();
        drain_cpu0();

        let early = blocked_thread(6);
        let late = blocked_thread(7);
        park(&early, sleep_channel(), Some(1_000));
        park(&late, sleep_channel(), Some(1_000_000_000));

        sweep_sleepers(2_000);
        assert_eq!(early.state(), ThreadState::Ready);
        assert_eq!(late.state(), ThreadState::Blocked);

        sweep_sleepers(2_000_000_000);
        assert_eq!(late.state(), ThreadState::Ready);

        registry::remove_thread(early.id);
        registry::remove_thread(late.id);
        drain_cpu0();
    }
}
