//! Optimal prefetch/write scheduling across parallel disks.
//!
//! Given `L` blocks, each bound to one of `D` disks, and `m` concurrent I/O
//! slots, a discrete event simulation computes when every block would be
//! written if blocks were issued from the tail of the sequence as soon as a
//! slot frees up. Reversing the simulated write order yields the order in
//! which the same blocks should be prefetched.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use strata_common::{Bid, DiskId};

/// Result of simulating an asynchronous write of a block sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSimulation {
    /// Simulated completion time of each block, indexed like the input.
    pub write_times: Vec<u64>,
    /// Number of time steps until the last block was written.
    pub makespan: u64,
}

/// Simulates writing blocks bound to `disks` with `m` concurrent slots.
///
/// Each disk completes one block per time step. The last `m` blocks are
/// queued up front; whenever a block completes, the next block from the
/// tail is issued, either straight to its disk when that disk is idle in
/// the current step or behind the disk's queue.
pub fn simulate_async_write(disks: &[DiskId], m: usize) -> WriteSimulation {
    let len = disks.len();
    let mut write_times = vec![0u64; len];
    if len == 0 {
        return WriteSimulation {
            write_times,
            makespan: 0,
        };
    }

    let mut queues: HashMap<DiskId, VecDeque<usize>> = HashMap::new();
    let mut busy: HashSet<DiskId> = HashSet::new();
    let mut events: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::new();

    // Index of the next block to issue, counting down.
    let mut next = len;
    let mut slots = m.max(1);
    while slots > 0 && next > 0 {
        next -= 1;
        queues.entry(disks[next]).or_default().push_back(next);
        slots -= 1;
    }

    for queue in queues.values_mut() {
        if let Some(block) = queue.pop_front() {
            events.push(Reverse((1, block)));
        }
    }

    let mut now = 0u64;
    while let Some(Reverse((time, block))) = events.pop() {
        if time != now {
            busy.clear();
            now = time;
        }
        write_times[block] = time + 1;

        if next > 0 {
            next -= 1;
            let disk = disks[next];
            if busy.contains(&disk) {
                queues.entry(disk).or_default().push_back(next);
            } else {
                let queue = queues.entry(disk).or_default();
                match queue.front_mut() {
                    Some(front) => {
                        events.push(Reverse((time + 1, *front)));
                        *front = next;
                    }
                    None => events.push(Reverse((time + 1, next))),
                }
                busy.insert(disk);
            }
        }

        let disk = disks[block];
        if !busy.contains(&disk) {
            if let Some(waiting) = queues.get_mut(&disk).and_then(|q| q.pop_front()) {
                events.push(Reverse((time + 1, waiting)));
                busy.insert(disk);
            }
        }
    }

    WriteSimulation {
        write_times,
        makespan: now,
    }
}

/// Computes the prefetch order of blocks bound to `disks`.
///
/// Returns a permutation of `0..disks.len()`: the order in which to issue
/// reads given `m` read buffers over `num_disks` disks. When there are no
/// more blocks than disks every order is optimal and the identity is
/// returned. Blocks written later in the simulation are fetched earlier;
/// blocks with equal write time keep their input order.
pub fn compute_prefetch_schedule(disks: &[DiskId], num_disks: usize, m: usize) -> Vec<usize> {
    let len = disks.len();
    if len <= num_disks {
        return (0..len).collect();
    }

    let sim = simulate_async_write(disks, m);
    let (min, max) = sim
        .write_times
        .iter()
        .fold((u64::MAX, 0), |(lo, hi), &t| (lo.min(t), hi.max(t)));

    let mut order: Vec<(usize, u64)> = sim
        .write_times
        .iter()
        .enumerate()
        .map(|(i, &t)| (i, max + min - t))
        .collect();
    // Stable: ties keep input order.
    order.sort_by_key(|&(_, prefetch_time)| prefetch_time);
    order.into_iter().map(|(i, _)| i).collect()
}

/// [`compute_prefetch_schedule`] over BIDs, resolving disks through
/// `disk_of`.
pub fn compute_prefetch_schedule_for_bids<F>(
    bids: &[Bid],
    num_disks: usize,
    m: usize,
    disk_of: F,
) -> Vec<usize>
where
    F: Fn(&Bid) -> DiskId,
{
    let disks: Vec<DiskId> = bids.iter().map(disk_of).collect();
    compute_prefetch_schedule(&disks, num_disks, m)
}
