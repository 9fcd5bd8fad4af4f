//! Block allocation strategies.
//!
//! A strategy maps the running index of a newly allocated block to the disk
//! that will hold it. Callers keep the index; strategies that need
//! randomness own their generator.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use strata_common::{DiskId, Result, StrataError, StrategyKind};

/// Chooses a disk for the `index`-th block of an allocation sequence.
pub trait AllocationStrategy: Send {
    /// Disk of the `index`-th block.
    fn disk(&mut self, index: usize) -> DiskId;

    /// Short name for logging.
    fn name(&self) -> &'static str;
}

/// Consecutive blocks on consecutive disks.
#[derive(Debug, Clone)]
pub struct Striping {
    disks: usize,
}

impl Striping {
    pub fn new(disks: usize) -> Self {
        Self { disks }
    }
}

impl AllocationStrategy for Striping {
    fn disk(&mut self, index: usize) -> DiskId {
        (index % self.disks) as DiskId
    }

    fn name(&self) -> &'static str {
        "striping"
    }
}

/// Striping shifted by a random start disk chosen once.
#[derive(Debug, Clone)]
pub struct SimpleRandom {
    disks: usize,
    offset: usize,
}

impl SimpleRandom {
    pub fn new(disks: usize, rng: &mut impl Rng) -> Self {
        Self {
            disks,
            offset: rng.gen_range(0..disks),
        }
    }
}

impl AllocationStrategy for SimpleRandom {
    fn disk(&mut self, index: usize) -> DiskId {
        ((index + self.offset) % self.disks) as DiskId
    }

    fn name(&self) -> &'static str {
        "simple_random"
    }
}

/// Every block on an independently chosen random disk.
#[derive(Debug, Clone)]
pub struct FullyRandom {
    disks: usize,
    rng: StdRng,
}

impl FullyRandom {
    pub fn new(disks: usize, rng: StdRng) -> Self {
        Self { disks, rng }
    }
}

impl AllocationStrategy for FullyRandom {
    fn disk(&mut self, _index: usize) -> DiskId {
        self.rng.gen_range(0..self.disks) as DiskId
    }

    fn name(&self) -> &'static str {
        "fully_random"
    }
}

/// Striping over a random permutation of the disks.
#[derive(Debug, Clone)]
pub struct RandomCyclic {
    perm: Vec<DiskId>,
}

impl RandomCyclic {
    pub fn new(disks: usize, rng: &mut impl Rng) -> Self {
        let mut perm: Vec<DiskId> = (0..disks as DiskId).collect();
        perm.shuffle(rng);
        Self { perm }
    }
}

impl AllocationStrategy for RandomCyclic {
    fn disk(&mut self, index: usize) -> DiskId {
        self.perm[index % self.perm.len()]
    }

    fn name(&self) -> &'static str {
        "random_cyclic"
    }
}

/// Every block on the same disk.
#[derive(Debug, Clone)]
pub struct SingleDisk {
    disk: DiskId,
}

impl SingleDisk {
    pub fn new(disk: DiskId) -> Self {
        Self { disk }
    }
}

impl AllocationStrategy for SingleDisk {
    fn disk(&mut self, _index: usize) -> DiskId {
        self.disk
    }

    fn name(&self) -> &'static str {
        "single_disk"
    }
}

/// Builds the strategy selected by `kind` over `disks` disks, seeding the
/// random ones from entropy.
pub fn make_strategy(kind: StrategyKind, disks: usize) -> Result<Box<dyn AllocationStrategy>> {
    make_strategy_seeded(kind, disks, rand::random())
}

/// Like [`make_strategy`] with a fixed seed for reproducible placement.
pub fn make_strategy_seeded(
    kind: StrategyKind,
    disks: usize,
    seed: u64,
) -> Result<Box<dyn AllocationStrategy>> {
    if disks == 0 {
        return Err(StrataError::NoDisks);
    }
    let mut rng = StdRng::seed_from_u64(seed);
    Ok(match kind {
        StrategyKind::Striping => Box::new(Striping::new(disks)),
        StrategyKind::SimpleRandom => Box::new(SimpleRandom::new(disks, &mut rng)),
        StrategyKind::FullyRandom => Box::new(FullyRandom::new(disks, rng)),
        StrategyKind::RandomCyclic => Box::new(RandomCyclic::new(disks, &mut rng)),
        StrategyKind::SingleDisk(disk) => {
            if disk as usize >= disks {
                return Err(StrataError::invalid_parameter("single disk", disk));
            }
            Box::new(SingleDisk::new(disk))
        }
    })
}
