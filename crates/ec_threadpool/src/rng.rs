use core::cell::Cell;
use core::hash::BuildHasher;
use core::sync::atomic::{AtomicUsize, Ordering};

use std::hash::RandomState;

// -----------------------------------------------------------------------------
// WorkerRng

const FIXED_STATE: [u64; 4] = [
    0x9a70_13f4_75bb_8c23,
    0x6b79_8b25_0c1a_42dd,
    0xd1c3_8f2a_9e04_77b1,
    0x85a3_08d3_1319_8a2e,
];

/// [xoshiro256+] is a fast pseudorandom number generator with 256 bits of
/// state, which tolerates weak seeding as long as the state is not all-zero.
///
/// [xoshiro256+]: https://prng.di.unimi.it/
pub(crate) struct WorkerRng {
    state: Cell<[u64; 4]>,
}

impl WorkerRng {
    /// Returns a `WorkerRng` with a fixed seed.
    ///
    /// Typically used to initialize in constant context; [`reseed`] is called
    /// when the worker binds to a pool.
    ///
    /// [`reseed`]: WorkerRng::reseed
    #[inline(always)]
    pub const fn fixed() -> Self {
        Self {
            state: Cell::new(FIXED_STATE),
        }
    }

    /// Reseeds from the worker id and a process-global entropy source.
    pub fn reseed(&self, id: usize) {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        // Any non-zero seed will do -- this hashes a global counter, then
        // expands the seed into the full state with splitmix64 as the
        // xoshiro authors recommend.
        let rs = RandomState::new();
        let mut seed = 0;
        while seed == 0 {
            seed = rs.hash_one(COUNTER.fetch_add(1, Ordering::Relaxed)) ^ id as u64;
        }

        let mut state = [0; 4];
        for word in &mut state {
            *word = splitmix64(&mut seed);
        }
        self.state.set(state);
    }

    pub fn next_u64(&self) -> u64 {
        let mut s = self.state.get();
        let result = s[0].wrapping_add(s[3]);

        let t = s[1] << 17;
        s[2] ^= s[0];
        s[3] ^= s[1];
        s[1] ^= s[2];
        s[0] ^= s[3];
        s[2] ^= t;
        s[3] = s[3].rotate_left(45);

        self.state.set(s);
        result
    }
}

fn splitmix64(x: &mut u64) -> u64 {
    *x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = *x;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

// -----------------------------------------------------------------------------
// VictimPermutation

/// A pseudo-random permutation of the victim ids `[0, num_threads)` minus the
/// caller's own id.
///
/// Implemented as a linear congruential walk `x <- (a*x + c) mod m` where `m`
/// is the next power of two at or above `num_threads`. With `c` odd and
/// `a ≡ 1 (mod 4)` the walk has full period `m` (Hull–Dobell), so every
/// victim is visited exactly once; values at or above `num_threads` and the
/// caller's own id are skipped on the fly. No allocation, one multiply per
/// candidate.
pub(crate) struct VictimPermutation {
    x: usize,
    a: usize,
    c: usize,
    mask: usize,
    remaining: usize,
    num_threads: usize,
    self_id: usize,
}

impl VictimPermutation {
    pub fn new(rng: &WorkerRng, num_threads: usize, self_id: usize) -> Self {
        debug_assert!(num_threads >= 1);
        let m = num_threads.next_power_of_two();
        let mask = m - 1;

        // `a ≡ 1 (mod 4)`, `c` odd: both drawn from the worker RNG.
        let a = (rng.next_u64() as usize & mask & !3) | 1;
        let c = (rng.next_u64() as usize & mask) | 1;
        let x = rng.next_u64() as usize & mask;

        Self {
            x,
            a,
            c,
            mask,
            remaining: m,
            num_threads,
            self_id,
        }
    }
}

impl Iterator for VictimPermutation {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.remaining > 0 {
            let victim = self.x;
            self.x = self.a.wrapping_mul(self.x).wrapping_add(self.c) & self.mask;
            self.remaining -= 1;
            if victim < self.num_threads && victim != self.self_id {
                return Some(victim);
            }
        }
        None
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::{VictimPermutation, WorkerRng};

    #[test]
    fn reseed_changes_state() {
        let rng = WorkerRng::fixed();
        let fixed_first = rng.next_u64();
        rng.reseed(0);
        // Astronomically unlikely to collide with the fixed stream.
        assert_ne!(rng.next_u64(), fixed_first);
    }

    #[test]
    fn permutation_visits_every_victim_once() {
        let rng = WorkerRng::fixed();
        rng.reseed(7);

        for num_threads in 1..=17 {
            for self_id in 0..num_threads {
                let mut seen = vec![0u32; num_threads];
                for victim in VictimPermutation::new(&rng, num_threads, self_id) {
                    seen[victim] += 1;
                }
                for (victim, &count) in seen.iter().enumerate() {
                    let expected = u32::from(victim != self_id);
                    assert_eq!(count, expected, "threads={num_threads} self={self_id}");
                }
            }
        }
    }

    #[test]
    fn permutations_differ_between_draws() {
        let rng = WorkerRng::fixed();
        rng.reseed(3);

        let order = |p: VictimPermutation| p.collect::<Vec<_>>();
        let mut distinct = false;
        for _ in 0..32 {
            let a = order(VictimPermutation::new(&rng, 16, 0));
            let b = order(VictimPermutation::new(&rng, 16, 0));
            if a != b {
                distinct = true;
                break;
            }
        }
        assert!(distinct, "victim order never varied");
    }
}
