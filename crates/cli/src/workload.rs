//! Demo workload: count the primes in fixed-size blocks of integers.

use fanout_scheduler::{ProcessError, WorkProcessor, WorkReceiver, WorkUnitIndex};
use fanout_transport::PeerId;

/// Integers per work unit.
pub const BLOCK: u64 = 10_000;

/// Computes unit `n` as the number of primes in `[n * BLOCK, (n + 1) * BLOCK)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrimeBlocks;

impl WorkProcessor for PrimeBlocks {
    fn process(
        &self,
        _thread: usize,
        unit: WorkUnitIndex,
        output: &mut Vec<u8>,
    ) -> Result<(), ProcessError> {
        let start = unit * BLOCK;
        let count = (start..start + BLOCK).filter(|&n| is_prime(n)).count() as u64;
        output.extend(rmp_serde::to_vec(&count)?);
        Ok(())
    }
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// Coordinator-side merge: sums the per-block counts.
#[derive(Debug, Default)]
pub struct PrimeTotal {
    pub primes: u64,
    pub malformed: u64,
}

impl WorkReceiver for PrimeTotal {
    fn receive(&mut self, unit: WorkUnitIndex, payload: &[u8], from: PeerId) {
        match rmp_serde::from_slice::<u64>(payload) {
            Ok(count) => self.primes += count,
            Err(e) => {
                tracing::warn!(unit, peer = %from, error = %e, "malformed result payload");
                self.malformed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_block_has_1229_primes() {
        let mut out = Vec::new();
        PrimeBlocks.process(0, 0, &mut out).unwrap();
        let mut total = PrimeTotal::default();
        total.receive(0, &out, PeerId::COORDINATOR);
        assert_eq!(total.primes, 1229);
    }

    #[test]
    fn small_numbers() {
        let primes: Vec<u64> = (0..20).filter(|&n| is_prime(n)).collect();
        assert_eq!(primes, vec![2, 3, 5, 7, 11, 13, 17, 19]);
    }

    #[test]
    fn garbage_payload_is_counted_not_summed() {
        let mut total = PrimeTotal::default();
        total.receive(3, &[0xc1], PeerId(2));
        assert_eq!(total.primes, 0);
        assert_eq!(total.malformed, 1);
    }
}
