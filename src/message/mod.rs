//! This module exports a minimal message-passing API, which is encapsulated
//! by a `Communicator` trait. Implementors only need to write `send` and
//! `recv` operations for a given transport layer; the trait then provides
//! the barrier and the typed all-reduce the engine's phase discipline rides
//! on. A single-process implementation is included; distributed transports
//! plug in from outside the crate.

pub mod comm;
pub mod util;

pub use comm::{Communicator, ReduceOp};

use crate::Real;

/// Single-process communicator. The collectives in the `Communicator`
/// trait short-circuit when `size() == 1`, so `send` and `recv` are
/// unreachable here.
pub struct Serial;

impl Communicator for Serial {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, _rank: usize, _message: Vec<u8>) {
        unreachable!("a serial communicator has no peers to send to")
    }

    fn recv(&self) -> Vec<u8> {
        unreachable!("a serial communicator has no peers to receive from")
    }
}

/// Fold the element-wise minimum of a small vector of reals across all
/// ranks. Used for the global time-step constraint.
pub fn all_reduce_min(comm: &dyn Communicator, value: &[Real]) -> Vec<Real> {
    comm.all_reduce(ReduceOp::Min, value.to_vec())
}

/// Fold the element-wise sum of a small vector of reals across all ranks.
/// Used for conservation sums and patch counts.
pub fn all_reduce_sum(comm: &dyn Communicator, value: &[Real]) -> Vec<Real> {
    comm.all_reduce(ReduceOp::Sum, value.to_vec())
}

/// Logical-or vote across ranks, used for the termination sentinel.
pub fn all_reduce_any(comm: &dyn Communicator, value: bool) -> bool {
    let vote = vec![if value { 1.0 } else { 0.0 }];
    comm.all_reduce(ReduceOp::Max, vote)[0] > 0.0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serial_collectives_are_identities() {
        let comm = Serial;
        assert_eq!(all_reduce_min(&comm, &[3.0, 1.0]), vec![3.0, 1.0]);
        assert_eq!(all_reduce_sum(&comm, &[2.0]), vec![2.0]);
        assert!(!all_reduce_any(&comm, false));
        assert!(all_reduce_any(&comm, true));
        comm.barrier();
    }

    #[test]
    fn reduce_ops_fold_element_wise() {
        let mut a = vec![1.0, 5.0, -2.0];
        ReduceOp::Min.fold(&mut a, &[0.5, 7.0, -1.0]);
        assert_eq!(a, vec![0.5, 5.0, -2.0]);

        let mut a = vec![1.0, 2.0];
        ReduceOp::Sum.fold(&mut a, &[3.0, 4.0]);
        assert_eq!(a, vec![4.0, 6.0]);

        let mut a = vec![1.0];
        ReduceOp::Max.fold(&mut a, &[-3.0]);
        assert_eq!(a, vec![1.0]);
    }
}
