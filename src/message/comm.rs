use crate::Real;

/// Element-wise fold applied by the reduction collectives. The engine only
/// ever reduces short real-valued vectors: time-step minima, conservation
/// sums, and termination votes (max over 0/1 flags).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Min,
    Max,
    Sum,
}

impl ReduceOp {
    /// Fold `other` into `into`, element by element.
    pub fn fold(self, into: &mut [Real], other: &[Real]) {
        for (x, y) in into.iter_mut().zip(other) {
            *x = match self {
                ReduceOp::Min => x.min(*y),
                ReduceOp::Max => x.max(*y),
                ReduceOp::Sum => *x + *y,
            };
        }
    }
}

fn encode(value: &[Real]) -> Vec<u8> {
    rmp_serde::to_vec(value).expect("reduction payload encoding cannot fail")
}

fn decode(bytes: &[u8]) -> Vec<Real> {
    rmp_serde::from_read_ref(bytes).expect("peer sent a malformed reduction payload")
}

/// Interface for a group of processes that can exchange messages over a
/// network. The underlying transport can in principle be TCP, UDP, or a
/// higher level abstraction like MPI; implementors only write `send` and
/// `recv`, and the trait supplies the reductions the engine brackets its
/// phases with (ghost exchange, flux fix-up, restriction) and folds its
/// scalars through (time steps, conservation sums, termination votes).
///
pub trait Communicator {
    /// Must be implemented to return the rank of this process within the
    /// communicator.
    fn rank(&self) -> usize;

    /// Must be implemented to return the number of peer processes in this
    /// communicator.
    fn size(&self) -> usize;

    /// Must be implemented to send a message to a peer. This method must
    /// return immediately, in other words it is not allowed to block until a
    /// matching receive is posted.
    fn send(&self, rank: usize, message: Vec<u8>);

    /// Must be implemented to receive a message from any of the peers. This
    /// method is allowed to block until a message is ready to be received.
    fn recv(&self) -> Vec<u8>;

    /// Block until every rank has entered the barrier: an all-reduce of an
    /// empty payload.
    fn barrier(&self) {
        self.all_reduce(ReduceOp::Sum, Vec::new());
    }

    /// Symmetric fold of a real-valued payload across all ranks, by
    /// recursive doubling: every rank pairs with the partner whose rank
    /// differs in one bit and exchanges its running fold, so all ranks hold
    /// the result after `log2` rounds. When the size is not a power of two,
    /// the tail ranks hand their payload to a partner in the leading block
    /// first and receive the finished result afterwards.
    ///
    fn all_reduce(&self, op: ReduceOp, mut value: Vec<Real>) -> Vec<Real> {
        let r = self.rank();
        let p = self.size();
        if p == 1 {
            return value;
        }

        let mut block = 1;
        while 2 * block <= p {
            block *= 2;
        }

        if r >= block {
            // tail rank: contribute, then wait for the result
            self.send(r - block, encode(&value));
            return decode(&self.recv());
        }
        if r + block < p {
            op.fold(&mut value, &decode(&self.recv()));
        }

        let mut stride = 1;
        while stride < block {
            self.send(r ^ stride, encode(&value));
            op.fold(&mut value, &decode(&self.recv()));
            stride *= 2;
        }

        if r + block < p {
            self.send(r + block, encode(&value));
        }
        value
    }
}
