//! Access arbitration: read/write/exclusive counts and their propagation
//! through stacked nodes.

use std::ops::{Add, AddAssign, Neg, Sub};
use std::sync::Arc;

use serde::Serialize;

use super::{ConsumerId, ProviderId, Topology};
use crate::error::GeomError;

/// A read/write/exclusive count triple.
///
/// Used both for held counts (never negative) and for the signed deltas passed
/// to [`Topology::access`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct Access {
    /// Read opens.
    pub read: i32,
    /// Write opens.
    pub write: i32,
    /// Exclusive opens.
    pub exclusive: i32,
}

impl Access {
    /// No access.
    pub const NONE: Access = Access::new(0, 0, 0);
    /// One read open.
    pub const READ: Access = Access::new(1, 0, 0);
    /// One read and one write open.
    pub const READ_WRITE: Access = Access::new(1, 1, 0);
    /// One read, write and exclusive open.
    pub const EXCLUSIVE: Access = Access::new(1, 1, 1);

    /// Builds a triple.
    pub const fn new(read: i32, write: i32, exclusive: i32) -> Self {
        Self {
            read,
            write,
            exclusive,
        }
    }

    /// True if all three counts are zero.
    pub const fn is_zero(self) -> bool {
        self.read == 0 && self.write == 0 && self.exclusive == 0
    }

    /// True if any count is below zero.
    pub const fn is_negative(self) -> bool {
        self.read < 0 || self.write < 0 || self.exclusive < 0
    }

    /// True if any component increases.
    pub const fn opens(self) -> bool {
        self.read > 0 || self.write > 0 || self.exclusive > 0
    }

    /// Component-wise sum, `None` if any count overflows.
    pub fn checked_add(self, rhs: Access) -> Option<Access> {
        Some(Access::new(
            self.read.checked_add(rhs.read)?,
            self.write.checked_add(rhs.write)?,
            self.exclusive.checked_add(rhs.exclusive)?,
        ))
    }

    /// Limits the negative components of a delta so that applying it to
    /// `held` cannot drop below zero.
    #[must_use]
    pub fn clamp_release(self, held: Access) -> Access {
        Access {
            read: self.read.max(-held.read),
            write: self.write.max(-held.write),
            exclusive: self.exclusive.max(-held.exclusive),
        }
    }

    /// True if a consumer holding `mine` can coexist with `others`.
    ///
    /// Exclusive access excludes every read or write held elsewhere, and the
    /// other way round.
    pub const fn compatible(mine: Access, others: Access) -> bool {
        let mine_rw = mine.read > 0 || mine.write > 0;
        let others_rw = others.read > 0 || others.write > 0;
        !((mine.exclusive > 0 && others_rw) || (mine_rw && others.exclusive > 0))
    }
}

impl Add for Access {
    type Output = Access;

    fn add(self, rhs: Access) -> Access {
        Access::new(
            self.read + rhs.read,
            self.write + rhs.write,
            self.exclusive + rhs.exclusive,
        )
    }
}

impl AddAssign for Access {
    fn add_assign(&mut self, rhs: Access) {
        *self = *self + rhs;
    }
}

impl Sub for Access {
    type Output = Access;

    fn sub(self, rhs: Access) -> Access {
        self + -rhs
    }
}

impl Neg for Access {
    type Output = Access;

    fn neg(self) -> Access {
        Access::new(-self.read, -self.write, -self.exclusive)
    }
}

impl core::fmt::Display for Access {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "r{}w{}e{}", self.read, self.write, self.exclusive)
    }
}

impl Topology {
    /// Changes a consumer's access counts by `delta`.
    ///
    /// Checks run before anything changes: resulting counts must not go
    /// negative, a failed provider refuses new opens, and exclusive access
    /// must not meet read or write access held by another consumer. Then the
    /// provider node's access callback runs and may veto (or cascade). Only
    /// when it agrees are the consumer counts committed and the provider
    /// aggregate recomputed.
    pub fn access(&mut self, cp: ConsumerId, delta: Access) -> Result<(), GeomError> {
        let consumer = self.consumer(cp)?;
        let Some(pp) = consumer.provider else {
            return Err(GeomError::NotAttached(cp));
        };
        let held = consumer.access;
        let Some(wanted) = held.checked_add(delta) else {
            return Err(GeomError::AccessOverflow(cp));
        };
        if wanted.is_negative() {
            return Err(GeomError::NegativeAccess(cp));
        }
        if delta.is_zero() {
            return Ok(());
        }

        let provider = self.provider(pp)?;
        if (provider.access - held).checked_add(wanted).is_none() {
            return Err(GeomError::AccessOverflow(cp));
        }
        if delta.opens() {
            if let Some(err) = provider.error() {
                return Err(GeomError::ProviderFailed(err));
            }
            if !Access::compatible(wanted, provider.access - held) {
                tracing::debug!(
                    target: "stratum::access",
                    consumer = %cp,
                    provider = %provider.name(),
                    %delta,
                    aggregate = %provider.access,
                    "exclusive conflict"
                );
                return Err(GeomError::ExclusiveConflict(pp));
            }
        }

        let ops = Arc::clone(self.node(provider.node())?.ops());
        ops.access(self, pp, delta)?;

        let consumer = self.consumer_mut(cp)?;
        consumer.access = wanted;
        consumer.handle().store_access(wanted);
        let node = consumer.node();
        self.refresh_provider_access(pp);
        tracing::trace!(target: "stratum::access", consumer = %cp, provider = %pp, %delta, held = %wanted, "access granted");

        if wanted.is_zero() && self.node(node).is_ok_and(|n| n.is_withering()) {
            self.wither_wash();
        }
        Ok(())
    }

    /// Standard access callback: applies the same delta to every attached
    /// consumer of the provider's node, undoing the ones already applied if
    /// any of them fails.
    pub fn std_access(&mut self, pp: ProviderId, delta: Access) -> Result<(), GeomError> {
        let node = self.provider(pp)?.node();
        let consumers: Vec<ConsumerId> = self.node(node)?.consumers().iter().copied().collect();
        let mut applied: Vec<(ConsumerId, Access)> = Vec::with_capacity(consumers.len());

        for cp in consumers {
            let Ok(consumer) = self.consumer(cp) else {
                continue;
            };
            if consumer.provider.is_none() {
                continue;
            }
            let step = delta.clamp_release(consumer.access);
            if step.is_zero() {
                continue;
            }
            if let Err(err) = self.access(cp, step) {
                for (done, step) in applied.into_iter().rev() {
                    if let Err(undo) = self.access(done, -step) {
                        tracing::warn!(target: "stratum::access", consumer = %done, %undo, "access rollback failed");
                    }
                }
                return Err(err);
            }
            applied.push((cp, step));
        }
        Ok(())
    }

    fn refresh_provider_access(&mut self, pp: ProviderId) {
        let Ok(provider) = self.provider(pp) else {
            return;
        };
        let total = provider
            .consumers
            .iter()
            .filter_map(|&cp| self.consumer(cp).ok())
            .fold(Access::NONE, |acc, c| acc + c.access);
        if let Ok(provider) = self.provider_mut(pp) {
            provider.access = total;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic() {
        let a = Access::new(2, 1, 0);
        assert_eq!(a + Access::READ, Access::new(3, 1, 0));
        assert_eq!(a - Access::READ_WRITE, Access::new(1, 0, 0));
        assert_eq!(-a, Access::new(-2, -1, 0));
        assert!((a - a).is_zero());
    }

    #[test]
    fn checked_add_catches_overflow() {
        let near = Access::new(i32::MAX, 0, 0);
        assert_eq!(near.checked_add(Access::new(-1, 1, 0)), Some(Access::new(i32::MAX - 1, 1, 0)));
        assert_eq!(near.checked_add(Access::READ), None);
        assert_eq!(Access::new(0, i32::MIN, 0).checked_add(Access::new(0, -1, 0)), None);
    }

    #[test]
    fn negative_detection() {
        assert!(!Access::NONE.is_negative());
        assert!(Access::new(0, -1, 0).is_negative());
    }

    #[test]
    fn clamp_release_limits_to_held() {
        let held = Access::new(1, 0, 0);
        assert_eq!(
            Access::new(-1, -1, -1).clamp_release(held),
            Access::new(-1, 0, 0)
        );
        assert_eq!(Access::new(1, 1, 0).clamp_release(held), Access::new(1, 1, 0));
    }

    #[test]
    fn exclusive_compatibility() {
        assert!(Access::compatible(Access::READ, Access::READ_WRITE));
        assert!(!Access::compatible(Access::EXCLUSIVE, Access::READ));
        assert!(!Access::compatible(Access::READ, Access::new(0, 0, 1)));
        assert!(Access::compatible(Access::EXCLUSIVE, Access::NONE));
    }

    #[test]
    fn display_is_compact() {
        assert_eq!(Access::new(1, 0, 1).to_string(), "r1w0e1");
    }
}
