// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Boundaries between the governor and the outside world.
//!
//! A domain talks to its frequency actuator through exactly one of two
//! conventions, fixed when the domain is initialized:
//!
//! - [`NonBlockingActuator`] is called inline from the report path and must
//!   never sleep.
//! - [`BlockingActuator`] may sleep. Only the domain's worker thread holds
//!   it, so it cannot be reached from the report path.

use std::sync::Arc;

use crate::types::DomainId;
use crate::types::Freq;
use crate::types::TimeNs;
use crate::types::UpdateFlags;

/// Maps an arbitrary frequency to one the hardware supports.
pub trait FreqResolver: Send + Sync {
    fn resolve_freq(&self, dom: DomainId, freq: Freq) -> Freq;
}

/// Frequency switch that completes without blocking. Returns the frequency
/// actually applied, or `None` when the request hit an invalid entry.
pub trait NonBlockingActuator: FreqResolver {
    fn fast_switch(&self, dom: DomainId, freq: Freq) -> Option<Freq>;
}

/// Frequency switch that may block. Returns the frequency actually applied,
/// or `None` when the request could not be serviced.
pub trait BlockingActuator: FreqResolver {
    fn set_target(&self, dom: DomainId, freq: Freq) -> Option<Freq>;
}

/// Entry point for the load source. Must be callable concurrently from any
/// thread and never blocks.
pub trait NonBlockingReporter: Send + Sync {
    fn report(&self, cpu: usize, util: u64, max: u64, flags: UpdateFlags, now: TimeNs);
}

/// Actuation convention of one domain.
pub enum Actuator {
    Inline(Arc<dyn NonBlockingActuator>),
    Deferred {
        resolver: Arc<dyn FreqResolver>,
        blocking: Arc<dyn BlockingActuator>,
    },
}

impl Actuator {
    pub fn inline<T: NonBlockingActuator + 'static>(act: Arc<T>) -> Actuator {
        Actuator::Inline(act)
    }

    /// The report path keeps only the resolver half. The blocking half is
    /// handed to the worker thread.
    pub fn deferred<T: BlockingActuator + 'static>(act: Arc<T>) -> Actuator {
        let resolver: Arc<dyn FreqResolver> = act.clone();
        Actuator::Deferred {
            resolver,
            blocking: act,
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self, Actuator::Inline(_))
    }
}
