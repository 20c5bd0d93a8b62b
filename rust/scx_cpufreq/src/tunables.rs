// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Tunables
//!
//! The configuration record shared by one or more domains. A [`Tunables`] is
//! a cheap handle: cloning it adds a reference, and the record is freed when
//! the last handle is dropped.
//!
//! All three values and a generation counter sit under one reader/writer
//! spin lock. Every setter bumps the generation, so a domain can tell that
//! its rate limiter is out of date and reload a consistent snapshot.

use std::sync::Arc;

use log::debug;
use serde::Deserialize;
use serde::Serialize;

use crate::error::GovError;
use crate::error::GovResult;

pub const MAX_BOOST_PERCENT: u32 = 20;
pub const DEFAULT_BOOST_PERCENT: u32 = 5;
/// Rate limits default to this multiple of the transition latency.
pub const LATENCY_MULTIPLIER: u32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunableValues {
    pub up_rate_limit_us: u32,
    pub down_rate_limit_us: u32,
    pub boost_percent: u32,
}

impl Default for TunableValues {
    fn default() -> Self {
        Self::for_latency_ns(0)
    }
}

impl TunableValues {
    /// Defaults for a domain whose hardware needs `transition_latency_ns` to
    /// switch frequency.
    pub fn for_latency_ns(transition_latency_ns: u64) -> Self {
        let lat_us = (transition_latency_ns / 1000).min(u32::MAX as u64) as u32;
        let rate_limit_us = if lat_us > 0 {
            LATENCY_MULTIPLIER.saturating_mul(lat_us)
        } else {
            LATENCY_MULTIPLIER
        };
        TunableValues {
            up_rate_limit_us: rate_limit_us,
            down_rate_limit_us: rate_limit_us,
            boost_percent: DEFAULT_BOOST_PERCENT,
        }
    }

    pub fn validate(&self) -> GovResult<()> {
        if self.boost_percent > MAX_BOOST_PERCENT {
            return Err(GovError::InvalidTunable {
                name: "boost_percent",
                value: self.boost_percent,
                max: MAX_BOOST_PERCENT,
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Inner {
    state: spin::RwLock<(TunableValues, u64)>,
}

/// Shared, reference-counted tunables handle.
#[derive(Debug, Clone)]
pub struct Tunables {
    inner: Arc<Inner>,
}

impl Tunables {
    pub fn new(values: TunableValues) -> GovResult<Tunables> {
        values.validate()?;
        Ok(Tunables {
            inner: Arc::new(Inner {
                state: spin::RwLock::new((values, 0)),
            }),
        })
    }

    pub fn values(&self) -> TunableValues {
        self.inner.state.read().0
    }

    /// Values together with the generation they belong to.
    pub fn snapshot(&self) -> (TunableValues, u64) {
        *self.inner.state.read()
    }

    pub fn generation(&self) -> u64 {
        self.inner.state.read().1
    }

    /// Replace all three values at once.
    pub fn update(&self, values: TunableValues) -> GovResult<()> {
        values.validate()?;
        let mut state = self.inner.state.write();
        state.0 = values;
        state.1 += 1;
        debug!("tunables updated: {:?}", values);
        Ok(())
    }

    fn modify(&self, f: impl FnOnce(&mut TunableValues)) -> GovResult<()> {
        let mut state = self.inner.state.write();
        let mut values = state.0;
        f(&mut values);
        values.validate()?;
        state.0 = values;
        state.1 += 1;
        Ok(())
    }

    pub fn up_rate_limit_us(&self) -> u32 {
        self.values().up_rate_limit_us
    }

    pub fn set_up_rate_limit_us(&self, us: u32) -> GovResult<()> {
        self.modify(|v| v.up_rate_limit_us = us)
    }

    pub fn down_rate_limit_us(&self) -> u32 {
        self.values().down_rate_limit_us
    }

    pub fn set_down_rate_limit_us(&self, us: u32) -> GovResult<()> {
        self.modify(|v| v.down_rate_limit_us = us)
    }

    pub fn boost_percent(&self) -> u32 {
        self.values().boost_percent
    }

    /// Rejects values above [`MAX_BOOST_PERCENT`], keeping the old one.
    pub fn set_boost_percent(&self, pct: u32) -> GovResult<()> {
        self.modify(|v| v.boost_percent = pct)
    }

    /// Number of live handles, the governor's own bookkeeping included.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn ptr_eq(&self, other: &Tunables) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakTunables {
        WeakTunables(Arc::downgrade(&self.inner))
    }
}

/// Non-owning reference, used for the global instance slot.
#[derive(Debug, Clone, Default)]
pub(crate) struct WeakTunables(std::sync::Weak<Inner>);

impl WeakTunables {
    pub(crate) fn upgrade(&self) -> Option<Tunables> {
        self.0.upgrade().map(|inner| Tunables { inner })
    }
}
