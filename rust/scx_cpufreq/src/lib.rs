// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Utilization-driven CPU frequency governor
//!
//! This crate holds the control loop that turns per-CPU utilization reports
//! into frequency requests for policy domains, groups of CPUs that share one
//! frequency.
//!
//! The load source reports samples through [`NonBlockingReporter`]. Each
//! report updates the CPU's sample and may trigger an evaluation of its
//! domain, which goes through a two-stage rate limiter, picks a frequency
//! from the capacity tables and hands it to the domain's actuator.
//!
//! Actuators come in two flavors. A [`NonBlockingActuator`] is called inline
//! from the report path. A [`BlockingActuator`] is only ever called from a
//! dedicated worker thread owned by the domain.
//!
//! Domains are managed through [`Governor`], which also owns the shared
//! [`Tunables`] and the display-state override.

mod actuator;
pub use actuator::Actuator;
pub use actuator::BlockingActuator;
pub use actuator::FreqResolver;
pub use actuator::NonBlockingActuator;
pub use actuator::NonBlockingReporter;

pub mod capacity;
pub use capacity::CapacityModel;
pub use capacity::CapacityTable;
pub use capacity::CpuClass;

mod cpumask;
pub use cpumask::read_cpulist;
pub use cpumask::Cpumask;

mod domain;
pub use domain::DomainStats;

mod error;
pub use error::GovError;
pub use error::GovResult;

mod governor;
pub use governor::DomainSpec;
pub use governor::Governor;
pub use governor::GovernorConfig;

pub mod ratelimit;
pub use ratelimit::RateLimiter;
pub use ratelimit::RateMode;

mod sample;
pub use sample::CpuSample;

mod tunables;
pub use tunables::TunableValues;
pub use tunables::Tunables;
pub use tunables::MAX_BOOST_PERCENT;

mod types;
pub use types::DomainId;
pub use types::Freq;
pub use types::FreqLimits;
pub use types::TimeNs;
pub use types::UpdateFlags;
pub use types::DEFAULT_TICK_NS;
pub use types::SCHED_CAPACITY_SCALE;
