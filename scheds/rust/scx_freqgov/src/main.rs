// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
mod load;
use load::LoadSampler;

mod stats;
use stats::Metrics;

mod sysfs;
use sysfs::Policy;
use sysfs::SysfsActuator;

use std::fs;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use crossbeam::channel::RecvTimeoutError;
use log::debug;
use log::info;
use log::warn;
use metrics_exporter_prometheus::PrometheusBuilder;
use scx_cpufreq::Actuator;
use scx_cpufreq::CapacityModel;
use scx_cpufreq::Cpumask;
use scx_cpufreq::DomainId;
use scx_cpufreq::FreqLimits;
use scx_cpufreq::Governor;
use scx_cpufreq::GovernorConfig;
use scx_cpufreq::TimeNs;
use scx_cpufreq::TunableValues;
use scx_stats::prelude::*;

/// scx_freqgov: a utilization-driven CPU frequency governor
///
/// Samples per-CPU utilization from /proc/stat and drives every cpufreq
/// policy through the userspace governor. Each policy is a domain whose CPUs
/// share one frequency. The frequency is picked from per-class capacity
/// tables, boosted by a configurable percentage and rate limited separately
/// for ramping up and down.
///
/// The previous governor of each policy is restored on exit.
#[derive(Debug, Parser)]
struct Opts {
    /// Load sampling interval in seconds.
    #[clap(short = 'i', long, default_value = "0.02")]
    interval: f64,

    /// Minimum time between frequency increases, in microseconds. Defaults
    /// to a multiple of the policy's transition latency.
    #[clap(short = 'u', long)]
    up_rate_limit_us: Option<u32>,

    /// Minimum time between frequency decreases, in microseconds. Defaults
    /// to a multiple of the policy's transition latency.
    #[clap(short = 'd', long)]
    down_rate_limit_us: Option<u32>,

    /// Percentage added to the utilization before picking a frequency.
    #[clap(short = 'b', long)]
    boost_perc: Option<u32>,

    /// Tunables as JSON, or a file containing them when prefixed with "f:"
    /// or "file:". E.g. '{"up_rate_limit_us": 500, "boost_percent": 10}'.
    /// Individual options above override the values given here.
    #[clap(short = 't', long)]
    tunables: Option<String>,

    /// Give every policy its own tunables instead of one set shared by all.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    per_policy_tunables: bool,

    /// Write frequencies from the sampling loop instead of per-policy
    /// worker threads.
    #[clap(short = 'f', long, action = clap::ArgAction::SetTrue)]
    fast_switch: bool,

    /// CPUs using the little capacity table, as a cpulist (e.g. "0-3") or a
    /// hex mask (e.g. "0xf"). Defaults to CPUs 0 and 1.
    #[clap(short = 'l', long)]
    little_cpus: Option<String>,

    /// Share of a sampling interval spent waiting on IO, in percent, above
    /// which the CPU gets the IO-wait boost. 0 disables.
    #[clap(long, default_value = "10.0")]
    iowait_thresh: f64,

    /// Poll this file for the display state. "0" or "off" means the display
    /// is off, which relaxes rate limits.
    #[clap(long)]
    display_state_file: Option<PathBuf>,

    /// Enable stats monitoring with the specified interval.
    #[clap(short = 's', long)]
    stats: Option<f64>,

    /// Run in stats monitoring mode with the specified interval. The
    /// governor is not started.
    #[clap(long)]
    monitor: Option<f64>,

    /// Show descriptions for statistics.
    #[clap(long)]
    help_stats: bool,

    /// Root of the sysfs tree, for testing against a fake tree.
    #[clap(long, default_value = "/")]
    sysfs_root: PathBuf,

    /// Enable verbose output. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable the Prometheus endpoint for metrics on port 9000.
    #[clap(long, action = clap::ArgAction::SetTrue)]
    enable_prometheus: bool,
}

impl Opts {
    /// Apply the individual tunable options on top of `vals`.
    fn override_tunables(&self, mut vals: TunableValues) -> Result<TunableValues> {
        if let Some(up) = self.up_rate_limit_us {
            vals.up_rate_limit_us = up;
        }
        if let Some(down) = self.down_rate_limit_us {
            vals.down_rate_limit_us = down;
        }
        if let Some(boost) = self.boost_perc {
            vals.boost_percent = boost;
        }
        vals.validate()?;
        Ok(vals)
    }
}

fn parse_tunables(input: &str) -> Result<TunableValues> {
    let vals: TunableValues = if input.starts_with("f:") || input.starts_with("file:") {
        let path = input.split_once(':').map(|(_, p)| p).unwrap_or(input);
        let mut f = fs::OpenOptions::new()
            .read(true)
            .open(path)
            .with_context(|| format!("Failed to open tunables file {}", path))?;
        let mut content = String::new();
        f.read_to_string(&mut content)?;
        serde_json::from_str(&content)?
    } else {
        serde_json::from_str(input)?
    };
    vals.validate()?;
    Ok(vals)
}

fn read_display_state(path: &Path) -> Result<bool> {
    let state = fs::read_to_string(path)
        .with_context(|| format!("Failed to read display state from {:?}", path))?;
    Ok(!matches!(state.trim(), "0" | "off"))
}

struct Domain {
    policy: Policy,
    limits: FreqLimits,
}

struct FreqGov {
    gov: Governor,
    domains: Vec<Domain>,
    sampler: LoadSampler,
    epoch: Instant,

    sample_interval: Duration,
    stats_server: StatsServer<(), Metrics>,
    prometheus: bool,
    display_state_file: Option<PathBuf>,
}

impl FreqGov {
    fn init(opts: &Opts) -> Result<Self> {
        let root = opts.sysfs_root.as_path();
        let nr_cpus = sysfs::nr_cpu_ids(root)?;
        let policies = sysfs::discover_policies(root, nr_cpus)?;
        info!("{} CPUs, {} cpufreq policies", nr_cpus, policies.len());

        let model = match &opts.little_cpus {
            Some(cpulist) => CapacityModel::new(Cpumask::parse(nr_cpus, cpulist)?),
            None => CapacityModel::with_default_classes(nr_cpus),
        };
        let mut config = GovernorConfig::new(nr_cpus);
        config.per_policy_tunables = opts.per_policy_tunables;
        let gov = Governor::with_model(config, model);

        let base_tunables = opts.tunables.as_deref().map(parse_tunables).transpose()?;
        let mut domains = vec![];
        for policy in policies.into_iter() {
            let spec = policy.domain_spec()?;
            let id = spec.id;
            let limits = spec.limits;
            let act = Arc::new(SysfsActuator::new(&policy)?);
            let actuator = if opts.fast_switch {
                Actuator::inline(act)
            } else {
                Actuator::deferred(act)
            };
            gov.domain_init(spec, actuator)?;

            let tunables = gov.tunables(id)?;
            let vals = opts.override_tunables(base_tunables.unwrap_or(tunables.values()))?;
            if vals != tunables.values() {
                tunables.update(vals)?;
            }
            gov.domain_start(id)?;
            info!(
                "policy{}: cpus={} online={} freqs={}-{}kHz tunables={:?}",
                policy.id,
                policy.related,
                policy.online,
                policy.cpuinfo_min,
                policy.cpuinfo_max,
                gov.tunables(id)?.values()
            );
            domains.push(Domain { policy, limits });
        }

        let capacities = sysfs::cpu_capacities(root, nr_cpus);
        let sampler = LoadSampler::new(capacities, opts.iowait_thresh / 100.0)?;
        let stats_server = StatsServer::new(stats::server_data())
            .set_path(stats::STATS_SOCK)
            .launch()?;

        Ok(Self {
            gov,
            domains,
            sampler,
            epoch: Instant::now(),
            sample_interval: Duration::from_secs_f64(opts.interval),
            stats_server,
            prometheus: opts.enable_prometheus,
            display_state_file: opts.display_state_file.clone(),
        })
    }

    fn now_ns(&self) -> TimeNs {
        self.epoch.elapsed().as_nanos() as TimeNs
    }

    fn poll_limits(&mut self) {
        for dom in self.domains.iter_mut() {
            let limits = match dom.policy.read_limits() {
                Ok(limits) => limits,
                Err(e) => {
                    warn!("policy{}: {:#}", dom.policy.id, e);
                    continue;
                }
            };
            if limits != dom.limits {
                debug!(
                    "policy{}: limits {:?} -> {:?}",
                    dom.policy.id, dom.limits, limits
                );
                dom.limits = limits;
                if let Err(e) = self.gov.domain_limits_changed(DomainId(dom.policy.id), limits) {
                    warn!("policy{}: {}", dom.policy.id, e);
                }
            }
        }
    }

    fn poll_display(&self) {
        if let Some(path) = &self.display_state_file {
            match read_display_state(path) {
                Ok(active) => self.gov.on_display_state_changed(active),
                Err(e) => debug!("{:#}", e),
            }
        }
    }

    fn sample_step(&mut self) -> Result<()> {
        self.poll_limits();
        self.poll_display();

        let loads = self.sampler.sample()?;
        let now = self.now_ns();
        for load in loads.iter() {
            self.gov.report(load.cpu, load.util, load.max, load.flags, now);
        }
        Ok(())
    }

    fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let (res_ch, req_ch) = self.stats_server.channels();
        let report_interval = Duration::from_secs(1);
        let now = Instant::now();
        let mut next_sample_at = now + self.sample_interval;
        let mut next_report_at = now + report_interval;

        while !shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();

            if now >= next_sample_at {
                self.sample_step()?;
                next_sample_at += self.sample_interval;
                if next_sample_at < now {
                    next_sample_at = now + self.sample_interval;
                }
            }

            if now >= next_report_at {
                if self.prometheus {
                    Metrics::collect(&self.gov).publish();
                }
                next_report_at += report_interval;
                if next_report_at < now {
                    next_report_at = now + report_interval;
                }
            }

            let timeout = next_sample_at
                .min(next_report_at)
                .saturating_duration_since(Instant::now());
            match req_ch.recv_timeout(timeout) {
                Ok(()) => res_ch.send(Metrics::collect(&self.gov))?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(e) => Err(e)?,
            }
        }

        info!("Shutting down");
        for dom in self.domains.iter() {
            let id = DomainId(dom.policy.id);
            self.gov.domain_stop(id)?;
            self.gov.domain_exit(id)?;
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.help_stats {
        stats::server_data().describe_meta(&mut std::io::stdout(), None)?;
        return Ok(());
    }

    let llv = match opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if let Some(intv) = opts.monitor.or(opts.stats) {
        let shutdown_copy = shutdown.clone();
        let jh = std::thread::spawn(move || {
            match stats::monitor(
                Path::new(stats::STATS_SOCK),
                Duration::from_secs_f64(intv),
                shutdown_copy,
            ) {
                Ok(_) => debug!("stats monitor thread finished successfully"),
                Err(e) => warn!("stats monitor thread finished because of an error {:#}", e),
            }
        });
        if opts.monitor.is_some() {
            let _ = jh.join();
            return Ok(());
        }
    }

    if opts.enable_prometheus {
        info!("Enabling Prometheus endpoint: http://localhost:9000");
        PrometheusBuilder::new()
            .install()
            .context("Failed to install Prometheus recorder")?;
    }

    let mut freqgov = FreqGov::init(&opts)?;
    freqgov.run(shutdown)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(args: &[&str]) -> Opts {
        let mut argv = vec!["scx_freqgov"];
        argv.extend_from_slice(args);
        Opts::parse_from(argv)
    }

    #[test]
    fn test_override_tunables() {
        let base = TunableValues::for_latency_ns(100_000);
        assert_eq!(opts(&[]).override_tunables(base).unwrap(), base);

        let vals = opts(&["-u", "300", "-b", "10"]).override_tunables(base).unwrap();
        assert_eq!(vals.up_rate_limit_us, 300);
        assert_eq!(vals.down_rate_limit_us, base.down_rate_limit_us);
        assert_eq!(vals.boost_percent, 10);

        assert!(opts(&["-b", "50"]).override_tunables(base).is_err());
    }

    #[test]
    fn test_parse_tunables() {
        let vals = parse_tunables(r#"{"down_rate_limit_us": 8000, "boost_percent": 10}"#).unwrap();
        assert_eq!(vals.down_rate_limit_us, 8000);
        assert_eq!(vals.boost_percent, 10);
        assert!(parse_tunables(r#"{"boost_percent": 21}"#).is_err());
        assert!(parse_tunables("boost=5").is_err());
    }

    #[test]
    fn test_tunables_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunables.json");
        fs::write(&path, r#"{"up_rate_limit_us": 1000}"#).unwrap();

        let vals = parse_tunables(&format!("f:{}", path.display())).unwrap();
        assert_eq!(vals.up_rate_limit_us, 1000);
        assert_eq!(vals.boost_percent, TunableValues::default().boost_percent);
        assert!(parse_tunables("file:/nonexistent/tunables.json").is_err());
    }

    #[test]
    fn test_display_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("display");
        for (content, active) in [("1\n", true), ("on", true), ("0\n", false), ("off\n", false)] {
            fs::write(&path, content).unwrap();
            assert_eq!(read_display_state(&path).unwrap(), active);
        }
        assert!(read_display_state(&dir.path().join("missing")).is_err());
    }
}
