// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use anyhow::Result;
use log::info;
use log::warn;
use metrics::counter;
use metrics::gauge;
use scx_cpufreq::DomainStats;
use scx_cpufreq::Governor;
use scx_stats::prelude::*;
use scx_stats_derive::stat_doc;
use scx_stats_derive::Stats;
use serde::Deserialize;
use serde::Serialize;

pub const STATS_SOCK: &str = "/var/run/scx/scx_freqgov/stats";

fn khz_to_mhz(khz: u64) -> f64 {
    khz as f64 / 1000.0
}

#[stat_doc]
#[derive(Clone, Debug, Default, Serialize, Deserialize, Stats)]
#[stat(_om_prefix = "d_")]
pub struct DomainMetrics {
    #[stat(desc = "CPUs sharing the frequency")]
    pub cpus: String,
    #[stat(desc = "1 while the domain is started")]
    pub started: u32,
    #[stat(desc = "1 if frequencies are switched from the sampling loop")]
    pub inline: u32,
    #[stat(desc = "Current frequency (kHz)")]
    pub cur_freq: u64,
    #[stat(desc = "Last requested frequency (kHz), 0 before the first request")]
    pub next_freq: u64,
    #[stat(desc = "Lower policy limit (kHz)")]
    pub min_freq: u64,
    #[stat(desc = "Upper policy limit (kHz)")]
    pub max_freq: u64,
    #[stat(desc = "Effective delay before raising (us)")]
    pub up_delay_us: u64,
    #[stat(desc = "Effective delay before lowering (us)")]
    pub down_delay_us: u64,
    #[stat(desc = "Utilization boost (%)")]
    pub boost_percent: u32,
    #[stat(desc = "1 while rate limits are widened for display off")]
    pub display_suspended: u32,
    #[stat(desc = "1 while a frequency request is in flight")]
    pub work_in_progress: u32,
    #[stat(desc = "Accepted frequency changes")]
    pub changes: u64,
    #[stat(desc = "Evaluations skipped by the rate limits")]
    pub rate_limited: u64,
    #[stat(desc = "Evaluations skipped while a request was in flight")]
    pub busy: u64,
    #[stat(desc = "Failed frequency requests")]
    pub failures: u64,
}

impl From<&DomainStats> for DomainMetrics {
    fn from(dom: &DomainStats) -> Self {
        Self {
            cpus: dom.cpus.clone(),
            started: dom.started as u32,
            inline: dom.inline as u32,
            cur_freq: dom.cur_freq as u64,
            next_freq: dom.next_freq.map(u64::from).unwrap_or(0),
            min_freq: dom.limits.min as u64,
            max_freq: dom.limits.max as u64,
            up_delay_us: dom.up_delay_ns / 1000,
            down_delay_us: dom.down_delay_ns / 1000,
            boost_percent: dom.boost_percent,
            display_suspended: dom.display_suspended as u32,
            work_in_progress: dom.work_in_progress as u32,
            changes: dom.changes,
            rate_limited: dom.rate_limited,
            busy: dom.busy,
            failures: dom.failures,
        }
    }
}

impl DomainMetrics {
    fn format<W: Write>(&self, w: &mut W, id: usize) -> Result<()> {
        let next = match self.next_freq {
            0 => format!("{:>7}", "-"),
            next => format!("{:7.1}", khz_to_mhz(next)),
        };
        writeln!(
            w,
            "  DOM[{:02}] cpus={:<8} cur={:7.1} next={} lim=[{:.0}, {:.0}] {}{}{}",
            id,
            self.cpus,
            khz_to_mhz(self.cur_freq),
            next,
            khz_to_mhz(self.min_freq),
            khz_to_mhz(self.max_freq),
            if self.started != 0 { "" } else { "stopped " },
            if self.inline != 0 { "fast" } else { "slow" },
            if self.work_in_progress != 0 { " busy" } else { "" },
        )?;
        writeln!(
            w,
            "          up={:5}us down={:5}us boost={:2}% changes={:6} rlimit={:6} busy={:4} fail={:3}{}",
            self.up_delay_us,
            self.down_delay_us,
            self.boost_percent,
            self.changes,
            self.rate_limited,
            self.busy,
            self.failures,
            if self.display_suspended != 0 { " display-off" } else { "" },
        )?;
        Ok(())
    }

    fn delta(&self, rhs: &Self) -> Self {
        Self {
            changes: self.changes.saturating_sub(rhs.changes),
            rate_limited: self.rate_limited.saturating_sub(rhs.rate_limited),
            busy: self.busy.saturating_sub(rhs.busy),
            failures: self.failures.saturating_sub(rhs.failures),
            ..self.clone()
        }
    }
}

#[stat_doc]
#[derive(Clone, Debug, Default, Serialize, Deserialize, Stats)]
#[stat(top)]
pub struct Metrics {
    #[stat(desc = "1 while the display is on")]
    pub display_active: u32,
    #[stat(desc = "Per-policy metrics")]
    pub domains: BTreeMap<usize, DomainMetrics>,
}

impl Metrics {
    pub fn collect(gov: &Governor) -> Self {
        Self {
            display_active: gov.display_active() as u32,
            domains: gov
                .domain_ids()
                .into_iter()
                .filter_map(|id| gov.domain_stats(id))
                .map(|dom| (dom.id.0, DomainMetrics::from(&dom)))
                .collect(),
        }
    }

    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "display={} domains={}",
            if self.display_active != 0 { "on" } else { "off" },
            self.domains.len()
        )?;
        for (id, dom) in self.domains.iter() {
            dom.format(w, *id)?;
        }
        Ok(())
    }

    /// Counters become per-interval, everything else is the latest value.
    fn delta(&self, rhs: &Self) -> Self {
        Self {
            display_active: self.display_active,
            domains: self
                .domains
                .iter()
                .map(|(id, dom)| {
                    let dom = match rhs.domains.get(id) {
                        Some(prev) => dom.delta(prev),
                        None => dom.clone(),
                    };
                    (*id, dom)
                })
                .collect(),
        }
    }

    /// Publish through the installed `metrics` recorder. The governor keeps
    /// cumulative counts so counters are set to absolute values.
    pub fn publish(&self) {
        gauge!("display_active").set(self.display_active as f64);
        for (id, dom) in self.domains.iter() {
            let id = id.to_string();
            gauge!("cur_freq_khz", "domain" => id.clone()).set(dom.cur_freq as f64);
            gauge!("next_freq_khz", "domain" => id.clone()).set(dom.next_freq as f64);
            gauge!("boost_percent", "domain" => id.clone()).set(dom.boost_percent as f64);
            counter!("freq_changes_total", "domain" => id.clone()).absolute(dom.changes);
            counter!("evaluations_skipped_total", "domain" => id.clone(), "reason" => "rate_limited")
                .absolute(dom.rate_limited);
            counter!("evaluations_skipped_total", "domain" => id.clone(), "reason" => "busy")
                .absolute(dom.busy);
            counter!("freq_failures_total", "domain" => id).absolute(dom.failures);
        }
    }
}

pub fn server_data() -> StatsServerData<(), Metrics> {
    let open: Box<dyn StatsOpener<(), Metrics>> = Box::new(move |(req_ch, res_ch)| {
        req_ch.send(())?;
        let mut prev = res_ch.recv()?;

        let read: Box<dyn StatsReader<(), Metrics>> = Box::new(move |_args, (req_ch, res_ch)| {
            req_ch.send(())?;
            let cur = res_ch.recv()?;
            let delta = cur.delta(&prev);
            prev = cur;
            delta.to_json()
        });

        Ok(read)
    });

    StatsServerData::new()
        .add_meta(Metrics::meta())
        .add_meta(DomainMetrics::meta())
        .add_ops("top", StatsOps { open, close: None })
}

/// Print the metrics served at `sock` every `intv` until `shutdown` is set,
/// reconnecting while the governor is not running.
pub fn monitor(sock: &Path, intv: Duration, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut retry_cnt: u32 = 0;

    while !shutdown.load(Ordering::Relaxed) {
        let mut client = match StatsClient::new().set_path(sock).connect(None) {
            Ok(client) => client,
            Err(e) => match e.downcast_ref::<std::io::Error>() {
                Some(ioe)
                    if matches!(
                        ioe.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    if retry_cnt == 1 {
                        info!("Stats server not available, retrying...");
                    }
                    retry_cnt += 1;
                    sleep(Duration::from_secs(1));
                    continue;
                }
                _ => Err(e)?,
            },
        };
        retry_cnt = 0;

        while !shutdown.load(Ordering::Relaxed) {
            let metrics = match client.request::<Metrics>("stats", vec![]) {
                Ok(metrics) => metrics,
                Err(e) => {
                    warn!("Stats request failed ({:#})", e);
                    sleep(Duration::from_secs(1));
                    break;
                }
            };
            metrics.format(&mut std::io::stdout())?;
            sleep(intv);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scx_cpufreq::DomainId;
    use scx_cpufreq::FreqLimits;

    fn dom() -> DomainStats {
        DomainStats {
            id: DomainId(4),
            cpus: "4-7".into(),
            started: true,
            shared: true,
            inline: true,
            cur_freq: 1_200_000,
            next_freq: Some(1_200_000),
            limits: FreqLimits {
                min: 300_000,
                max: 2_400_000,
            },
            up_delay_ns: 500_000,
            down_delay_ns: 20_000_000,
            boost_percent: 5,
            display_suspended: false,
            work_in_progress: false,
            changes: 12,
            rate_limited: 3,
            busy: 0,
            failures: 1,
        }
    }

    fn metrics(dom: &DomainStats) -> Metrics {
        Metrics {
            display_active: 1,
            domains: [(dom.id.0, DomainMetrics::from(dom))].into_iter().collect(),
        }
    }

    #[test]
    fn test_format() {
        let mut buf = vec![];
        metrics(&dom()).format(&mut buf).unwrap();
        let out = String::from_utf8(buf).unwrap();

        assert!(out.starts_with("display=on domains=1\n"));
        assert!(out.contains("DOM[04] cpus=4-7"));
        assert!(out.contains("cur= 1200.0"));
        assert!(out.contains("lim=[300, 2400] fast"));
        assert!(out.contains("up=  500us down=20000us boost= 5%"));
        assert!(!out.contains("display-off"));
    }

    #[test]
    fn test_delta_counts_interval() {
        let prev = metrics(&dom());
        let mut d = dom();
        d.changes = 20;
        d.failures = 1;
        d.cur_freq = 1_800_000;
        let delta = metrics(&d).delta(&prev);

        let dm = &delta.domains[&4];
        assert_eq!(dm.changes, 8);
        assert_eq!(dm.rate_limited, 0);
        assert_eq!(dm.failures, 0);
        assert_eq!(dm.cur_freq, 1_800_000);
    }

    #[test]
    fn test_json() {
        let mut d = dom();
        d.next_freq = None;
        let val = serde_json::to_value(metrics(&d)).unwrap();

        assert_eq!(val["display_active"], 1);
        assert_eq!(val["domains"]["4"]["cur_freq"], 1_200_000);
        assert_eq!(val["domains"]["4"]["next_freq"], 0);
        assert_eq!(val["domains"]["4"]["max_freq"], 2_400_000);
    }
}
