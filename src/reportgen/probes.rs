//! The relay region probes.
//!
//! A probe plan is a set of named [`ProbeSet`]s.  Probes within a set are alternative
//! attempts at the same region and address family: the first success, or the first
//! verdict that further attempts are redundant, cancels the rest of the set.  Sets are
//! independent of each other.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use anyhow::{ensure, Result};
use tokio::time::Duration;

use crate::interfaces;
use crate::relay_map::{RelayMap, RelayNode};
use crate::{RegionLatencies, Report};

/// The retransmit interval used when netcheck first runs.
///
/// We have no past context to work with, and we want answers relatively quickly, so it's
/// biased slightly more aggressive than [`DEFAULT_ACTIVE_RETRANSMIT_DELAY`].  A few extra
/// packets at startup is fine.
const DEFAULT_INITIAL_RETRANSMIT: Duration = Duration::from_millis(100);

/// The retransmit interval used in a steady state when the previous report has no
/// latency for a region.
///
/// This is a somewhat conservative guess: if we have no data, likely the region is far
/// away or timed out the last time we probed it.
const DEFAULT_ACTIVE_RETRANSMIT_DELAY: Duration = Duration::from_millis(200);

/// Extra delay stacked onto steady-state retransmits, multiplied by the attempt number.
const ACTIVE_RETRANSMIT_EXTRA_DELAY: Duration = Duration::from_millis(50);

/// The number of fastest regions to periodically re-query during incremental reports.
/// (During a full report, all regions are scanned.)
const NUM_INCREMENTAL_REGIONS: usize = 3;

/// Attempts per region in an initial plan.
const INITIAL_ATTEMPTS: usize = 3;

/// The protocol used to time a region's latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, derive_more::Display)]
#[repr(u8)]
pub(crate) enum ProbeProto {
    /// STUN over IPv4.
    StunIpv4,
    /// STUN over IPv6.
    StunIpv6,
}

/// A single STUN probe to one relay node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, derive_more::Display)]
pub(crate) enum Probe {
    #[display("STUN IPv4 after {delay:?} to {node}")]
    StunIpv4 {
        /// When the probe is started, relative to the time the report run starts.  One
        /// probe in each probe set has a delay of 0, non-zero delays are retries on UDP
        /// loss or timeout.
        delay: Duration,
        /// The relay node to send this probe to.
        node: Arc<RelayNode>,
    },
    #[display("STUN IPv6 after {delay:?} to {node}")]
    StunIpv6 {
        delay: Duration,
        node: Arc<RelayNode>,
    },
}

impl Probe {
    pub(crate) fn delay(&self) -> Duration {
        match self {
            Probe::StunIpv4 { delay, .. } | Probe::StunIpv6 { delay, .. } => *delay,
        }
    }

    pub(crate) fn proto(&self) -> ProbeProto {
        match self {
            Probe::StunIpv4 { .. } => ProbeProto::StunIpv4,
            Probe::StunIpv6 { .. } => ProbeProto::StunIpv6,
        }
    }

    pub(crate) fn node(&self) -> &Arc<RelayNode> {
        match self {
            Probe::StunIpv4 { node, .. } | Probe::StunIpv6 { node, .. } => node,
        }
    }
}

/// A probe set is a sequence of [`Probe`]s to one region over one address family.
///
/// The probes only differ in their delays, they are effectively retries; the first
/// successful probe cancels the others in the set.  The label is only used for tracing
/// and tests.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ProbeSet {
    /// Name of this set, `region-<id>-v4` or `region-<id>-v6`.
    label: String,
    proto: ProbeProto,
    probes: Vec<Probe>,
}

impl ProbeSet {
    fn new(region_id: u16, proto: ProbeProto) -> Self {
        let family = match proto {
            ProbeProto::StunIpv4 => "v4",
            ProbeProto::StunIpv6 => "v6",
        };
        Self {
            label: format!("region-{region_id}-{family}"),
            proto,
            probes: Vec::new(),
        }
    }

    fn push(&mut self, probe: Probe) -> Result<()> {
        ensure!(probe.proto() == self.proto, "mismatching probe proto");
        self.probes.push(probe);
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}

impl<'a> IntoIterator for &'a ProbeSet {
    type Item = &'a Probe;
    type IntoIter = std::slice::Iter<'a, Probe>;

    fn into_iter(self) -> Self::IntoIter {
        self.probes.iter()
    }
}

impl fmt::Display for ProbeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, r#"ProbeSet("{}") {{"#, self.label)?;
        for probe in self.probes.iter() {
            writeln!(f, "        {probe},")?;
        }
        writeln!(f, "}}")
    }
}

/// A probe plan.
///
/// The [`reportgen`] actor runs all the sets of a plan concurrently and aborts the
/// remaining ones once it has enough information for a report.
///
/// [`reportgen`]: crate::reportgen
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ProbePlan(BTreeSet<ProbeSet>);

impl ProbePlan {
    /// Creates an initial probe plan, scanning every non-avoided region.
    pub(crate) fn initial(relay_map: &RelayMap, if_state: &interfaces::State) -> Self {
        let mut plan = Self(BTreeSet::new());

        for region in relay_map.regions().filter(|region| !region.avoid) {
            let mut stun_ipv4_probes = ProbeSet::new(region.region_id, ProbeProto::StunIpv4);
            let mut stun_ipv6_probes = ProbeSet::new(region.region_id, ProbeProto::StunIpv6);

            for attempt in 0..INITIAL_ATTEMPTS {
                let node = &region.nodes[attempt % region.nodes.len()];
                let delay = DEFAULT_INITIAL_RETRANSMIT * attempt as u32;

                if if_state.have_v4 && node.might_ipv4() {
                    stun_ipv4_probes
                        .push(Probe::StunIpv4 {
                            delay,
                            node: node.clone(),
                        })
                        .expect("adding StunIpv4 probe to a StunIpv4 probe set");
                }
                if if_state.have_v6 && node.might_ipv6() {
                    stun_ipv6_probes
                        .push(Probe::StunIpv6 {
                            delay,
                            node: node.clone(),
                        })
                        .expect("adding StunIpv6 probe to a StunIpv6 probe set");
                }
            }
            plan.add(stun_ipv4_probes);
            plan.add(stun_ipv6_probes);
        }
        plan
    }

    /// Creates a follow-up probe plan using a previous report.
    pub(crate) fn with_last_report(
        relay_map: &RelayMap,
        if_state: &interfaces::State,
        last_report: &Report,
    ) -> Self {
        if last_report.region_latency.is_empty() {
            return Self::initial(relay_map, if_state);
        }
        let mut plan = Self(BTreeSet::new());
        if !if_state.have_v4 && !if_state.have_v6 {
            return plan;
        }

        let had_stun_ipv4 = !last_report.region_v4_latency.is_empty();
        let had_stun_ipv6 = !last_report.region_v6_latency.is_empty();
        let had_both = if_state.have_v6 && had_stun_ipv4 && had_stun_ipv6;
        for (ri, region) in sort_regions(relay_map, &last_report.region_latency)
            .into_iter()
            .enumerate()
        {
            if ri == NUM_INCREMENTAL_REGIONS {
                break;
            }
            let mut do4 = if_state.have_v4;
            let mut do6 = if_state.have_v6;

            // By default, each region only gets one STUN packet sent, except the fastest
            // two from the previous round.
            let mut attempts = 1;
            let is_fastest_two = ri < 2;

            if is_fastest_two {
                attempts = 2;
            } else if had_both {
                // For dual stack machines, make the 3rd & slower regions alternate
                // between address families.
                if ri % 2 == 0 {
                    (do4, do6) = (true, false);
                } else {
                    (do4, do6) = (false, true);
                }
            }
            if !is_fastest_two && !had_stun_ipv6 {
                do6 = false;
            }
            if region.region_id == last_report.preferred_region {
                // But if we already had a relay home, try extra hard to make sure it's
                // there so we don't flip flop around.
                attempts = 4;
            }
            let retransmit_delay = last_report
                .region_latency
                .get(region.region_id)
                .map(|l| l * 120 / 100)
                .unwrap_or(DEFAULT_ACTIVE_RETRANSMIT_DELAY);

            let mut stun_ipv4_probes = ProbeSet::new(region.region_id, ProbeProto::StunIpv4);
            let mut stun_ipv6_probes = ProbeSet::new(region.region_id, ProbeProto::StunIpv6);

            for attempt in 0..attempts {
                if attempt != 0 && !had_stun_ipv6 {
                    do6 = false;
                }
                let node = &region.nodes[attempt % region.nodes.len()];
                let mut delay = retransmit_delay * attempt as u32;
                if attempt > 1 {
                    delay += ACTIVE_RETRANSMIT_EXTRA_DELAY * attempt as u32;
                }

                if do4 {
                    stun_ipv4_probes
                        .push(Probe::StunIpv4 {
                            delay,
                            node: node.clone(),
                        })
                        .expect("adding StunIpv4 probe to a StunIpv4 probe set");
                }
                if do6 {
                    stun_ipv6_probes
                        .push(Probe::StunIpv6 {
                            delay,
                            node: node.clone(),
                        })
                        .expect("adding StunIpv6 probe to a StunIpv6 probe set");
                }
            }
            plan.add(stun_ipv4_probes);
            plan.add(stun_ipv6_probes);
        }
        plan
    }

    /// Returns an iterator over the [`ProbeSet`]s in this plan.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &ProbeSet> {
        self.0.iter()
    }

    /// Adds a [`ProbeSet`] if it contains probes.
    fn add(&mut self, set: ProbeSet) {
        if !set.is_empty() {
            self.0.insert(set);
        }
    }
}

impl fmt::Display for ProbePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ProbePlan {{")?;
        for probe_set in self.0.iter() {
            writeln!(f, r#"    ProbeSet("{}") {{"#, probe_set.label)?;
            for probe in probe_set.probes.iter() {
                writeln!(f, "        {probe},")?;
            }
            writeln!(f, "    }}")?;
        }
        writeln!(f, "}}")
    }
}

impl FromIterator<ProbeSet> for ProbePlan {
    fn from_iter<T: IntoIterator<Item = ProbeSet>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Sorts the non-avoided regions from fastest to slowest using the previous latencies.
///
/// Regions without previous data sort last, ties and no-data regions are ordered by
/// region id.
fn sort_regions<'a>(
    relay_map: &'a RelayMap,
    last_latency: &RegionLatencies,
) -> Vec<&'a Arc<crate::relay_map::RelayRegion>> {
    let mut prev: Vec<_> = relay_map.regions().filter(|region| !region.avoid).collect();
    prev.sort_by(|a, b| {
        let latency_a = last_latency.get(a.region_id);
        let latency_b = last_latency.get(b.region_id);
        match (latency_a, latency_b) {
            // A known latency sorts before none.
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.region_id.cmp(&b.region_id),
            (Some(_), Some(_)) => match latency_a.cmp(&latency_b) {
                std::cmp::Ordering::Equal => a.region_id.cmp(&b.region_id),
                ordering => ordering,
            },
        }
    });
    prev
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::relay_map::{RelayRegion, UseIpv4, UseIpv6};

    use super::*;

    fn test_node(region_id: u16, idx: usize) -> Arc<RelayNode> {
        Arc::new(RelayNode {
            name: format!("{region_id}{}", (b'a' + idx as u8) as char),
            region_id,
            host_name: format!("relay-{region_id}-{idx}.example.net"),
            stun_port: 0,
            stun_only: false,
            stun_test_ip: None,
            ipv4: UseIpv4::TryDns,
            ipv6: UseIpv6::TryDns,
        })
    }

    fn test_map(regions: u16) -> RelayMap {
        RelayMap::from_regions((1..=regions).map(|region_id| RelayRegion {
            region_id,
            region_code: format!("region-{region_id}"),
            avoid: false,
            nodes: vec![test_node(region_id, 0)],
        }))
        .unwrap()
    }

    fn latencies(pairs: impl IntoIterator<Item = (u16, u64)>) -> RegionLatencies {
        let mut latencies = RegionLatencies::new();
        for (region_id, millis) in pairs {
            latencies.update_region(region_id, Duration::from_millis(millis));
        }
        latencies
    }

    fn last_report(
        preferred_region: u16,
        latency_pairs: Vec<(u16, u64)>,
        v6_pairs: Vec<(u16, u64)>,
    ) -> Report {
        Report {
            udp: true,
            ipv4: true,
            ipv6: !v6_pairs.is_empty(),
            preferred_region,
            region_latency: latencies(latency_pairs.clone()),
            region_v4_latency: latencies(latency_pairs),
            region_v6_latency: latencies(v6_pairs),
            ..Default::default()
        }
    }

    #[test]
    fn test_initial_probeplan_v4_only() {
        let relay_map = test_map(2);
        let node_1 = relay_map.get_region(1).unwrap().nodes[0].clone();
        let node_2 = relay_map.get_region(2).unwrap().nodes[0].clone();
        let if_state = interfaces::State::fake();
        let plan = ProbePlan::initial(&relay_map, &if_state);

        let expected_plan: ProbePlan = [
            ProbeSet {
                label: "region-1-v4".into(),
                proto: ProbeProto::StunIpv4,
                probes: vec![
                    Probe::StunIpv4 {
                        delay: Duration::ZERO,
                        node: node_1.clone(),
                    },
                    Probe::StunIpv4 {
                        delay: Duration::from_millis(100),
                        node: node_1.clone(),
                    },
                    Probe::StunIpv4 {
                        delay: Duration::from_millis(200),
                        node: node_1.clone(),
                    },
                ],
            },
            ProbeSet {
                label: "region-2-v4".into(),
                proto: ProbeProto::StunIpv4,
                probes: vec![
                    Probe::StunIpv4 {
                        delay: Duration::ZERO,
                        node: node_2.clone(),
                    },
                    Probe::StunIpv4 {
                        delay: Duration::from_millis(100),
                        node: node_2.clone(),
                    },
                    Probe::StunIpv4 {
                        delay: Duration::from_millis(200),
                        node: node_2.clone(),
                    },
                ],
            },
        ]
        .into_iter()
        .collect();

        assert_eq!(plan.to_string(), expected_plan.to_string());
        assert_eq!(plan, expected_plan);
    }

    #[test]
    fn test_initial_probeplan_dual_stack_cycles_nodes() {
        let relay_map = RelayMap::from_regions([RelayRegion {
            region_id: 1,
            region_code: "one".into(),
            avoid: false,
            nodes: vec![test_node(1, 0), test_node(1, 1)],
        }])
        .unwrap();
        let if_state = interfaces::State::fake_dual_stack();
        let plan = ProbePlan::initial(&relay_map, &if_state);

        let sets: Vec<_> = plan.iter().collect();
        assert_eq!(sets.len(), 2);
        for set in sets {
            // attempt N targets node N % len(nodes)
            let names: Vec<_> = set.probes.iter().map(|p| p.node().name.clone()).collect();
            assert_eq!(names, vec!["1a", "1b", "1a"]);
        }
    }

    #[test]
    fn test_initial_probeplan_skips_avoided_regions() {
        let mut region_1 = RelayRegion {
            region_id: 1,
            region_code: "one".into(),
            avoid: true,
            nodes: vec![test_node(1, 0)],
        };
        let region_2 = RelayRegion {
            region_id: 2,
            region_code: "two".into(),
            avoid: false,
            nodes: vec![test_node(2, 0)],
        };
        let relay_map = RelayMap::from_regions([region_1.clone(), region_2]).unwrap();
        let if_state = interfaces::State::fake();
        let plan = ProbePlan::initial(&relay_map, &if_state);
        let labels: Vec<_> = plan.iter().map(|set| set.label.as_str()).collect();
        assert_eq!(labels, vec!["region-2-v4"]);

        region_1.avoid = false;
        let relay_map = RelayMap::from_regions([region_1]).unwrap();
        let plan = ProbePlan::initial(&relay_map, &interfaces::State::fake());
        assert_eq!(plan.iter().count(), 1);
    }

    #[test]
    fn test_plan_with_report_preferred_region_gets_four_tries() {
        let relay_map = test_map(1);
        let node = relay_map.get_region(1).unwrap().nodes[0].clone();
        let if_state = interfaces::State::fake();
        // Preferred region with 50ms latency: retransmit delay is 60ms.
        let report = last_report(1, vec![(1, 50)], vec![]);

        let plan = ProbePlan::with_last_report(&relay_map, &if_state, &report);
        let expected_plan: ProbePlan = [ProbeSet {
            label: "region-1-v4".into(),
            proto: ProbeProto::StunIpv4,
            probes: vec![
                Probe::StunIpv4 {
                    delay: Duration::ZERO,
                    node: node.clone(),
                },
                Probe::StunIpv4 {
                    delay: Duration::from_millis(60),
                    node: node.clone(),
                },
                // attempts > 1 get the extra 50ms * attempt stacked on
                Probe::StunIpv4 {
                    delay: Duration::from_millis(120 + 100),
                    node: node.clone(),
                },
                Probe::StunIpv4 {
                    delay: Duration::from_millis(180 + 150),
                    node: node.clone(),
                },
            ],
        }]
        .into_iter()
        .collect();

        assert_eq!(plan.to_string(), expected_plan.to_string());
        assert_eq!(plan, expected_plan);
    }

    #[test]
    fn test_plan_with_report_keeps_top_three_regions() {
        let relay_map = test_map(5);
        let if_state = interfaces::State::fake();
        let report = last_report(0, vec![(1, 10), (2, 20), (3, 30), (4, 40), (5, 50)], vec![]);

        let plan = ProbePlan::with_last_report(&relay_map, &if_state, &report);
        let labels: Vec<_> = plan.iter().map(|set| set.label.as_str()).collect();
        assert_eq!(labels, vec!["region-1-v4", "region-2-v4", "region-3-v4"]);
        // fastest two get two attempts, the third one
        for set in plan.iter() {
            let want = if set.label == "region-3-v4" { 1 } else { 2 };
            assert_eq!(set.probes.len(), want, "{}", set.label);
        }
    }

    #[test]
    fn test_plan_with_report_family_alternation() {
        let relay_map = test_map(4);
        let if_state = interfaces::State::fake_dual_stack();
        let report = last_report(
            0,
            vec![(1, 10), (2, 20), (3, 30), (4, 40)],
            vec![(1, 10), (2, 20), (3, 30), (4, 40)],
        );

        let plan = ProbePlan::with_last_report(&relay_map, &if_state, &report);
        let labels: Vec<_> = plan.iter().map(|set| set.label.as_str()).collect();
        // Fastest two probe both families, the third (rank 2, even) is IPv4 only.
        assert_eq!(
            labels,
            vec![
                "region-1-v4",
                "region-1-v6",
                "region-2-v4",
                "region-2-v6",
                "region-3-v4",
            ]
        );
    }

    #[test]
    fn test_plan_with_report_no_v6_last_time() {
        let relay_map = test_map(3);
        let if_state = interfaces::State::fake_dual_stack();
        // IPv6 did not work last time: only the fastest two attempt v6, once.
        let report = last_report(0, vec![(1, 10), (2, 20), (3, 30)], vec![]);

        let plan = ProbePlan::with_last_report(&relay_map, &if_state, &report);
        for set in plan.iter() {
            match set.label.as_str() {
                "region-1-v6" | "region-2-v6" => {
                    assert_eq!(set.probes.len(), 1, "{}", set.label);
                }
                "region-1-v4" | "region-2-v4" => {
                    assert_eq!(set.probes.len(), 2, "{}", set.label);
                }
                "region-3-v4" => assert_eq!(set.probes.len(), 1),
                other => panic!("unexpected set {other}"),
            }
        }
    }

    #[test]
    fn test_plan_with_empty_last_report_is_initial() {
        let relay_map = test_map(2);
        let if_state = interfaces::State::fake();
        let plan = ProbePlan::with_last_report(&relay_map, &if_state, &Report::default());
        assert_eq!(plan, ProbePlan::initial(&relay_map, &if_state));
    }

    #[test]
    fn test_sort_regions() {
        let relay_map = test_map(3);
        let ids = |latencies: &RegionLatencies| -> Vec<u16> {
            sort_regions(&relay_map, latencies)
                .into_iter()
                .map(|region| region.region_id)
                .collect()
        };

        // lower latency sorts first
        assert_eq!(ids(&latencies([(1, 30), (2, 10), (3, 20)])), vec![2, 3, 1]);
        // missing latency sorts last
        assert_eq!(ids(&latencies([(2, 10)])), vec![2, 1, 3]);
        // equal latencies and no data order by region id
        assert_eq!(ids(&latencies([(1, 10), (2, 10)])), vec![1, 2, 3]);
        assert_eq!(ids(&latencies([])), vec![1, 2, 3]);
    }
}
