//! End-of-run statistics over the output queue.

use crate::emu::{Outcome, Packet};

/// Aggregated emulation statistics. Times are in seconds, matching the
/// report format.
#[derive(Debug, Default)]
pub struct Stats {
    pub arrived: u64,
    pub served: u64,
    pub dropped: u64,
    pub removed: u64,
    pub avg_inter_arrival_s: Option<f64>,
    pub avg_service_s: Option<f64>,
    pub avg_in_q1: Option<f64>,
    pub avg_in_q2: Option<f64>,
    pub avg_in_s1: Option<f64>,
    pub avg_in_s2: Option<f64>,
    pub avg_system_s: Option<f64>,
    pub stddev_system_s: Option<f64>,
    pub token_drop_prob: Option<f64>,
    pub packet_drop_prob: Option<f64>,
}

fn round3(ms: f64) -> f64 {
    (ms * 1000.0 + 0.5).floor() / 1000.0
}

/// Compute the statistics over completed packets.
///
/// `total_us` is the emulation wall time; `tokens`/`token_drops` come from
/// the token thread.
pub fn compute(done: &[Packet], total_us: u64, tokens: u64, token_drops: u64) -> Stats {
    let mut st = Stats { arrived: done.len() as u64, ..Stats::default() };

    let mut total_inter_ms = 0.0;
    let mut total_service_ms = 0.0;
    let mut total_q1_ms = 0.0;
    let mut total_q2_ms = 0.0;
    let mut total_s1_ms = 0.0;
    let mut total_s2_ms = 0.0;
    let mut total_system_ms = 0.0;

    for p in done {
        total_inter_ms += round3(p.real_inter_us as f64 / 1000.0);
        match p.outcome {
            Outcome::Served { server } => {
                st.served += 1;
                let service_ms = round3((p.end_svc_us - p.begin_svc_us) as f64 / 1000.0);
                total_service_ms += service_ms;
                total_q1_ms += round3((p.leave_q1_us - p.enter_q1_us) as f64 / 1000.0);
                total_q2_ms += round3((p.leave_q2_us - p.enter_q2_us) as f64 / 1000.0);
                if server == 1 {
                    total_s1_ms += service_ms;
                } else {
                    total_s2_ms += service_ms;
                }
                total_system_ms += round3((p.end_svc_us - p.arrive_us) as f64 / 1000.0);
            }
            Outcome::Dropped => st.dropped += 1,
            Outcome::Removed => st.removed += 1,
            Outcome::Pending => {}
        }
    }

    if st.arrived > 0 {
        st.avg_inter_arrival_s = Some(total_inter_ms / st.arrived as f64 / 1000.0);
        st.packet_drop_prob = Some(st.dropped as f64 / st.arrived as f64);
    }
    if st.served > 0 {
        st.avg_service_s = Some(total_service_ms / st.served as f64 / 1000.0);
        let avg_system_ms = total_system_ms / st.served as f64;
        st.avg_system_s = Some(avg_system_ms / 1000.0);

        let mut variance = 0.0;
        for p in done {
            if let Outcome::Served { .. } = p.outcome {
                let system_ms = round3((p.end_svc_us - p.arrive_us) as f64 / 1000.0);
                variance += (system_ms - avg_system_ms) * (system_ms - avg_system_ms);
            }
        }
        variance /= st.served as f64;
        st.stddev_system_s = Some(variance.sqrt() / 1000.0);
    }
    if total_us > 0 {
        let total_ms = round3(total_us as f64 / 1000.0);
        st.avg_in_q1 = Some(total_q1_ms / total_ms);
        st.avg_in_q2 = Some(total_q2_ms / total_ms);
        st.avg_in_s1 = Some(total_s1_ms / total_ms);
        st.avg_in_s2 = Some(total_s2_ms / total_ms);
    }
    if tokens > 0 {
        st.token_drop_prob = Some(token_drops as f64 / tokens as f64);
    }
    st
}

fn line(label: &str, value: Option<f64>, missing: &str) {
    match value {
        Some(v) => println!("\t{} = {:.6}", label, v),
        None => println!("\t{} = N/A, {}", label, missing),
    }
}

/// Print the statistics block in the report format.
pub fn report(st: &Stats) {
    println!("\nStatistics:\n");
    line("average packet inter-arrival time", st.avg_inter_arrival_s, "no packet arrived");
    line("average packet service time", st.avg_service_s, "no packet was served");
    println!();
    line("average number of packets in Q1", st.avg_in_q1, "no emulation time");
    line("average number of packets in Q2", st.avg_in_q2, "no emulation time");
    line("average number of packets in S1", st.avg_in_s1, "no emulation time");
    line("average number of packets in S2", st.avg_in_s2, "no emulation time");
    println!();
    line("average time a packet spent in system", st.avg_system_s, "no packet was served");
    line(
        "standard deviation for time spent in system",
        st.stddev_system_s,
        "no packet was served",
    );
    println!();
    line("token drop probability", st.token_drop_prob, "no token created");
    line("packet drop probability", st.packet_drop_prob, "no packet arrived");
}
