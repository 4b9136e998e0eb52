//! The leaky-bucket emulator.
//!
//! Four worker threads — packet arrivals, token arrivals, and two servers —
//! plus the signal path share one mutex-protected state and one condition
//! variable. Packets wait in Q1 until the bucket can pay their token cost,
//! move to Q2, and are drained by whichever server is free; a SIGINT stops
//! arrivals and drains both queues.

use crate::stats::{self, Stats};
use crate::trace::{timestamp, TraceRecord};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Intervals are capped at ten seconds, whatever the rates say.
const MAX_INTERVAL_US: u64 = 10_000_000;

#[derive(Debug, Clone)]
pub struct Config {
    /// Packet arrival rate, packets per second.
    pub lambda: f64,
    /// Service rate, packets per second.
    pub mu: f64,
    /// Token arrival rate, tokens per second.
    pub rate: f64,
    /// Bucket depth.
    pub bucket: u64,
    /// Tokens required per packet.
    pub tokens_per_packet: u64,
    /// Number of packets to arrive.
    pub num: u64,
    /// Per-packet records; overrides lambda/mu/P when present.
    pub trace: Option<Vec<TraceRecord>>,
    /// Suppress the event trace (tests).
    pub quiet: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            lambda: 1.0,
            mu: 0.35,
            rate: 1.5,
            bucket: 10,
            tokens_per_packet: 3,
            num: 20,
            trace: None,
            quiet: false,
        }
    }
}

fn rate_to_interval_us(rate: f64) -> u64 {
    let ms = (1000.0 / rate).round();
    if !ms.is_finite() || ms < 0.0 || ms >= (MAX_INTERVAL_US / 1000) as f64 {
        return MAX_INTERVAL_US;
    }
    (ms as u64) * 1000
}

impl Config {
    fn token_interval_us(&self) -> u64 {
        rate_to_interval_us(self.rate)
    }

    /// (inter-arrival, token need, service time) for packet `seq`.
    fn packet_params(&self, seq: usize) -> (u64, u64, u64) {
        match &self.trace {
            Some(records) => {
                let r = records[seq];
                (
                    r.inter_arrival_ms.saturating_mul(1000).min(MAX_INTERVAL_US),
                    r.tokens,
                    r.service_ms.saturating_mul(1000).min(MAX_INTERVAL_US),
                )
            }
            None => (
                rate_to_interval_us(self.lambda),
                self.tokens_per_packet,
                rate_to_interval_us(self.mu),
            ),
        }
    }
}

/// What finally happened to a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Served { server: u8 },
    Dropped,
    Removed,
}

/// One packet, with every timestamp the statistics need (microseconds since
/// emulation start).
#[derive(Debug, Clone)]
pub struct Packet {
    pub id: u64,
    pub need: u64,
    pub service_us: u64,
    pub real_inter_us: u64,
    pub arrive_us: u64,
    pub enter_q1_us: u64,
    pub leave_q1_us: u64,
    pub enter_q2_us: u64,
    pub leave_q2_us: u64,
    pub begin_svc_us: u64,
    pub end_svc_us: u64,
    pub outcome: Outcome,
}

struct Shared {
    q1: VecDeque<Packet>,
    q2: VecDeque<Packet>,
    done: Vec<Packet>,
    tokens: u64,
    token_count: u64,
    token_drops: u64,
    /// Packets that have not arrived yet.
    remaining: u64,
    arrivals_done: bool,
    stopped: bool,
}

pub struct Emulator {
    cfg: Config,
    state: Mutex<Shared>,
    cv: Condvar,
    start: Instant,
}

impl Emulator {
    pub fn new(cfg: Config) -> Arc<Emulator> {
        let remaining = cfg.num;
        Arc::new(Emulator {
            cfg,
            state: Mutex::new(Shared {
                q1: VecDeque::new(),
                q2: VecDeque::new(),
                done: Vec::new(),
                tokens: 0,
                token_count: 0,
                token_drops: 0,
                remaining,
                arrivals_done: false,
                stopped: false,
            }),
            cv: Condvar::new(),
            start: Instant::now(),
        })
    }

    fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn say(&self, msg: String) {
        if !self.cfg.quiet {
            println!("{}ms: {}", timestamp(self.now_us()), msg);
        }
    }

    /// Move the head of Q1 to Q2 if the bucket can pay for it. Called with
    /// the state lock held, after any token or packet arrival.
    fn try_dispatch(&self, st: &mut Shared) -> bool {
        let affordable = matches!(st.q1.front(), Some(p) if p.need <= st.tokens);
        if !affordable {
            return false;
        }
        let mut p = st.q1.pop_front().expect("q1 head vanished");
        st.tokens -= p.need;
        p.leave_q1_us = self.now_us();
        let in_q1_ms = (p.leave_q1_us - p.enter_q1_us) as f64 / 1000.0;
        self.say(format!(
            "p{} leaves Q1, time in Q1 = {:.3}ms, token bucket now has {} tokens",
            p.id, in_q1_ms, st.tokens
        ));
        p.enter_q2_us = self.now_us();
        self.say(format!("p{} enters Q2", p.id));
        st.q2.push_back(p);
        true
    }

    fn arrival_loop(&self) {
        let mut seq: usize = 0;
        let mut prev_arrival_us: u64 = 0;
        loop {
            {
                let st = self.state.lock().unwrap();
                if st.remaining == 0 || st.stopped {
                    break;
                }
            }
            let (inter_us, need, service_us) = self.cfg.packet_params(seq);
            if inter_us > 0 {
                std::thread::sleep(Duration::from_micros(inter_us));
            }

            let mut st = self.state.lock().unwrap();
            if st.remaining == 0 || st.stopped {
                break;
            }
            st.remaining -= 1;
            seq += 1;

            let now = self.now_us();
            let real_inter = now - prev_arrival_us;
            prev_arrival_us = now;

            let mut p = Packet {
                id: seq as u64,
                need,
                service_us,
                real_inter_us: real_inter,
                arrive_us: now,
                enter_q1_us: 0,
                leave_q1_us: 0,
                enter_q2_us: 0,
                leave_q2_us: 0,
                begin_svc_us: 0,
                end_svc_us: 0,
                outcome: Outcome::Pending,
            };

            let inter_ms = real_inter as f64 / 1000.0;
            if p.need > self.cfg.bucket {
                // Can never be paid for: drop on arrival.
                p.outcome = Outcome::Dropped;
                self.say(format!(
                    "p{} arrives, needs {} tokens, inter-arrival time = {:.3}ms, dropped",
                    p.id, p.need, inter_ms
                ));
                st.done.push(p);
            } else {
                self.say(format!(
                    "p{} arrives, needs {} tokens, inter-arrival time = {:.3}ms",
                    p.id, p.need, inter_ms
                ));
                p.enter_q1_us = self.now_us();
                self.say(format!("p{} enters Q1", p.id));
                st.q1.push_back(p);
                if self.try_dispatch(&mut st) {
                    self.cv.notify_all();
                }
            }
        }

        let mut st = self.state.lock().unwrap();
        st.arrivals_done = true;
        self.cv.notify_all();
    }

    fn token_loop(&self) {
        loop {
            {
                let st = self.state.lock().unwrap();
                if st.stopped || (st.remaining == 0 && st.q1.is_empty()) {
                    break;
                }
            }
            let interval = self.cfg.token_interval_us();
            if interval > 0 {
                std::thread::sleep(Duration::from_micros(interval));
            }

            let mut st = self.state.lock().unwrap();
            if st.stopped || (st.remaining == 0 && st.q1.is_empty()) {
                break;
            }
            st.token_count += 1;
            let id = st.token_count;
            if st.tokens >= self.cfg.bucket {
                st.token_drops += 1;
                self.say(format!("token t{} arrives, dropped", id));
            } else {
                st.tokens += 1;
                self.say(format!(
                    "token t{} arrives, token bucket now has {} tokens",
                    id, st.tokens
                ));
            }
            if self.try_dispatch(&mut st) {
                self.cv.notify_all();
            }
        }
    }

    fn server_loop(&self, server: u8) {
        loop {
            let mut p = {
                let mut st = self.state.lock().unwrap();
                loop {
                    if let Some(p) = st.q2.pop_front() {
                        break p;
                    }
                    let finished =
                        st.stopped || (st.arrivals_done && st.q1.is_empty() && st.q2.is_empty());
                    if finished {
                        return;
                    }
                    st = self.cv.wait(st).unwrap();
                }
            };

            p.leave_q2_us = self.now_us();
            let in_q2_ms = (p.leave_q2_us - p.enter_q2_us) as f64 / 1000.0;
            self.say(format!("p{} leaves Q2, time in Q2 = {:.3}ms", p.id, in_q2_ms));
            p.begin_svc_us = self.now_us();
            p.outcome = Outcome::Served { server };
            self.say(format!(
                "p{} begins service at S{}, requesting {:.0}ms of service",
                p.id,
                server,
                p.service_us as f64 / 1000.0
            ));

            if p.service_us > 0 {
                std::thread::sleep(Duration::from_micros(p.service_us));
            }

            p.end_svc_us = self.now_us();
            let service_ms = (p.end_svc_us - p.begin_svc_us) as f64 / 1000.0;
            let system_ms = (p.end_svc_us - p.arrive_us) as f64 / 1000.0;
            self.say(format!(
                "p{} departs from S{}, service time = {:.3}ms, time in system = {:.3}ms",
                p.id, server, service_ms, system_ms
            ));
            self.state.lock().unwrap().done.push(p);
        }
    }

    /// SIGINT: stop arrivals and tokens, drain both queues, wake everyone.
    pub fn interrupt(&self) {
        let mut st = self.state.lock().unwrap();
        if st.stopped {
            return;
        }
        if !self.cfg.quiet {
            println!(
                "\n{}ms: SIGINT caught, no new packets or tokens will be allowed",
                timestamp(self.now_us())
            );
        }
        while let Some(mut p) = st.q1.pop_front() {
            p.outcome = Outcome::Removed;
            self.say(format!("p{} removed from Q1", p.id));
            st.done.push(p);
        }
        while let Some(mut p) = st.q2.pop_front() {
            p.outcome = Outcome::Removed;
            self.say(format!("p{} removed from Q2", p.id));
            st.done.push(p);
        }
        st.remaining = 0;
        st.stopped = true;
        self.cv.notify_all();
    }

    /// Run the emulation to completion and return the statistics.
    pub fn run(self: &Arc<Emulator>) -> Stats {
        self.say(String::from("emulation begins"));

        let mut handles = Vec::new();
        {
            let me = self.clone();
            handles.push(std::thread::spawn(move || me.arrival_loop()));
        }
        {
            let me = self.clone();
            handles.push(std::thread::spawn(move || me.token_loop()));
        }
        for server in [1u8, 2u8] {
            let me = self.clone();
            handles.push(std::thread::spawn(move || me.server_loop(server)));
        }
        for h in handles {
            h.join().expect("emulator thread panicked");
        }

        let total_us = self.now_us();
        self.say(String::from("emulation ends"));

        let st = self.state.lock().unwrap();
        let computed = stats::compute(&st.done, total_us, st.token_count, st.token_drops);
        log::debug!(
            "{} arrived / {} served / {} dropped / {} removed",
            computed.arrived,
            computed.served,
            computed.dropped,
            computed.removed
        );
        computed
    }
}
