//! The interference manager.
//!
//! For every non-writeback shared read the memory system reports
//! per-component measured latency (`add_latency`) and estimated
//! interference (`add_interference`). Every `sample_size` requests per
//! core the manager emits one line to that core's latency trace (the
//! measured shared latency per component) and one to its interference
//! trace (shared latency minus interference, the alone estimate).
//! Accumulators optionally reset every `reset_interval` samples.

use std::io::Write;

use crate::common::{CpuId, Tick};
use crate::mem::req::{LatencyKind, MemReq};

/// Per-core, per-component latency and interference accounting.
pub struct InterferenceManager {
    cpu_count: usize,
    sample_size: u64,
    reset_interval: Option<u64>,

    latency_sum: Vec<[Tick; LatencyKind::COUNT]>,
    interference_sum: Vec<[Tick; LatencyKind::COUNT]>,
    latency_reqs: Vec<[u64; LatencyKind::COUNT]>,
    interference_reqs: Vec<[u64; LatencyKind::COUNT]>,

    total_requests: Vec<u64>,
    running_latency_sum: Vec<Tick>,
    samples_taken: Vec<u64>,

    /// Lifetime round-trip latency per core.
    pub round_trip_latency: Vec<Tick>,
    /// Lifetime request count per core.
    pub requests: Vec<u64>,
    /// Lifetime interference ticks per core per component.
    pub lifetime_interference: Vec<[Tick; LatencyKind::COUNT]>,

    latency_trace: Option<Box<dyn Write>>,
    estimate_trace: Option<Box<dyn Write>>,
}

impl InterferenceManager {
    /// Creates the manager for `cpu_count` cores.
    pub fn new(cpu_count: usize, sample_size: u64, reset_interval: Option<u64>) -> Self {
        Self {
            cpu_count,
            sample_size,
            reset_interval,
            latency_sum: vec![[0; LatencyKind::COUNT]; cpu_count],
            interference_sum: vec![[0; LatencyKind::COUNT]; cpu_count],
            latency_reqs: vec![[0; LatencyKind::COUNT]; cpu_count],
            interference_reqs: vec![[0; LatencyKind::COUNT]; cpu_count],
            total_requests: vec![0; cpu_count],
            running_latency_sum: vec![0; cpu_count],
            samples_taken: vec![0; cpu_count],
            round_trip_latency: vec![0; cpu_count],
            requests: vec![0; cpu_count],
            lifetime_interference: vec![[0; LatencyKind::COUNT]; cpu_count],
            latency_trace: None,
            estimate_trace: None,
        }
    }

    /// Attaches trace sinks; a header row is written to each.
    pub fn attach_traces(&mut self, mut latency: Box<dyn Write>, mut estimate: Box<dyn Write>) {
        for sink in [&mut latency, &mut estimate] {
            let _ = write!(sink, "CPU,Requests,Total");
            for kind in LatencyKind::ALL {
                let _ = write!(sink, ",{}", kind.as_str());
            }
            let _ = writeln!(sink);
        }
        self.latency_trace = Some(latency);
        self.estimate_trace = Some(estimate);
    }

    /// Records measured shared-mode latency for one component.
    pub fn add_latency(&mut self, kind: LatencyKind, req: &MemReq, ticks: Tick) {
        debug_assert!(req.cmd.is_read());
        let cpu = req.true_requester;
        self.latency_sum[cpu][kind as usize] += ticks;
        self.latency_reqs[cpu][kind as usize] += 1;
    }

    /// Records estimated interference for one component.
    pub fn add_interference(&mut self, kind: LatencyKind, req: &MemReq, ticks: Tick) {
        debug_assert!(req.cmd.is_read());
        let cpu = req.true_requester;
        self.interference_sum[cpu][kind as usize] += ticks;
        self.interference_reqs[cpu][kind as usize] += 1;
        self.lifetime_interference[cpu][kind as usize] += ticks;
    }

    /// Folds a finished request's breakdown vectors into the
    /// accumulators and counts its round trip. Emits trace lines at each
    /// sample boundary.
    pub fn complete_request(&mut self, req: &MemReq, round_trip: Tick) {
        let cpu = req.true_requester;
        for kind in LatencyKind::ALL {
            let idx = kind as usize;
            if req.latency_breakdown[idx] > 0 {
                self.latency_sum[cpu][idx] += req.latency_breakdown[idx];
                self.latency_reqs[cpu][idx] += 1;
            }
            if req.interference_breakdown[idx] > 0 {
                self.interference_sum[cpu][idx] += req.interference_breakdown[idx];
                self.interference_reqs[cpu][idx] += 1;
                self.lifetime_interference[cpu][idx] += req.interference_breakdown[idx];
            }
        }
        self.running_latency_sum[cpu] += round_trip;
        self.total_requests[cpu] += 1;
        self.round_trip_latency[cpu] += round_trip;
        self.requests[cpu] += 1;

        if self.total_requests[cpu].is_multiple_of(self.sample_size) {
            self.samples_taken[cpu] += 1;
            let avg = self.trace_latency(cpu);
            self.trace_interference(cpu, &avg);
            if let Some(reset) = self.reset_interval {
                if self.samples_taken[cpu].is_multiple_of(reset) {
                    self.reset_measurements(cpu);
                }
            }
        }
    }

    /// Average measured latency per component for a core.
    pub fn average_latencies(&self, cpu: CpuId) -> [f64; LatencyKind::COUNT + 1] {
        let mut out = [0.0; LatencyKind::COUNT + 1];
        let n = self.total_requests[cpu].max(1) as f64;
        out[0] = self.running_latency_sum[cpu] as f64 / n;
        for kind in LatencyKind::ALL {
            out[kind as usize + 1] = self.latency_sum[cpu][kind as usize] as f64 / n;
        }
        out
    }

    /// Average interference per component for a core.
    pub fn average_interference(&self, cpu: CpuId) -> [f64; LatencyKind::COUNT] {
        let mut out = [0.0; LatencyKind::COUNT];
        let n = self.total_requests[cpu].max(1) as f64;
        for kind in LatencyKind::ALL {
            out[kind as usize] = self.interference_sum[cpu][kind as usize] as f64 / n;
        }
        out
    }

    fn trace_latency(&mut self, cpu: CpuId) -> [f64; LatencyKind::COUNT + 1] {
        let avg = self.average_latencies(cpu);
        if let Some(sink) = &mut self.latency_trace {
            let _ = write!(sink, "{cpu},{},{:.2}", self.requests[cpu], avg[0]);
            for kind in LatencyKind::ALL {
                let _ = write!(sink, ",{:.2}", avg[kind as usize + 1]);
            }
            let _ = writeln!(sink);
        }
        avg
    }

    fn trace_interference(&mut self, cpu: CpuId, avg_lats: &[f64; LatencyKind::COUNT + 1]) {
        let n = self.total_requests[cpu].max(1) as f64;
        let total_interference: f64 = self.interference_sum[cpu]
            .iter()
            .map(|&t| t as f64)
            .sum::<f64>()
            / n;
        if let Some(sink) = &mut self.estimate_trace {
            // The estimate line is shared latency minus interference:
            // the alone-mode projection.
            let _ = write!(
                sink,
                "{cpu},{},{:.2}",
                self.requests[cpu],
                avg_lats[0] - total_interference
            );
            for kind in LatencyKind::ALL {
                let avg_int = self.interference_sum[cpu][kind as usize] as f64 / n;
                let _ = write!(sink, ",{:.2}", avg_lats[kind as usize + 1] - avg_int);
            }
            let _ = writeln!(sink);
        }
    }

    fn reset_measurements(&mut self, cpu: CpuId) {
        self.latency_sum[cpu] = [0; LatencyKind::COUNT];
        self.interference_sum[cpu] = [0; LatencyKind::COUNT];
        self.latency_reqs[cpu] = [0; LatencyKind::COUNT];
        self.interference_reqs[cpu] = [0; LatencyKind::COUNT];
        self.total_requests[cpu] = 0;
        self.running_latency_sum[cpu] = 0;
    }

    /// Number of cores tracked.
    pub fn cpu_count(&self) -> usize {
        self.cpu_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::req::MemCmd;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct SharedSink(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn req(cpu: CpuId) -> MemReq {
        let mut r = MemReq::new(MemCmd::Read, 0x1000, 64, cpu, 0);
        r.true_requester = cpu;
        r
    }

    #[test]
    fn breakdowns_accumulate_per_component() {
        let mut man = InterferenceManager::new(2, 4, None);
        let mut r = req(0);
        r.add_latency(LatencyKind::MemoryBusService, 100);
        r.add_interference(LatencyKind::MemoryBusQueue, 30);
        man.complete_request(&r, 150);
        assert_eq!(man.requests[0], 1);
        assert_eq!(man.round_trip_latency[0], 150);
        assert_eq!(
            man.lifetime_interference[0][LatencyKind::MemoryBusQueue as usize],
            30
        );
    }

    #[test]
    fn sample_boundary_emits_trace_lines() {
        let lat_buf = Rc::new(RefCell::new(Vec::new()));
        let est_buf = Rc::new(RefCell::new(Vec::new()));
        let mut man = InterferenceManager::new(1, 2, None);
        man.attach_traces(
            Box::new(SharedSink(lat_buf.clone())),
            Box::new(SharedSink(est_buf.clone())),
        );
        for _ in 0..4 {
            let mut r = req(0);
            r.add_latency(LatencyKind::MemoryBusService, 100);
            r.add_interference(LatencyKind::MemoryBusService, 40);
            man.complete_request(&r, 100);
        }
        let lat = String::from_utf8(lat_buf.borrow().clone()).unwrap();
        let est = String::from_utf8(est_buf.borrow().clone()).unwrap();
        // Header plus one line per sample window of 2 requests.
        assert_eq!(lat.lines().count(), 3);
        assert_eq!(est.lines().count(), 3);
        assert!(lat.lines().next().unwrap().starts_with("CPU,Requests,Total"));
        // The estimate subtracts interference: 100 - 40 = 60 average.
        let est_line = est.lines().nth(1).unwrap();
        assert!(est_line.contains("60.00"), "line was: {est_line}");
    }

    #[test]
    fn reset_interval_drops_accumulators() {
        let mut man = InterferenceManager::new(1, 1, Some(2));
        for _ in 0..2 {
            let mut r = req(0);
            r.add_latency(LatencyKind::MemoryBusService, 100);
            man.complete_request(&r, 100);
        }
        // After two samples the window accumulators were reset, but the
        // lifetime counters survive.
        assert_eq!(man.total_requests[0], 0);
        assert_eq!(man.requests[0], 2);
    }
}
