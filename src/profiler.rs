use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use instant::Instant;

/// Observes kernel launches. Never affects control flow.
pub trait KernelProfiler {
    fn begin_kernel(&self, name: &str, tensors: usize) {
        let _ = (name, tensors);
    }

    fn end_kernel(&self, name: &str) {
        let _ = name;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProfiler;

impl KernelProfiler for NoopProfiler {}

impl<P: KernelProfiler + ?Sized> KernelProfiler for &P {
    fn begin_kernel(&self, name: &str, tensors: usize) {
        (**self).begin_kernel(name, tensors)
    }

    fn end_kernel(&self, name: &str) {
        (**self).end_kernel(name)
    }
}

#[derive(Debug, Clone)]
pub struct TimingResult {
    pub name: String,
    pub tensors: usize,
    pub duration_ns: u64,
}

#[derive(Debug)]
struct TimerInner {
    open: Vec<(String, usize, Instant)>,
    results: Vec<TimingResult>,
    enabled: bool,
}

/// Host-side wall-clock timer for encoded kernel batches.
///
/// Measures how long the host spends packing and encoding a call, not device
/// execution time.
#[derive(Debug, Clone)]
pub struct KernelTimer {
    inner: Arc<Mutex<TimerInner>>,
}

impl Default for KernelTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelTimer {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TimerInner {
                open: Vec::new(),
                results: Vec::new(),
                enabled: true,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.lock().enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().enabled
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.open.clear();
        inner.results.clear();
    }

    pub fn results(&self) -> Vec<TimingResult> {
        self.lock().results.clone()
    }

    pub fn aggregate_results(results: &[TimingResult]) -> HashMap<String, (u64, usize)> {
        let mut aggregated: HashMap<String, (u64, usize)> = HashMap::new();
        for result in results {
            let entry = aggregated.entry(result.name.clone()).or_insert((0, 0));
            entry.0 += result.duration_ns;
            entry.1 += 1;
        }
        aggregated
    }

    pub fn print_results(results: &[TimingResult]) {
        let aggregated = Self::aggregate_results(results);
        let mut sorted: Vec<_> = aggregated.into_iter().collect();
        sorted.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then_with(|| a.0.cmp(&b.0)));

        let total_ns: u64 = sorted.iter().map(|(_, (ns, _))| ns).sum();

        println!("\n=== Kernel Encoding Times ===");
        println!(
            "{:<40} {:>12} {:>8} {:>10}",
            "Kernel", "Time (ms)", "Count", "% Total"
        );
        println!("{}", "-".repeat(74));

        for (name, (total_time_ns, count)) in &sorted {
            let time_ms = *total_time_ns as f64 / 1_000_000.0;
            let percent = match total_ns {
                0 => 0.0,
                total => (*total_time_ns as f64 / total as f64) * 100.0,
            };
            println!(
                "{:<40} {:>12.3} {:>8} {:>9.1}%",
                name, time_ms, count, percent
            );
        }

        println!("{}", "-".repeat(74));
        println!("{:<40} {:>12.3}", "Total", total_ns as f64 / 1_000_000.0);
    }
}

impl KernelProfiler for KernelTimer {
    fn begin_kernel(&self, name: &str, tensors: usize) {
        let mut inner = self.lock();
        if inner.enabled {
            inner.open.push((name.to_string(), tensors, Instant::now()));
        }
    }

    fn end_kernel(&self, name: &str) {
        let mut inner = self.lock();
        let Some(position) = inner.open.iter().rposition(|(open, _, _)| open == name) else {
            return;
        };
        let (name, tensors, start) = inner.open.remove(position);
        let duration_ns = start.elapsed().as_nanos() as u64;
        inner.results.push(TimingResult {
            name,
            tensors,
            duration_ns,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_pairs_begin_and_end() {
        let timer = KernelTimer::new();
        timer.begin_kernel("fused_adam_float_float", 3);
        timer.end_kernel("fused_adam_float_float");
        timer.end_kernel("never_started");

        let results = timer.results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "fused_adam_float_float");
        assert_eq!(results[0].tensors, 3);
    }

    #[test]
    fn test_disabled_timer_records_nothing() {
        let timer = KernelTimer::new();
        timer.set_enabled(false);
        timer.begin_kernel("k", 1);
        timer.end_kernel("k");
        assert!(timer.results().is_empty());
    }

    #[test]
    fn test_aggregate_results() {
        let results = vec![
            TimingResult {
                name: "a".into(),
                tensors: 1,
                duration_ns: 10,
            },
            TimingResult {
                name: "b".into(),
                tensors: 2,
                duration_ns: 5,
            },
            TimingResult {
                name: "a".into(),
                tensors: 4,
                duration_ns: 30,
            },
        ];
        let aggregated = KernelTimer::aggregate_results(&results);
        assert_eq!(aggregated["a"], (40, 2));
        assert_eq!(aggregated["b"], (5, 1));
    }
}
