//! Paging instrumentation
//!
//! Provides tracing and statistics for the VM subsystem.
//!
//! Design:
//! - Lightweight event tracing, ordered by a sequence number
//! - Counters for faults, evictions and swap traffic that always run
//! - Ring buffer for recent events (bounded memory)
//! - Event recording is off until enabled

use super::process::Pid;
use std::collections::VecDeque;

/// Maximum number of events to keep in the trace buffer
const TRACE_BUFFER_SIZE: usize = 1000;

/// Trace event categories
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceCategory {
    /// Page faults and how they were satisfied
    Fault,
    /// Clock victims
    Evict,
    /// Swap slot traffic
    Swap,
    /// Waits for a pinned-out frame pool
    Pin,
    /// Address space load/unload
    Process,
}

impl std::fmt::Display for TraceCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceCategory::Fault => write!(f, "FAULT"),
            TraceCategory::Evict => write!(f, "EVICT"),
            TraceCategory::Swap => write!(f, "SWAP"),
            TraceCategory::Pin => write!(f, "PIN"),
            TraceCategory::Process => write!(f, "PROCESS"),
        }
    }
}

/// A single trace event
#[derive(Debug, Clone)]
pub struct TraceEvent {
    /// Position in the global event order
    pub seq: u64,
    pub category: TraceCategory,
    pub name: String,
    pub detail: Option<String>,
    pub pid: Option<Pid>,
}

impl TraceEvent {
    pub fn instant(category: TraceCategory, name: impl Into<String>) -> Self {
        Self {
            seq: 0,
            category,
            name: name.into(),
            detail: None,
            pid: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_pid(mut self, pid: Pid) -> Self {
        self.pid = Some(pid);
        self
    }
}

impl std::fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} [{}] {}", self.seq, self.category, self.name)?;
        if let Some(pid) = self.pid {
            write!(f, " {}", pid)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, " {}", detail)?;
        }
        Ok(())
    }
}

/// Paging counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagingStats {
    /// Faults that installed a page
    pub faults: u64,
    /// Faults dropped because the address was outside the address space
    pub ignored_faults: u64,
    pub evictions: u64,
    pub swap_outs: u64,
    pub swap_ins: u64,
    pub zero_fills: u64,
    pub section_loads: u64,
    /// Times a fault blocked on a fully pinned frame pool
    pub waits: u64,
    pub processes_loaded: u64,
    pub processes_unloaded: u64,
}

impl PagingStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The paging tracer
#[derive(Debug)]
pub struct Tracer {
    enabled: bool,
    /// Category filter (None = all)
    filter: Option<Vec<TraceCategory>>,
    events: VecDeque<TraceEvent>,
    next_seq: u64,
    pub stats: PagingStats,
}

impl Tracer {
    pub fn new() -> Self {
        Self {
            enabled: false,
            filter: None,
            events: VecDeque::with_capacity(TRACE_BUFFER_SIZE),
            next_seq: 0,
            stats: PagingStats::new(),
        }
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Set category filter (None = trace all)
    pub fn set_filter(&mut self, categories: Option<Vec<TraceCategory>>) {
        self.filter = categories;
    }

    fn should_trace(&self, category: TraceCategory) -> bool {
        if !self.enabled {
            return false;
        }
        match &self.filter {
            None => true,
            Some(cats) => cats.contains(&category),
        }
    }

    /// Record a trace event, stamping its sequence number
    pub fn trace(&mut self, mut event: TraceEvent) {
        if !self.should_trace(event.category) {
            return;
        }
        event.seq = self.next_seq;
        self.next_seq += 1;

        if self.events.len() >= TRACE_BUFFER_SIZE {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn events(&self) -> &VecDeque<TraceEvent> {
        &self.events
    }

    pub fn events_by_category(&self, category: TraceCategory) -> Vec<&TraceEvent> {
        self.events
            .iter()
            .filter(|e| e.category == category)
            .collect()
    }

    pub fn events_by_pid(&self, pid: Pid) -> Vec<&TraceEvent> {
        self.events
            .iter()
            .filter(|e| e.pid == Some(pid))
            .collect()
    }

    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    /// Reset everything (events and stats)
    pub fn reset(&mut self) {
        self.clear_events();
        self.stats = PagingStats::new();
    }

    pub fn summary(&self) -> TraceSummary {
        TraceSummary {
            enabled: self.enabled,
            event_count: self.events.len(),
            stats: self.stats,
        }
    }
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary of trace/stats data
#[derive(Debug, Clone)]
pub struct TraceSummary {
    pub enabled: bool,
    pub event_count: usize,
    pub stats: PagingStats,
}

impl std::fmt::Display for TraceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = &self.stats;
        writeln!(f, "=== Paging Statistics ===")?;
        writeln!(f, "Tracing: {}", if self.enabled { "ON" } else { "OFF" })?;
        writeln!(f, "Events buffered: {}", self.event_count)?;
        writeln!(f)?;
        writeln!(f, "--- Faults ---")?;
        writeln!(f, "Handled: {}", s.faults)?;
        writeln!(f, "Ignored: {}", s.ignored_faults)?;
        writeln!(f, "Section loads: {}", s.section_loads)?;
        writeln!(f, "Zero fills: {}", s.zero_fills)?;
        writeln!(f, "Pool waits: {}", s.waits)?;
        writeln!(f)?;
        writeln!(f, "--- Replacement ---")?;
        writeln!(f, "Evictions: {}", s.evictions)?;
        writeln!(f, "Swap outs: {}", s.swap_outs)?;
        writeln!(f, "Swap ins: {}", s.swap_ins)?;
        writeln!(f)?;
        writeln!(f, "--- Processes ---")?;
        writeln!(f, "Loaded: {}", s.processes_loaded)?;
        writeln!(f, "Unloaded: {}", s.processes_unloaded)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracer_disabled_by_default() {
        let tracer = Tracer::new();
        assert!(!tracer.is_enabled());
    }

    #[test]
    fn test_tracer_enable_disable() {
        let mut tracer = Tracer::new();
        tracer.enable();
        assert!(tracer.is_enabled());
        tracer.disable();
        assert!(!tracer.is_enabled());
    }

    #[test]
    fn test_trace_event_builders() {
        let event = TraceEvent::instant(TraceCategory::Fault, "zero-fill")
            .with_pid(Pid(3))
            .with_detail("vpn 4 -> frame 1");
        assert_eq!(event.pid, Some(Pid(3)));
        assert_eq!(event.detail.as_deref(), Some("vpn 4 -> frame 1"));
        assert_eq!(event.to_string(), "#0 [FAULT] zero-fill pid:3 vpn 4 -> frame 1");
    }

    #[test]
    fn test_tracer_records_in_order() {
        let mut tracer = Tracer::new();
        tracer.enable();

        tracer.trace(TraceEvent::instant(TraceCategory::Fault, "a"));
        tracer.trace(TraceEvent::instant(TraceCategory::Evict, "b"));
        tracer.trace(TraceEvent::instant(TraceCategory::Swap, "c"));

        let seqs: Vec<u64> = tracer.events().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_tracer_filter() {
        let mut tracer = Tracer::new();
        tracer.enable();
        tracer.set_filter(Some(vec![TraceCategory::Evict]));

        tracer.trace(TraceEvent::instant(TraceCategory::Fault, "fault"));
        tracer.trace(TraceEvent::instant(TraceCategory::Evict, "evict"));

        assert_eq!(tracer.events().len(), 1);
        assert_eq!(tracer.events_by_category(TraceCategory::Evict).len(), 1);
    }

    #[test]
    fn test_tracer_ring_buffer() {
        let mut tracer = Tracer::new();
        tracer.enable();

        for _ in 0..TRACE_BUFFER_SIZE + 100 {
            tracer.trace(TraceEvent::instant(TraceCategory::Fault, "test"));
        }

        assert_eq!(tracer.events().len(), TRACE_BUFFER_SIZE);
        assert_eq!(tracer.events().front().unwrap().seq, 100);
    }

    #[test]
    fn test_events_by_pid() {
        let mut tracer = Tracer::new();
        tracer.enable();

        tracer.trace(TraceEvent::instant(TraceCategory::Fault, "a").with_pid(Pid(1)));
        tracer.trace(TraceEvent::instant(TraceCategory::Fault, "b").with_pid(Pid(2)));
        tracer.trace(TraceEvent::instant(TraceCategory::Evict, "c").with_pid(Pid(1)));

        assert_eq!(tracer.events_by_pid(Pid(1)).len(), 2);
    }

    #[test]
    fn test_reset() {
        let mut tracer = Tracer::new();
        tracer.enable();
        tracer.trace(TraceEvent::instant(TraceCategory::Fault, "test"));
        tracer.stats.faults = 10;

        tracer.reset();

        assert!(tracer.events().is_empty());
        assert_eq!(tracer.stats, PagingStats::default());
    }

    #[test]
    fn test_disabled_tracer_no_events() {
        let mut tracer = Tracer::new();
        tracer.trace(TraceEvent::instant(TraceCategory::Fault, "a"));
        assert!(tracer.events().is_empty());
    }

    #[test]
    fn test_summary_display() {
        let mut tracer = Tracer::new();
        tracer.stats.evictions = 7;
        let text = tracer.summary().to_string();
        assert!(text.contains("Evictions: 7"));
        assert!(text.contains("Tracing: OFF"));
    }
}
