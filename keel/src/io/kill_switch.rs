//! Wall-clock deadline and interrupt latch for a running task.
//!
//! The switch never kills anything itself. A timer thread flips a flag when
//! the deadline passes, the process-wide interrupt handler bumps a generation
//! counter, and the controller observes both through [`KillSwitch::check`]
//! at its next transition.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::types::AgentState;

const MINUTE: u64 = 60;

/// Kill switch tuning. Deserializes from the `[kill_switch]` config table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchConfig {
    /// Used when the stack is unknown.
    pub default_timeout_secs: u64,
    /// No extension or heartbeat moves the deadline past start + ceiling.
    pub hard_ceiling_secs: u64,
    /// Minimum remaining time guaranteed by a heartbeat.
    pub heartbeat_runway_secs: u64,
    /// Extra time granted to a known slow operation.
    pub slow_op_extension_secs: u64,
    /// Per-stack overrides (lowercase stack name -> seconds).
    pub stack_timeouts: BTreeMap<String, u64>,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30 * MINUTE,
            hard_ceiling_secs: 90 * MINUTE,
            heartbeat_runway_secs: 5 * MINUTE,
            slow_op_extension_secs: 10 * MINUTE,
            stack_timeouts: BTreeMap::new(),
        }
    }
}

impl KillSwitchConfig {
    pub fn hard_ceiling(&self) -> Duration {
        Duration::from_secs(self.hard_ceiling_secs)
    }

    pub fn heartbeat_runway(&self) -> Duration {
        Duration::from_secs(self.heartbeat_runway_secs)
    }

    pub fn slow_op_extension(&self) -> Duration {
        Duration::from_secs(self.slow_op_extension_secs)
    }

    /// Initial timeout for a stack, before the ceiling is applied.
    pub fn timeout_for_stack(&self, stack: &str) -> Duration {
        let key = stack.trim().to_ascii_lowercase();
        if let Some(secs) = self.stack_timeouts.get(&key) {
            return Duration::from_secs(*secs);
        }
        let minutes = match key.as_str() {
            "python" | "node" | "javascript" | "typescript" => 30,
            "go" | "golang" => 40,
            "java" | "kotlin" => 50,
            "rust" | "c++" | "cpp" | "docker" => 60,
            _ => return Duration::from_secs(self.default_timeout_secs),
        };
        Duration::from_secs(minutes * MINUTE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSignal {
    NotTriggered,
    Interrupted,
    TimedOut,
}

impl KillSignal {
    /// Terminal state the controller routes to for this signal.
    pub fn terminal_state(self) -> Option<AgentState> {
        match self {
            KillSignal::NotTriggered => None,
            KillSignal::Interrupted => Some(AgentState::FailedByInterrupt),
            KillSignal::TimedOut => Some(AgentState::FailedByTimeout),
        }
    }
}

static SLOW_OPERATIONS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\bdocker\s+build\b",
        r"\b(npm|yarn|pnpm)\s+(install|ci)\b",
        r"\bpip3?\s+install\b",
        r"\bcargo\s+build\b",
        r"\bmvn\b",
        r"\bgradlew?\b",
        r"\bgo\s+build\b",
        r"^\s*make\b",
        r"\btsc\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).unwrap())
    .collect()
});

static INTERRUPT_GENERATION: AtomicU64 = AtomicU64::new(0);
static HANDLER_INSTALLED: OnceLock<bool> = OnceLock::new();

/// Install the process-wide SIGINT/SIGTERM handler once.
fn install_interrupt_handler() -> bool {
    *HANDLER_INSTALLED.get_or_init(|| {
        match ctrlc::set_handler(|| {
            INTERRUPT_GENERATION.fetch_add(1, Ordering::SeqCst);
        }) {
            Ok(()) => {
                debug!("interrupt handler installed");
                true
            }
            Err(err) => {
                warn!(err = %err, "could not install interrupt handler");
                false
            }
        }
    })
}

#[derive(Debug)]
struct KillState {
    timed_out: AtomicBool,
    interrupted: AtomicBool,
    cancelled: AtomicBool,
    deadline: Mutex<Instant>,
    wake: Condvar,
}

impl KillState {
    fn new(deadline: Instant) -> Self {
        Self {
            timed_out: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            deadline: Mutex::new(deadline),
            wake: Condvar::new(),
        }
    }

    fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_deadline(&self, deadline: Instant) {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = deadline;
        self.wake.notify_all();
    }
}

fn timer_loop(state: Arc<KillState>) {
    let mut deadline = state.deadline.lock().unwrap_or_else(PoisonError::into_inner);
    loop {
        if state.cancelled.load(Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        if now >= *deadline {
            state.timed_out.store(true, Ordering::SeqCst);
            warn!("kill switch deadline passed");
            return;
        }
        let wait = *deadline - now;
        deadline = match state.wake.wait_timeout(deadline, wait) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        };
    }
}

#[derive(Debug)]
pub struct KillSwitch {
    config: KillSwitchConfig,
    timeout: Duration,
    started: Option<Instant>,
    state: Arc<KillState>,
    timer: Option<JoinHandle<()>>,
    interrupt_baseline: Option<u64>,
}

impl KillSwitch {
    /// A switch whose initial deadline depends on the project stack.
    pub fn for_stack(stack: &str, config: KillSwitchConfig) -> Self {
        let timeout = config.timeout_for_stack(stack);
        Self::with_timeout(timeout, config)
    }

    /// A switch with an explicit initial timeout (clamped to the ceiling).
    pub fn with_timeout(timeout: Duration, config: KillSwitchConfig) -> Self {
        let timeout = timeout.min(config.hard_ceiling());
        Self {
            config,
            timeout,
            started: None,
            state: Arc::new(KillState::new(Instant::now() + timeout)),
            timer: None,
            interrupt_baseline: None,
        }
    }

    pub fn config(&self) -> &KillSwitchConfig {
        &self.config
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    /// Start the clock. Re-arming resets any latched signal.
    pub fn arm(&mut self) {
        self.disarm();
        let now = Instant::now();
        self.started = Some(now);
        self.state = Arc::new(KillState::new(now + self.timeout));
        let state = Arc::clone(&self.state);
        self.timer = Some(thread::spawn(move || timer_loop(state)));

        // Only the main thread owns process signals; workers rely on the
        // embedder calling trigger_interrupt.
        if thread::current().name() == Some("main") && install_interrupt_handler() {
            self.interrupt_baseline = Some(INTERRUPT_GENERATION.load(Ordering::SeqCst));
        }
        info!(timeout_secs = self.timeout.as_secs(), "kill switch armed");
    }

    /// Current signal. Once triggered it stays triggered until re-armed;
    /// an interrupt wins over a timeout.
    pub fn check(&self) -> KillSignal {
        if let Some(baseline) = self.interrupt_baseline
            && INTERRUPT_GENERATION.load(Ordering::SeqCst) > baseline
        {
            self.state.interrupted.store(true, Ordering::SeqCst);
        }
        if self.state.interrupted.load(Ordering::SeqCst) {
            return KillSignal::Interrupted;
        }
        if self.is_armed() && Instant::now() >= self.state.deadline() {
            self.state.timed_out.store(true, Ordering::SeqCst);
        }
        if self.state.timed_out.load(Ordering::SeqCst) {
            return KillSignal::TimedOut;
        }
        KillSignal::NotTriggered
    }

    /// Time left before the deadline (zero once passed).
    pub fn remaining(&self) -> Duration {
        if !self.is_armed() {
            return self.timeout;
        }
        self.state
            .deadline()
            .saturating_duration_since(Instant::now())
    }

    fn ceiling_at(&self) -> Option<Instant> {
        self.started.map(|start| start + self.config.hard_ceiling())
    }

    /// Push the deadline forward by `extra`, never past the hard ceiling.
    /// Returns the new remaining time.
    pub fn extend(&mut self, reason: &str, extra: Duration) -> Duration {
        let Some(ceiling) = self.ceiling_at().filter(|_| self.is_armed()) else {
            self.timeout = (self.timeout + extra).min(self.config.hard_ceiling());
            return self.timeout;
        };
        let deadline = (self.state.deadline() + extra).min(ceiling);
        self.state.set_deadline(deadline);
        let remaining = self.remaining();
        info!(reason, remaining_secs = remaining.as_secs(), "kill switch extended");
        remaining
    }

    /// Extension for a known slow operation, if `command` is one.
    pub fn extension_for(&self, command: &str) -> Option<Duration> {
        SLOW_OPERATIONS
            .iter()
            .any(|re| re.is_match(command))
            .then(|| self.config.slow_op_extension())
    }

    /// Guarantee at least the heartbeat runway, capped by the ceiling.
    pub fn heartbeat(&mut self) -> Duration {
        if let Some(ceiling) = self.ceiling_at()
            && self.is_armed()
        {
            let floor = (Instant::now() + self.config.heartbeat_runway()).min(ceiling);
            if floor > self.state.deadline() {
                self.state.set_deadline(floor);
                debug!("heartbeat moved deadline");
            }
        }
        self.remaining()
    }

    /// Deliver an interrupt without a process signal.
    pub fn trigger_interrupt(&self) {
        warn!("interrupt delivered");
        self.state.interrupted.store(true, Ordering::SeqCst);
    }

    /// Stop the timer thread and drop the interrupt subscription. Latched
    /// signals remain visible until the next `arm`.
    pub fn disarm(&mut self) {
        self.interrupt_baseline = None;
        let Some(handle) = self.timer.take() else {
            return;
        };
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.wake.notify_all();
        if handle.join().is_err() {
            warn!("kill switch timer thread panicked");
        }
        debug!("kill switch disarmed");
    }
}

impl Drop for KillSwitch {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ceiling_secs: u64) -> KillSwitchConfig {
        KillSwitchConfig {
            hard_ceiling_secs: ceiling_secs,
            heartbeat_runway_secs: 30,
            ..KillSwitchConfig::default()
        }
    }

    #[test]
    fn stack_timeouts_follow_the_table() {
        let cfg = KillSwitchConfig::default();
        assert_eq!(cfg.timeout_for_stack("Python"), Duration::from_secs(30 * 60));
        assert_eq!(cfg.timeout_for_stack("go"), Duration::from_secs(40 * 60));
        assert_eq!(cfg.timeout_for_stack("kotlin"), Duration::from_secs(50 * 60));
        assert_eq!(cfg.timeout_for_stack("rust"), Duration::from_secs(60 * 60));
        assert_eq!(cfg.timeout_for_stack("cobol"), Duration::from_secs(30 * 60));
    }

    #[test]
    fn initial_timeout_is_clamped_to_the_ceiling() {
        let switch = KillSwitch::for_stack("rust", config(600));
        assert_eq!(switch.remaining(), Duration::from_secs(600));
    }

    #[test]
    fn times_out_and_latches() {
        let mut switch = KillSwitch::with_timeout(Duration::from_millis(50), config(60));
        switch.arm();
        assert_eq!(switch.check(), KillSignal::NotTriggered);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(switch.check(), KillSignal::TimedOut);
        switch.heartbeat();
        assert_eq!(switch.check(), KillSignal::TimedOut);
        switch.disarm();
        assert_eq!(switch.check(), KillSignal::TimedOut);
    }

    #[test]
    fn interrupt_latches_and_wins_over_timeout() {
        let mut switch = KillSwitch::with_timeout(Duration::from_millis(10), config(60));
        switch.arm();
        thread::sleep(Duration::from_millis(50));
        switch.trigger_interrupt();
        assert_eq!(switch.check(), KillSignal::Interrupted);
        assert_eq!(
            switch.check().terminal_state(),
            Some(AgentState::FailedByInterrupt)
        );
    }

    #[test]
    fn rearming_clears_latched_signals() {
        let mut switch = KillSwitch::with_timeout(Duration::from_secs(30), config(60));
        switch.arm();
        switch.trigger_interrupt();
        assert_eq!(switch.check(), KillSignal::Interrupted);
        switch.arm();
        assert_eq!(switch.check(), KillSignal::NotTriggered);
    }

    #[test]
    fn extension_never_passes_the_ceiling() {
        let mut switch = KillSwitch::with_timeout(Duration::from_secs(10), config(20));
        switch.arm();
        let remaining = switch.extend("docker build", Duration::from_secs(3600));
        assert!(remaining <= Duration::from_secs(20));
        assert!(remaining > Duration::from_secs(15));
    }

    #[test]
    fn heartbeat_guarantees_runway() {
        let mut switch = KillSwitch::with_timeout(Duration::from_secs(1), config(600));
        switch.arm();
        let remaining = switch.heartbeat();
        assert!(remaining > Duration::from_secs(25));
        assert_eq!(switch.check(), KillSignal::NotTriggered);
    }

    #[test]
    fn slow_operations_get_an_extension() {
        let switch = KillSwitch::with_timeout(Duration::from_secs(60), KillSwitchConfig::default());
        assert_eq!(
            switch.extension_for("npm install"),
            Some(Duration::from_secs(600))
        );
        assert_eq!(
            switch.extension_for("docker build -t app ."),
            Some(Duration::from_secs(600))
        );
        assert_eq!(switch.extension_for("pytest tests/"), None);
    }

    #[test]
    fn unarmed_switch_never_times_out() {
        let switch = KillSwitch::with_timeout(Duration::ZERO, config(60));
        assert_eq!(switch.check(), KillSignal::NotTriggered);
    }
}
