use super::OutputLine;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Default)]
struct LineState {
    high: AtomicBool,
    writes: AtomicUsize,
    released: AtomicBool,
}

/// Output line that only exists in memory. Level changes are logged so a
/// bench run without relay hardware still shows what would have happened.
#[derive(Debug)]
pub struct SimulatedLine {
    pin: u8,
    state: Arc<LineState>,
}

/// Read-only view on a [`SimulatedLine`] that outlives the driver owning it.
#[derive(Clone, Debug)]
pub struct LineProbe {
    state: Arc<LineState>,
}

impl SimulatedLine {
    pub fn new(pin: u8) -> Self {
        Self {
            pin,
            state: Arc::new(LineState::default()),
        }
    }

    pub fn probe(&self) -> LineProbe {
        LineProbe {
            state: self.state.clone(),
        }
    }

    fn write(&mut self, high: bool) {
        self.state.high.store(high, Ordering::SeqCst);
        self.state.writes.fetch_add(1, Ordering::SeqCst);
        info!(
            "[simulated] pin {} -> {}",
            self.pin,
            if high { "HIGH" } else { "LOW" }
        );
    }
}

impl OutputLine for SimulatedLine {
    fn set_high(&mut self) {
        self.write(true);
    }

    fn set_low(&mut self) {
        self.write(false);
    }

    fn describe(&self) -> String {
        format!("simulated pin {}", self.pin)
    }
}

impl Drop for SimulatedLine {
    fn drop(&mut self) {
        self.state.released.store(true, Ordering::SeqCst);
    }
}

impl LineProbe {
    pub fn is_high(&self) -> bool {
        self.state.high.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.state.writes.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.state.released.load(Ordering::SeqCst)
    }
}
