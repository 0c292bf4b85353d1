//! System load reading used by admission control.

/// Reports the one-minute load average divided by the CPU count. `None` when unknown.
pub trait LoadSource: Send + Sync {
    fn load_per_cpu(&self) -> Option<f64>;
}

impl<F> LoadSource for F
where
    F: Fn() -> Option<f64> + Send + Sync,
{
    fn load_per_cpu(&self) -> Option<f64> {
        self()
    }
}

/// Load average of this machine, via the OS.
#[derive(Debug, Clone)]
pub struct SystemLoad {
    cpus: f64,
}

impl SystemLoad {
    pub fn new() -> Self {
        Self {
            cpus: num_cpus::get().max(1) as f64,
        }
    }
}

impl Default for SystemLoad {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSource for SystemLoad {
    fn load_per_cpu(&self) -> Option<f64> {
        let one = sysinfo::System::load_average().one;
        // Platforms without a load average report zero or NaN.
        (one.is_finite() && one >= 0.0).then(|| one / self.cpus)
    }
}
