use trex_cpu::{ConfigError, CpuConfig};

/// Scheduling parameters plus the template every processor is configured from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Instructions each processor may run per round when more than one is configured.
    pub smp_quantum: u64,
    /// Instructions per round for a lone processor. Clamped to the next timer deadline.
    pub uniprocessor_quantum: u64,
    pub cpu: CpuConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            smp_quantum: 16,
            uniprocessor_quantum: u64::MAX,
            cpu: CpuConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.smp_quantum == 0 {
            return Err(ConfigError::ZeroQuantum("smp_quantum"));
        }
        if self.uniprocessor_quantum == 0 {
            return Err(ConfigError::ZeroQuantum("uniprocessor_quantum"));
        }
        self.cpu.validate()
    }

    /// Processor configuration for a machine with `processors` processors.
    ///
    /// With more than one processor, linking is turned off and traces are capped at one quantum,
    /// so every processor comes back to the scheduler at trace granularity.
    pub fn processor_config(&self, processors: usize) -> CpuConfig {
        let mut cpu = self.cpu.clone();
        if processors > 1 {
            cpu.link_traces = false;
            let quantum = usize::try_from(self.smp_quantum).unwrap_or(usize::MAX);
            cpu.max_trace_len = cpu.max_trace_len.min(quantum);
        }
        cpu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_quanta_are_rejected() {
        let config = SchedulerConfig {
            smp_quantum: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroQuantum("smp_quantum")));
        SchedulerConfig::default().validate().unwrap();
    }

    #[test]
    fn multiprocessor_config_disables_linking_and_caps_traces() {
        let config = SchedulerConfig::default();
        let single = config.processor_config(1);
        assert!(single.link_traces);
        assert_eq!(single.max_trace_len, 32);

        let smp = config.processor_config(4);
        assert!(!smp.link_traces);
        assert_eq!(smp.max_trace_len, 16);
    }
}
