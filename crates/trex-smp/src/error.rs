use trex_cpu::ConfigError;
use trex_mem::GuestMemoryError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MachineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("no processor {cpu} (machine has {processors})")]
    NoSuchProcessor { cpu: usize, processors: usize },
    #[error(transparent)]
    Memory(#[from] GuestMemoryError),
}
