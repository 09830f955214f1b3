use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Bad file type: {0}")]
    BadFileType(String),

    #[error("Pool file is corrupt: {0}")]
    Corrupt(String),

    #[error("Out of space: no segment can hold {blocks} contiguous blocks")]
    OutOfSpace { blocks: u32 },

    #[error("Allocation of {size} bytes exceeds the per-segment maximum of {max} bytes")]
    AllocationTooLarge { size: usize, max: usize },

    #[error("Address {0:#x} does not lie inside a referenced view")]
    InvalidAddress(usize),

    #[error("Invalid RVA: {0:#x}")]
    InvalidRva(u32),

    #[error("RVA {0:#x} does not refer to a live allocation")]
    NotAllocated(u32),

    #[error("Pool is opened read-only")]
    ReadOnly,

    #[error("Failed to map segment {segment}: {source}")]
    Map {
        segment: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid pool configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Failed to serialize pool configuration: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),
}

pub type Result<T> = std::result::Result<T, PoolError>;
