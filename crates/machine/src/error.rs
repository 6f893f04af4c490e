use thiserror::Error;
use vela_devices::AddressSpaceError;
use vela_hv::HvError;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("hypervisor platform is not available")]
    HypervisorUnavailable,
    #[error("out of host resources: {0}")]
    ResourceExhausted(String),
    #[error("invalid VM spec: {0}")]
    InvalidSpec(String),
    #[error("guest loader failed: {0}")]
    Loader(String),
    #[error("disk backend: {0}")]
    Disk(std::io::Error),
    #[error("VM already started")]
    AlreadyStarted,
    #[error(transparent)]
    Hypervisor(HvError),
    #[error("VM spec I/O: {0}")]
    SpecIo(#[from] std::io::Error),
    #[error("VM spec format: {0}")]
    SpecFormat(#[from] serde_json::Error),
}

impl From<HvError> for VmError {
    fn from(err: HvError) -> Self {
        match err {
            HvError::Unavailable => VmError::HypervisorUnavailable,
            HvError::ResourceExhausted(what) => VmError::ResourceExhausted(what),
            other => VmError::Hypervisor(other),
        }
    }
}

impl From<AddressSpaceError> for VmError {
    fn from(err: AddressSpaceError) -> Self {
        VmError::InvalidSpec(err.to_string())
    }
}
