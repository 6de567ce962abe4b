use crate::hal::OsStatus;
use crate::utils::describe_status;

/// Failures surfaced by the hardware-facing components.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HalError {
    /// A property read or write was rejected by the HAL.
    #[error("property operation failed: {}", status_text(.0))]
    PropertyOperationFailed(OsStatus),
    /// The caller broke a precondition, e.g. fewer than two sources for a virtual device.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    /// The HAL refused to build the virtual device.
    #[error("virtual device creation failed: {}", status_text(.0))]
    AggregateCreationFailed(OsStatus),
}

impl HalError {
    /// The raw status code, when the failure came from the HAL.
    pub fn status(&self) -> Option<OsStatus> {
        match self {
            HalError::PropertyOperationFailed(s) | HalError::AggregateCreationFailed(s) => {
                Some(*s)
            }
            HalError::InvalidConfiguration(_) => None,
        }
    }
}

fn status_text(status: &OsStatus) -> String {
    describe_status(*status)
}
