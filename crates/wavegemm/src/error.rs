use thiserror::Error;

/// Errors surfaced by the harness.
///
/// Everything except [`HarnessError::DeviceLost`] is raised synchronously at
/// setup time and represents a fixed environment or configuration mismatch
/// that retrying cannot fix. `DeviceLost` can surface from any fence wait or
/// readback and is fatal to the process: there is no device reset or retry,
/// and no further GPU reads are attempted once it has been observed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HarnessError {
    /// No adapter on the system exposes subgroup operations and timestamp
    /// queries.
    #[error("no compatible adapter: subgroup operations and timestamp queries are required")]
    NoCompatibleAdapter,

    /// The driver rejected logical device creation.
    #[error("device creation failed: {reason}")]
    DeviceCreation {
        /// Driver-reported cause.
        reason: String,
    },

    /// A GPU buffer could not be allocated, e.g. the size exceeds device
    /// limits.
    #[error("buffer allocation failed: {reason}")]
    Allocation {
        /// Cause of the allocation failure.
        reason: String,
    },

    /// The requested kernel variant is unknown, or requires a feature the
    /// device does not expose.
    #[error("kernel variant `{name}` is not supported on this device")]
    UnsupportedKernel {
        /// The name the variant was requested under.
        name: String,
    },

    /// The device was removed while work was in flight. Terminal.
    #[error("device lost: {reason}")]
    DeviceLost {
        /// Reason reported by the driver, if any.
        reason: String,
    },

    /// The run configuration is internally inconsistent (zero dimensions,
    /// tile size mismatch for the chosen kernel, unsupported element width).
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// What was inconsistent.
        reason: String,
    },
}
