// Fatal error taxonomy
//
// Every failure the frame engine can hit leaves GPU state opaque, so there is
// no recovery tier: errors carry a diagnostic code and travel up to main,
// which exits with that code.

use ash::vk;
use thiserror::Error;

/// Root cause of a failed run. Wrapped in `anyhow::Error` while propagating;
/// [`exit_code`] digs it back out.
#[derive(Debug, Error)]
pub enum FatalError {
    /// A Vulkan call returned an error code
    #[error("{operation} failed: {result}")]
    Api {
        operation: &'static str,
        result: vk::Result,
    },

    /// GPU heap exhausted or allocator misuse
    #[error("GPU allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    /// A bounded fence wait ran out before the GPU reached the value
    #[error("timed out waiting for fence value {value}")]
    WaitTimeout { value: u64 },

    /// No adapter satisfied the requirements (or the software adapter was
    /// requested and none is installed)
    #[error("no suitable Vulkan adapter found")]
    NoSuitableAdapter,

    /// Window surface could not be created or stopped making sense
    #[error("surface error: {0}")]
    Surface(String),
}

impl FatalError {
    /// Helper for `map_err` at Vulkan call sites.
    pub fn api(operation: &'static str) -> impl FnOnce(vk::Result) -> FatalError {
        move |result| FatalError::Api { operation, result }
    }

    /// Diagnostic code reported as the process exit status.
    pub fn code(&self) -> i32 {
        match self {
            FatalError::Api { result, .. } => result.as_raw(),
            FatalError::Allocation(_) => vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.as_raw(),
            FatalError::WaitTimeout { .. } => vk::Result::TIMEOUT.as_raw(),
            FatalError::NoSuitableAdapter => vk::Result::ERROR_INCOMPATIBLE_DRIVER.as_raw(),
            FatalError::Surface(_) => vk::Result::ERROR_SURFACE_LOST_KHR.as_raw(),
        }
    }
}

/// Exit code for an error chain: the first `FatalError` found, else 1.
pub fn exit_code(error: &anyhow::Error) -> i32 {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<FatalError>())
        .map(FatalError::code)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn api_errors_report_the_raw_vulkan_code() {
        let err = FatalError::api("vkQueueSubmit")(vk::Result::ERROR_DEVICE_LOST);
        assert_eq!(err.code(), vk::Result::ERROR_DEVICE_LOST.as_raw());
        assert!(err.to_string().contains("vkQueueSubmit"));
    }

    #[test]
    fn exit_code_finds_the_fatal_error_under_context() {
        let result: anyhow::Result<()> = Err(FatalError::WaitTimeout { value: 7 })
            .context("waiting for frame slot 1")
            .context("rendering frame");
        let err = result.unwrap_err();
        assert_eq!(exit_code(&err), vk::Result::TIMEOUT.as_raw());
    }

    #[test]
    fn untyped_errors_exit_with_one() {
        let err = anyhow::anyhow!("config exploded");
        assert_eq!(exit_code(&err), 1);
    }
}
