use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SamplingError {
    #[error("The target thread has probably been terminated. {0}, errno {1}")]
    ThreadTerminated(&'static str, i32),

    #[error("Ignorable error encountered during sampling: {0}, errno {1}")]
    Ignorable(&'static str, i32),

    #[error("Could not set up the suspend signal handler, errno {0}")]
    SignalSetupFailed(i32),

    #[error("Thread suspension is not supported on this platform")]
    Unsupported,
}
