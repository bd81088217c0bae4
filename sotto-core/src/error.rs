use thiserror::Error;

/// All errors produced by sotto-core.
#[derive(Debug, Error)]
pub enum SottoError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no input device found")]
    NoInputDevice,

    #[error("local engine error: {0}")]
    Engine(String),

    #[error("local engine exceeded the {0:?} deadline")]
    EngineTimeout(std::time::Duration),

    #[error("no healthy transcription server available")]
    RemoteUnavailable,

    #[error("upload failed: {0}")]
    RemoteUpload(String),

    #[error("status check failed: {0}")]
    RemoteStatus(String),

    #[error("result download failed: {0}")]
    RemoteResult(String),

    #[error("server reported transcription failure: {0}")]
    RemoteTask(String),

    #[error("remote transcription exceeded the {0:?} ceiling")]
    RemoteDeadline(std::time::Duration),

    #[error("every transcription path failed — local: {local}; remote: {remote}")]
    AllPathsFailed { local: String, remote: String },

    #[error("WAV encode error: {0}")]
    WavEncode(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SottoError>;
