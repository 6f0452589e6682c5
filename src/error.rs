use std::io;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("process {pid} is not running")]
    NotRunning { pid: u32 },

    #[error("process exited before the expected prompt appeared; transcript:\n{transcript}")]
    ProtocolViolation { transcript: String },

    #[error("process did not finish within {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("gpg exited with status {status}: {output}")]
    Gpg { status: i32, output: String },

    #[error("invalid key ID '{keyid}': {reason}")]
    InvalidKeyId { keyid: String, reason: String },

    #[error("invalid {what}: {reason}")]
    InvalidInput { what: &'static str, reason: String },

    #[error("cannot parse command line '{command}': {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("keyring not initialized")]
    KeyringNotInitialized,

    #[error("permission denied")]
    PermissionDenied,

    #[error("unexpected gpg output: {0}")]
    UnexpectedOutput(String),
}

pub type Result<T> = std::result::Result<T, Error>;
