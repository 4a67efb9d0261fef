use thiserror::Error;

/// Errors produced by the sync core.
#[derive(Error, Debug)]
pub enum SyncError {
  /// Fetch rejected, timed out or never reached the server
  #[error("Network failure: {0}")]
  NetworkFailure(String),

  /// The remote authority answered with a non-2xx status
  #[error("Remote rejected request with status {status}: {body}")]
  RemoteRejection { status: u16, body: String },

  /// Durable store could not be opened, read or written
  #[error("Storage failure: {0}")]
  StorageFailure(String),

  /// Cache partition could not be opened or written
  #[error("Cache failure: {0}")]
  CacheFailure(String),

  /// A message that does not belong to the wire contract
  #[error("Protocol violation: {0}")]
  ProtocolViolation(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Maximum length for response bodies carried in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl SyncError {
  fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
      return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
      end -= 1;
    }
    format!(
      "{}... (truncated, {} total bytes)",
      &body[..end],
      body.len()
    )
  }

  pub fn from_status(status: u16, body: &str) -> Self {
    SyncError::RemoteRejection {
      status,
      body: Self::truncate_body(body),
    }
  }

  /// Whether the failure says anything about connectivity.
  pub fn is_network(&self) -> bool {
    matches!(self, SyncError::NetworkFailure(_))
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(e: reqwest::Error) -> Self {
    SyncError::NetworkFailure(e.to_string())
  }
}
