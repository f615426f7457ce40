#[derive(Debug)]
pub enum DecodeError {
    InvalidUlid,
    InvalidEntityKey(String),
    InvalidFormat,
    Other(anyhow::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::InvalidUlid => write!(f, "Invalid ULID"),
            DecodeError::InvalidEntityKey(key) => write!(f, "Invalid entity key: {}", key),
            DecodeError::InvalidFormat => write!(f, "Invalid Format"),
            DecodeError::Other(e) => write!(f, "Other: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<ulid::DecodeError> for DecodeError {
    fn from(_: ulid::DecodeError) -> Self { DecodeError::InvalidUlid }
}

impl From<serde_json::Error> for DecodeError {
    fn from(e: serde_json::Error) -> Self { DecodeError::Other(e.into()) }
}
