use std::io;

/// Errors raised inside the client layers.
///
/// None of these cross the execution boundary: the execution client folds
/// them into a failed `ExecutionResponse`, and the stream session turns them
/// into log lines and reconnect attempts.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("socket: {0}")]
    Socket(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::Socket(err.to_string())
    }
}
