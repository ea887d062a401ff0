// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel send error: {0}")]
    ChannelSendError(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    /// connection and protocol errors
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("failed to send packet: {0}")]
    PacketSendFailed(String),

    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// business errors raised by the data-access layer and tasks
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("{0}")]
    ValidationFailed(String),

    #[error("{0}")]
    OperationFailure(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl AppError {
    /// Whether this error ended a handshake attempt.
    pub fn is_connection_failed(&self) -> bool {
        matches!(self, AppError::ConnectionFailed(_))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        AppError::MalformedProtocol(value.to_string())
    }
}
