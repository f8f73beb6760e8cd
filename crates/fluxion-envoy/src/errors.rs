// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Error types for the Envoy reader

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvoyError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("XML parsing error: {0}")]
    XmlError(String),

    /// The cloud login or token exchange rejected the attempt.
    #[error("Authentication with Enlighten failed: {0}")]
    AuthenticationFailed(String),

    /// 401 persisted after every reauthentication attempt.
    #[error("Unauthorized: {url}")]
    Unauthorized { url: String },

    #[error("Token is invalid: {0}")]
    InvalidToken(String),

    #[error("Envoy returned status {status}: {message}")]
    ApiError { status: u16, message: String },

    #[error("Could not detect Envoy model: {0}")]
    ModelDetection(String),

    #[error("Invalid path expression '{expr}': {reason}")]
    InvalidPath { expr: String, reason: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Envoy rejected the request: {message} ({reason})")]
    DeviceRejected { message: String, reason: String },

    #[error("Realtime stream is not supported by this Envoy")]
    StreamNotSupported,

    #[error("Realtime callback failed: {0}")]
    StreamCallback(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl EnvoyError {
    /// Errors after which the stored token should be dropped and a new one
    /// obtained from the cloud.
    pub fn requires_reauth(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::InvalidToken(_) | Self::Unauthorized { .. }
        )
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }
}

impl From<quick_xml::Error> for EnvoyError {
    fn from(err: quick_xml::Error) -> Self {
        Self::XmlError(err.to_string())
    }
}

pub type EnvoyResult<T> = Result<T, EnvoyError>;
