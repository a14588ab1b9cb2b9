// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2024 Oxide Computer Company

use std::convert;

#[derive(Debug, thiserror::Error)]
pub enum TopodError {
    #[error("I/O error: {0:?}")]
    Io(std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Resource already exists: {0}")]
    Exists(String),
    #[error("No such resource: {0}")]
    Missing(String),
    #[error("Invalid argument: {0}")]
    Invalid(String),
    /// The engine task is no longer accepting requests.
    #[error("Topology engine has shut down")]
    Shutdown,
    #[error("error: {0}")]
    Other(String),
}

impl convert::From<std::io::Error> for TopodError {
    fn from(err: std::io::Error) -> Self {
        TopodError::Io(err)
    }
}

impl convert::From<serde_json::Error> for TopodError {
    fn from(err: serde_json::Error) -> Self {
        TopodError::Serialization(err.to_string())
    }
}

impl convert::From<TopodError> for dropshot::HttpError {
    fn from(o: TopodError) -> dropshot::HttpError {
        match o {
            TopodError::Io(e) => {
                dropshot::HttpError::for_internal_error(e.to_string())
            }
            TopodError::Serialization(e) => {
                dropshot::HttpError::for_internal_error(e)
            }
            TopodError::Exists(e) => dropshot::HttpError::for_status(
                Some(e),
                http::StatusCode::CONFLICT,
            ),
            TopodError::Missing(e) => dropshot::HttpError::for_status(
                Some(e),
                http::StatusCode::NOT_FOUND,
            ),
            TopodError::Invalid(e) => {
                dropshot::HttpError::for_bad_request(None, e)
            }
            TopodError::Shutdown => dropshot::HttpError::for_unavail(
                None,
                "topology engine has shut down".to_string(),
            ),
            TopodError::Other(e) => dropshot::HttpError::for_internal_error(e),
        }
    }
}

impl convert::From<String> for TopodError {
    fn from(err: String) -> Self {
        TopodError::Other(err)
    }
}

impl convert::From<&str> for TopodError {
    fn from(err: &str) -> Self {
        TopodError::Other(err.to_string())
    }
}

impl convert::From<anyhow::Error> for TopodError {
    fn from(err: anyhow::Error) -> Self {
        TopodError::Other(err.to_string())
    }
}
