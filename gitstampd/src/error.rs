//! Maps request-handling failures onto the HTTP status codes specified for
//! the front end (§4.6). Grounded in the teacher's
//! `error.rs::ProcessingError` (`IntoResponse` impl) and `status.rs`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("bad parameters or invalid input")]
    BadRequest,

    #[error("length required")]
    LengthRequired,

    #[error("request too long")]
    TooLong,

    #[error("unsupported media type")]
    UnsupportedMediaType,

    #[error("signer pool exhausted")]
    TooManyRequests,

    #[error(transparent)]
    Core(#[from] gitstamp_core::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::BadRequest => StatusCode::NOT_ACCEPTABLE,
            Error::LengthRequired => StatusCode::LENGTH_REQUIRED,
            Error::TooLong => StatusCode::PAYLOAD_TOO_LARGE,
            Error::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            Error::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = format!("{self}");
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
