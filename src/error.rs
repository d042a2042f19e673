//! Error types for Sonance.
//!
//! Every error maps onto a stable numeric code so the handle-oriented API
//! surface can report failures the way a C binding expects: `0` is success,
//! everything else is one of the codes below. The full message of the most
//! recent failure on the current thread is kept in a thread-local buffer and
//! retrievable through [`last_error_message`].

use std::cell::RefCell;
use thiserror::Error;

/// Stable numeric error codes, part of the external surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    InvalidHandle = 1,
    WrongObjectType = 2,
    UnknownProperty = 3,
    WrongPropertyType = 4,
    Range = 5,
    UnknownProtocol = 6,
    Decoder = 7,
    Io = 8,
    OutOfMemory = 9,
    NotInitialized = 10,
    AlreadyInitialized = 11,
    Shutdown = 12,
    Internal = 13,
}

#[derive(Error, Debug)]
pub enum SonanceError {
    #[error("invalid handle: {0}")]
    InvalidHandle(u64),

    #[error("wrong object type: expected {expected}, got {got}")]
    WrongObjectType { expected: &'static str, got: &'static str },

    #[error("unknown property {property} for object type {object_type}")]
    UnknownProperty { property: &'static str, object_type: &'static str },

    #[error("wrong property type for {property}: expected {expected}")]
    WrongPropertyType { property: &'static str, expected: &'static str },

    #[error("value {value} for {property} is outside [{min}, {max}]")]
    Range {
        property: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("unknown stream protocol: {0}")]
    UnknownProtocol(String),

    #[error("decoder error: {0}")]
    Decoder(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("library is not initialized")]
    NotInitialized,

    #[error("library is already initialized")]
    AlreadyInitialized,

    #[error("object or context has been shut down")]
    Shutdown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl SonanceError {
    /// The numeric code this error reports through the external surface.
    pub fn code(&self) -> ErrorCode {
        match self {
            SonanceError::InvalidHandle(_) => ErrorCode::InvalidHandle,
            SonanceError::WrongObjectType { .. } => ErrorCode::WrongObjectType,
            SonanceError::UnknownProperty { .. } => ErrorCode::UnknownProperty,
            SonanceError::WrongPropertyType { .. } => ErrorCode::WrongPropertyType,
            SonanceError::Range { .. } => ErrorCode::Range,
            SonanceError::UnknownProtocol(_) => ErrorCode::UnknownProtocol,
            SonanceError::Decoder(_) => ErrorCode::Decoder,
            SonanceError::Io(_) => ErrorCode::Io,
            // Device failures surface as IO to callers; the distinction only
            // matters in logs.
            SonanceError::AudioDevice(_) => ErrorCode::Io,
            SonanceError::OutOfMemory => ErrorCode::OutOfMemory,
            SonanceError::NotInitialized => ErrorCode::NotInitialized,
            SonanceError::AlreadyInitialized => ErrorCode::AlreadyInitialized,
            SonanceError::Shutdown => ErrorCode::Shutdown,
            SonanceError::Internal(_) => ErrorCode::Internal,
        }
    }
}

pub type Result<T> = std::result::Result<T, SonanceError>;

thread_local! {
    static LAST_ERROR: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Record `err` as the current thread's last error and pass it through.
pub(crate) fn record_error(err: SonanceError) -> SonanceError {
    LAST_ERROR.with(|slot| {
        let mut slot = slot.borrow_mut();
        slot.clear();
        use std::fmt::Write;
        let _ = write!(slot, "{err}");
    });
    err
}

/// Message of the most recent error reported on this thread, or an empty
/// string if none has occurred.
pub fn last_error_message() -> String {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorCode::Ok as i32, 0);
        assert_eq!(SonanceError::InvalidHandle(3).code() as i32, 1);
        assert_eq!(SonanceError::OutOfMemory.code() as i32, 9);
        assert_eq!(SonanceError::Shutdown.code() as i32, 12);
    }

    #[test]
    fn last_error_is_recorded_per_thread() {
        let _ = record_error(SonanceError::InvalidHandle(42));
        assert!(last_error_message().contains("42"));
        std::thread::spawn(|| {
            assert_eq!(last_error_message(), "");
        })
        .join()
        .unwrap();
    }
}
