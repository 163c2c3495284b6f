//! Result taxonomy shared by every pool and resource entry point.

use derive_more::{Display, Error};

/// Failure side of a pool or resource operation.
///
/// These are recoverable conditions the caller is expected to check. Programmer errors
/// (double free, duplicate allocation record, cross-device fence misuse) go through
/// [`rhi_assert!`](crate::rhi_assert) instead.
#[derive(Debug, Display, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RhiError {
    /// Generic backend failure.
    #[display("operation failed")]
    Fail,
    /// Heap budget exhausted or the backing allocation could not be made.
    #[display("out of memory")]
    OutOfMemory,
    /// Null, unregistered or otherwise malformed argument.
    #[display("invalid argument")]
    InvalidArgument,
    /// The object is in the wrong state for this call.
    #[display("invalid operation")]
    InvalidOperation,
}

pub type RhiResult<T = ()> = Result<T, RhiError>;

/// Flat result code, for callers aggregating outcomes across devices.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResultCode {
    #[default]
    Success,
    Fail,
    OutOfMemory,
    InvalidArgument,
    InvalidOperation,
}

impl ResultCode {
    #[inline]
    pub fn is_success(self) -> bool {
        self == ResultCode::Success
    }

    /// Converts back into a `Result`, `Success` being the only `Ok` value.
    pub fn into_result(self) -> RhiResult {
        match self {
            ResultCode::Success => Ok(()),
            ResultCode::Fail => Err(RhiError::Fail),
            ResultCode::OutOfMemory => Err(RhiError::OutOfMemory),
            ResultCode::InvalidArgument => Err(RhiError::InvalidArgument),
            ResultCode::InvalidOperation => Err(RhiError::InvalidOperation),
        }
    }
}

impl From<RhiError> for ResultCode {
    fn from(error: RhiError) -> Self {
        match error {
            RhiError::Fail => ResultCode::Fail,
            RhiError::OutOfMemory => ResultCode::OutOfMemory,
            RhiError::InvalidArgument => ResultCode::InvalidArgument,
            RhiError::InvalidOperation => ResultCode::InvalidOperation,
        }
    }
}

impl<T> From<&RhiResult<T>> for ResultCode {
    fn from(result: &RhiResult<T>) -> Self {
        match result {
            Ok(_) => ResultCode::Success,
            Err(error) => (*error).into(),
        }
    }
}
