//! Status codes returned by read-cache operations.

use std::fmt;

/// Public status for construction and configuration errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Status {
    /// Operation completed successfully.
    #[default]
    Ok = 0,
    /// Key was not found.
    NotFound = 1,
    /// Allocation failed.
    OutOfMemory = 2,
    /// Invalid argument provided.
    InvalidArgument = 3,
    /// More threads than the epoch table supports.
    TooManyThreads = 4,
    /// Operation was aborted.
    Aborted = 5,
}

impl Status {
    /// Check if the status indicates success.
    #[inline]
    pub const fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Get the status as a string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "Ok",
            Status::NotFound => "NotFound",
            Status::OutOfMemory => "OutOfMemory",
            Status::InvalidArgument => "InvalidArgument",
            Status::TooManyThreads => "TooManyThreads",
            Status::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of an engine operation, returned up the call stack.
///
/// The engine raises no panics on concurrent paths; every race resolves into
/// one of these values and the caller decides whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum OperationStatus {
    /// Operation completed and any chain updates are published.
    #[default]
    Success,
    /// No record for the key was found.
    NotFound,
    /// Transient contention (lost CAS, busy allocator, stale epoch).
    /// Refresh the epoch and retry.
    RetryLater,
    /// The read-cache log could not reserve space; await eviction of the
    /// oldest pages before retrying.
    AllocateFailed,
    /// Post-insert verification saw an intervening record escape to disk.
    /// The in-memory insertion was abandoned; proceed with the value
    /// already fetched.
    RecordOnDisk,
    /// Verification found a newer in-memory record for the key; the
    /// insertion was abandoned.
    RecordExists,
}

impl OperationStatus {
    /// Check if the operation succeeded.
    #[inline]
    pub const fn is_success(&self) -> bool {
        matches!(self, OperationStatus::Success)
    }

    /// Check if a retry is needed.
    #[inline]
    pub const fn needs_retry(&self) -> bool {
        matches!(
            self,
            OperationStatus::RetryLater | OperationStatus::AllocateFailed
        )
    }

    /// Check if the insertion was abandoned in favor of an existing record.
    #[inline]
    pub const fn is_abandoned(&self) -> bool {
        matches!(
            self,
            OperationStatus::RecordOnDisk | OperationStatus::RecordExists
        )
    }

    /// Convert to the public status.
    pub const fn to_status(&self) -> Status {
        match self {
            OperationStatus::Success => Status::Ok,
            OperationStatus::NotFound => Status::NotFound,
            OperationStatus::RetryLater | OperationStatus::AllocateFailed => Status::Aborted,
            OperationStatus::RecordOnDisk | OperationStatus::RecordExists => Status::Ok,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationStatus::Success => "Success",
            OperationStatus::NotFound => "NotFound",
            OperationStatus::RetryLater => "RetryLater",
            OperationStatus::AllocateFailed => "AllocateFailed",
            OperationStatus::RecordOnDisk => "RecordOnDisk",
            OperationStatus::RecordExists => "RecordExists",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_predicates() {
        assert!(Status::Ok.is_ok());
        assert!(!Status::NotFound.is_ok());
        assert_eq!(Status::default(), Status::Ok);
    }

    #[test]
    fn test_operation_status_predicates() {
        assert!(OperationStatus::Success.is_success());
        assert!(OperationStatus::RetryLater.needs_retry());
        assert!(OperationStatus::AllocateFailed.needs_retry());
        assert!(OperationStatus::RecordOnDisk.is_abandoned());
        assert!(OperationStatus::RecordExists.is_abandoned());
        assert!(!OperationStatus::Success.is_abandoned());
    }

    #[test]
    fn test_conversion() {
        assert_eq!(OperationStatus::Success.to_status(), Status::Ok);
        assert_eq!(OperationStatus::NotFound.to_status(), Status::NotFound);
        assert_eq!(OperationStatus::RetryLater.to_status(), Status::Aborted);
        // Abandoned insertions are not errors; the caller already holds a value.
        assert_eq!(OperationStatus::RecordOnDisk.to_status(), Status::Ok);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", OperationStatus::AllocateFailed), "AllocateFailed");
        assert_eq!(format!("{}", Status::TooManyThreads), "TooManyThreads");
    }
}
