//! Error classification for the gRPC exporters, including server throttling hints.
//!
//! A status is retried when its code is one of `Cancelled`, `DeadlineExceeded`,
//! `ResourceExhausted`, `Aborted`, `OutOfRange`, `Unavailable` or `DataLoss`.
//! A `google.rpc.RetryInfo` detail on a retryable status turns it into a
//! throttled retry with the server's delay.

use crate::error::ExportError;
use crate::retry::RetryErrorType;
use std::time::Duration;
use tonic_types::StatusExt;

// Server hints longer than this are treated as misconfiguration.
const MAX_THROTTLE_DELAY: Duration = Duration::from_secs(600);

/// Classifies a [`tonic::Status`].
pub fn classify_tonic_status(status: &tonic::Status) -> RetryErrorType {
    let retry_delay = status
        .get_details_retry_info()
        .and_then(|retry_info| retry_info.retry_delay);

    classify_grpc_error(status.code(), retry_delay)
}

/// Classifies an [`ExportError`] returned by an attempt.
pub fn classify_export_error(err: &ExportError) -> RetryErrorType {
    match err {
        ExportError::Status(status) => classify_tonic_status(status),
        ExportError::Transport(_) => RetryErrorType::Retryable,
        _ => RetryErrorType::NonRetryable,
    }
}

fn classify_grpc_error(code: tonic::Code, retry_delay: Option<Duration>) -> RetryErrorType {
    match code {
        tonic::Code::Cancelled
        | tonic::Code::DeadlineExceeded
        | tonic::Code::ResourceExhausted
        | tonic::Code::Aborted
        | tonic::Code::OutOfRange
        | tonic::Code::Unavailable
        | tonic::Code::DataLoss => match retry_delay {
            Some(delay) => RetryErrorType::Throttled(delay.min(MAX_THROTTLE_DELAY)),
            None => RetryErrorType::Retryable,
        },
        _ => RetryErrorType::NonRetryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tonic_types::{ErrorDetails, StatusExt};

    #[rstest]
    #[case(tonic::Code::Cancelled, RetryErrorType::Retryable)]
    #[case(tonic::Code::DeadlineExceeded, RetryErrorType::Retryable)]
    #[case(tonic::Code::ResourceExhausted, RetryErrorType::Retryable)]
    #[case(tonic::Code::Aborted, RetryErrorType::Retryable)]
    #[case(tonic::Code::OutOfRange, RetryErrorType::Retryable)]
    #[case(tonic::Code::Unavailable, RetryErrorType::Retryable)]
    #[case(tonic::Code::DataLoss, RetryErrorType::Retryable)]
    #[case(tonic::Code::InvalidArgument, RetryErrorType::NonRetryable)]
    #[case(tonic::Code::Unauthenticated, RetryErrorType::NonRetryable)]
    #[case(tonic::Code::PermissionDenied, RetryErrorType::NonRetryable)]
    #[case(tonic::Code::Internal, RetryErrorType::NonRetryable)]
    fn classifies_status_codes(#[case] code: tonic::Code, #[case] expected: RetryErrorType) {
        assert_eq!(classify_grpc_error(code, None), expected);
    }

    #[test]
    fn retry_info_becomes_throttle() {
        let status = tonic::Status::with_error_details(
            tonic::Code::ResourceExhausted,
            "slow down",
            ErrorDetails::with_retry_info(Some(Duration::from_secs(3))),
        );
        assert_eq!(
            classify_tonic_status(&status),
            RetryErrorType::Throttled(Duration::from_secs(3))
        );
    }

    #[test]
    fn throttle_is_capped() {
        assert_eq!(
            classify_grpc_error(tonic::Code::Unavailable, Some(Duration::from_secs(3600))),
            RetryErrorType::Throttled(MAX_THROTTLE_DELAY)
        );
    }

    #[test]
    fn retry_info_on_permanent_code_is_ignored() {
        assert_eq!(
            classify_grpc_error(tonic::Code::PermissionDenied, Some(Duration::from_secs(1))),
            RetryErrorType::NonRetryable
        );
    }

    #[test]
    fn local_errors_are_not_retried() {
        assert_eq!(
            classify_export_error(&ExportError::Disconnected),
            RetryErrorType::NonRetryable
        );
        assert_eq!(
            classify_export_error(&ExportError::from(tonic::Status::unavailable("x"))),
            RetryErrorType::Retryable
        );
    }
}
