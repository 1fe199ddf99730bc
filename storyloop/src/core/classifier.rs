//! Deterministic classification of iteration and provider failures.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::IterationOutcome;

/// How the executor (or the driver on its behalf) characterised a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Executor crash, network error, timeout.
    Recoverable,
    /// The executor cannot proceed (bad credential, malformed story).
    Unrecoverable,
}

/// Classify a failed iteration.
///
/// `attempt` is the 1-based attempt number of this iteration for its story.
/// Recoverable failures become fatal once the story's retry budget is spent.
pub fn classify_failure(kind: FailureKind, attempt: u32, max_attempts: u32) -> IterationOutcome {
    match kind {
        FailureKind::Unrecoverable => IterationOutcome::FatalFailure,
        FailureKind::Recoverable if attempt >= max_attempts => IterationOutcome::FatalFailure,
        FailureKind::Recoverable => IterationOutcome::RetryableFailure,
    }
}

/// Transient vs permanent source-control failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFailureKind {
    Transient,
    Permanent,
}

static PERMANENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(authentication failed|permission denied|could not read username|bad credentials|http 401|http 403|\b401\b|\b403\b|repository not found|not found|invalid username or token|gh auth login|protected branch)",
    )
    .expect("permanent provider pattern")
});

static TRANSIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(could not resolve host|connection (reset|refused|timed out)|timed? ?out|temporarily unavailable|rate limit|early eof|the remote end hung up|http 5\d\d|\b50[234]\b|tls|network is unreachable)",
    )
    .expect("transient provider pattern")
});

/// Classify provider output (usually stderr).
///
/// Authentication and permission problems win over network noise in the same
/// message; anything unrecognised is treated as permanent.
pub fn classify_provider_output(output: &str) -> ProviderFailureKind {
    if PERMANENT_RE.is_match(output) {
        return ProviderFailureKind::Permanent;
    }
    if TRANSIENT_RE.is_match(output) {
        return ProviderFailureKind::Transient;
    }
    ProviderFailureKind::Permanent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecoverable_is_fatal_on_first_attempt() {
        assert_eq!(
            classify_failure(FailureKind::Unrecoverable, 1, 3),
            IterationOutcome::FatalFailure
        );
    }

    /// Verifies a recoverable failure turns fatal once attempts reach the limit.
    #[test]
    fn recoverable_is_retryable_until_limit() {
        assert_eq!(
            classify_failure(FailureKind::Recoverable, 1, 3),
            IterationOutcome::RetryableFailure
        );
        assert_eq!(
            classify_failure(FailureKind::Recoverable, 2, 3),
            IterationOutcome::RetryableFailure
        );
        assert_eq!(
            classify_failure(FailureKind::Recoverable, 3, 3),
            IterationOutcome::FatalFailure
        );
    }

    #[test]
    fn network_errors_are_transient() {
        for msg in [
            "fatal: unable to access 'https://github.com/o/r/': Could not resolve host: github.com",
            "error: RPC failed; curl 56 Connection reset by peer",
            "fatal: the remote end hung up unexpectedly",
            "HTTP 502: Bad Gateway",
        ] {
            assert_eq!(
                classify_provider_output(msg),
                ProviderFailureKind::Transient,
                "{msg}"
            );
        }
    }

    #[test]
    fn auth_errors_are_permanent() {
        for msg in [
            "remote: Permission to o/r.git denied to bot.\nfatal: unable to access: The requested URL returned error: 403",
            "fatal: Authentication failed for 'https://github.com/o/r/'",
            "To get started with GitHub CLI, please run:  gh auth login",
        ] {
            assert_eq!(
                classify_provider_output(msg),
                ProviderFailureKind::Permanent,
                "{msg}"
            );
        }
    }

    #[test]
    fn unknown_output_is_permanent() {
        assert_eq!(
            classify_provider_output("fatal: something odd"),
            ProviderFailureKind::Permanent
        );
    }
}
