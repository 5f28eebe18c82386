//! Substring classification of per-sample error strings.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Timeout,
    LlmError,
    Validation,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::LlmError => "llm_error",
            Self::Validation => "validation",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket an error message. A leading `timeout:`, `llm_error:` or
/// `validation:` prefix decides; otherwise the first substring match wins in
/// the order timeout, llm_error, validation.
pub fn classify(message: &str) -> ErrorCategory {
    let msg = message.to_lowercase();
    let prefix = msg.split_once(':').map(|(head, _)| head.trim());
    match prefix {
        Some("timeout") => return ErrorCategory::Timeout,
        Some("llm_error") => return ErrorCategory::LlmError,
        Some("validation") => return ErrorCategory::Validation,
        Some("crash") => return ErrorCategory::Unknown,
        _ => {}
    }
    if msg.contains("timeout") || msg.contains("timed out") {
        ErrorCategory::Timeout
    } else if msg.contains("llm_error")
        || msg.contains("rate limit")
        || msg.contains("server error")
        || msg.contains("network")
        || msg.contains("api error")
    {
        ErrorCategory::LlmError
    } else if msg.contains("validation")
        || msg.contains("missing")
        || msg.contains("required")
        || msg.contains("unsupported")
        || msg.contains("unknown metric")
    {
        ErrorCategory::Validation
    } else {
        ErrorCategory::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_engine_generated_messages() {
        assert_eq!(
            classify("timeout: sample exceeded 100ms"),
            ErrorCategory::Timeout
        );
        assert_eq!(
            classify("llm_error: rate limited (retry after None)"),
            ErrorCategory::LlmError
        );
        assert_eq!(
            classify("validation: missing required field 'answer'"),
            ErrorCategory::Validation
        );
        assert_eq!(
            classify("crash: worker 3 terminated"),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn prefix_wins_over_substrings() {
        assert_eq!(
            classify("validation: metric 'response_timeout' missing required field(s): answer"),
            ErrorCategory::Validation
        );
        assert_eq!(
            classify("llm_error: request rejected 400: missing parameter"),
            ErrorCategory::LlmError
        );
        assert_eq!(
            classify("crash: metric 'timeout_guard' panicked: boom"),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn classification_is_case_insensitive() {
        assert_eq!(classify("Request TIMED OUT"), ErrorCategory::Timeout);
        assert_eq!(classify("Unsupported sample type"), ErrorCategory::Validation);
    }
}
