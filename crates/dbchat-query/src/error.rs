//! Error types for the query mini-language.

/// Reasons a query text is rejected.
///
/// Positions are byte offsets into the trimmed query text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("query must start with db.<collection>.<method>(")]
    InvalidPrefix,
    #[error("unbalanced parentheses at position {position}")]
    UnbalancedParens { position: usize },
    #[error("no closing parenthesis for {method}(")]
    NoMatchingCloseParen { method: String },
    #[error("invalid comma placement at position {position}")]
    InvalidCommaPlacement { position: usize },
    #[error("unclosed quotes")]
    UnclosedQuotes,
    #[error("unsupported method: {0}. Only find(), aggregate(), or countDocuments() supported")]
    UnsupportedMethod(String),
    #[error("invalid arguments at position {position}: {reason}")]
    ArgumentParseError { position: usize, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            ParseError::UnbalancedParens { position: 7 }.to_string(),
            "unbalanced parentheses at position 7"
        );
        assert_eq!(
            ParseError::NoMatchingCloseParen {
                method: "find".into()
            }
            .to_string(),
            "no closing parenthesis for find("
        );
        assert!(ParseError::UnsupportedMethod("deleteMany".into())
            .to_string()
            .starts_with("unsupported method: deleteMany"));
    }

    #[test]
    fn test_argument_error_carries_reason() {
        let err = ParseError::ArgumentParseError {
            position: 12,
            reason: "identifier `eval` is not allowed".into(),
        };
        assert!(err.to_string().contains("position 12"));
        assert!(err.to_string().contains("eval"));
    }
}
