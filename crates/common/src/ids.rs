//! External identifier codec.
//!
//! Internal identifiers are 64-bit sequences. On the wire they carry a short
//! type prefix (`fn_42`, `fv_7`, `s_3`, `exp_19`) so callers cannot confuse a
//! funnel id with a version id.

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Funnel,
    FunnelVersion,
    Step,
    Publication,
    Export,
}

impl IdKind {
    pub fn prefix(self) -> &'static str {
        match self {
            IdKind::Funnel => "fn",
            IdKind::FunnelVersion => "fv",
            IdKind::Step => "s",
            IdKind::Publication => "fp",
            IdKind::Export => "exp",
        }
    }

    fn label(self) -> &'static str {
        match self {
            IdKind::Funnel => "funnel id",
            IdKind::FunnelVersion => "funnel version id",
            IdKind::Step => "step id",
            IdKind::Publication => "publication id",
            IdKind::Export => "export id",
        }
    }
}

/// Formats an internal id as its external representation, e.g. `fn_42`.
pub fn format_id(kind: IdKind, id: i64) -> String {
    format!("{}_{}", kind.prefix(), id)
}

/// Parses an external id back to the internal sequence value.
///
/// Rejects missing or mismatched prefixes and non-positive values.
pub fn parse_id(kind: IdKind, external: &str) -> Result<i64, AppError> {
    let expected = format!("{}_", kind.prefix());

    let digits = external.strip_prefix(&expected).ok_or_else(|| {
        AppError::Validation(format!(
            "Invalid {}: expected `{}<n>`, got `{}`",
            kind.label(),
            expected,
            external
        ))
    })?;

    let id: i64 = digits
        .parse()
        .map_err(|_| AppError::Validation(format!("Invalid {}: `{}`", kind.label(), external)))?;

    if id <= 0 {
        return Err(AppError::Validation(format!(
            "Invalid {}: `{}`",
            kind.label(),
            external
        )));
    }

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        for kind in [IdKind::Funnel, IdKind::FunnelVersion, IdKind::Step, IdKind::Export] {
            let external = format_id(kind, 42);
            assert_eq!(parse_id(kind, &external).unwrap(), 42);
        }
    }

    #[test]
    fn rejects_wrong_prefix() {
        assert!(parse_id(IdKind::Funnel, "fv_42").is_err());
        assert!(parse_id(IdKind::Funnel, "42").is_err());
    }

    #[test]
    fn rejects_non_positive_and_garbage() {
        assert!(parse_id(IdKind::Funnel, "fn_0").is_err());
        assert!(parse_id(IdKind::Funnel, "fn_-3").is_err());
        assert!(parse_id(IdKind::Funnel, "fn_abc").is_err());
    }
}
