use crate::errors::CrdPolicyError;

const VALID: [&str; 3] = ["Skip", "Create", "CreateReplace"];

/// Validates the effective CRD policy for a release, applying `default` when
/// unset (empty string or `None`).
pub fn validate(policy: Option<&str>, default: &str) -> Result<String, CrdPolicyError> {
    let value = match policy {
        None => default,
        Some(v) if v.is_empty() => default,
        Some(v) => v,
    };

    if VALID.contains(&value) {
        Ok(value.to_string())
    } else {
        Err(CrdPolicyError::Invalid { value: value.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_falls_back_to_default() {
        assert_eq!(validate(None, "Create").unwrap(), "Create");
        assert_eq!(validate(Some(""), "Create").unwrap(), "Create");
    }

    #[test]
    fn accepts_known_values() {
        assert_eq!(validate(Some("Skip"), "Create").unwrap(), "Skip");
        assert_eq!(validate(Some("CreateReplace"), "Create").unwrap(), "CreateReplace");
    }

    #[test]
    fn rejects_unknown_value() {
        let err = validate(Some("Bogus"), "Create").unwrap_err();
        assert!(matches!(err, CrdPolicyError::Invalid { value } if value == "Bogus"));
    }
}
