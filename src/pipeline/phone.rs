//! Phone normalisation for broker contacts (Kazakhstan numbering).

use crate::error::FeedbackError;

/// Normalises a raw broker phone number to `+7XXXXXXXXXX`.
///
/// Accepts exactly two shapes after trimming: a 10-digit local number
/// (`+7` is prepended) or an 11-digit number starting with `7` (`+` is
/// prepended). Anything containing a non-ASCII-digit is rejected.
///
/// # Errors
/// [`FeedbackError::InvalidPhoneFormat`] carrying the raw input.
pub fn normalize_phone(raw: &str) -> Result<String, FeedbackError> {
    let trimmed = raw.trim();
    if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(FeedbackError::InvalidPhoneFormat(raw.to_string()));
    }
    match trimmed.len() {
        10 => Ok(format!("+7{trimmed}")),
        11 if trimmed.starts_with('7') => Ok(format!("+{trimmed}")),
        _ => Err(FeedbackError::InvalidPhoneFormat(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("7011234567", "+77011234567")]
    #[case("77011234567", "+77011234567")]
    #[case("  77011234567\n", "+77011234567")]
    #[case(" 7011234567 ", "+77011234567")]
    fn accepts_known_shapes(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(normalize_phone(raw).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("123")]
    #[case("87011234567")]
    #[case("+77011234567")]
    #[case("770112345678")]
    #[case("abcdefghij")]
    #[case("701-123-45")]
    #[case("абвгдежзий")]
    #[case("7701123456x")]
    #[case("70112 3456")]
    fn rejects_other_shapes(#[case] raw: &str) {
        match normalize_phone(raw) {
            Err(FeedbackError::InvalidPhoneFormat(value)) => assert_eq!(value, raw),
            other => panic!("expected InvalidPhoneFormat, got {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn ten_digits_get_country_prefix(digits in "[0-9]{10}") {
            prop_assert_eq!(normalize_phone(&digits).unwrap(), format!("+7{digits}"));
        }

        #[test]
        fn eleven_digits_starting_with_seven_get_plus(rest in "[0-9]{10}") {
            let raw = format!("7{rest}");
            prop_assert_eq!(normalize_phone(&raw).unwrap(), format!("+{raw}"));
        }

        #[test]
        fn eleven_digits_with_other_prefix_are_rejected(first in "[0-689]", rest in "[0-9]{10}") {
            let raw = format!("{first}{rest}");
            prop_assert!(normalize_phone(&raw).is_err());
        }

        #[test]
        fn any_non_digit_is_rejected(head in "[0-9]{0,9}", bad in "[^0-9]", tail in "[0-9]{0,9}") {
            let raw = format!("{head}{bad}{tail}");
            prop_assert!(normalize_phone(&raw).is_err());
        }

        #[test]
        fn other_lengths_are_rejected(digits in "[0-9]{0,9}|[0-9]{12,16}") {
            prop_assert!(normalize_phone(&digits).is_err());
        }
    }
}
