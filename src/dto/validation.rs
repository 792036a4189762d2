//! Validation helpers for DTOs.

use validator::ValidationError;

const MAX_USER_ID_LEN: usize = 128;

/// Validates an identity-provider user id: non-blank, bounded, no control characters.
///
/// # Examples
///
/// ```ignore
/// validate_user_id("user-42")   // Ok
/// validate_user_id("   ")       // Err - blank
/// validate_user_id("a\nb")      // Err - control character
/// ```
pub fn validate_user_id(id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() {
        let mut err = ValidationError::new("user_id_blank");
        err.message = Some("User ID must not be blank".into());
        return Err(err);
    }

    if id.len() > MAX_USER_ID_LEN {
        let mut err = ValidationError::new("user_id_length");
        err.message = Some(
            format!("User ID must be at most {MAX_USER_ID_LEN} bytes (got {})", id.len()).into(),
        );
        return Err(err);
    }

    if id.chars().any(char::is_control) {
        let mut err = ValidationError::new("user_id_format");
        err.message = Some("User ID must not contain control characters".into());
        return Err(err);
    }

    Ok(())
}
