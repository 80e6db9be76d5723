use thiserror::Error;

pub const MIN_PASSWORD_LEN: usize = 4;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordPolicyError {
    #[error("password must be at least {min} characters")]
    TooShort { min: usize },
    #[error("passwords do not match")]
    ConfirmationMismatch,
}

/// Validate a new fallback password and its confirmation before storing it.
pub fn check_new_password(password: &str, confirm: &str) -> Result<(), PasswordPolicyError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(PasswordPolicyError::TooShort {
            min: MIN_PASSWORD_LEN,
        });
    }
    if password != confirm {
        return Err(PasswordPolicyError::ConfirmationMismatch);
    }
    Ok(())
}
