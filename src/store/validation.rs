use crate::protocol::RegisterUser;
use crate::{AppError, AppResult};

pub fn validate_username(username: &str) -> AppResult<()> {
    let length = username.chars().count();
    let allowed = username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !(3..=32).contains(&length) || !allowed {
        return Err(AppError::ValidationFailed(
            "Username must be 3 to 32 letters, digits or underscores.".to_string(),
        ));
    }
    Ok(())
}

pub fn validate_name(name: &str) -> AppResult<()> {
    if name.trim().is_empty() {
        return Err(AppError::ValidationFailed("Name must not be empty.".to_string()));
    }
    Ok(())
}

/// Long passwords pass as they are, shorter ones need a lower case letter, an
/// upper case letter and a digit.
pub fn validate_password(password: &str) -> AppResult<()> {
    if password.chars().count() >= 32 {
        return Ok(());
    }
    let lower = password.chars().any(char::is_lowercase);
    let upper = password.chars().any(char::is_uppercase);
    let digit = password.chars().any(|c| c.is_ascii_digit());
    if lower && upper && digit {
        return Ok(());
    }
    Err(AppError::ValidationFailed(
        "Password is not strong enough.".to_string(),
    ))
}

pub fn validate_registration(registration: &RegisterUser) -> AppResult<()> {
    validate_username(&registration.username)?;
    validate_name(&registration.first_name)?;
    validate_name(&registration.last_name)?;
    validate_password(&registration.password)?;
    if registration.password != registration.password_confirm {
        return Err(AppError::ValidationFailed("Passwords don't match.".to_string()));
    }
    Ok(())
}
