//! Boundary validation for user-submitted data. Structural constraints live
//! here; the store still re-checks existence and membership, which are not
//! structural.

/// Validates username format: 3-32 characters, alphanumeric plus underscore
/// and hyphen, no leading or trailing special character.
pub fn validate_username(username: &str) -> Result<(), String> {
    if username.len() < 3 {
        return Err("username must be at least 3 characters long".to_string());
    }

    if username.len() > 32 {
        return Err("username must not exceed 32 characters".to_string());
    }

    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(
            "username can only contain alphanumeric characters, underscores, and hyphens"
                .to_string(),
        );
    }

    if username.starts_with('_')
        || username.starts_with('-')
        || username.ends_with('_')
        || username.ends_with('-')
    {
        return Err("username cannot start or end with underscore or hyphen".to_string());
    }

    Ok(())
}

/// Validates display name: 3-64 characters after trimming.
pub fn validate_name(name: &str) -> Result<(), String> {
    let trimmed = name.trim();

    if trimmed.len() < 3 {
        return Err("name must be at least 3 characters long".to_string());
    }

    if trimmed.len() > 64 {
        return Err("name must not exceed 64 characters".to_string());
    }

    Ok(())
}

/// Validates password: 8-128 characters.
pub fn validate_password(password: &str) -> Result<(), String> {
    let len = password.len();
    if !(8..=128).contains(&len) {
        return Err("password must be between 8 and 128 characters".to_string());
    }
    Ok(())
}

/// Validates room name: 1-100 characters after trimming.
pub fn validate_room_name(name: &str) -> Result<(), String> {
    let trimmed = name.trim();

    if trimmed.is_empty() {
        return Err("room name cannot be empty".to_string());
    }

    if trimmed.len() > 100 {
        return Err("room name must not exceed 100 characters".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_length_bounds() {
        assert!(validate_username("ab").is_err());
        assert!(validate_username("abc").is_ok());
        assert!(validate_username(&"a".repeat(33)).is_err());
    }

    #[test]
    fn username_charset() {
        assert!(validate_username("alice_1").is_ok());
        assert!(validate_username("al ice").is_err());
        assert!(validate_username("_alice").is_err());
        assert!(validate_username("alice-").is_err());
    }

    #[test]
    fn password_bounds() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("longenough").is_ok());
    }

    #[test]
    fn room_name_bounds() {
        assert!(validate_room_name("  ").is_err());
        assert!(validate_room_name("general").is_ok());
    }
}
