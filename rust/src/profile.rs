//! Registration field checks and avatar storage paths.

use serde_json::{json, Map, Value};

pub const USERNAME_MIN: usize = 3;
pub const USERNAME_MAX: usize = 30;
pub const AGE_MIN: i32 = 18;
pub const AGE_MAX: i32 = 120;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProfileError {
    #[error("Username must be 3-30 characters")]
    UsernameLength,
    #[error("Username may only contain letters, numbers and underscores")]
    UsernameCharset,
    #[error("Age must be between 18 and 120")]
    AgeOutOfRange,
    #[error("Unsupported image type")]
    UnsupportedImage,
    #[error("Nothing to update")]
    Empty,
}

pub fn validate_username(raw: &str) -> Result<String, ProfileError> {
    let name = raw.trim();
    let len = name.chars().count();
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&len) {
        return Err(ProfileError::UsernameLength);
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ProfileError::UsernameCharset);
    }
    Ok(name.to_string())
}

pub fn validate_age(age: i32) -> Result<i32, ProfileError> {
    if (AGE_MIN..=AGE_MAX).contains(&age) {
        Ok(age)
    } else {
        Err(ProfileError::AgeOutOfRange)
    }
}

/// Validated column patch for `profiles`. `None` fields are left untouched.
pub fn profile_patch(
    username: Option<&str>,
    age: Option<i32>,
    avatar_url: Option<&str>,
) -> Result<Value, ProfileError> {
    let mut patch = Map::new();
    if let Some(name) = username {
        patch.insert("username".into(), json!(validate_username(name)?));
    }
    if let Some(age) = age {
        patch.insert("age".into(), json!(validate_age(age)?));
    }
    if let Some(url) = avatar_url {
        patch.insert("avatar_url".into(), json!(url));
    }
    if patch.is_empty() {
        return Err(ProfileError::Empty);
    }
    Ok(Value::Object(patch))
}

pub fn location_patch(latitude: f64, longitude: f64) -> Value {
    json!({"latitude": latitude, "longitude": longitude})
}

/// Random object name keeping the upload's extension, plus its content type.
pub fn avatar_object(file_name: &str) -> Result<(String, &'static str), ProfileError> {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .ok_or(ProfileError::UnsupportedImage)?;
    let content_type = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        _ => return Err(ProfileError::UnsupportedImage),
    };
    Ok((format!("{}.{ext}", uuid::Uuid::new_v4()), content_type))
}
