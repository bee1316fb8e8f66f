use crate::error::{AppError, Result};

pub fn validate_instance_id(instance_id: &str) -> Result<()> {
    if uuid::Uuid::parse_str(instance_id).is_err() {
        return Err(AppError::other("Invalid instance id"));
    }
    Ok(())
}

/// Map names and workshop ids end up on the command line; restrict them to
/// characters that cannot smuggle extra console commands.
pub fn validate_map_name(map: &str) -> Result<()> {
    let is_safe = !map.is_empty()
        && map
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'));

    if !is_safe {
        return Err(AppError::config(format!("Invalid map name: {map:?}")));
    }
    Ok(())
}
