use std::path::PathBuf;

pub fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|part| {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}

/// Non-empty variable as a path.
pub fn path_var(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|raw| !raw.trim().is_empty())
        .map(PathBuf::from)
}

/// Non-empty variable, trimmed, left unparsed so the loader can report the
/// offending value.
pub fn raw_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}
