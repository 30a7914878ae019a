//! Name rules: bucket name validation, filename validation and display-name
//! rendering.

const BUCKET_NAME_MIN_LEN: usize = 6;
const BUCKET_NAME_MAX_LEN: usize = 30;
const FILENAME_MAX_LEN: usize = 255;

/// Validate a bucket name: 6-30 ASCII letters, digits or hyphens.
///
/// Returns the reason on failure.
pub fn check_bucket_name(name: &str) -> Result<(), &'static str> {
    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err("must be between 6 and 30 characters");
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err("allowed characters are letters, digits, and hyphens");
    }
    Ok(())
}

/// Validate a user-supplied filename. It is never used as a path, but it is
/// echoed into response headers.
pub fn check_filename(filename: &str) -> Result<(), &'static str> {
    if filename.is_empty() {
        return Err("filename is empty");
    }
    if filename.len() > FILENAME_MAX_LEN {
        return Err("filename is longer than 255 bytes");
    }
    if filename.chars().any(char::is_control) {
        return Err("filename contains control characters");
    }
    Ok(())
}

/// Render the display name for `filename` with `suffix`.
///
/// Suffix 0 leaves the name untouched. Otherwise `_{suffix}` goes before the
/// last `.`, or at the end when there is no dot.
pub fn display_name(filename: &str, suffix: i64) -> String {
    if suffix == 0 {
        return filename.to_string();
    }
    match filename.rfind('.') {
        Some(dot) => format!("{}_{}{}", &filename[..dot], suffix, &filename[dot..]),
        None => format!("{}_{}", filename, suffix),
    }
}
