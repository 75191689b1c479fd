//! Path segments derived from remote titles, and the on-disk image layout
//!
//! All paths here are relative to the storage root and always use `/`.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref UNSAFE_CHARS: Regex = Regex::new(r"[^A-Za-z0-9._-]").unwrap();
}

/// Top-level directory for every downloaded image
pub const IMAGES_DIR: &str = "images";
pub const THUMBNAIL_FILE: &str = "thumbnail.png";

/// Replace every character outside `[A-Za-z0-9._-]` with `_`
pub fn sanitize(name: &str) -> String {
    UNSAFE_CHARS.replace_all(name, "_").into_owned()
}

/// A sanitized name usable as one directory. `.` and `..` survive
/// sanitizing and an empty name stays empty, so those become `_`.
fn segment(name: &str) -> String {
    let sanitized = sanitize(name);
    match sanitized.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => sanitized,
    }
}

/// `images/<comic>`
pub fn comic_dir(comic_name: &str) -> String {
    format!("{}/{}", IMAGES_DIR, segment(comic_name))
}

/// `images/<comic>/<chapter>`
pub fn chapter_dir(comic_name: &str, chapter_name: &str) -> String {
    format!("{}/{}", comic_dir(comic_name), segment(chapter_name))
}

/// `images/<comic>/thumbnail.png`
pub fn thumbnail_path(comic_name: &str) -> String {
    format!("{}/{}", comic_dir(comic_name), THUMBNAIL_FILE)
}

/// `images/<comic>/<chapter>/images_<index>.png`, index zero-based
pub fn chapter_image_path(comic_name: &str, chapter_name: &str, index: usize) -> String {
    format!("{}/images_{}.png", chapter_dir(comic_name, chapter_name), index)
}
