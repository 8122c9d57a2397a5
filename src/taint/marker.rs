//! Finding the configured marker string in data the program just read.

use std::ops::Range;

/// Every occurrence of `marker` in `haystack`, left to right. Matches do not
/// overlap: the search resumes just past the end of each one.
pub fn find_markers<'a>(
    haystack: &'a [u8],
    marker: &'a [u8],
) -> impl Iterator<Item = Range<usize>> + 'a {
    let mut pos = 0;
    std::iter::from_fn(move || {
        if marker.is_empty() {
            return None;
        }
        while pos + marker.len() <= haystack.len() {
            let start = pos;
            if haystack[start..start + marker.len()] == *marker {
                pos = start + marker.len();
                return Some(start..pos);
            }
            pos += 1;
        }
        None
    })
}
