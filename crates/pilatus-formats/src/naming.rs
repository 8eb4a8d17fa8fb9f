//! Frame numbers from detector filenames.
//!
//! Multi-image series are written as `<name>_NNNNN.<ext>`; a single-image
//! acquisition has no `_` suffix and is frame 0.

use tracing::warn;

const FRAME_DIGITS: usize = 5;

/// Frame number encoded in `file_name`.
///
/// Reads up to five digits after the last `_`. A name without `_` is frame 0;
/// a suffix with no digits is logged and also treated as frame 0.
#[must_use]
pub fn frame_number(file_name: &str) -> u32 {
    let Some((_, suffix)) = file_name.rsplit_once('_') else {
        return 0;
    };

    let digits: String = suffix
        .chars()
        .take(FRAME_DIGITS)
        .take_while(char::is_ascii_digit)
        .collect();

    match digits.parse() {
        Ok(frame) => frame,
        Err(_) => {
            warn!(file = file_name, "No frame number after '_', using 0");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_single_image_is_frame_zero() {
        assert_eq!(frame_number("scan3.cbf"), 0);
        assert_eq!(frame_number("frame_name_without_suffix.tif"), 0);
    }

    #[test]
    fn test_series_frames() {
        assert_eq!(frame_number("scan_00007.cbf"), 7);
        assert_eq!(frame_number("scan_00000.tif"), 0);
        assert_eq!(frame_number("scan4_01234.tif"), 1234);
        assert_eq!(frame_number("my_sample_run_00042.cbf"), 42);
    }

    #[test]
    fn test_only_five_digits_are_read() {
        assert_eq!(frame_number("scan_123456.tif"), 12345);
    }

    #[test]
    #[traced_test]
    fn test_suffix_without_digits_logs_warning() {
        assert_eq!(frame_number("dark_frame.tif"), 0);
        assert!(logs_contain("No frame number"));
    }
}
