//! Image file helpers.

use std::fs;
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};
use crate::protocol::PAGE_UNIT_SIZE;

/// Parse a byte count: decimal, `0x` hexadecimal, or with a `K` suffix for
/// KiB (`32K` = 32768).
pub fn parse_size(text: &str) -> Result<usize> {
    let text = text.trim();
    let invalid = || Error::InvalidImage(format!("invalid size '{text}'"));

    let (digits, multiplier) = match text
        .strip_suffix('K')
        .or_else(|| text.strip_suffix('k'))
    {
        Some(rest) => (rest, 1024),
        None => (text, 1),
    };

    let value = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        usize::from_str_radix(hex, 16).map_err(|_| invalid())?
    } else {
        digits
            .parse::<usize>()
            .map_err(|_| invalid())?
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(invalid)
}

/// Read an image file.
pub fn load_image(path: &Path) -> Result<Vec<u8>> {
    let data = fs::read(path)?;
    debug!("Loaded {} bytes from {}", data.len(), path.display());
    Ok(data)
}

/// Extend `image` with `fill` up to the next page-unit boundary.
pub fn pad_to_page_unit(image: &mut Vec<u8>, fill: u8) -> usize {
    let target = image
        .len()
        .div_ceil(PAGE_UNIT_SIZE)
        * PAGE_UNIT_SIZE;
    let added = target - image.len();
    image.resize(target, fill);
    added
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_forms() {
        assert_eq!(parse_size("20000").unwrap(), 20000);
        assert_eq!(parse_size("0x8000").unwrap(), 0x8000);
        assert_eq!(parse_size("32K").unwrap(), 32768);
        assert_eq!(parse_size("1k").unwrap(), 1024);
        assert_eq!(parse_size("0x10K").unwrap(), 16 * 1024);
        assert_eq!(parse_size(" 512 ").unwrap(), 512);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        for bad in ["", "K", "0x", "12Q", "-5", "0xZZ"] {
            assert!(parse_size(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn test_pad_to_page_unit() {
        let mut image = vec![0u8; 300];
        assert_eq!(pad_to_page_unit(&mut image, 0xFF), 212);
        assert_eq!(image.len(), 512);
        assert_eq!(image[511], 0xFF);

        let mut aligned = vec![0u8; 256];
        assert_eq!(pad_to_page_unit(&mut aligned, 0xFF), 0);
    }

    #[test]
    fn test_load_image_missing_file() {
        let err = load_image(Path::new("/nonexistent/eeflash/rom.bin")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
