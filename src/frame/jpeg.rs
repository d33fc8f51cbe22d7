//! Minimal JPEG header inspection
//!
//! Only what the replay source needs: confirm SOI/EOI and read the frame
//! dimensions from the first SOF segment.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum JpegParseError {
    #[error("invalid JPEG: too short")]
    TooShort,

    #[error("missing SOI marker")]
    MissingSoi,

    #[error("missing EOI marker")]
    MissingEoi,

    #[error("missing SOF marker")]
    MissingSof,
}

/// JPEG marker codes
mod markers {
    pub const SOI: u8 = 0xD8; // Start of Image
    pub const EOI: u8 = 0xD9; // End of Image
    pub const SOS: u8 = 0xDA; // Start of Scan
    pub const SOF0: u8 = 0xC0; // Start of Frame (Baseline)
    pub const SOF2: u8 = 0xC2; // Start of Frame (Progressive)
    pub const TEM: u8 = 0x01;
    pub const RST0: u8 = 0xD0;
    pub const RST7: u8 = 0xD7;
}

/// Dimensions read from a JPEG header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JpegInfo {
    pub width: u16,
    pub height: u16,
    pub components: u8,
}

/// Walks the marker segments up to the first SOF and returns its dimensions.
pub fn inspect_jpeg(data: &[u8]) -> Result<JpegInfo, JpegParseError> {
    if data.len() < 4 {
        return Err(JpegParseError::TooShort);
    }

    if data[0] != 0xFF || data[1] != markers::SOI {
        return Err(JpegParseError::MissingSoi);
    }

    let mut pos = 2;
    while pos + 1 < data.len() {
        if data[pos] != 0xFF {
            pos += 1;
            continue;
        }

        let marker = data[pos + 1];
        pos += 2;

        match marker {
            // Fill bytes and standalone markers carry no length
            0xFF => pos -= 1,
            0x00 | markers::SOI | markers::TEM => {}
            markers::RST0..=markers::RST7 => {}

            markers::EOI | markers::SOS => break,

            markers::SOF0..=markers::SOF2 => {
                // length(2) + precision(1) + height(2) + width(2) + components(1)
                if pos + 8 > data.len() {
                    return Err(JpegParseError::TooShort);
                }
                return Ok(JpegInfo {
                    height: u16::from_be_bytes([data[pos + 3], data[pos + 4]]),
                    width: u16::from_be_bytes([data[pos + 5], data[pos + 6]]),
                    components: data[pos + 7],
                });
            }

            _ => {
                if pos + 2 > data.len() {
                    break;
                }
                let length = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
                pos += length;
            }
        }
    }

    Err(JpegParseError::MissingSof)
}

/// Like [`inspect_jpeg`], but also rejects data that does not end in EOI,
/// which is what a file cut short mid-write looks like.
pub fn validate_jpeg(data: &[u8]) -> Result<JpegInfo, JpegParseError> {
    let info = inspect_jpeg(data)?;
    if !data.ends_with(&[0xFF, markers::EOI]) {
        return Err(JpegParseError::MissingEoi);
    }
    Ok(info)
}

#[cfg(test)]
pub(crate) fn create_minimal_jpeg(width: u16, height: u16) -> Vec<u8> {
    let mut jpeg = Vec::new();

    // SOI
    jpeg.extend(&[0xFF, 0xD8]);

    // APP0 stub
    jpeg.extend(&[0xFF, 0xE0, 0x00, 0x04, 0x00, 0x00]);

    // SOF0 (minimal)
    jpeg.extend(&[0xFF, 0xC0]);
    jpeg.extend(&[0x00, 0x0B]); // Length
    jpeg.push(0x08); // Precision
    jpeg.extend(&height.to_be_bytes());
    jpeg.extend(&width.to_be_bytes());
    jpeg.push(0x01); // 1 component (grayscale)
    jpeg.push(0x01); // Component ID
    jpeg.push(0x11); // Sampling factors
    jpeg.push(0x00); // Q table

    // SOS
    jpeg.extend(&[0xFF, 0xDA, 0x00, 0x08, 0x01, 0x01, 0x00, 0x00, 0x3F, 0x00]);

    // Scan data
    jpeg.extend(&[0x01, 0x02, 0x03, 0x04]);

    // EOI
    jpeg.extend(&[0xFF, 0xD9]);

    jpeg
}
