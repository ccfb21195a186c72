//! Decoding of the obfuscated image files the box stores pictures as.

use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageDecodeError {
    #[error("failed to read image: {0}")]
    Io(#[from] io::Error),
    #[error("unknown file type: {0}")]
    UnknownFileType(String),
    #[error("magic guess failed")]
    MagicGuessFailed,
    #[error("no complete image in {0}")]
    NoImage(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    pub data: Vec<u8>,
    pub mime: &'static str,
    pub extension: &'static str,
}

impl DecodedImage {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Turns a file written by the box into a plain image.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> Result<DecodedImage, ImageDecodeError>;
}

/// Header bytes of the formats the desktop client obfuscates.
const XOR_HEADERS: [(&str, &str, u8, u8); 3] = [
    ("jpg", "image/jpeg", 0xff, 0xd8),
    ("png", "image/png", 0x89, 0x50),
    ("gif", "image/gif", 0x47, 0x49),
];

/// Start of every JFIF image in an Android cache blob.
const JFIF_MARKER: [u8; 8] = [0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10, 0x4a, 0x46];

/// Handles desktop `*.dat` files (whole file XORed with one byte) and
/// Android `cache.data.N` blobs (JPEGs concatenated back to back).
#[derive(Debug, Clone, Copy, Default)]
pub struct DatImageDecoder;

impl DatImageDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Guesses the XOR key from the first byte and checks it against the
    /// second byte of each known header.
    pub fn decode_pc_dat(buf: &[u8]) -> Result<DecodedImage, ImageDecodeError> {
        let (first, second) = match buf {
            [a, b, ..] => (*a, *b),
            _ => return Err(ImageDecodeError::MagicGuessFailed),
        };
        for (extension, mime, header, check) in XOR_HEADERS {
            let magic = header ^ first;
            if second ^ magic == check {
                return Ok(DecodedImage {
                    data: buf.iter().map(|b| b ^ magic).collect(),
                    mime,
                    extension,
                });
            }
        }
        Err(ImageDecodeError::MagicGuessFailed)
    }

    /// Returns the last image that is followed by another one; the tail of
    /// the blob may still be being written.
    pub fn decode_android_cache(buf: &[u8]) -> Option<DecodedImage> {
        let starts: Vec<usize> = buf
            .windows(JFIF_MARKER.len())
            .enumerate()
            .filter(|(_, w)| *w == JFIF_MARKER)
            .map(|(i, _)| i)
            .filter(|&i| i > 0)
            .collect();

        let end = *starts.last()?;
        let start = starts
            .len()
            .checked_sub(2)
            .map(|i| starts[i])
            .unwrap_or(0);
        Some(DecodedImage {
            data: buf[start..end].to_vec(),
            mime: "image/jpeg",
            extension: "jpg",
        })
    }
}

fn is_android_cache(name: &str) -> bool {
    name.strip_prefix("cache.data.")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

impl ImageDecoder for DatImageDecoder {
    fn decode(&self, path: &Path) -> Result<DecodedImage, ImageDecodeError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        let display = path.display().to_string();

        if name.ends_with(".dat") && name.len() > ".dat".len() {
            let buf = fs::read(path)?;
            return Self::decode_pc_dat(&buf);
        }
        if is_android_cache(name) {
            let buf = fs::read(path)?;
            return Self::decode_android_cache(&buf).ok_or(ImageDecodeError::NoImage(display));
        }
        Err(ImageDecodeError::UnknownFileType(display))
    }
}

/// Sniffs the mime type of an image blob from its header.
pub fn sniff_mime(data: &[u8]) -> &'static str {
    match data {
        [0xff, 0xd8, 0xff, ..] => "image/jpeg",
        [0x89, b'P', b'N', b'G', ..] => "image/png",
        [b'G', b'I', b'F', b'8', ..] => "image/gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
        [b'B', b'M', ..] => "image/bmp",
        _ => "application/octet-stream",
    }
}
