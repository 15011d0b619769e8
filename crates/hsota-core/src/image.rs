//! ESP application image header parser.
//!
//! Every application image starts with a 24-byte `esp_image_header_t`.
//! Filesystem images have no header and are never parsed here.

use std::fmt;

use thiserror::Error;

/// First byte of every application image.
pub const IMAGE_MAGIC: u8 = 0xE9;

/// Header length in bytes.
pub const IMAGE_HEADER_LEN: usize = 24;

/// Bootloader limit on segments per image.
pub const MAX_SEGMENTS: u8 = 16;

/// Header offsets
const SEGMENT_COUNT_OFFSET: usize = 1;
const SPI_MODE_OFFSET: usize = 2;
const SPI_SPEED_SIZE_OFFSET: usize = 3;
const ENTRY_ADDR_OFFSET: usize = 4;
const CHIP_ID_OFFSET: usize = 12;
const MIN_CHIP_REV_OFFSET: usize = 14;
const HASH_APPENDED_OFFSET: usize = 23;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ImageHeaderError {
    #[error("Image too small: {actual} bytes, header needs {}", IMAGE_HEADER_LEN)]
    TooShort { actual: usize },

    #[error("Invalid image magic 0x{found:02X}, expected 0x{:02X}", IMAGE_MAGIC)]
    InvalidMagic { found: u8 },

    #[error("Invalid segment count {0}")]
    InvalidSegmentCount(u8),
}

/// SPI flash access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpiMode {
    Qio,
    Qout,
    Dio,
    Dout,
    FastRead,
    SlowRead,
    Unknown(u8),
}

impl From<u8> for SpiMode {
    fn from(value: u8) -> Self {
        match value {
            0 => SpiMode::Qio,
            1 => SpiMode::Qout,
            2 => SpiMode::Dio,
            3 => SpiMode::Dout,
            4 => SpiMode::FastRead,
            5 => SpiMode::SlowRead,
            other => SpiMode::Unknown(other),
        }
    }
}

impl fmt::Display for SpiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpiMode::Qio => write!(f, "QIO"),
            SpiMode::Qout => write!(f, "QOUT"),
            SpiMode::Dio => write!(f, "DIO"),
            SpiMode::Dout => write!(f, "DOUT"),
            SpiMode::FastRead => write!(f, "FAST_READ"),
            SpiMode::SlowRead => write!(f, "SLOW_READ"),
            SpiMode::Unknown(v) => write!(f, "UNKNOWN({})", v),
        }
    }
}

/// Parsed application image header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    pub segment_count: u8,
    pub spi_mode: SpiMode,
    /// Raw SPI speed nibble.
    pub spi_speed: u8,
    /// Raw flash size nibble.
    pub flash_size: u8,
    pub entry_addr: u32,
    pub chip_id: u16,
    pub min_chip_rev: u8,
    /// A SHA-256 digest follows the image.
    pub hash_appended: bool,
}

impl ImageHeader {
    /// Parse the header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, ImageHeaderError> {
        if data.len() < IMAGE_HEADER_LEN {
            return Err(ImageHeaderError::TooShort { actual: data.len() });
        }
        if data[0] != IMAGE_MAGIC {
            return Err(ImageHeaderError::InvalidMagic { found: data[0] });
        }

        let segment_count = data[SEGMENT_COUNT_OFFSET];
        if segment_count == 0 || segment_count > MAX_SEGMENTS {
            return Err(ImageHeaderError::InvalidSegmentCount(segment_count));
        }

        let speed_size = data[SPI_SPEED_SIZE_OFFSET];
        let entry_addr = u32::from_le_bytes([
            data[ENTRY_ADDR_OFFSET],
            data[ENTRY_ADDR_OFFSET + 1],
            data[ENTRY_ADDR_OFFSET + 2],
            data[ENTRY_ADDR_OFFSET + 3],
        ]);
        let chip_id = u16::from_le_bytes([data[CHIP_ID_OFFSET], data[CHIP_ID_OFFSET + 1]]);

        Ok(Self {
            segment_count,
            spi_mode: SpiMode::from(data[SPI_MODE_OFFSET]),
            spi_speed: speed_size & 0x0F,
            flash_size: speed_size >> 4,
            entry_addr,
            chip_id,
            min_chip_rev: data[MIN_CHIP_REV_OFFSET],
            hash_appended: data[HASH_APPENDED_OFFSET] == 1,
        })
    }

    /// Flash size in MiB.
    pub fn flash_size_mb(&self) -> Option<u32> {
        (self.flash_size <= 7).then(|| 1u32 << self.flash_size)
    }

    /// SPI clock in MHz.
    pub fn spi_speed_mhz(&self) -> Option<u32> {
        match self.spi_speed {
            0x0 => Some(40),
            0x1 => Some(26),
            0x2 => Some(20),
            0xF => Some(80),
            _ => None,
        }
    }

    /// Chip family name.
    pub fn chip_name(&self) -> &'static str {
        match self.chip_id {
            0x0000 => "ESP32",
            0x0002 => "ESP32-S2",
            0x0005 => "ESP32-C3",
            0x0009 => "ESP32-S3",
            0x000C => "ESP32-C2",
            0x000D => "ESP32-C6",
            0x0010 => "ESP32-H2",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ImageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Chip:        {} (id 0x{:04X})", self.chip_name(), self.chip_id)?;
        writeln!(f, "Segments:    {}", self.segment_count)?;
        writeln!(f, "Entry:       0x{:08X}", self.entry_addr)?;
        writeln!(f, "SPI mode:    {}", self.spi_mode)?;
        match self.spi_speed_mhz() {
            Some(mhz) => writeln!(f, "SPI speed:   {} MHz", mhz)?,
            None => writeln!(f, "SPI speed:   0x{:X}", self.spi_speed)?,
        }
        match self.flash_size_mb() {
            Some(mb) => writeln!(f, "Flash size:  {} MB", mb)?,
            None => writeln!(f, "Flash size:  0x{:X}", self.flash_size)?,
        }
        write!(f, "SHA-256:     {}", if self.hash_appended { "appended" } else { "none" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Vec<u8> {
        let mut h = vec![0u8; IMAGE_HEADER_LEN];
        h[0] = IMAGE_MAGIC;
        h[1] = 5;
        h[2] = 2; // DIO
        h[3] = 0x2F; // 4MB, 80MHz
        h[4..8].copy_from_slice(&0x4008_0F2Cu32.to_le_bytes());
        h[12..14].copy_from_slice(&9u16.to_le_bytes());
        h[23] = 1;
        h
    }

    #[test]
    fn test_parse_header() {
        let header = ImageHeader::parse(&sample_header()).unwrap();
        assert_eq!(header.segment_count, 5);
        assert_eq!(header.spi_mode, SpiMode::Dio);
        assert_eq!(header.spi_speed_mhz(), Some(80));
        assert_eq!(header.flash_size_mb(), Some(4));
        assert_eq!(header.entry_addr, 0x4008_0F2C);
        assert_eq!(header.chip_name(), "ESP32-S3");
        assert!(header.hash_appended);
    }

    #[test]
    fn test_parse_rejects_bad_magic() {
        let mut data = sample_header();
        data[0] = 0x00;
        assert_eq!(
            ImageHeader::parse(&data),
            Err(ImageHeaderError::InvalidMagic { found: 0 })
        );
    }

    #[test]
    fn test_parse_rejects_short_input() {
        assert_eq!(
            ImageHeader::parse(&[IMAGE_MAGIC, 1]),
            Err(ImageHeaderError::TooShort { actual: 2 })
        );
    }

    #[test]
    fn test_parse_rejects_segment_count() {
        let mut data = sample_header();
        data[1] = 0;
        assert_eq!(
            ImageHeader::parse(&data),
            Err(ImageHeaderError::InvalidSegmentCount(0))
        );
        data[1] = 17;
        assert!(ImageHeader::parse(&data).is_err());
    }

    #[test]
    fn test_display_mentions_chip() {
        let header = ImageHeader::parse(&sample_header()).unwrap();
        let text = header.to_string();
        assert!(text.contains("ESP32-S3"));
        assert!(text.contains("4 MB"));
    }
}
