use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, Timelike};
use std::io::{Cursor, Write};

use crate::error::{Result, ZipError};

/// Value of a 32-bit size/offset field whose real value lives in a zip64 record.
pub const SENTINEL32: u32 = 0xFFFF_FFFF;

/// Value of a 16-bit count field whose real value lives in a zip64 record.
pub const SENTINEL16: u16 = 0xFFFF;

/// Header id of the zip64 extended information extra field.
pub const ZIP64_EXTRA_ID: u16 = 0x0001;

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unknown(v) => *v,
        }
    }

    /// Human readable name, including well known methods this crate cannot decode.
    pub fn name(&self) -> &'static str {
        match self.as_u16() {
            0 => "stored",
            8 => "deflate",
            9 => "deflate64",
            12 => "bzip2",
            14 => "lzma",
            19 => "lz77",
            99 => "aes",
            _ => "unknown",
        }
    }

    pub(crate) fn unsupported(&self) -> ZipError {
        ZipError::UnsupportedMethod {
            method: self.as_u16(),
            name: self.name(),
        }
    }
}

/// Packed MS-DOS date and time: `year-1980(7) month(4) day(5)` in the high half,
/// `hour(5) minute(6) second/2(5)` in the low half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DosDateTime(u32);

impl DosDateTime {
    /// 1980-01-01 00:00:00, the earliest representable instant.
    pub const MIN: DosDateTime = DosDateTime((1 << 21) | (1 << 16));

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn from_parts(time: u16, date: u16) -> Self {
        Self(time as u32 | (date as u32) << 16)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn time(&self) -> u16 {
        self.0 as u16
    }

    pub fn date(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// Pack a local date-time. Years before 1980 clamp to [`DosDateTime::MIN`],
    /// years after 2107 to the last representable second.
    pub fn from_naive(dt: NaiveDateTime) -> Self {
        let year = dt.year() - 1980;
        if year < 0 {
            return Self::MIN;
        }
        if year > 127 {
            return Self((127 << 25) | (12 << 21) | (31 << 16) | (23 << 11) | (59 << 5) | 29);
        }
        Self(
            (year as u32) << 25
                | dt.month() << 21
                | dt.day() << 16
                | dt.hour() << 11
                | dt.minute() << 5
                | dt.second() >> 1,
        )
    }

    /// Current local time.
    pub fn now() -> Self {
        Self::from_naive(Local::now().naive_local())
    }

    /// (year, month, day)
    pub fn ymd(&self) -> (u16, u8, u8) {
        let date = self.date();
        let day = (date & 0x1F) as u8;
        let month = ((date >> 5) & 0x0F) as u8;
        let year = ((date >> 9) & 0x7F) + 1980;
        (year, month, day)
    }

    /// (hour, minute, second)
    pub fn hms(&self) -> (u8, u8, u8) {
        let time = self.time();
        let second = ((time & 0x1F) * 2) as u8;
        let minute = ((time >> 5) & 0x3F) as u8;
        let hour = ((time >> 11) & 0x1F) as u8;
        (hour, minute, second)
    }

    /// Unpacked value, or `None` when the fields do not form a real date.
    pub fn to_naive(&self) -> Option<NaiveDateTime> {
        let (year, month, day) = self.ymd();
        let (hour, minute, second) = self.hms();
        NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)?.and_hms_opt(
            hour as u32,
            minute as u32,
            second as u32,
        )
    }
}

impl Default for DosDateTime {
    fn default() -> Self {
        Self::MIN
    }
}

/// End of Central Directory (EOCD) - 22 bytes minimum
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(ZipError::format("invalid end of central directory"));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_number: cursor.read_u16::<LittleEndian>()?,
            disk_with_cd: cursor.read_u16::<LittleEndian>()?,
            disk_entries: cursor.read_u16::<LittleEndian>()?,
            total_entries: cursor.read_u16::<LittleEndian>()?,
            cd_size: cursor.read_u32::<LittleEndian>()?,
            cd_offset: cursor.read_u32::<LittleEndian>()?,
            comment_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn is_zip64(&self) -> bool {
        self.disk_entries == SENTINEL16
            || self.total_entries == SENTINEL16
            || self.cd_size == SENTINEL32
            || self.cd_offset == SENTINEL32
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(Self::SIGNATURE)?;
        w.write_u16::<LittleEndian>(self.disk_number)?;
        w.write_u16::<LittleEndian>(self.disk_with_cd)?;
        w.write_u16::<LittleEndian>(self.disk_entries)?;
        w.write_u16::<LittleEndian>(self.total_entries)?;
        w.write_u32::<LittleEndian>(self.cd_size)?;
        w.write_u32::<LittleEndian>(self.cd_offset)?;
        w.write_u16::<LittleEndian>(self.comment_len)?;
        Ok(())
    }
}

/// ZIP64 End of Central Directory Locator - 20 bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zip64EOCDLocator {
    pub disk_with_eocd64: u32,
    pub eocd64_offset: u64,
    pub total_disks: u32,
}

impl Zip64EOCDLocator {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(ZipError::format("invalid zip64 end of central directory locator"));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_with_eocd64: cursor.read_u32::<LittleEndian>()?,
            eocd64_offset: cursor.read_u64::<LittleEndian>()?,
            total_disks: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(Self::SIGNATURE)?;
        w.write_u32::<LittleEndian>(self.disk_with_eocd64)?;
        w.write_u64::<LittleEndian>(self.eocd64_offset)?;
        w.write_u32::<LittleEndian>(self.total_disks)?;
        Ok(())
    }
}

/// ZIP64 End of Central Directory - 56 bytes minimum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zip64EOCD {
    pub eocd64_size: u64,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub disk_with_cd: u32,
    pub disk_entries: u64,
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EOCD {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x06";
    pub const MIN_SIZE: usize = 56;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE || &data[0..4] != Self::SIGNATURE {
            return Err(ZipError::format("invalid zip64 end of central directory"));
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            eocd64_size: cursor.read_u64::<LittleEndian>()?,
            version_made_by: cursor.read_u16::<LittleEndian>()?,
            version_needed: cursor.read_u16::<LittleEndian>()?,
            disk_number: cursor.read_u32::<LittleEndian>()?,
            disk_with_cd: cursor.read_u32::<LittleEndian>()?,
            disk_entries: cursor.read_u64::<LittleEndian>()?,
            total_entries: cursor.read_u64::<LittleEndian>()?,
            cd_size: cursor.read_u64::<LittleEndian>()?,
            cd_offset: cursor.read_u64::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(Self::SIGNATURE)?;
        w.write_u64::<LittleEndian>(self.eocd64_size)?;
        w.write_u16::<LittleEndian>(self.version_made_by)?;
        w.write_u16::<LittleEndian>(self.version_needed)?;
        w.write_u32::<LittleEndian>(self.disk_number)?;
        w.write_u32::<LittleEndian>(self.disk_with_cd)?;
        w.write_u64::<LittleEndian>(self.disk_entries)?;
        w.write_u64::<LittleEndian>(self.total_entries)?;
        w.write_u64::<LittleEndian>(self.cd_size)?;
        w.write_u64::<LittleEndian>(self.cd_offset)?;
        Ok(())
    }
}

/// Central Directory File Header (CDFH) - 46 bytes minimum
pub const CDFH_SIGNATURE: &[u8] = b"PK\x01\x02";
pub const CDFH_MIN_SIZE: usize = 46;

/// Local File Header (LFH) - 30 bytes
pub const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";
pub const LFH_SIZE: usize = 30;

/// Fixed part of a central directory record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CentralHeader {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub modified: u32,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name_len: u16,
    pub extra_len: u16,
    pub comment_len: u16,
    pub disk_start: u16,
    pub internal_attrs: u16,
    pub external_attrs: u32,
    pub lfh_offset: u32,
}

impl CentralHeader {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < CDFH_MIN_SIZE {
            return Err(ZipError::format("truncated central directory header"));
        }
        if &data[0..4] != CDFH_SIGNATURE {
            return Err(ZipError::format(format!(
                "expected central directory signature 02014b50, found {:02x?}",
                &data[0..4]
            )));
        }

        let mut cursor = Cursor::new(&data[4..]);

        let version_made_by = cursor.read_u16::<LittleEndian>()?;
        let version_needed = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let method = cursor.read_u16::<LittleEndian>()?;
        let time = cursor.read_u16::<LittleEndian>()?;
        let date = cursor.read_u16::<LittleEndian>()?;
        Ok(Self {
            version_made_by,
            version_needed,
            flags,
            method,
            modified: DosDateTime::from_parts(time, date).raw(),
            crc32: cursor.read_u32::<LittleEndian>()?,
            compressed_size: cursor.read_u32::<LittleEndian>()?,
            uncompressed_size: cursor.read_u32::<LittleEndian>()?,
            name_len: cursor.read_u16::<LittleEndian>()?,
            extra_len: cursor.read_u16::<LittleEndian>()?,
            comment_len: cursor.read_u16::<LittleEndian>()?,
            disk_start: cursor.read_u16::<LittleEndian>()?,
            internal_attrs: cursor.read_u16::<LittleEndian>()?,
            external_attrs: cursor.read_u32::<LittleEndian>()?,
            lfh_offset: cursor.read_u32::<LittleEndian>()?,
        })
    }

    /// Total record length including the variable parts.
    pub fn record_len(&self) -> u64 {
        CDFH_MIN_SIZE as u64 + self.name_len as u64 + self.extra_len as u64 + self.comment_len as u64
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let modified = DosDateTime::from_raw(self.modified);
        w.write_all(CDFH_SIGNATURE)?;
        w.write_u16::<LittleEndian>(self.version_made_by)?;
        w.write_u16::<LittleEndian>(self.version_needed)?;
        w.write_u16::<LittleEndian>(self.flags)?;
        w.write_u16::<LittleEndian>(self.method)?;
        w.write_u16::<LittleEndian>(modified.time())?;
        w.write_u16::<LittleEndian>(modified.date())?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        w.write_u32::<LittleEndian>(self.compressed_size)?;
        w.write_u32::<LittleEndian>(self.uncompressed_size)?;
        w.write_u16::<LittleEndian>(self.name_len)?;
        w.write_u16::<LittleEndian>(self.extra_len)?;
        w.write_u16::<LittleEndian>(self.comment_len)?;
        w.write_u16::<LittleEndian>(self.disk_start)?;
        w.write_u16::<LittleEndian>(self.internal_attrs)?;
        w.write_u32::<LittleEndian>(self.external_attrs)?;
        w.write_u32::<LittleEndian>(self.lfh_offset)?;
        Ok(())
    }
}

/// Fixed part of a local file header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalHeader {
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub modified: u32,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name_len: u16,
    pub extra_len: u16,
}

impl LocalHeader {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < LFH_SIZE {
            return Err(ZipError::format("truncated local file header"));
        }
        if &data[0..4] != LFH_SIGNATURE {
            return Err(ZipError::format(format!(
                "expected local header signature 04034b50, found {:02x?}",
                &data[0..4]
            )));
        }

        let mut cursor = Cursor::new(&data[4..]);

        let version_needed = cursor.read_u16::<LittleEndian>()?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let method = cursor.read_u16::<LittleEndian>()?;
        let time = cursor.read_u16::<LittleEndian>()?;
        let date = cursor.read_u16::<LittleEndian>()?;
        Ok(Self {
            version_needed,
            flags,
            method,
            modified: DosDateTime::from_parts(time, date).raw(),
            crc32: cursor.read_u32::<LittleEndian>()?,
            compressed_size: cursor.read_u32::<LittleEndian>()?,
            uncompressed_size: cursor.read_u32::<LittleEndian>()?,
            name_len: cursor.read_u16::<LittleEndian>()?,
            extra_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    /// Header length including name and extra field; the entry data follows.
    pub fn header_len(&self) -> u64 {
        LFH_SIZE as u64 + self.name_len as u64 + self.extra_len as u64
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        let modified = DosDateTime::from_raw(self.modified);
        w.write_all(LFH_SIGNATURE)?;
        w.write_u16::<LittleEndian>(self.version_needed)?;
        w.write_u16::<LittleEndian>(self.flags)?;
        w.write_u16::<LittleEndian>(self.method)?;
        w.write_u16::<LittleEndian>(modified.time())?;
        w.write_u16::<LittleEndian>(modified.date())?;
        w.write_u32::<LittleEndian>(self.crc32)?;
        w.write_u32::<LittleEndian>(self.compressed_size)?;
        w.write_u32::<LittleEndian>(self.uncompressed_size)?;
        w.write_u16::<LittleEndian>(self.name_len)?;
        w.write_u16::<LittleEndian>(self.extra_len)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dos_time_round_trips_even_seconds() {
        let dt = NaiveDate::from_ymd_opt(2022, 6, 15)
            .unwrap()
            .and_hms_opt(13, 45, 58)
            .unwrap();
        let packed = DosDateTime::from_naive(dt);
        assert_eq!(packed.ymd(), (2022, 6, 15));
        assert_eq!(packed.hms(), (13, 45, 58));
        assert_eq!(packed.to_naive(), Some(dt));
    }

    #[test]
    fn dos_time_clamps_before_1980() {
        let dt = NaiveDate::from_ymd_opt(1970, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(DosDateTime::from_naive(dt), DosDateTime::MIN);
        assert_eq!(DosDateTime::MIN.ymd(), (1980, 1, 1));
    }

    #[test]
    fn dos_time_split_matches_header_fields() {
        let packed = DosDateTime::from_parts(0x6B2F, 0x54CF);
        assert_eq!(packed.time(), 0x6B2F);
        assert_eq!(packed.date(), 0x54CF);
        assert_eq!(packed.raw(), 0x54CF_6B2F);
    }

    #[test]
    fn invalid_dos_fields_do_not_unpack() {
        assert_eq!(DosDateTime::from_raw(0).to_naive(), None);
    }

    #[test]
    fn method_names() {
        assert_eq!(CompressionMethod::from_u16(0), CompressionMethod::Stored);
        assert_eq!(CompressionMethod::from_u16(8), CompressionMethod::Deflate);
        assert_eq!(CompressionMethod::from_u16(12).name(), "bzip2");
        assert_eq!(CompressionMethod::from_u16(77).name(), "unknown");
        assert!(matches!(
            CompressionMethod::from_u16(14).unsupported(),
            ZipError::UnsupportedMethod { method: 14, name: "lzma" }
        ));
    }

    #[test]
    fn eocd_write_then_parse() {
        let eocd = EndOfCentralDirectory {
            disk_entries: 3,
            total_entries: 3,
            cd_size: 150,
            cd_offset: 1000,
            comment_len: 4,
            ..Default::default()
        };
        let mut bytes = Vec::new();
        eocd.write_to(&mut bytes).unwrap();
        assert_eq!(bytes.len(), EndOfCentralDirectory::SIZE);
        assert_eq!(EndOfCentralDirectory::from_bytes(&bytes).unwrap(), eocd);
        assert!(!eocd.is_zip64());
    }

    #[test]
    fn central_header_rejects_wrong_signature() {
        let mut bytes = vec![0u8; CDFH_MIN_SIZE];
        bytes[..4].copy_from_slice(LFH_SIGNATURE);
        assert!(matches!(
            CentralHeader::from_bytes(&bytes),
            Err(ZipError::Format(_))
        ));
    }
}
