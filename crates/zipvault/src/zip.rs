use std::io::Write;

use anyhow::{bail, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use time::macros::datetime;
use time::OffsetDateTime;

use crate::crc32::crc32;

pub(crate) const LOCAL_FILE_HEADER_SIG: u32 = 0x0403_4b50;
pub(crate) const CENTRAL_DIR_HEADER_SIG: u32 = 0x0201_4b50;
pub(crate) const EOCD_SIG: u32 = 0x0605_4b50;

pub(crate) const LOCAL_FILE_HEADER_LEN: usize = 30;
pub(crate) const CENTRAL_DIR_HEADER_LEN: usize = 46;
pub(crate) const EOCD_LEN: usize = 22;

const VERSION_NEEDED: u16 = 20;
const VERSION_MADE_BY: u16 = 0x0314;

const DOS_FLOOR: (u16, u16) = (0x0000, 0x0021);
const DOS_CEIL: (u16, u16) = (0xBF7D, 0xFF9F);

/// Unix millis to DOS (time, date) words, UTC, clamped to 1980..=2107.
pub fn dos_datetime(unix_ms: i64) -> (u16, u16) {
    let Ok(ts) = OffsetDateTime::from_unix_timestamp(unix_ms.div_euclid(1000)) else {
        return if unix_ms < 0 { DOS_FLOOR } else { DOS_CEIL };
    };
    if ts < datetime!(1980-01-01 00:00:00 UTC) {
        return DOS_FLOOR;
    }
    if ts > datetime!(2107-12-31 23:59:59 UTC) {
        return DOS_CEIL;
    }
    let time = ((ts.hour() as u16) << 11) | ((ts.minute() as u16) << 5) | (ts.second() as u16 / 2);
    let date = (((ts.year() - 1980) as u16) << 9) | ((ts.month() as u16) << 5) | ts.day() as u16;
    (time, date)
}

pub struct ZipEntry {
    pub name: String,
    pub data: Vec<u8>,
    pub modified_ms: i64,
}

struct CentralRecord {
    name: Vec<u8>,
    crc: u32,
    size: u32,
    time: u16,
    date: u16,
    offset: u32,
}

pub struct ZipWriter<W: Write> {
    sink: W,
    offset: u64,
    central: Vec<CentralRecord>,
}

impl<W: Write> ZipWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            sink,
            offset: 0,
            central: Vec::new(),
        }
    }

    pub fn entry_count(&self) -> usize {
        self.central.len()
    }

    pub fn push(&mut self, name: &str, modified_ms: i64, data: &[u8]) -> Result<()> {
        if name.len() > u16::MAX as usize {
            bail!("Entry name is longer than {} bytes", u16::MAX);
        }
        let Ok(size) = u32::try_from(data.len()) else {
            bail!("Entry {name} doesn't fit a zip32 size field");
        };
        let Ok(offset) = u32::try_from(self.offset) else {
            bail!("Archive grew past the zip32 offset limit");
        };
        if self.central.len() >= u16::MAX as usize {
            bail!("Archive holds the zip32 maximum of {} entries", u16::MAX);
        }
        let crc = crc32(data);
        let (time, date) = dos_datetime(modified_ms);

        self.sink.write_u32::<LittleEndian>(LOCAL_FILE_HEADER_SIG)?;
        self.sink.write_u16::<LittleEndian>(VERSION_NEEDED)?;
        self.sink.write_u16::<LittleEndian>(0)?; // flags
        self.sink.write_u16::<LittleEndian>(0)?; // method: store
        self.sink.write_u16::<LittleEndian>(time)?;
        self.sink.write_u16::<LittleEndian>(date)?;
        self.sink.write_u32::<LittleEndian>(crc)?;
        self.sink.write_u32::<LittleEndian>(size)?;
        self.sink.write_u32::<LittleEndian>(size)?;
        self.sink.write_u16::<LittleEndian>(name.len() as u16)?;
        self.sink.write_u16::<LittleEndian>(0)?; // extra field len
        self.sink.write_all(name.as_bytes())?;
        self.sink.write_all(data)?;

        self.offset += (LOCAL_FILE_HEADER_LEN + name.len()) as u64 + size as u64;
        self.central.push(CentralRecord {
            name: name.as_bytes().to_vec(),
            crc,
            size,
            time,
            date,
            offset,
        });
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        let Ok(cd_offset) = u32::try_from(self.offset) else {
            bail!("Archive grew past the zip32 offset limit");
        };
        let mut cd_size = 0u64;
        for rec in &self.central {
            self.sink.write_u32::<LittleEndian>(CENTRAL_DIR_HEADER_SIG)?;
            self.sink.write_u16::<LittleEndian>(VERSION_MADE_BY)?;
            self.sink.write_u16::<LittleEndian>(VERSION_NEEDED)?;
            self.sink.write_u16::<LittleEndian>(0)?; // flags
            self.sink.write_u16::<LittleEndian>(0)?; // method: store
            self.sink.write_u16::<LittleEndian>(rec.time)?;
            self.sink.write_u16::<LittleEndian>(rec.date)?;
            self.sink.write_u32::<LittleEndian>(rec.crc)?;
            self.sink.write_u32::<LittleEndian>(rec.size)?;
            self.sink.write_u32::<LittleEndian>(rec.size)?;
            self.sink.write_u16::<LittleEndian>(rec.name.len() as u16)?;
            self.sink.write_u16::<LittleEndian>(0)?; // extra field len
            self.sink.write_u16::<LittleEndian>(0)?; // comment len
            self.sink.write_u16::<LittleEndian>(0)?; // disk number start
            self.sink.write_u16::<LittleEndian>(0)?; // internal attributes
            self.sink.write_u32::<LittleEndian>(0)?; // external attributes
            self.sink.write_u32::<LittleEndian>(rec.offset)?;
            self.sink.write_all(&rec.name)?;
            cd_size += (CENTRAL_DIR_HEADER_LEN + rec.name.len()) as u64;
        }
        let Ok(cd_size) = u32::try_from(cd_size) else {
            bail!("Central directory grew past the zip32 size limit");
        };
        let count = self.central.len() as u16;
        self.sink.write_u32::<LittleEndian>(EOCD_SIG)?;
        self.sink.write_u16::<LittleEndian>(0)?; // this disk
        self.sink.write_u16::<LittleEndian>(0)?; // central dir start disk
        self.sink.write_u16::<LittleEndian>(count)?;
        self.sink.write_u16::<LittleEndian>(count)?;
        self.sink.write_u32::<LittleEndian>(cd_size)?;
        self.sink.write_u32::<LittleEndian>(cd_offset)?;
        self.sink.write_u16::<LittleEndian>(0)?; // comment len
        Ok(self.sink)
    }
}

pub fn build_zip(entries: &[ZipEntry]) -> Result<Vec<u8>> {
    let mut writer = ZipWriter::new(Vec::new());
    for entry in entries {
        writer.push(&entry.name, entry.modified_ms, &entry.data)?;
    }
    writer.finish()
}
