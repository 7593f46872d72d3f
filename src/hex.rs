//! Intel HEX (I32HEX) load images.
//!
//! A [HexFile] is an ordered set of non-overlapping byte regions plus an
//! optional start address.  Writing emits `:CCAAAATTDD..KK` records: data
//! records chunked at sixteen bytes, an extended-linear-address record
//! whenever the upper sixteen bits of the emission cursor change, a
//! start-linear-address record when a start address is set, and a final
//! end-of-file record.  The checksum makes each record sum to zero
//! modulo 256.

use std::io::{BufRead, Write};

use derive_more::{Display, Error, From};

/// Data record.
const DATA: u8 = 0x00;
/// End-of-file record; zero-length, always last.
const EOF: u8 = 0x01;
/// Extended linear address record: upper 16 bits of the 32-bit address.
const EXT_LIN_ADDR: u8 = 0x04;
/// Start linear address record: the 32-bit entry point.
const START_LIN_ADDR: u8 = 0x05;

/// Bytes per data record.
const CHUNK: usize = 16;

#[derive(Debug, Display, Error, From)]
pub enum HexError {
    #[display("malformed record: {_0}")]
    #[from(skip)]
    BadRecord(#[error(not(source))] String),
    #[display("record checksum is not zero")]
    Checksum,
    #[display("record type {_0:#04x} not implemented")]
    UnknownType(#[error(not(source))] u8),
    #[display("record after the end-of-file record")]
    AfterEof,
    #[display("overlapping regions")]
    Overlap,
    #[from]
    Io(std::io::Error),
}

/// A contiguous run of bytes at an absolute address.
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[display("region at {address:#010x} of {} bytes", data.len())]
pub struct Region {
    pub address: u32,
    pub data: Vec<u8>,
}

impl Region {
    pub fn end(&self) -> u32 {
        self.address + self.data.len() as u32
    }
}

/// An Intel HEX image.
#[derive(Default, PartialEq, Eq, Debug)]
pub struct HexFile {
    pub regions: Vec<Region>,
    pub start: Option<u32>,
}

impl HexFile {
    pub fn new() -> HexFile {
        HexFile::default()
    }

    /// Insert a region, keeping the set sorted and merging regions that
    /// touch.  Overlap is refused.
    pub fn add_region(&mut self, address: u32, data: Vec<u8>) -> Result<(), HexError> {
        self.regions.push(Region { address, data });
        self.normalize()
    }

    /// Fold another image's regions into this one.
    pub fn merge(&mut self, other: HexFile) -> Result<(), HexError> {
        for r in other.regions {
            self.add_region(r.address, r.data)?;
        }
        Ok(())
    }

    fn normalize(&mut self) -> Result<(), HexError> {
        self.regions.sort_by_key(|r| r.address);
        let mut i = 0;
        while i + 1 < self.regions.len() {
            if self.regions[i].end() == self.regions[i + 1].address {
                let next = self.regions.remove(i + 1);
                self.regions[i].data.extend(next.data);
            } else if self.regions[i].end() > self.regions[i + 1].address {
                return Err(HexError::Overlap);
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// Parse records from a reader.  Lines that do not start with `:` are
    /// ignored, everything after the end-of-file record is refused.
    pub fn load(reader: impl BufRead) -> Result<HexFile, HexError> {
        let mut hex = HexFile::new();
        let mut ext: u32 = 0;
        let mut done = false;
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || !line.starts_with(':') {
                continue;
            }
            let (address, typ, data) = parse_record(line)?;
            if done {
                return Err(HexError::AfterEof);
            }
            match typ {
                DATA => hex.add_region(ext + address as u32, data)?,
                EXT_LIN_ADDR => {
                    if data.len() < 2 {
                        return Err(HexError::BadRecord("short extended address".into()));
                    }
                    ext = u32::from(u16::from_be_bytes([data[0], data[1]])) << 16;
                }
                START_LIN_ADDR => {
                    let bytes: [u8; 4] = data
                        .as_slice()
                        .try_into()
                        .map_err(|_| HexError::BadRecord("short start address".into()))?;
                    hex.start = Some(u32::from_be_bytes(bytes));
                }
                EOF => {
                    if !data.is_empty() {
                        return Err(HexError::BadRecord("end-of-file record not empty".into()));
                    }
                    done = true;
                }
                other => return Err(HexError::UnknownType(other)),
            }
        }
        Ok(hex)
    }

    /// Write the image out, one record per line.
    pub fn save(&self, writer: &mut impl Write) -> Result<(), HexError> {
        let mut upper: Option<u32> = None;
        for region in &self.regions {
            let mut address = region.address;
            let mut data = region.data.as_slice();
            while !data.is_empty() {
                if upper != Some(address >> 16) {
                    upper = Some(address >> 16);
                    emit(writer, 0, EXT_LIN_ADDR, &((address >> 16) as u16).to_be_bytes())?;
                }
                // Never let a record straddle a 64 KiB boundary.
                let room = 0x1_0000 - (address as usize & 0xffff);
                let take = data.len().min(CHUNK).min(room);
                emit(writer, address as u16, DATA, &data[..take])?;
                address += take as u32;
                data = &data[take..];
            }
        }
        if let Some(start) = self.start {
            emit(writer, 0, START_LIN_ADDR, &start.to_be_bytes())?;
        }
        emit(writer, 0, EOF, &[])?;
        Ok(())
    }
}

/// Format one record; the checksum is the two's complement of the byte
/// sum, so the whole record sums to zero.
fn emit(writer: &mut impl Write, address: u16, typ: u8, data: &[u8]) -> Result<(), HexError> {
    let mut bytes = Vec::with_capacity(data.len() + 5);
    bytes.push(data.len() as u8);
    bytes.extend_from_slice(&address.to_be_bytes());
    bytes.push(typ);
    bytes.extend_from_slice(data);
    let sum: u8 = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    bytes.push(sum.wrapping_neg());
    write!(writer, ":")?;
    for b in &bytes {
        write!(writer, "{b:02X}")?;
    }
    writeln!(writer)?;
    Ok(())
}

/// Split one `:CCAAAATTDD..KK` line into address, type and payload.
fn parse_record(line: &str) -> Result<(u16, u8, Vec<u8>), HexError> {
    let hex = &line[1..];
    if hex.len() % 2 != 0 || hex.len() < 10 {
        return Err(HexError::BadRecord(line.into()));
    }
    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for i in (0..hex.len()).step_by(2) {
        let b = u8::from_str_radix(&hex[i..i + 2], 16)
            .map_err(|_| HexError::BadRecord(line.into()))?;
        bytes.push(b);
    }
    let count = bytes[0] as usize;
    if bytes.len() != count + 5 {
        return Err(HexError::BadRecord("byte count field incorrect".into()));
    }
    if bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)) != 0 {
        return Err(HexError::Checksum);
    }
    let address = u16::from_be_bytes([bytes[1], bytes[2]]);
    let typ = bytes[3];
    let data = bytes[4..4 + count].to_vec();
    Ok((address, typ, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn saved(hex: &HexFile) -> String {
        let mut out = Vec::new();
        hex.save(&mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn save_produces_expected_records() {
        let mut hex = HexFile::new();
        hex.add_region(0x0800_0000, vec![1, 2, 3, 4]).unwrap();
        hex.start = Some(0x0800_0000);
        assert_eq!(
            saved(&hex),
            ":020000040800F2\n:0400000001020304F2\n:0400000508000000EF\n:00000001FF\n"
        );
    }

    #[test]
    fn round_trip_preserves_the_image()  {
        let mut hex = HexFile::new();
        hex.add_region(0x0800_0000, (0..40).collect()).unwrap();
        hex.add_region(0x0001_0000, vec![0xaa; 7]).unwrap();
        hex.start = Some(0x0800_0000);
        let text = saved(&hex);
        let back = HexFile::load(text.as_bytes()).unwrap();
        assert_eq!(back, hex);
    }

    #[test]
    fn every_record_checksums_to_zero() {
        let mut hex = HexFile::new();
        hex.add_region(0xfff0, (0..64).collect()).unwrap();
        for line in saved(&hex).lines() {
            let bytes: Vec<u8> = (1..line.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(&line[i..i + 2], 16).unwrap())
                .collect();
            let sum = bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
            assert_eq!(sum, 0, "{line}");
        }
    }

    #[test]
    fn upper_address_change_emits_type_four() {
        // A region crossing a 64 KiB boundary needs a second extended
        // linear address record.
        let mut hex = HexFile::new();
        hex.add_region(0xfff8, vec![0u8; 16]).unwrap();
        let text = saved(&hex);
        let ext: Vec<&str> =
            text.lines().filter(|l| l.len() >= 9 && &l[7..9] == "04").collect();
        assert_eq!(ext.len(), 2, "{text}");
    }

    #[test]
    fn adjacent_regions_merge() {
        let mut hex = HexFile::new();
        hex.add_region(0x104, vec![3, 4]).unwrap();
        hex.add_region(0x100, vec![0, 1]).unwrap();
        hex.add_region(0x102, vec![2]).unwrap();
        hex.add_region(0x105, vec![5]).unwrap();
        assert_eq!(hex.regions.len(), 2);
        assert_eq!(hex.regions[0].data, vec![0, 1, 2]);
        assert_eq!(hex.regions[1].data, vec![3, 4, 5]);
    }

    #[test]
    fn overlapping_region_is_refused() {
        let mut hex = HexFile::new();
        hex.add_region(0x100, vec![0x11]).unwrap();
        assert!(matches!(hex.add_region(0x100, vec![0, 0]), Err(HexError::Overlap)));
    }

    #[test]
    fn record_after_eof_is_refused() {
        let text = ":00000001FF\n:0100000055AA\n";
        assert!(matches!(HexFile::load(text.as_bytes()), Err(HexError::AfterEof)));
    }

    #[test]
    fn bad_checksum_is_refused() {
        let text = ":0100000055AB\n";
        assert!(matches!(HexFile::load(text.as_bytes()), Err(HexError::Checksum)));
    }

    #[test]
    fn unknown_record_type_is_refused() {
        let text = ":00000003FD\n";
        assert!(matches!(HexFile::load(text.as_bytes()), Err(HexError::UnknownType(3))));
    }
}
