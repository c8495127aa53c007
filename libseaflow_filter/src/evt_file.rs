use bitvec::slice::BitSlice;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use ndarray::{Array2, ArrayView1, Axis};
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::str::FromStr;

use super::constants::*;
use super::error::EvtFileError;
use super::file_id::FileId;

/// The fixed SeaFlow channel set, in on-disk order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Time = 0,
    PulseWidth = 1,
    D1 = 2,
    D2 = 3,
    FscSmall = 4,
    FscPerp = 5,
    FscBig = 6,
    Pe = 7,
    ChlSmall = 8,
    ChlBig = 9,
}

impl Channel {
    pub const ALL: [Channel; CHANNEL_COUNT] = [
        Channel::Time,
        Channel::PulseWidth,
        Channel::D1,
        Channel::D2,
        Channel::FscSmall,
        Channel::FscPerp,
        Channel::FscBig,
        Channel::Pe,
        Channel::ChlSmall,
        Channel::ChlBig,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Channel::Time => "time",
            Channel::PulseWidth => "pulse_width",
            Channel::D1 => "D1",
            Channel::D2 => "D2",
            Channel::FscSmall => "fsc_small",
            Channel::FscPerp => "fsc_perp",
            Channel::FscBig => "fsc_big",
            Channel::Pe => "pe",
            Channel::ChlSmall => "chl_small",
            Channel::ChlBig => "chl_big",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl FromStr for Channel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Channel::ALL
            .iter()
            .find(|c| c.name() == s)
            .copied()
            .ok_or_else(|| s.to_string())
    }
}

/// One particle's channel values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParticleRecord {
    values: [u16; CHANNEL_COUNT],
}

impl ParticleRecord {
    pub fn new(values: [u16; CHANNEL_COUNT]) -> Self {
        Self { values }
    }

    pub fn get(&self, channel: Channel) -> u16 {
        self.values[channel.index()]
    }

    pub fn values(&self) -> &[u16; CHANNEL_COUNT] {
        &self.values
    }
}

/// Compression of a file on disk. Signaled by the file name, never sniffed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    pub fn from_path(path: &Path) -> Self {
        match path.extension() {
            Some(ext) if ext == GZIP_EXTENSION => Compression::Gzip,
            _ => Compression::None,
        }
    }
}

/// An EventFile is the decoded particle table of one acquisition file.
///
/// Particles are stored as rows of an (n, CHANNEL_COUNT) matrix in the on-disk channel
/// order. The table is never modified after decoding; subsets are new EventFiles.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFile {
    pub id: FileId,
    particles: Array2<u16>,
}

impl EventFile {
    pub fn new(id: FileId, particles: Array2<u16>) -> Self {
        Self { id, particles }
    }

    pub fn from_records(id: FileId, records: &[ParticleRecord]) -> Self {
        let mut particles = Array2::<u16>::zeros([records.len(), CHANNEL_COUNT]);
        for (mut row, record) in particles.rows_mut().into_iter().zip(records) {
            for (dst, src) in row.iter_mut().zip(record.values()) {
                *dst = *src;
            }
        }
        Self { id, particles }
    }

    /// Read and decode a file, decompressing if the name ends with .gz
    pub fn read(path: &Path) -> Result<Self, EvtFileError> {
        if !path.exists() {
            return Err(EvtFileError::BadFilePath(path.to_path_buf()));
        }
        let id = FileId::from_path(path)?;
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        spdlog::debug!(
            "Read {} ({})",
            id,
            human_bytes::human_bytes(bytes.len() as f64)
        );
        Self::decode(&bytes, Compression::from_path(path), id)
    }

    /// Decode a complete EVT byte stream.
    pub fn decode(
        bytes: &[u8],
        compression: Compression,
        id: FileId,
    ) -> Result<Self, EvtFileError> {
        match compression {
            Compression::None => Self::decode_raw(bytes, id),
            Compression::Gzip => {
                let mut raw = Vec::new();
                // Instruments may append gzip members to one file
                MultiGzDecoder::new(bytes).read_to_end(&mut raw)?;
                Self::decode_raw(&raw, id)
            }
        }
    }

    fn decode_raw(bytes: &[u8], id: FileId) -> Result<Self, EvtFileError> {
        if bytes.is_empty() {
            return Err(EvtFileError::Empty);
        }
        if bytes.len() < HEADER_SIZE {
            return Err(EvtFileError::BadHeader(bytes.len()));
        }
        let mut cursor = Cursor::new(bytes);
        let declared = cursor.read_u32::<LittleEndian>()?;
        let payload = bytes.len() - HEADER_SIZE;

        if payload % RECORD_SIZE != 0 {
            // Evenly sized rows of the wrong width point at a different channel set
            if declared > 0 && payload % (declared as usize * 2) == 0 {
                return Err(EvtFileError::ChannelMismatch(payload / 2 / declared as usize));
            }
            return Err(EvtFileError::RecordSize(payload));
        }
        let found = payload / RECORD_SIZE;
        if found != declared as usize {
            return Err(EvtFileError::CountMismatch { declared, found });
        }

        let mut particles = Array2::<u16>::zeros([found, CHANNEL_COUNT]);
        for mut row in particles.rows_mut() {
            // Row markers are a LabVIEW artifact and carry no data
            for _ in 0..MARKER_WORDS {
                cursor.read_u16::<LittleEndian>()?;
            }
            for value in row.iter_mut() {
                *value = cursor.read_u16::<LittleEndian>()?;
            }
        }

        Ok(Self { id, particles })
    }

    /// Encode in the on-disk schema (uncompressed)
    pub fn encode(&self) -> std::io::Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.len() * RECORD_SIZE);
        self.encode_into(&mut bytes)?;
        Ok(bytes)
    }

    fn encode_into<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        // The header count is a u32
        let count = u32::try_from(self.len()).map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} particles do not fit an EVT header", self.len()),
            )
        })?;
        writer.write_u32::<LittleEndian>(count)?;
        for row in self.particles.rows() {
            writer.write_u16::<LittleEndian>(ROW_MARKER_FIRST)?;
            writer.write_u16::<LittleEndian>(ROW_MARKER_SECOND)?;
            for value in row.iter() {
                writer.write_u16::<LittleEndian>(*value)?;
            }
        }
        Ok(())
    }

    /// Write to a file, gzip compressed if the name ends with .gz. Parent directories are created.
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        match Compression::from_path(path) {
            Compression::None => {
                let mut writer = std::io::BufWriter::new(file);
                self.encode_into(&mut writer)?;
                writer.flush()?;
            }
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(file, flate2::Compression::default());
                self.encode_into(&mut encoder)?;
                encoder.finish()?;
            }
        }
        Ok(())
    }

    /// The subset of particles whose mask bit is set. The mask must cover every particle.
    pub fn select(&self, mask: &BitSlice) -> Self {
        let indices: Vec<usize> = mask.iter_ones().collect();
        Self {
            id: self.id.clone(),
            particles: self.particles.select(Axis(0), &indices),
        }
    }

    pub fn len(&self) -> usize {
        self.particles.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record(&self, index: usize) -> ParticleRecord {
        let mut values = [0u16; CHANNEL_COUNT];
        for (dst, src) in values.iter_mut().zip(self.particles.row(index)) {
            *dst = *src;
        }
        ParticleRecord { values }
    }

    pub fn column(&self, channel: Channel) -> ArrayView1<'_, u16> {
        self.particles.column(channel.index())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bitvec::prelude::*;

    pub(crate) fn test_id() -> FileId {
        FileId::from_path(Path::new("2014_185/2014-07-04T00-00-02+00-00")).unwrap()
    }

    pub(crate) fn particle(d1: u16, d2: u16, fsc_small: u16) -> ParticleRecord {
        let mut values = [0u16; CHANNEL_COUNT];
        values[Channel::Time.index()] = 1;
        values[Channel::D1.index()] = d1;
        values[Channel::D2.index()] = d2;
        values[Channel::FscSmall.index()] = fsc_small;
        values[Channel::Pe.index()] = 100;
        values[Channel::ChlSmall.index()] = 200;
        ParticleRecord::new(values)
    }

    fn raw_file(declared: u32, words_per_row: usize, rows: usize) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(declared).unwrap();
        for r in 0..rows {
            for w in 0..words_per_row {
                bytes.write_u16::<LittleEndian>((r * 31 + w) as u16).unwrap();
            }
        }
        bytes
    }

    #[test]
    fn test_round_trip() {
        let records: Vec<ParticleRecord> = (0..25)
            .map(|i| particle(i * 100, i * 120 + 7, i * 1000 + 3))
            .collect();
        let evt = EventFile::from_records(test_id(), &records);
        let bytes = evt.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 25 * RECORD_SIZE);
        assert_eq!(&bytes[..HEADER_SIZE], &25u32.to_le_bytes());
        let decoded = EventFile::decode(&bytes, Compression::None, test_id()).unwrap();
        assert_eq!(decoded, evt);
        assert_eq!(decoded.encode().unwrap(), bytes);
        assert_eq!(decoded.record(3), records[3]);
    }

    #[test]
    fn test_declared_count_mismatch() {
        let bytes = raw_file(100, RECORD_WORDS, 80);
        match EventFile::decode(&bytes, Compression::None, test_id()) {
            Err(EvtFileError::CountMismatch { declared, found }) => {
                assert_eq!(declared, 100);
                assert_eq!(found, 80);
            }
            other => panic!("expected count mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_channel_mismatch() {
        let bytes = raw_file(7, RECORD_WORDS + 1, 7);
        assert!(matches!(
            EventFile::decode(&bytes, Compression::None, test_id()),
            Err(EvtFileError::ChannelMismatch(13))
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let mut bytes = raw_file(3, RECORD_WORDS, 3);
        bytes.pop();
        assert!(matches!(
            EventFile::decode(&bytes, Compression::None, test_id()),
            Err(EvtFileError::RecordSize(_))
        ));
        assert!(matches!(
            EventFile::decode(&[1, 0], Compression::None, test_id()),
            Err(EvtFileError::BadHeader(2))
        ));
        assert!(matches!(
            EventFile::decode(&[], Compression::None, test_id()),
            Err(EvtFileError::Empty)
        ));
    }

    #[test]
    fn test_zero_particles() {
        let bytes = raw_file(0, RECORD_WORDS, 0);
        let evt = EventFile::decode(&bytes, Compression::None, test_id()).unwrap();
        assert!(evt.is_empty());
    }

    #[test]
    fn test_gzip_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir
            .path()
            .join("2014_185")
            .join("2014-07-04T00-00-02+00-00.gz");
        let records: Vec<ParticleRecord> = (0..10).map(|i| particle(i, i + 1, i + 2)).collect();
        let evt = EventFile::from_records(test_id(), &records);
        evt.write(&path).unwrap();
        let read = EventFile::read(&path).unwrap();
        assert_eq!(read, evt);
        assert_eq!(read.id.as_str(), "2014_185/2014-07-04T00-00-02+00-00");
    }

    #[test]
    fn test_concatenated_gzip_members() {
        let records: Vec<ParticleRecord> = (0..6).map(|i| particle(i, i + 1, i + 2)).collect();
        let evt = EventFile::from_records(test_id(), &records);
        let raw = evt.encode().unwrap();
        let (head, tail) = raw.split_at(HEADER_SIZE + 2 * RECORD_SIZE);

        let mut bytes = Vec::new();
        for part in [head, tail] {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(part).unwrap();
            bytes.extend(encoder.finish().unwrap());
        }
        let decoded = EventFile::decode(&bytes, Compression::Gzip, test_id()).unwrap();
        assert_eq!(decoded, evt);
    }

    #[test]
    fn test_select_subset() {
        let records: Vec<ParticleRecord> = (0..4).map(|i| particle(i, i, i)).collect();
        let evt = EventFile::from_records(test_id(), &records);
        let mask = bitvec![0, 1, 0, 1];
        let subset = evt.select(&mask);
        assert_eq!(subset.len(), 2);
        assert_eq!(subset.record(1), records[3]);
        let decoded =
            EventFile::decode(&subset.encode().unwrap(), Compression::None, test_id()).unwrap();
        assert_eq!(decoded, subset);
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(Channel::from_str("fsc_small"), Ok(Channel::FscSmall));
        assert!(Channel::from_str("xyz").is_err());
    }
}
