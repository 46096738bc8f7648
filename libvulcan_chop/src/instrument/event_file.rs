use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::constants::{EVENT_FILE_MAGIC, EVENT_FILE_VERSION};
use crate::error::InstrumentError;
use super::RunMetadata;

/// A single neutron event
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub pixel: u32,
    /// Seconds since the run start
    pub pulse_time: f64,
    /// Time-of-flight in microseconds
    pub tof: f64,
}

/// A time series sample log. Each value holds until the next entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SampleLog {
    pub name: String,
    pub times: Vec<f64>,
    pub values: Vec<f64>,
}

impl SampleLog {
    pub fn new(name: &str, entries: &[(f64, f64)]) -> Self {
        Self {
            name: name.to_string(),
            times: entries.iter().map(|(t, _)| *t).collect(),
            values: entries.iter().map(|(_, v)| *v).collect(),
        }
    }
}

/// The contents of a .vevt event file.
///
/// Layout (little endian):
/// ```text
/// magic "VEVT" | version u32 | run start ns i64 (-1 unknown) | duration f64 (NaN unknown)
/// title: len u32, utf8 bytes
/// events: count u64, then (pixel u32, pulse time f64, tof f64) per event
/// logs: count u32, then per log: name (len u32, bytes), count u64, (time f64, value f64)
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventFile {
    pub metadata: RunMetadata,
    pub events: Vec<Event>,
    pub logs: Vec<SampleLog>,
}

const EVENT_RECORD_BYTES: u64 = 20;
const LOG_ENTRY_BYTES: u64 = 16;

/// A count read from the file, refused when its records could not fit in the file
fn checked_count(
    count: u64,
    record_bytes: u64,
    file_len: u64,
    what: &str,
) -> Result<usize, InstrumentError> {
    match count.checked_mul(record_bytes) {
        Some(bytes) if bytes <= file_len => Ok(count as usize),
        _ => Err(InstrumentError::BadFormat(format!(
            "{what} count {count} does not fit in a file of {file_len} bytes"
        ))),
    }
}

fn read_string<R: Read>(reader: &mut R, file_len: u64) -> Result<String, InstrumentError> {
    let len = reader.read_u32::<LittleEndian>()?;
    let len = checked_count(len as u64, 1, file_len, "string byte")?;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|e| InstrumentError::BadFormat(e.to_string()))
}

fn write_string<W: Write>(writer: &mut W, s: &str) -> Result<(), InstrumentError> {
    writer.write_u32::<LittleEndian>(s.len() as u32)?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

impl EventFile {
    /// Read an event file from disk
    pub fn read(path: &Path) -> Result<Self, InstrumentError> {
        if !path.exists() {
            return Err(InstrumentError::BadFilePath(path.to_path_buf()));
        }
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        Self::read_from(&mut reader, file_len).map_err(|e| match e {
            InstrumentError::IOError(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                InstrumentError::BadFormat(format!("{path:?} is truncated"))
            }
            other => other,
        })
    }

    fn read_from<R: Read>(reader: &mut R, file_len: u64) -> Result<Self, InstrumentError> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != EVENT_FILE_MAGIC {
            return Err(InstrumentError::BadFormat(format!(
                "bad magic {magic:?}"
            )));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        if version != EVENT_FILE_VERSION {
            return Err(InstrumentError::BadFormat(format!(
                "unsupported version {version}; expected {EVENT_FILE_VERSION}"
            )));
        }

        let start_ns = reader.read_i64::<LittleEndian>()?;
        let duration = reader.read_f64::<LittleEndian>()?;
        let title = read_string(reader, file_len)?;
        let metadata = RunMetadata {
            start_epoch_ns: (start_ns >= 0).then_some(start_ns),
            duration_s: (!duration.is_nan()).then_some(duration),
            title,
        };

        let n_events = reader.read_u64::<LittleEndian>()?;
        let n_events = checked_count(n_events, EVENT_RECORD_BYTES, file_len, "event")?;
        let mut events = Vec::with_capacity(n_events);
        for _ in 0..n_events {
            events.push(Event {
                pixel: reader.read_u32::<LittleEndian>()?,
                pulse_time: reader.read_f64::<LittleEndian>()?,
                tof: reader.read_f64::<LittleEndian>()?,
            });
        }

        let n_logs = reader.read_u32::<LittleEndian>()?;
        // Every log has at least a name length and an entry count
        let n_logs = checked_count(n_logs as u64, 12, file_len, "sample log")?;
        let mut logs = Vec::with_capacity(n_logs);
        for _ in 0..n_logs {
            let name = read_string(reader, file_len)?;
            let n_entries = reader.read_u64::<LittleEndian>()?;
            let n_entries = checked_count(n_entries, LOG_ENTRY_BYTES, file_len, "log entry")?;
            let mut log = SampleLog {
                name,
                times: Vec::with_capacity(n_entries),
                values: Vec::with_capacity(n_entries),
            };
            for _ in 0..n_entries {
                log.times.push(reader.read_f64::<LittleEndian>()?);
                log.values.push(reader.read_f64::<LittleEndian>()?);
            }
            logs.push(log);
        }

        Ok(Self {
            metadata,
            events,
            logs,
        })
    }

    /// Write the event file to disk, replacing any existing file
    pub fn write(&self, path: &Path) -> Result<(), InstrumentError> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(EVENT_FILE_MAGIC)?;
        writer.write_u32::<LittleEndian>(EVENT_FILE_VERSION)?;
        writer.write_i64::<LittleEndian>(self.metadata.start_epoch_ns.unwrap_or(-1))?;
        writer.write_f64::<LittleEndian>(self.metadata.duration_s.unwrap_or(f64::NAN))?;
        write_string(&mut writer, &self.metadata.title)?;

        writer.write_u64::<LittleEndian>(self.events.len() as u64)?;
        for event in self.events.iter() {
            writer.write_u32::<LittleEndian>(event.pixel)?;
            writer.write_f64::<LittleEndian>(event.pulse_time)?;
            writer.write_f64::<LittleEndian>(event.tof)?;
        }

        writer.write_u32::<LittleEndian>(self.logs.len() as u32)?;
        for log in self.logs.iter() {
            write_string(&mut writer, &log.name)?;
            writer.write_u64::<LittleEndian>(log.times.len() as u64)?;
            for (time, value) in log.times.iter().zip(log.values.iter()) {
                writer.write_f64::<LittleEndian>(*time)?;
                writer.write_f64::<LittleEndian>(*value)?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}
