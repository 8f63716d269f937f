//! Binary append-only log of observer frames (Recorder/Player),
//! replayable with seek and sync to an independent clock.
//!
//! Wire format: a sequence of variable-length records, each prefixed
//! by a 16-byte Header `{ timestamp: u64, type: u16, flags: u16, size:
//! u32 }`. A Frame record carries `count: u32` followed by `count`
//! packed ObjectRecord tuples.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::warn;
use uuid::Uuid;

use crate::error::RecorderError;
use crate::observer::{ObservedObject, Status};

pub const HEADER_SIZE: usize = 16;
/// id(4) + uuid(16) + x(4) + y(4) + size(4) + flags(2) +
/// timestamp_enter(8) + timestamp_touched(8) = 50 bytes of payload;
/// 4 bytes of trailing reserved padding bring one ObjectRecord to the
/// documented 54 bytes (see DESIGN.md for this resolution).
pub const OBJECT_RECORD_SIZE: usize = 54;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Start,
    Stop,
    Frame,
}

impl RecordKind {
    fn wire_type(self) -> u16 {
        match self {
            RecordKind::Start => 0x01,
            RecordKind::Stop => 0x02,
            RecordKind::Frame => 0x03,
        }
    }

    fn from_wire(t: u16) -> Option<RecordKind> {
        match t {
            0x01 => Some(RecordKind::Start),
            0x02 => Some(RecordKind::Stop),
            0x03 => Some(RecordKind::Frame),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub timestamp_ms: u64,
    pub kind: RecordKind,
    pub flags: u16,
    pub size: u32,
}

fn status_bit(status: Status) -> u16 {
    match status {
        Status::Enter => 0b0001,
        Status::Move => 0b0010,
        Status::Leave => 0b0100,
        Status::Invalid => 0b1000,
    }
}

fn status_from_bit(bits: u16) -> Status {
    match bits {
        0b0001 => Status::Enter,
        0b0010 => Status::Move,
        0b0100 => Status::Leave,
        _ => Status::Invalid,
    }
}

fn write_object_record<W: Write>(w: &mut W, row: &ObservedObject) -> std::io::Result<()> {
    w.write_u32::<LittleEndian>(row.id as u32)?;
    w.write_all(row.uuid.as_bytes())?;
    w.write_f32::<LittleEndian>(row.x)?;
    w.write_f32::<LittleEndian>(row.y)?;
    w.write_f32::<LittleEndian>(row.size)?;
    w.write_u16::<LittleEndian>(status_bit(row.status))?;
    w.write_u64::<LittleEndian>(row.region_entered_ms)?;
    w.write_u64::<LittleEndian>(row.last_touched_ms)?;
    w.write_u32::<LittleEndian>(0)?; // reserved
    Ok(())
}

fn read_object_record<R: Read>(r: &mut R) -> std::io::Result<ObservedObject> {
    let id = r.read_u32::<LittleEndian>()?;
    let mut uuid_bytes = [0u8; 16];
    r.read_exact(&mut uuid_bytes)?;
    let x = r.read_f32::<LittleEndian>()?;
    let y = r.read_f32::<LittleEndian>()?;
    let size = r.read_f32::<LittleEndian>()?;
    let flags = r.read_u16::<LittleEndian>()?;
    let region_entered_ms = r.read_u64::<LittleEndian>()?;
    let last_touched_ms = r.read_u64::<LittleEndian>()?;
    let _reserved = r.read_u32::<LittleEndian>()?;
    Ok(ObservedObject {
        id: id as u64,
        uuid: Uuid::from_bytes(uuid_bytes),
        x,
        y,
        size,
        status: status_from_bit(flags),
        region_entered_ms,
        last_touched_ms,
        immobile: false,
    })
}

pub struct Writer {
    file: BufWriter<File>,
}

impl Writer {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, RecorderError> {
        let file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
        Ok(Writer { file: BufWriter::new(file) })
    }

    fn write_header(&mut self, kind: RecordKind, timestamp_ms: u64, flags: u16, size: u32) -> Result<(), RecorderError> {
        self.file.write_u64::<LittleEndian>(timestamp_ms)?;
        self.file.write_u16::<LittleEndian>(kind.wire_type())?;
        self.file.write_u16::<LittleEndian>(flags)?;
        self.file.write_u32::<LittleEndian>(size)?;
        Ok(())
    }

    pub fn write_start(&mut self, timestamp_ms: u64) -> Result<(), RecorderError> {
        self.write_header(RecordKind::Start, timestamp_ms, 0, 0)?;
        Ok(())
    }

    pub fn write_stop(&mut self, timestamp_ms: u64) -> Result<(), RecorderError> {
        self.write_header(RecordKind::Stop, timestamp_ms, 0, 0)?;
        Ok(())
    }

    pub fn write_frame(&mut self, timestamp_ms: u64, rows: &[ObservedObject]) -> Result<(), RecorderError> {
        let size = 4 + rows.len() * OBJECT_RECORD_SIZE;
        self.write_header(RecordKind::Frame, timestamp_ms, 0, size as u32)?;
        self.file.write_u32::<LittleEndian>(rows.len() as u32)?;
        for row in rows {
            write_object_record(&mut self.file, row)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), RecorderError> {
        self.file.flush()?;
        Ok(())
    }
}

pub enum PlayerRecord {
    Start,
    Stop,
    Frame(Vec<ObservedObject>),
}

pub struct Player {
    reader: BufReader<File>,
    file_len: u64,
    started_at: Option<Instant>,
    first_timestamp_ms: Option<u64>,
    paused: bool,
    /// How long to hold at a `Stop` record before a caller looping
    /// playback should start the next pass, independent of the
    /// reader's own pacing.
    pub pause_after_stop_ms: u64,
    stopped_at: Option<Instant>,
}

impl Player {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecorderError> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        Ok(Player {
            reader: BufReader::new(file),
            file_len,
            started_at: None,
            first_timestamp_ms: None,
            paused: false,
            pause_after_stop_ms: 0,
            stopped_at: None,
        })
    }

    /// True while a caller should hold off on reading further records
    /// because a `Stop` was seen less than `pause_after_stop_ms` ago.
    pub fn is_holding_after_stop(&self) -> bool {
        match self.stopped_at {
            Some(t) => t.elapsed() < Duration::from_millis(self.pause_after_stop_ms),
            None => false,
        }
    }

    /// Seeks to a fraction of the file's byte length, in `[0,1]`. Not
    /// frame-accurate, matching the coarse scrub-bar semantics of a
    /// byte-offset seek.
    pub fn seek(&mut self, play_pos: f32) -> Result<(), RecorderError> {
        let pos = (play_pos.clamp(0.0, 1.0) as f64 * self.file_len as f64) as u64;
        self.reader.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn sync_to_wall_clock(&mut self, timestamp_ms: u64) {
        self.started_at = Some(Instant::now());
        self.first_timestamp_ms = Some(timestamp_ms);
    }

    /// Wall-clock time implied by the player's playback clock, given
    /// the last `sync_to_wall_clock` call.
    pub fn current_time_ms(&self) -> Option<u64> {
        let (started, first) = (self.started_at?, self.first_timestamp_ms?);
        Some(first + started.elapsed().as_millis() as u64)
    }

    fn read_header_at_cursor(&mut self) -> Result<Header, RecorderError> {
        let timestamp_ms = self.reader.read_u64::<LittleEndian>()?;
        let raw_type = self.reader.read_u16::<LittleEndian>()?;
        let flags = self.reader.read_u16::<LittleEndian>()?;
        let size = self.reader.read_u32::<LittleEndian>()?;
        let kind = RecordKind::from_wire(raw_type)
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "bad record type"))?;
        Ok(Header { timestamp_ms, kind, flags, size })
    }

    /// Reads the next header, skipping forward one byte at a time on a
    /// malformed record until a plausible header is found (or EOF,
    /// which is a normal termination, not an error).
    pub fn next_header(&mut self) -> Result<Option<Header>, RecorderError> {
        if self.paused {
            return Ok(None);
        }
        let mut skipped = 0usize;
        loop {
            let start = self.reader.stream_position()?;
            match self.read_header_at_cursor() {
                Ok(header) => {
                    if skipped > 0 {
                        warn!("player: resynced after skipping {} byte(s)", skipped);
                    }
                    return Ok(Some(header));
                }
                Err(RecorderError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(_) => {
                    skipped += 1;
                    self.reader.seek(SeekFrom::Start(start + 1))?;
                    if start + 1 >= self.file_len {
                        return Err(RecorderError::Resynced { skipped });
                    }
                }
            }
        }
    }

    pub fn next_frame(&mut self, header: &Header) -> Result<PlayerRecord, RecorderError> {
        match header.kind {
            RecordKind::Start => Ok(PlayerRecord::Start),
            RecordKind::Stop => {
                self.stopped_at = Some(Instant::now());
                Ok(PlayerRecord::Stop)
            }
            RecordKind::Frame => {
                let count = self.reader.read_u32::<LittleEndian>()?;
                let mut rows = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    rows.push(read_object_record(&mut self.reader)?);
                }
                Ok(PlayerRecord::Frame(rows))
            }
        }
    }
}

#[allow(dead_code)]
fn sleep_until_due(target: Duration, elapsed: Duration) {
    if target > elapsed {
        std::thread::sleep(target - elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn row(id: u64) -> ObservedObject {
        ObservedObject {
            id,
            uuid: Uuid::new_v4(),
            x: 1.5,
            y: -2.5,
            size: 0.4,
            status: Status::Enter,
            region_entered_ms: 10,
            last_touched_ms: 20,
            immobile: false,
        }
    }

    #[test]
    fn scenario_s6_packed_round_trip_preserves_frame_counts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.bin");

        let mut writer = Writer::create(&path).unwrap();
        writer.write_start(0).unwrap();
        writer.write_frame(1, &[row(1), row(2)]).unwrap();
        writer.write_frame(2, &[]).unwrap();
        writer.write_frame(3, &(0..5).map(row).collect::<Vec<_>>()).unwrap();
        writer.write_stop(4).unwrap();
        writer.flush().unwrap();

        let mut player = Player::open(&path).unwrap();
        let mut counts = Vec::new();
        let mut saw_start = false;
        let mut saw_stop = false;
        while let Some(header) = player.next_header().unwrap() {
            match player.next_frame(&header).unwrap() {
                PlayerRecord::Start => saw_start = true,
                PlayerRecord::Stop => saw_stop = true,
                PlayerRecord::Frame(rows) => counts.push(rows.len()),
            }
        }
        assert!(saw_start);
        assert!(saw_stop);
        assert_eq!(counts, vec![2, 0, 5]);
    }

    #[test]
    fn object_record_round_trips_within_tolerance() {
        let mut buf = Vec::new();
        let r = row(7);
        write_object_record(&mut buf, &r).unwrap();
        assert_eq!(buf.len(), OBJECT_RECORD_SIZE);
        let back = read_object_record(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(back.id, r.id);
        assert_eq!(back.uuid, r.uuid);
        assert!((back.x - r.x).abs() < 1e-4);
        assert!((back.y - r.y).abs() < 1e-4);
        assert_eq!(back.size, r.size);
    }

    #[test]
    fn malformed_byte_triggers_resync_not_a_crash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.bin");
        {
            let mut writer = Writer::create(&path).unwrap();
            writer.write_start(0).unwrap();
            writer.flush().unwrap();
        }
        // Corrupt one byte of the header's type field.
        {
            let mut f = OpenOptions::new().write(true).open(&path).unwrap();
            f.seek(SeekFrom::Start(8)).unwrap();
            f.write_all(&[0xFF]).unwrap();
        }
        let mut player = Player::open(&path).unwrap();
        let result = player.next_header();
        assert!(result.is_err() || result.unwrap().is_none());
    }
}
