//! Virtual tape image format and positioning.
//!
//! Each record is stored as `[u32 LE length][data][u32 LE length]`, the same
//! self-describing framing a half-inch tape block carries. Some length values
//! are sentinels rather than data lengths: see [`TAPE_MARK`], [`ERASE_GAP`],
//! [`END_OF_MEDIUM`] and [`ERROR_FLAG`]. Reading forward and backward are
//! mirror images of each other, so spacing and locating agree in both
//! directions.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;
use tracing::debug;

pub const TAPE_MARK: u32 = 0x0000_0000;
pub const ERASE_GAP: u32 = 0xFFFF_FFFE;
pub const END_OF_MEDIUM: u32 = 0xFFFF_FFFF;
/// Set on the length of a record that had a read or write error.
pub const ERROR_FLAG: u32 = 0x8000_0000;

/// Largest record accepted for writing.
pub const MAX_RECORD_LENGTH: usize = 0x0100_0000;

/// Range of the physical reference reported in a block id.
pub const PHYSICAL_REFERENCE_RANGE: f64 = 126.0;

#[derive(Error, Debug)]
pub enum TapeError {
    #[error("tape image I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("record at offset {position} is truncated")]
    Truncated { position: u64 },

    #[error("record length mismatch at offset {position}: {leading} != {trailing}")]
    LengthMismatch {
        position: u64,
        leading: u32,
        trailing: u32,
    },

    #[error("volume is not write-enabled")]
    ReadOnly,

    #[error("record of {0} bytes is too large")]
    RecordTooLarge(usize),
}

/// What a single step over the tape found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapeEvent {
    /// A data record; `data` is only filled in for reads, not spaces.
    Record { length: u32, data: Option<Vec<u8>> },
    /// A record flagged as bad when it was written.
    ErrorRecord { length: u32 },
    TapeMark,
    EndOfMedium,
    BeginningOfMedium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateOutcome {
    Located,
    /// A medium boundary was reached before the requested block.
    BoundaryReached,
}

/// A tape image opened on a drive.
#[derive(Debug)]
pub struct VirtualTape {
    file: File,
    writable: bool,
    position: u64,
    block_id: u32,
}

impl VirtualTape {
    /// Open an image, read-write only if the volume is write-enabled.
    pub fn open<P: AsRef<Path>>(path: P, writable: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path.as_ref())?;
        Ok(Self::from_file(file, writable))
    }

    pub fn from_file(file: File, writable: bool) -> Self {
        Self {
            file,
            writable,
            position: 0,
            block_id: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn block_id(&self) -> u32 {
        self.block_id
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn rewind(&mut self) {
        self.position = 0;
        self.block_id = 0;
    }

    /// Read a length word. `None` when fewer than four bytes remain.
    fn read_length_at(&mut self, offset: u64) -> io::Result<Option<u32>> {
        let mut word = [0u8; 4];
        self.file.seek(SeekFrom::Start(offset))?;
        match self.file.read_exact(&mut word) {
            Ok(()) => Ok(Some(u32::from_le_bytes(word))),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn read_data_at(&mut self, offset: u64, length: u32) -> io::Result<Vec<u8>> {
        let mut data = vec![0u8; length as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut data)?;
        Ok(data)
    }

    /// Step forward over one block, skipping erase gaps.
    pub fn advance(&mut self, read_data: bool) -> Result<TapeEvent, TapeError> {
        let mut pos = self.position;
        loop {
            let leading = match self.read_length_at(pos)? {
                Some(len) => len,
                None => {
                    self.position = pos;
                    return Ok(TapeEvent::EndOfMedium);
                }
            };

            match leading {
                ERASE_GAP => pos += 4,
                END_OF_MEDIUM => {
                    self.position = pos;
                    return Ok(TapeEvent::EndOfMedium);
                }
                TAPE_MARK => {
                    self.position = pos + 4;
                    self.block_id += 1;
                    return Ok(TapeEvent::TapeMark);
                }
                _ => {
                    let length = leading & !ERROR_FLAG;
                    let trailing = self
                        .read_length_at(pos + 4 + length as u64)?
                        .ok_or(TapeError::Truncated { position: pos })?;
                    if trailing != leading {
                        return Err(TapeError::LengthMismatch {
                            position: pos,
                            leading,
                            trailing,
                        });
                    }

                    let event = if leading & ERROR_FLAG != 0 {
                        TapeEvent::ErrorRecord { length }
                    } else {
                        let data = if read_data {
                            Some(self.read_data_at(pos + 4, length)?)
                        } else {
                            None
                        };
                        TapeEvent::Record { length, data }
                    };

                    self.position = pos + 8 + length as u64;
                    self.block_id += 1;
                    return Ok(event);
                }
            }
        }
    }

    /// Step backward over one block, skipping erase gaps.
    pub fn retreat(&mut self, read_data: bool) -> Result<TapeEvent, TapeError> {
        let mut pos = self.position;
        loop {
            if pos == 0 {
                self.position = 0;
                self.block_id = 0;
                return Ok(TapeEvent::BeginningOfMedium);
            }
            if pos < 4 {
                return Err(TapeError::Truncated { position: pos });
            }

            let trailing = self
                .read_length_at(pos - 4)?
                .ok_or(TapeError::Truncated { position: pos })?;

            match trailing {
                ERASE_GAP | END_OF_MEDIUM => pos -= 4,
                TAPE_MARK => {
                    self.position = pos - 4;
                    self.block_id = self.block_id.saturating_sub(1);
                    return Ok(TapeEvent::TapeMark);
                }
                _ => {
                    let length = trailing & !ERROR_FLAG;
                    let start = pos
                        .checked_sub(8 + length as u64)
                        .ok_or(TapeError::Truncated { position: pos })?;
                    let leading = self
                        .read_length_at(start)?
                        .ok_or(TapeError::Truncated { position: start })?;
                    if leading != trailing {
                        return Err(TapeError::LengthMismatch {
                            position: start,
                            leading,
                            trailing,
                        });
                    }

                    let event = if trailing & ERROR_FLAG != 0 {
                        TapeEvent::ErrorRecord { length }
                    } else {
                        let data = if read_data {
                            Some(self.read_data_at(start + 4, length)?)
                        } else {
                            None
                        };
                        TapeEvent::Record { length, data }
                    };

                    self.position = start;
                    self.block_id = self.block_id.saturating_sub(1);
                    return Ok(event);
                }
            }
        }
    }

    /// Write a framed record at the current position. Everything beyond it
    /// is discarded, as on a real tape.
    pub fn write_record(&mut self, data: &[u8]) -> Result<(), TapeError> {
        if !self.writable {
            return Err(TapeError::ReadOnly);
        }
        if data.is_empty() || data.len() > MAX_RECORD_LENGTH {
            return Err(TapeError::RecordTooLarge(data.len()));
        }

        let length = (data.len() as u32).to_le_bytes();
        let mut frame = Vec::with_capacity(data.len() + 8);
        frame.extend_from_slice(&length);
        frame.extend_from_slice(data);
        frame.extend_from_slice(&length);
        self.write_frame(&frame)
    }

    pub fn write_mark(&mut self) -> Result<(), TapeError> {
        if !self.writable {
            return Err(TapeError::ReadOnly);
        }
        self.write_frame(&TAPE_MARK.to_le_bytes())
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<(), TapeError> {
        self.file.set_len(self.position)?;
        self.file.seek(SeekFrom::Start(self.position))?;
        self.file.write_all(frame)?;
        self.file.flush()?;
        self.position += frame.len() as u64;
        self.block_id += 1;
        Ok(())
    }

    /// Step record by record until the block id equals `target`.
    pub fn locate(&mut self, target: u32) -> Result<LocateOutcome, TapeError> {
        while self.block_id != target {
            let event = if self.block_id < target {
                self.advance(false)?
            } else {
                self.retreat(false)?
            };
            if matches!(event, TapeEvent::EndOfMedium | TapeEvent::BeginningOfMedium) {
                debug!(
                    "Locate to block {} stopped at block {} (offset {})",
                    target, self.block_id, self.position
                );
                return Ok(LocateOutcome::BoundaryReached);
            }
        }
        Ok(LocateOutcome::Located)
    }

    /// Approximate physical position packed with the logical block id, in
    /// the layout of a 3480/3490 block id: physical reference in bits 24..30,
    /// block number in bits 0..21.
    pub fn block_id_reference(&self) -> io::Result<u32> {
        let size = self.file.metadata()?.len();
        let physical = if size == 0 {
            1
        } else {
            ((self.position as f64 / size as f64) * PHYSICAL_REFERENCE_RANGE) as u32 + 1
        };
        Ok(((physical & 0x7F) << 24) | (self.block_id & 0x003F_FFFF))
    }
}
