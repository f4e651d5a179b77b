use crate::config::Level;
use flate2::{Compress, Compression, Crc, FlushCompress, Status};
use std::fmt;
use std::io;

const OUTPUT_CHUNK_SIZE: usize = 32 * 1024; // 32KB output headroom per deflate call

/// OS byte written in the gzip header: unknown.
const OS_UNKNOWN: u8 = 0xFF;

/// A reusable gzip stream encoder.
///
/// Produces a single gzip member: header, deflate body, CRC32 and length
/// trailer. The encoder does not own a destination; every operation returns
/// the bytes it produced so the caller decides how to write them. Call
/// [`Compressor::reset`] before reusing it for another stream.
pub struct Compressor {
    level: Compression,
    deflate: Compress,
    crc: Crc,
    header_written: bool,
    output: Vec<u8>,
}

impl Compressor {
    /// Creates a new encoder at the given level.
    pub fn new(level: Level) -> Self {
        let level = level.compression();
        Self {
            level,
            deflate: Compress::new(level, false),
            crc: Crc::new(),
            header_written: false,
            output: Vec::with_capacity(OUTPUT_CHUNK_SIZE),
        }
    }

    /// Discards any stream state so the encoder can start a new member.
    pub fn reset(&mut self) {
        self.deflate.reset();
        self.crc.reset();
        self.header_written = false;
        self.output.clear();
    }

    /// Compresses `input`, returning whatever output the encoder produced.
    ///
    /// The returned slice may be empty while the encoder accumulates a block.
    pub fn compress(&mut self, input: &[u8]) -> io::Result<&[u8]> {
        self.begin();
        self.crc.update(input);
        self.run(input, FlushCompress::None)?;
        Ok(&self.output)
    }

    /// Emits all pending compressed data on a byte boundary.
    pub fn flush(&mut self) -> io::Result<&[u8]> {
        self.begin();
        self.run(&[], FlushCompress::Sync)?;
        Ok(&self.output)
    }

    /// Finishes the member, returning the remaining output and the trailer.
    pub fn finish(&mut self) -> io::Result<&[u8]> {
        self.begin();
        self.run(&[], FlushCompress::Finish)?;
        self.output.extend_from_slice(&self.crc.sum().to_le_bytes());
        self.output.extend_from_slice(&self.crc.amount().to_le_bytes());
        Ok(&self.output)
    }

    fn begin(&mut self) {
        self.output.clear();
        if self.header_written {
            return;
        }
        let extra_flags = if self.level.level() >= Compression::best().level() {
            2
        } else if self.level.level() <= Compression::fast().level() {
            4
        } else {
            0
        };
        self.output.extend_from_slice(&[
            0x1F,
            0x8B,
            8, // deflate
            0, // flags
            0,
            0,
            0,
            0, // mtime
            extra_flags,
            OS_UNKNOWN,
        ]);
        self.header_written = true;
    }

    fn run(&mut self, mut input: &[u8], flush: FlushCompress) -> io::Result<()> {
        loop {
            self.output.reserve(OUTPUT_CHUNK_SIZE);
            let before_in = self.deflate.total_in();
            let before_out = self.deflate.total_out();
            let status = self
                .deflate
                .compress_vec(input, &mut self.output, flush)
                .map_err(io::Error::other)?;
            let consumed = (self.deflate.total_in() - before_in) as usize;
            let produced = self.deflate.total_out() - before_out;
            input = &input[consumed..];

            if status == Status::StreamEnd {
                return Ok(());
            }
            let has_room = self.output.len() < self.output.capacity();
            if flush != FlushCompress::Finish && input.is_empty() && has_room {
                return Ok(());
            }
            if consumed == 0 && produced == 0 && status == Status::BufError {
                return Err(io::Error::other("deflate stream made no progress"));
            }
        }
    }
}

impl fmt::Debug for Compressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compressor")
            .field("level", &self.level.level())
            .field("header_written", &self.header_written)
            .finish_non_exhaustive()
    }
}
