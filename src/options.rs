use std::io::{Read, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::CodecType;
use crate::errors::{Error, Result};

/// Marks a byte stream as speaking this protocol.
pub const MAGIC: u32 = 0x3bef5c;

/// Per-connection preamble, exchanged once before any request.
///
/// Always JSON on the wire, whatever codec it goes on to select, so the
/// server can parse it without prior agreement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// must equal [`MAGIC`]
    pub magic: u32,
    /// codec for every header/body pair that follows
    pub codec_type: CodecType,
    /// bound on dialing; zero means no limit
    pub connect_timeout: Duration,
    /// bound on server-side request handling; zero means no limit
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            magic: MAGIC,
            codec_type: CodecType::Bincode,
            connect_timeout: Duration::from_secs(10),
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    /// Default options with the given codec.
    pub fn with_codec(codec_type: CodecType) -> Self {
        Options {
            codec_type,
            ..Options::default()
        }
    }

    /// Read one preamble off the stream, consuming exactly the JSON value
    /// so the codec-encoded messages behind it stay intact.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Options> {
        let mut de = serde_json::Deserializer::from_reader(reader);
        let opt = Options::deserialize(&mut de)
            .map_err(|e| Error::Status(format!("invalid options preamble: {e}")))?;
        if opt.magic != MAGIC {
            return Err(Error::InvalidMagic(opt.magic));
        }
        Ok(opt)
    }

    /// Write the preamble to the stream.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        serde_json::to_writer(&mut *writer, self)
            .map_err(|e| Error::ClientSerialize(e.to_string()))?;
        writer.flush()?;
        Ok(())
    }
}
