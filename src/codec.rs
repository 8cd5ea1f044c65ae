use std::io::{self, BufReader, Read};

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::stream::StreamExt;

// Message layout (after the handshake preamble)
//
// [ header ][ len(u64 BE) ][ body bytes ] ...
//
// The header is encoded in the connection's codec; the body is an opaque
// blob in the same codec's value encoding, decoded where its type is known.

// max encoded body len
const MAX_BODY_LEN: u64 = 1024 * 1024;

/// Per-message envelope. The client mints `seq`; the server echoes it.
/// `error` is empty on requests and carries the failure text on responses.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// "Service.Method" addressing a registered method
    pub service_method: String,
    /// per-connection monotonically increasing request id
    pub seq: u64,
    /// empty, or the error the server is reporting for this seq
    pub error: String,
}

/// Identifies how headers and body values are encoded on a connection.
///
/// The id travels in the handshake preamble as a string; anything that does
/// not name one of these variants is rejected before a codec is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecType {
    /// the native binary format
    #[serde(rename = "application/bincode")]
    Bincode,
    /// self-describing text format, handy for debugging across languages
    #[serde(rename = "application/json")]
    Json,
}

impl CodecType {
    /// The wire id of this codec.
    pub fn as_str(&self) -> &'static str {
        match self {
            CodecType::Bincode => "application/bincode",
            CodecType::Json => "application/json",
        }
    }

    /// Encode a value into a body blob.
    pub fn encode<T: Serialize + ?Sized>(
        &self,
        value: &T,
    ) -> std::result::Result<Vec<u8>, String> {
        match self {
            CodecType::Bincode => bincode::serialize(value).map_err(|e| e.to_string()),
            CodecType::Json => serde_json::to_vec(value).map_err(|e| e.to_string()),
        }
    }

    /// Decode a body blob into a value.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> std::result::Result<T, String> {
        match self {
            CodecType::Bincode => bincode::deserialize(bytes).map_err(|e| e.to_string()),
            CodecType::Json => serde_json::from_slice(bytes).map_err(|e| e.to_string()),
        }
    }

    /// Build the read/write codec halves over a duplex stream.
    ///
    /// The stream is cloned so the read half can live on the receive loop
    /// while the write half sits behind the send lock.
    pub fn new_codec<S: StreamExt>(
        self,
        stream: S,
    ) -> io::Result<(Box<dyn CodecRead>, Box<dyn CodecWrite>)> {
        let read_half = stream.try_clone()?;
        Ok((
            Box::new(FramedReader::new(self, read_half)),
            Box::new(FramedWriter::new(self, stream)),
        ))
    }

    fn encode_header_into(&self, buf: &mut BytesMut, header: &Header) -> Result<()> {
        match self {
            CodecType::Bincode => bincode::serialize_into(buf.writer(), header)
                .map_err(|e| io_invalid(e.to_string()))?,
            CodecType::Json => serde_json::to_writer(buf.writer(), header)
                .map_err(|e| io_invalid(e.to_string()))?,
        }
        Ok(())
    }
}

impl std::fmt::Display for CodecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Read half of a connection's codec, owned by exactly one read loop.
pub trait CodecRead: Send {
    /// Decode the next header. Clean EOF comes back as a disconnect error
    /// (see [`Error::is_disconnect`]) and marks the normal end of stream.
    fn read_header(&mut self, header: &mut Header) -> Result<()>;
    /// Read the next body blob. Every header is followed by exactly one
    /// body, so this must be called even when the message will be ignored,
    /// or framing is lost.
    fn read_body(&mut self) -> Result<Vec<u8>>;
}

/// Write half of a connection's codec; shared behind the per-connection
/// send lock so header+body pairs never interleave.
pub trait CodecWrite: Send {
    /// Write one header+body pair. The pair is flushed as a single write
    /// before this returns success.
    fn write(&mut self, header: &Header, body: &[u8]) -> Result<()>;
    /// Tear the connection down, waking the peer read half.
    fn close(&mut self) -> Result<()>;
}

pub(crate) struct FramedReader<R: Read + Send + 'static> {
    ty: CodecType,
    reader: BufReader<R>,
}

impl<R: Read + Send + 'static> FramedReader<R> {
    pub(crate) fn new(ty: CodecType, read_half: R) -> Self {
        FramedReader {
            ty,
            reader: BufReader::with_capacity(32 * 1024, read_half),
        }
    }
}

impl<R: Read + Send + 'static> CodecRead for FramedReader<R> {
    fn read_header(&mut self, header: &mut Header) -> Result<()> {
        match self.ty {
            CodecType::Bincode => {
                *header = bincode::deserialize_from(&mut self.reader).map_err(bincode_err)?;
            }
            CodecType::Json => {
                let mut de = serde_json::Deserializer::from_reader(&mut self.reader);
                *header = Header::deserialize(&mut de).map_err(json_err)?;
            }
        }
        Ok(())
    }

    fn read_body(&mut self) -> Result<Vec<u8>> {
        let len = self.reader.read_u64::<BigEndian>()?;
        if len > MAX_BODY_LEN {
            return Err(Error::FrameTooBig(len));
        }
        let mut body = vec![0u8; len as usize];
        self.reader.read_exact(&mut body)?;
        Ok(body)
    }
}

pub(crate) struct FramedWriter<S: StreamExt> {
    ty: CodecType,
    stream: S,
    buf: BytesMut,
}

impl<S: StreamExt> FramedWriter<S> {
    pub(crate) fn new(ty: CodecType, stream: S) -> Self {
        FramedWriter {
            ty,
            stream,
            buf: BytesMut::with_capacity(32 * 1024),
        }
    }
}

impl<S: StreamExt> CodecWrite for FramedWriter<S> {
    fn write(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        if body.len() as u64 > MAX_BODY_LEN {
            return Err(Error::FrameTooBig(body.len() as u64));
        }
        self.buf.clear();
        self.ty.encode_header_into(&mut self.buf, header)?;
        self.buf.put_u64(body.len() as u64);
        self.buf.extend_from_slice(body);
        self.stream.write_all(&self.buf)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stream.shutdown()?;
        Ok(())
    }
}

fn io_invalid(msg: String) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::InvalidData, msg))
}

fn bincode_err(e: bincode::Error) -> Error {
    match *e {
        bincode::ErrorKind::Io(ioe) => Error::Io(ioe),
        other => io_invalid(other.to_string()),
    }
}

fn json_err(e: serde_json::Error) -> Error {
    use serde_json::error::Category;
    match e.classify() {
        Category::Eof => Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, e.to_string())),
        Category::Io => Error::Io(io::Error::new(
            e.io_error_kind().unwrap_or(io::ErrorKind::Other),
            e.to_string(),
        )),
        _ => io_invalid(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode_message(ty: CodecType, header: &Header, body: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        ty.encode_header_into(&mut buf, header).unwrap();
        buf.put_u64(body.len() as u64);
        buf.extend_from_slice(body);
        buf.to_vec()
    }

    fn roundtrip(ty: CodecType) {
        let header = Header {
            service_method: "Foo.Sum".to_owned(),
            seq: 7,
            error: String::new(),
        };
        let body = ty.encode(&(1i32, 2i32)).unwrap();
        let wire = encode_message(ty, &header, &body);

        let mut reader = FramedReader::new(ty, Cursor::new(wire));
        let mut got = Header::default();
        reader.read_header(&mut got).unwrap();
        assert_eq!(got, header);
        let got_body = reader.read_body().unwrap();
        let value: (i32, i32) = ty.decode(&got_body).unwrap();
        assert_eq!(value, (1, 2));
    }

    #[test]
    fn bincode_roundtrip() {
        roundtrip(CodecType::Bincode);
    }

    #[test]
    fn json_roundtrip() {
        roundtrip(CodecType::Json);
    }

    #[test]
    fn back_to_back_messages_keep_framing() {
        let ty = CodecType::Bincode;
        let mut wire = Vec::new();
        for seq in 1..=3u64 {
            let header = Header {
                service_method: "Foo.Sum".to_owned(),
                seq,
                error: String::new(),
            };
            let body = ty.encode(&seq).unwrap();
            wire.extend_from_slice(&encode_message(ty, &header, &body));
        }

        let mut reader = FramedReader::new(ty, Cursor::new(wire));
        for seq in 1..=3u64 {
            let mut header = Header::default();
            reader.read_header(&mut header).unwrap();
            assert_eq!(header.seq, seq);
            let echoed: u64 = ty.decode(&reader.read_body().unwrap()).unwrap();
            assert_eq!(echoed, seq);
        }
        // the stream is exhausted: the next header read is a clean EOF
        let mut header = Header::default();
        let err = reader.read_header(&mut header).unwrap_err();
        assert!(err.is_disconnect());
    }

    #[test]
    fn oversized_body_is_rejected() {
        let ty = CodecType::Bincode;
        let header = Header::default();
        let mut buf = BytesMut::new();
        ty.encode_header_into(&mut buf, &header).unwrap();
        buf.put_u64(MAX_BODY_LEN + 1);

        let mut reader = FramedReader::new(ty, Cursor::new(buf.to_vec()));
        let mut got = Header::default();
        reader.read_header(&mut got).unwrap();
        assert!(matches!(reader.read_body(), Err(Error::FrameTooBig(_))));
    }

    #[test]
    fn unknown_codec_id_is_rejected() {
        let err = serde_json::from_str::<CodecType>("\"application/gob\"");
        assert!(err.is_err());
        let ok: CodecType = serde_json::from_str("\"application/json\"").unwrap();
        assert_eq!(ok, CodecType::Json);
    }
}
