use core::str;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::Awaiting;
use crate::util::find_line;
use crate::Error;

/// Longest chunk size line we accept before the line ending shows up.
const MAX_SIZE_LINE: usize = 1024;

/// Max number of hex digits in a chunk size.
const MAX_SIZE_DIGITS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dechunker {
    Size,
    /// Chunk data still to come.
    Chunk(usize),
    /// Line ending after the chunk data.
    ChunkEnd,
    Trailer,
    Ended,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ChunkEvent {
    Data(Bytes),
    NeedMore,
    Ended,
}

impl Dechunker {
    pub fn new() -> Self {
        Dechunker::Size
    }

    /// Consume as much of `input` as needed to produce the next piece of data.
    ///
    /// Chunk data is emitted as it arrives, a large chunk can come out in
    /// several pieces. Trailer lines after the zero sized chunk are consumed
    /// and dropped.
    pub fn poll(&mut self, input: &mut BytesMut) -> Result<ChunkEvent, Error> {
        loop {
            let more = match *self {
                Dechunker::Size => self.read_size(input)?,
                Dechunker::Chunk(len) => return Ok(self.read_data(input, len)),
                Dechunker::ChunkEnd => self.read_chunk_end(input)?,
                Dechunker::Trailer => self.read_trailer(input),
                Dechunker::Ended => return Ok(ChunkEvent::Ended),
            };

            if !more {
                return Ok(ChunkEvent::NeedMore);
            }
        }
    }

    /// What we are waiting for, should the connection close now.
    pub fn awaiting(&self) -> Awaiting {
        match self {
            Dechunker::Trailer | Dechunker::Ended => Awaiting::ChunkTrailer,
            _ => Awaiting::Chunk,
        }
    }

    fn read_size(&mut self, input: &mut BytesMut) -> Result<bool, Error> {
        let (line_len, term_len) = match find_line(input) {
            Some(v) => v,
            None => {
                if input.len() > MAX_SIZE_LINE {
                    return Err(Error::ChunkExpectedCrLf);
                }
                return Ok(false);
            }
        };

        let line = &input[..line_len];

        // Chunk extensions after ; are ignored.
        let len_end = line.iter().position(|c| *c == b';').unwrap_or(line_len);
        let len_str = str::from_utf8(&line[..len_end])
            .map_err(|_| Error::ChunkLenNotAscii)?
            .trim();

        if len_str.is_empty() || len_str.len() > MAX_SIZE_DIGITS {
            return Err(Error::ChunkLenNotANumber);
        }

        let len = usize::from_str_radix(len_str, 16).map_err(|_| Error::ChunkLenNotANumber)?;

        trace!("Chunk size: {}", len);

        input.advance(line_len + term_len);

        *self = if len == 0 {
            Self::Trailer
        } else {
            Self::Chunk(len)
        };

        Ok(true)
    }

    fn read_data(&mut self, input: &mut BytesMut, left: usize) -> ChunkEvent {
        if input.is_empty() {
            return ChunkEvent::NeedMore;
        }

        let n = left.min(input.len());
        let data = input.split_to(n).freeze();

        *self = if n == left {
            Self::ChunkEnd
        } else {
            Self::Chunk(left - n)
        };

        ChunkEvent::Data(data)
    }

    fn read_chunk_end(&mut self, input: &mut BytesMut) -> Result<bool, Error> {
        let term_len = match input.first() {
            None => return Ok(false),
            Some(b'\n') => 1,
            Some(b'\r') => match input.get(1) {
                None => return Ok(false),
                Some(b'\n') => 2,
                Some(_) => return Err(Error::ChunkExpectedCrLf),
            },
            Some(_) => return Err(Error::ChunkExpectedCrLf),
        };

        input.advance(term_len);
        *self = Self::Size;

        Ok(true)
    }

    fn read_trailer(&mut self, input: &mut BytesMut) -> bool {
        let (line_len, term_len) = match find_line(input) {
            Some(v) => v,
            None => return false,
        };

        if line_len == 0 {
            *self = Self::Ended;
        } else {
            trace!("Discard chunk trailer line");
        }

        input.advance(line_len + term_len);

        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn buf(s: &[u8]) -> BytesMut {
        BytesMut::from(s)
    }

    #[test]
    fn test_dechunk_size() -> Result<(), Error> {
        let mut d = Dechunker::new();
        assert_eq!(d.poll(&mut buf(b""))?, ChunkEvent::NeedMore);
        assert_eq!(d.poll(&mut buf(b"2"))?, ChunkEvent::NeedMore);
        assert_eq!(d.poll(&mut buf(b"2\r"))?, ChunkEvent::NeedMore);
        assert_eq!(d, Dechunker::Size);

        let mut input = buf(b"2\r\n");
        assert_eq!(d.poll(&mut input)?, ChunkEvent::NeedMore);
        assert_eq!(d, Dechunker::Chunk(2));
        assert!(input.is_empty());
        Ok(())
    }

    #[test]
    fn test_dechunk_size_meta() -> Result<(), Error> {
        let mut d = Dechunker::new();
        let mut input = buf(b"2;meta=1\r\nOK\r\n");
        assert_eq!(d.poll(&mut input)?, ChunkEvent::Data(Bytes::from_static(b"OK")));
        assert!(input.is_empty());
        Ok(())
    }

    #[test]
    fn test_dechunk_size_not_meta() -> Result<(), Error> {
        let mut d = Dechunker::new();
        let mut input = buf(b"9\r\nnot meta;\r\n");
        assert_eq!(
            d.poll(&mut input)?,
            ChunkEvent::Data(Bytes::from_static(b"not meta;"))
        );
        Ok(())
    }

    #[test]
    fn test_dechunk_partial_chunk() -> Result<(), Error> {
        let mut d = Dechunker::new();
        let mut input = buf(b"5\r\nhel");
        assert_eq!(d.poll(&mut input)?, ChunkEvent::Data(Bytes::from_static(b"hel")));
        assert_eq!(d, Dechunker::Chunk(2));
        assert_eq!(d.poll(&mut input)?, ChunkEvent::NeedMore);
        input.extend_from_slice(b"lo\r");
        assert_eq!(d.poll(&mut input)?, ChunkEvent::Data(Bytes::from_static(b"lo")));
        assert_eq!(d.poll(&mut input)?, ChunkEvent::NeedMore);
        assert_eq!(d, Dechunker::ChunkEnd);
        input.extend_from_slice(b"\n0\r\n\r\n");
        assert_eq!(d.poll(&mut input)?, ChunkEvent::Ended);
        Ok(())
    }

    #[test]
    fn test_dechunk_huge_size_streams() -> Result<(), Error> {
        let mut d = Dechunker::new();
        let mut input = buf(b"ffffffffffff\r\nabc");
        assert_eq!(d.poll(&mut input)?, ChunkEvent::Data(Bytes::from_static(b"abc")));
        assert_eq!(d, Dechunker::Chunk(0xffff_ffff_ffff - 3));
        assert!(input.is_empty());
        Ok(())
    }

    #[test]
    fn test_dechunk_full_body() -> Result<(), Error> {
        let mut d = Dechunker::new();
        let mut input = buf(b"7\r\nHello, \r\n6\r\nworld!\r\n0\r\n\r\n");
        let mut body = Vec::new();

        loop {
            match d.poll(&mut input)? {
                ChunkEvent::Data(b) => body.extend_from_slice(&b),
                ChunkEvent::Ended => break,
                ChunkEvent::NeedMore => panic!("input is complete"),
            }
        }

        assert_eq!(body, b"Hello, world!");
        assert!(matches!(d, Dechunker::Ended));
        assert!(input.is_empty());
        Ok(())
    }

    #[test]
    fn test_dechunk_trailer_consumed() -> Result<(), Error> {
        let mut d = Dechunker::new();
        let mut input = buf(b"0\r\nX-Checksum: 42\r\nX-More: 1\r\n\r\nHTTP/1.1");
        assert_eq!(d.poll(&mut input)?, ChunkEvent::Ended);
        // The next response is left untouched.
        assert_eq!(&input[..], b"HTTP/1.1");
        Ok(())
    }

    #[test]
    fn test_dechunk_bare_lf() -> Result<(), Error> {
        let mut d = Dechunker::new();
        let mut input = buf(b"2\nOK\n0\n\n");
        assert_eq!(d.poll(&mut input)?, ChunkEvent::Data(Bytes::from_static(b"OK")));
        assert_eq!(d.poll(&mut input)?, ChunkEvent::Ended);
        Ok(())
    }

    #[test]
    fn test_dechunk_bad_size() {
        let mut d = Dechunker::new();
        let err = d.poll(&mut buf(b"xyz\r\n")).unwrap_err();
        assert!(matches!(err, Error::ChunkLenNotANumber));
    }

    #[test]
    fn test_dechunk_missing_crlf() {
        let mut d = Dechunker::new();
        let mut input = buf(b"2\r\nOKX\r\n");
        assert_eq!(d.poll(&mut input).unwrap(), ChunkEvent::Data(Bytes::from_static(b"OK")));
        let err = d.poll(&mut input).unwrap_err();
        assert!(matches!(err, Error::ChunkExpectedCrLf));
    }

    #[test]
    fn test_awaiting() {
        assert_eq!(Dechunker::Size.awaiting(), Awaiting::Chunk);
        assert_eq!(Dechunker::Chunk(3).awaiting(), Awaiting::Chunk);
        assert_eq!(Dechunker::ChunkEnd.awaiting(), Awaiting::Chunk);
        assert_eq!(Dechunker::Trailer.awaiting(), Awaiting::ChunkTrailer);
    }
}
