//! Content decoding.
//!
//! The codecs themselves are not part of this crate. A [`DecoderFactory`]
//! lists the encodings it can handle and hands out a [`ContentDecoder`] per
//! response. When `decode_content` is enabled, the client advertises the
//! factory encodings in `Accept-Encoding`.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;

use crate::util::tokens;
use crate::Error;

/// Decoder for one response body.
pub trait ContentDecoder: Send {
    /// Decode the next piece of input. May return nothing.
    fn decode(&mut self, input: &[u8]) -> Result<Bytes, Error>;

    /// Flush what is left once the body has ended.
    fn finish(&mut self) -> Result<Bytes, Error>;
}

/// Makes decoders by content-encoding name.
pub trait DecoderFactory: Send + Sync + 'static {
    /// Encoding names, such as `gzip`, in order of preference.
    fn encodings(&self) -> Vec<String>;

    /// A decoder for the (lowercase) encoding name.
    fn decoder(&self, encoding: &str) -> Option<Box<dyn ContentDecoder>>;
}

/// The decoders to use for a response, if any apply.
#[derive(Clone)]
pub(crate) struct Decoders(Arc<dyn DecoderFactory>);

impl Decoders {
    pub fn new(factory: Arc<dyn DecoderFactory>) -> Self {
        Decoders(factory)
    }

    pub fn accept_encoding(&self) -> String {
        self.0.encodings().join(", ")
    }

    /// Pick a decoder for the response headers.
    ///
    /// Only a single coding is supported. `identity` needs no decoder.
    pub fn for_response(&self, headers: &HeaderMap) -> Result<Option<Box<dyn ContentDecoder>>, Error> {
        let Some(value) = headers.get("content-encoding") else {
            return Ok(None);
        };

        let value = value
            .to_str()
            .map_err(|_| Error::Decode("content-encoding is not a string".into()))?;

        let codings: Vec<_> = tokens(value)
            .map(|v| v.to_ascii_lowercase())
            .filter(|v| v != "identity")
            .collect();

        match codings.as_slice() {
            [] => Ok(None),
            [single] => match self.0.decoder(single) {
                Some(d) => {
                    debug!("Decode content-encoding: {}", single);
                    Ok(Some(d))
                }
                None => Err(Error::Decode(format!("unsupported content-encoding: {}", single))),
            },
            _ => Err(Error::Decode(format!("unsupported content-encoding: {}", value))),
        }
    }
}

impl fmt::Debug for Decoders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Decoders").field(&self.0.encodings()).finish()
    }
}
