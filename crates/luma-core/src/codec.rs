//! Record encodings for the span, trace and dependency topics.

use crate::error::CodecError;
use crate::model::{DependencyLink, Span};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Zipkin v2 JSON.
    #[default]
    Json,
    /// Compact bincode layout.
    Binary,
}

impl Encoding {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes, CodecError> {
        let bytes = match self {
            Encoding::Json => serde_json::to_vec(value)?,
            Encoding::Binary => bincode::serialize(value)?,
        };
        Ok(Bytes::from(bytes))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        Ok(match self {
            Encoding::Json => serde_json::from_slice(bytes)?,
            Encoding::Binary => bincode::deserialize(bytes)?,
        })
    }

    pub fn encode_span(&self, span: &Span) -> Result<Bytes, CodecError> {
        self.encode(span)
    }

    pub fn decode_span(&self, bytes: &[u8]) -> Result<Span, CodecError> {
        self.decode(bytes)
    }

    pub fn encode_spans(&self, spans: &[Span]) -> Result<Bytes, CodecError> {
        self.encode(spans)
    }

    pub fn decode_spans(&self, bytes: &[u8]) -> Result<Vec<Span>, CodecError> {
        self.decode(bytes)
    }

    pub fn encode_link(&self, link: &DependencyLink) -> Result<Bytes, CodecError> {
        self.encode(link)
    }

    pub fn decode_link(&self, bytes: &[u8]) -> Result<DependencyLink, CodecError> {
        self.decode(bytes)
    }

    pub fn encode_links(&self, links: &[DependencyLink]) -> Result<Bytes, CodecError> {
        self.encode(links)
    }

    pub fn decode_links(&self, bytes: &[u8]) -> Result<Vec<DependencyLink>, CodecError> {
        self.decode(bytes)
    }
}

impl std::str::FromStr for Encoding {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Encoding::Json),
            "binary" | "bincode" => Ok(Encoding::Binary),
            other => Err(CodecError::UnknownEncoding(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Kind;

    #[test]
    fn test_binary_preserves_optional_fields() {
        let span = Span::new("a", "b")
            .with_parent("a")
            .with_kind(Kind::Client)
            .with_timestamp(1_000)
            .with_local_service("svc_a")
            .with_annotation(1_001, "ws");
        let bytes = Encoding::Binary.encode_spans(&[span.clone()]).unwrap();
        assert_eq!(Encoding::Binary.decode_spans(&bytes).unwrap(), vec![span]);
    }

    #[test]
    fn test_json_accepts_sparse_span() {
        let spans = Encoding::Json
            .decode_spans(br#"[{"traceId":"a","id":"b"}]"#)
            .unwrap();
        assert_eq!(spans, vec![Span::new("a", "b")]);
    }

    #[test]
    fn test_decode_garbage_is_an_error() {
        assert!(Encoding::Json.decode_spans(b"not json").is_err());
        assert!(Encoding::Binary.decode_link(&[0xff]).is_err());
    }
}
