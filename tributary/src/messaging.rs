use std::collections::BTreeMap;

use bincode::{DefaultOptions, Error as BincodeError, Options};
use serde::Serialize;
use tributary_engine::{Metric, SpanData};

pub(crate) fn encode<T: Serialize>(buffer: &mut Vec<u8>, payload: &T) -> Result<(), BincodeError> {
    // this uses a two-byte length prefix followed by the bincode-ed payload

    let start = buffer.len();
    buffer.extend_from_slice(&[0, 0]);

    let result = DefaultOptions::new()
        .with_varint_encoding()
        .with_big_endian()
        .with_limit(u16::MAX as u64)
        .serialize_into(&mut *buffer, payload);

    if let Err(err) = result {
        buffer.truncate(start);
        return Err(err);
    }

    let payload_size = buffer.len() - start - 2;
    let payload_size_bytes = (payload_size as u16).to_be_bytes();

    buffer[start..start + 2].copy_from_slice(&payload_size_bytes);

    Ok(())
}

/// Sent once per connection, before any records.
#[derive(Serialize)]
pub struct Handshake {
    pub fields: BTreeMap<String, String>,
}

#[derive(Serialize)]
pub enum Message<'a> {
    Span(&'a SpanData),
    Metric(&'a Metric),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> impl Options {
        DefaultOptions::new()
            .with_varint_encoding()
            .with_big_endian()
            .with_limit(u16::MAX as u64)
    }

    #[test]
    fn frames_are_length_prefixed() {
        let handshake = Handshake {
            fields: BTreeMap::from_iter([("service".to_owned(), "api".to_owned())]),
        };

        let mut buffer = vec![];
        encode(&mut buffer, &handshake).unwrap();
        encode(&mut buffer, &handshake).unwrap();

        let len = u16::from_be_bytes([buffer[0], buffer[1]]) as usize;
        assert_eq!(buffer.len(), 2 * (len + 2));

        let decoded: BTreeMap<String, String> = options().deserialize(&buffer[2..2 + len]).unwrap();
        assert_eq!(decoded, handshake.fields);
    }

    #[test]
    fn oversized_payload_leaves_buffer_untouched() {
        let mut buffer = vec![1, 2, 3];
        let huge = "x".repeat(u16::MAX as usize + 1);

        assert!(encode(&mut buffer, &huge).is_err());
        assert_eq!(buffer, vec![1, 2, 3]);
    }
}
