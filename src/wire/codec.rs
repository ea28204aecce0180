//! Length-delimited JSON framing.
//!
//! Frames are a 4-byte big-endian length followed by one JSON envelope.
//! The codec is directional: the client encodes `ClientEnvelope` and
//! decodes `WorkerEnvelope`; a worker (such as the test mocks) uses the
//! reverse pairing.

use std::io;
use std::marker::PhantomData;

use bytes::BytesMut;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json;
use tokio_io::codec::{Decoder, Encoder};

use wire::{ClientEnvelope, WorkerEnvelope};

pub type ClientCodec = Codec<ClientEnvelope, WorkerEnvelope>;
pub type WorkerCodec = Codec<WorkerEnvelope, ClientEnvelope>;

const LEN_PREFIX: usize = 4;

pub struct Codec<E, D> {
    max_frame: usize,
    _marker: PhantomData<(E, D)>,
}

impl<E, D> Codec<E, D> {
    pub fn new(max_frame: usize) -> Codec<E, D> {
        Codec {
            max_frame: max_frame,
            _marker: PhantomData,
        }
    }
}

impl<E: Serialize, D> Encoder for Codec<E, D> {
    type Item = E;
    type Error = io::Error;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> io::Result<()> {
        let json = serde_json::to_vec(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if json.len() > self.max_frame {
            return Err(io::Error::new(io::ErrorKind::InvalidInput,
                                      format!("frame of {} bytes exceeds limit of {}",
                                              json.len(),
                                              self.max_frame)));
        }
        let len = json.len() as u32;
        dst.reserve(LEN_PREFIX + json.len());
        dst.extend_from_slice(&[(len >> 24) as u8, (len >> 16) as u8, (len >> 8) as u8,
                                len as u8]);
        dst.extend_from_slice(&json);
        Ok(())
    }
}

impl<E, D: DeserializeOwned> Decoder for Codec<E, D> {
    type Item = D;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<D>> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = ((src[0] as usize) << 24) | ((src[1] as usize) << 16) |
                  ((src[2] as usize) << 8) | (src[3] as usize);
        if len > self.max_frame {
            return Err(io::Error::new(io::ErrorKind::InvalidData,
                                      format!("frame of {} bytes exceeds limit of {}",
                                              len,
                                              self.max_frame)));
        }
        if src.len() < LEN_PREFIX + len {
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }
        drop(src.split_to(LEN_PREFIX));
        let body = src.split_to(len);
        let env = serde_json::from_slice(&body)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(env))
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use tokio_io::codec::{Decoder, Encoder};
    use wire::{ClientEnvelope, RequestFrame};
    use super::Codec;

    #[test]
    fn roundtrip() {
        let mut codec: Codec<ClientEnvelope, ClientEnvelope> = Codec::new(1024);
        let env = ClientEnvelope::Frame(RequestFrame {
            correlation_id: "req-1".into(),
            task: "text_embedding".into(),
            payload: vec![1, 2, 3],
            payload_mime: "application/octet-stream".into(),
            seq: 0,
            total: 1,
            offset: 0,
            meta: Default::default(),
        });

        let mut buf = BytesMut::new();
        codec.encode(env.clone(), &mut buf).unwrap();

        // A partial prefix decodes to nothing and consumes nothing.
        let mut partial = BytesMut::from(&buf[..3]);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        assert_eq!(partial.len(), 3);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, env);
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec: Codec<ClientEnvelope, ClientEnvelope> = Codec::new(8);
        let env = ClientEnvelope::Health { correlation_id: "h-1".into() };
        let mut buf = BytesMut::new();
        assert!(codec.encode(env, &mut buf).is_err());
    }
}
