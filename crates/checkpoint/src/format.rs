//! On-disk encoding of a checkpoint blob
//!
//! ```text
//! [0..4]   magic           b"CKPT"
//! [4..8]   format revision u32 LE
//! [8..16]  payload length  u64 LE
//! [16..]   payload         bincode-encoded CheckpointState
//! ```
//!
//! bincode keeps every numeric payload bit-exact, so a decoded blob equals
//! the one that was encoded.

use bytes::Bytes;
use runtime_core::{Error, Result};
use tracing::{debug, warn};

use crate::state::CheckpointState;

/// Magic bytes for checkpoint files
pub const CHECKPOINT_MAGIC: [u8; 4] = *b"CKPT";

/// Container layout revision (independent of the blob's checkpoint version)
pub const FORMAT_REVISION: u32 = 1;

/// Size of the fixed header
pub const HEADER_LEN: usize = 16;

/// Parsed checkpoint file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointHeader {
    pub magic: [u8; 4],
    pub revision: u32,
    pub payload_len: u64,
}

impl CheckpointHeader {
    fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.revision.to_le_bytes());
        buf[8..16].copy_from_slice(&self.payload_len.to_le_bytes());
        buf
    }

    /// Parse the header at the start of `data`
    pub fn parse(data: &[u8]) -> std::result::Result<Self, String> {
        if data.len() < HEADER_LEN {
            return Err(format!(
                "file is {} bytes, shorter than the {}-byte header",
                data.len(),
                HEADER_LEN
            ));
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[0..4]);
        if magic != CHECKPOINT_MAGIC {
            return Err("invalid checkpoint magic".to_string());
        }

        let mut revision = [0u8; 4];
        revision.copy_from_slice(&data[4..8]);
        let mut payload_len = [0u8; 8];
        payload_len.copy_from_slice(&data[8..16]);

        Ok(Self {
            magic,
            revision: u32::from_le_bytes(revision),
            payload_len: u64::from_le_bytes(payload_len),
        })
    }
}

/// Encode a checkpoint blob into file contents
pub fn encode(state: &CheckpointState) -> Result<Bytes> {
    let payload = bincode::serialize(state)?;
    let header = CheckpointHeader {
        magic: CHECKPOINT_MAGIC,
        revision: FORMAT_REVISION,
        payload_len: payload.len() as u64,
    };

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(&payload);

    debug!(size_bytes = buf.len(), fields = state.len(), "Encoded checkpoint");
    Ok(Bytes::from(buf))
}

/// Decode file contents; `origin` names the file in error messages
pub fn decode(data: &[u8], origin: &str) -> Result<CheckpointState> {
    let corrupted = |reason: String| Error::CheckpointCorrupted {
        path: origin.to_string(),
        reason,
    };

    let header = CheckpointHeader::parse(data).map_err(&corrupted)?;
    if header.revision != FORMAT_REVISION {
        warn!(
            path = origin,
            expected = FORMAT_REVISION,
            found = header.revision,
            "Checkpoint container revision mismatch"
        );
    }

    let payload = &data[HEADER_LEN..];
    if payload.len() as u64 != header.payload_len {
        return Err(corrupted(format!(
            "payload is {} bytes, header declares {} (truncated or partially written)",
            payload.len(),
            header.payload_len
        )));
    }

    bincode::deserialize(payload).map_err(|e| corrupted(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{keys, StateValue, Tensor, TensorData};
    use std::collections::BTreeMap;

    fn sample_state() -> CheckpointState {
        let mut model = BTreeMap::new();
        model.insert(
            "embedding.weight".to_string(),
            StateValue::Tensor(
                Tensor::from_f32(vec![2, 3], vec![0.1, -0.0, f32::MIN_POSITIVE, 1e-30, 3.5, -7.25])
                    .unwrap(),
            ),
        );
        model.insert(
            "position_ids".to_string(),
            StateValue::Tensor(Tensor::new(vec![3], TensorData::I64(vec![0, 1, 2])).unwrap()),
        );

        let mut state = CheckpointState::new();
        state.insert(keys::CHECKPOINT_VERSION, 3u64);
        state.insert(keys::ITERATION, 100u64);
        state.insert(keys::EPOCH, 2u64);
        state.insert(keys::MODEL, StateValue::Map(model));
        state.insert(keys::OPTIMIZER, StateValue::Float(0.1 + 0.2));
        state
    }

    #[test]
    fn test_encode_decode_exact() {
        let state = sample_state();
        let encoded = encode(&state).unwrap();
        assert_eq!(&encoded[0..4], b"CKPT");

        let decoded = decode(&encoded, "test.ckpt").unwrap();
        assert_eq!(decoded, state);
        assert_eq!(
            decoded.get(keys::OPTIMIZER),
            Some(&StateValue::Float(0.30000000000000004))
        );
    }

    #[test]
    fn test_truncated_file_rejected() {
        let encoded = encode(&sample_state()).unwrap();
        let truncated = &encoded[..encoded.len() - 4];

        let err = decode(truncated, "iter_0000100/mp_rank_00/model_optim_rng.ckpt").unwrap_err();
        match err {
            Error::CheckpointCorrupted { path, reason } => {
                assert_eq!(path, "iter_0000100/mp_rank_00/model_optim_rng.ckpt");
                assert!(reason.contains("truncated"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut encoded = encode(&sample_state()).unwrap().to_vec();
        encoded[0] = b'X';
        assert!(matches!(
            decode(&encoded, "x"),
            Err(Error::CheckpointCorrupted { .. })
        ));
        assert!(matches!(decode(b"CK", "x"), Err(Error::CheckpointCorrupted { .. })));
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let header = CheckpointHeader {
            magic: CHECKPOINT_MAGIC,
            revision: FORMAT_REVISION,
            payload_len: 4,
        };
        let mut data = header.to_bytes().to_vec();
        data.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(decode(&data, "x"), Err(Error::CheckpointCorrupted { .. })));
    }
}
