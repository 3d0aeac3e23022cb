//! Scene content codec
//!
//! Flush payloads are opaque to the transport. The renderer hands them to a
//! [`SceneUpdateDecoder`]; [`SlotRecordDecoder`] is the default and reads a
//! sequence of records:
//!
//! ```text
//! SetValue:    | 0 | Slot(4) | Len(4) | Value(Len)   |
//! DeclareSlot: | 1 | Slot(4) | Role(1) | Type(1) | Param(4) |
//! RemoveSlot:  | 2 | Slot(4) |
//! ```
//!
//! Role 0 is provider, 1 is consumer. Type 0 is transform, 1 texture and 2 a
//! plain value whose kind is `Param`. All integers are big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::TransportError;
use crate::link::{DataType, SlotRole};
use crate::types::{DataSlotId, SceneId};

const OP_SET_VALUE: u8 = 0;
const OP_DECLARE_SLOT: u8 = 1;
const OP_REMOVE_SLOT: u8 = 2;

/// One decoded scene mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneOp {
    SetValue {
        slot: DataSlotId,
        value: Bytes,
    },
    DeclareSlot {
        slot: DataSlotId,
        role: SlotRole,
        data_type: DataType,
    },
    RemoveSlot {
        slot: DataSlotId,
    },
}

/// Turns a flush payload into scene mutations
///
/// A decoder must either decode the whole payload or fail; a failed flush is
/// dropped without touching the replica.
pub trait SceneUpdateDecoder: Send {
    fn decode(&self, scene: SceneId, payload: &Bytes) -> Result<Vec<SceneOp>, TransportError>;
}

/// Default record decoder
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotRecordDecoder;

impl SceneUpdateDecoder for SlotRecordDecoder {
    fn decode(&self, scene: SceneId, payload: &Bytes) -> Result<Vec<SceneOp>, TransportError> {
        let mut buf = payload.clone();
        let mut ops = Vec::new();

        while buf.has_remaining() {
            let kind = buf.get_u8();
            let op = match kind {
                OP_SET_VALUE => {
                    need(&buf, 8, scene)?;
                    let slot = DataSlotId(buf.get_u32());
                    let len = buf.get_u32() as usize;
                    need(&buf, len, scene)?;
                    SceneOp::SetValue {
                        slot,
                        value: buf.split_to(len),
                    }
                }
                OP_DECLARE_SLOT => {
                    need(&buf, 10, scene)?;
                    let slot = DataSlotId(buf.get_u32());
                    let role = match buf.get_u8() {
                        0 => SlotRole::Provider,
                        1 => SlotRole::Consumer,
                        other => return Err(malformed(scene, format!("bad slot role {}", other))),
                    };
                    let type_tag = buf.get_u8();
                    let param = buf.get_u32();
                    let data_type = match type_tag {
                        0 => DataType::Transform,
                        1 => DataType::Texture,
                        2 => DataType::Value(param),
                        other => return Err(malformed(scene, format!("bad slot type {}", other))),
                    };
                    SceneOp::DeclareSlot {
                        slot,
                        role,
                        data_type,
                    }
                }
                OP_REMOVE_SLOT => {
                    need(&buf, 4, scene)?;
                    SceneOp::RemoveSlot {
                        slot: DataSlotId(buf.get_u32()),
                    }
                }
                other => return Err(malformed(scene, format!("unknown record kind {}", other))),
            };
            ops.push(op);
        }

        Ok(ops)
    }
}

fn malformed(scene: SceneId, reason: String) -> TransportError {
    TransportError::MalformedMessage(format!("{} update: {}", scene, reason))
}

fn need(buf: &Bytes, n: usize, scene: SceneId) -> Result<(), TransportError> {
    if buf.remaining() < n {
        return Err(malformed(
            scene,
            format!("record truncated, need {} bytes, have {}", n, buf.remaining()),
        ));
    }
    Ok(())
}

/// Encode mutations in the default record format
pub fn encode_ops(ops: &[SceneOp]) -> Bytes {
    let mut buf = BytesMut::new();
    for op in ops {
        match op {
            SceneOp::SetValue { slot, value } => {
                buf.put_u8(OP_SET_VALUE);
                buf.put_u32(slot.0);
                buf.put_u32(value.len() as u32);
                buf.put_slice(value);
            }
            SceneOp::DeclareSlot {
                slot,
                role,
                data_type,
            } => {
                buf.put_u8(OP_DECLARE_SLOT);
                buf.put_u32(slot.0);
                buf.put_u8(match role {
                    SlotRole::Provider => 0,
                    SlotRole::Consumer => 1,
                });
                let (tag, param) = match data_type {
                    DataType::Transform => (0, 0),
                    DataType::Texture => (1, 0),
                    DataType::Value(kind) => (2, *kind),
                };
                buf.put_u8(tag);
                buf.put_u32(param);
            }
            SceneOp::RemoveSlot { slot } => {
                buf.put_u8(OP_REMOVE_SLOT);
                buf.put_u32(slot.0);
            }
        }
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_mixed_records() {
        let ops = vec![
            SceneOp::DeclareSlot {
                slot: DataSlotId(1),
                role: SlotRole::Consumer,
                data_type: DataType::Value(7),
            },
            SceneOp::SetValue {
                slot: DataSlotId(1),
                value: Bytes::from_static(b"hello"),
            },
            SceneOp::RemoveSlot {
                slot: DataSlotId(2),
            },
        ];
        let payload = encode_ops(&ops);

        let decoded = SlotRecordDecoder.decode(SceneId(1), &payload).unwrap();
        assert_eq!(decoded, ops);
    }

    #[test]
    fn test_empty_payload_decodes_to_nothing() {
        let decoded = SlotRecordDecoder.decode(SceneId(1), &Bytes::new()).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_truncated_value_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(OP_SET_VALUE);
        buf.put_u32(1);
        buf.put_u32(10);
        buf.put_slice(b"short");

        let result = SlotRecordDecoder.decode(SceneId(3), &buf.freeze());
        assert!(matches!(result, Err(TransportError::MalformedMessage(_))));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let result = SlotRecordDecoder.decode(SceneId(3), &Bytes::from_static(&[9, 0, 0, 0, 1]));
        assert!(result.is_err());
    }
}
