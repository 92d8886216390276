//! Parameter RPC wire format — slotted request/reply frames.
//!
//! A frame is a 28-byte header followed by a list of typed slots. Every
//! integer is little-endian. The header:
//!
//! | off | field   | meaning                              |
//! |-----|---------|--------------------------------------|
//! | 0   | magic   | `RPC_MAGIC` ("FTHM")                 |
//! | 4   | version | `RPC_VERSION`                        |
//! | 8   | session | session token, 0 during CONNECT      |
//! | 12  | seq     | request sequence, echoed by replies  |
//! | 16  | flags   | bit 0: reply                         |
//! | 20  | proc    | procedure number                     |
//! | 24  | n_slots | slot count                           |
//!
//! Each slot: `{ id: u32, kind: u32, len: u32, data[len], pad to 4 }`.
//!
//! Parameter values (`ParamValue`) ride on top of slots: parameter `i` of a
//! call occupies `SLOT_NAME0 + i`, `SLOT_TYPE0 + i` and `SLOT_VALUE0 + i`,
//! with the value encoded per its type tag (booleans as u32, Null with no
//! value slot at all).

// ── Constants ────────────────────────────────────────────────────────────────

/// "FTHM" as a little-endian u32.
pub const RPC_MAGIC: u32 = 0x4D485446;

/// RPC framing revision.
pub const RPC_VERSION: u32 = 1;

/// Hard cap on one RPC datagram. Large enough for a full schema slot plus
/// header overhead, small enough to stay a single UDP datagram.
pub const RPC_MAX_FRAME: usize = 65_000;

/// Parameter slots per call; at most `MAX_PARAMS - 1` parameters are usable.
pub const MAX_PARAMS: usize = 1024;

/// Transport-internal procedures.
pub const PROC_CONNECT: u32 = 1;
pub const PROC_DISCONNECT: u32 = 2;

/// First user procedure number.
pub const PROC_USER: u32 = 0x100;
pub const PROC_VERSION: u32 = PROC_USER;
pub const PROC_GET_SCHEMA: u32 = PROC_USER + 1;
pub const PROC_SET_MASTER: u32 = PROC_USER + 2;
pub const PROC_SET: u32 = PROC_USER + 3;
pub const PROC_GET: u32 = PROC_USER + 4;

/// First user slot number.
pub const SLOT_USER: u32 = 0x100;
pub const SLOT_VERSION: u32 = SLOT_USER;
pub const SLOT_MAGIC: u32 = SLOT_USER + 1;
pub const SLOT_STATUS: u32 = SLOT_USER + 2;
pub const SLOT_SCHEMA_DATA: u32 = SLOT_USER + 3;
pub const SLOT_SCHEMA_SIZE: u32 = SLOT_USER + 4;
pub const SLOT_SCHEMA_ID: u32 = SLOT_USER + 5;
pub const SLOT_MASTER_HOST: u32 = SLOT_USER + 6;
pub const SLOT_MASTER_PORT: u32 = SLOT_USER + 7;
pub const SLOT_NAME0: u32 = SLOT_USER + 8;
pub const SLOT_TYPE0: u32 = SLOT_NAME0 + MAX_PARAMS as u32;
pub const SLOT_VALUE0: u32 = SLOT_TYPE0 + MAX_PARAMS as u32;

pub const STATUS_OK: u32 = 1;
pub const STATUS_FAIL: u32 = 0;

/// Parameter value type tags.
pub const TYPE_NULL: u32 = 0;
pub const TYPE_BOOL: u32 = 1;
pub const TYPE_I64: u32 = 2;
pub const TYPE_F64: u32 = 3;
pub const TYPE_STRING: u32 = 4;

/// Master data sinks must advertise a port in this range.
pub const MIN_DATA_PORT: u16 = 10_000;
pub const MAX_DATA_PORT: u16 = 50_000;

const HEADER_LEN: usize = 28;
const FLAG_REPLY: u32 = 0x1;

const KIND_U32: u32 = 1;
const KIND_I64: u32 = 2;
const KIND_F64: u32 = 3;
const KIND_STR: u32 = 4;
const KIND_BYTES: u32 = 5;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),

    #[error("bad rpc magic: 0x{0:08x}")]
    BadMagic(u32),

    #[error("unsupported rpc version: {0}")]
    BadVersion(u32),

    #[error("encoded frame would exceed {RPC_MAX_FRAME} bytes")]
    FrameTooLarge,

    #[error("too many parameters in one call")]
    TooManyParams,

    #[error("unknown slot kind {kind} for slot {id}")]
    BadSlotKind { id: u32, kind: u32 },

    #[error("slot {id} has wrong length {len} for its kind")]
    BadSlotLength { id: u32, len: usize },

    #[error("slot {0} is not valid UTF-8")]
    InvalidString(u32),

    #[error("missing slot {0}")]
    MissingSlot(u32),

    #[error("unknown parameter type tag {0}")]
    BadTypeTag(u32),
}

// ── Values ───────────────────────────────────────────────────────────────────

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
}

impl ParamValue {
    pub fn type_tag(&self) -> u32 {
        match self {
            ParamValue::Null => TYPE_NULL,
            ParamValue::Bool(_) => TYPE_BOOL,
            ParamValue::I64(_) => TYPE_I64,
            ParamValue::F64(_) => TYPE_F64,
            ParamValue::String(_) => TYPE_STRING,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SlotValue {
    U32(u32),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// One request or reply frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub session: u32,
    pub seq: u32,
    pub reply: bool,
    pub proc: u32,
    slots: Vec<(u32, SlotValue)>,
}

impl Frame {
    pub fn request(session: u32, seq: u32, proc: u32) -> Self {
        Self { session, seq, reply: false, proc, slots: Vec::new() }
    }

    /// An empty reply mirroring a request's routing fields.
    pub fn reply_to(request: &Frame) -> Self {
        Self {
            session: request.session,
            seq: request.seq,
            reply: true,
            proc: request.proc,
            slots: Vec::new(),
        }
    }

    fn set(&mut self, id: u32, value: SlotValue) {
        match self.slots.iter_mut().find(|(slot_id, _)| *slot_id == id) {
            Some((_, existing)) => *existing = value,
            None => self.slots.push((id, value)),
        }
    }

    fn get(&self, id: u32) -> Option<&SlotValue> {
        self.slots.iter().find(|(slot_id, _)| *slot_id == id).map(|(_, v)| v)
    }

    pub fn set_u32(&mut self, id: u32, value: u32) {
        self.set(id, SlotValue::U32(value));
    }

    pub fn set_i64(&mut self, id: u32, value: i64) {
        self.set(id, SlotValue::I64(value));
    }

    pub fn set_f64(&mut self, id: u32, value: f64) {
        self.set(id, SlotValue::F64(value));
    }

    pub fn set_str(&mut self, id: u32, value: &str) {
        self.set(id, SlotValue::Str(value.to_owned()));
    }

    pub fn set_bytes(&mut self, id: u32, value: Vec<u8>) {
        self.set(id, SlotValue::Bytes(value));
    }

    pub fn get_u32(&self, id: u32) -> Option<u32> {
        match self.get(id) {
            Some(SlotValue::U32(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_i64(&self, id: u32) -> Option<i64> {
        match self.get(id) {
            Some(SlotValue::I64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_f64(&self, id: u32) -> Option<f64> {
        match self.get(id) {
            Some(SlotValue::F64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_str(&self, id: u32) -> Option<&str> {
        match self.get(id) {
            Some(SlotValue::Str(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn get_bytes(&self, id: u32) -> Option<&[u8]> {
        match self.get(id) {
            Some(SlotValue::Bytes(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Reply status, `STATUS_FAIL` when the slot is absent.
    pub fn status(&self) -> u32 {
        self.get_u32(SLOT_STATUS).unwrap_or(STATUS_FAIL)
    }

    // ── Parameter helpers ────────────────────────────────────────────────────

    /// Install parameter `i`: name, type tag, and value slots.
    pub fn set_param(&mut self, i: usize, name: &str, value: &ParamValue) -> Result<(), RpcError> {
        if i >= MAX_PARAMS - 1 {
            return Err(RpcError::TooManyParams);
        }
        self.set_str(SLOT_NAME0 + i as u32, name);
        self.set_param_value(i, value)?;
        Ok(())
    }

    /// Install the type/value slots of parameter `i` without a name.
    /// Used by GET replies, where names are implied by request order.
    pub fn set_param_value(&mut self, i: usize, value: &ParamValue) -> Result<(), RpcError> {
        if i >= MAX_PARAMS - 1 {
            return Err(RpcError::TooManyParams);
        }
        let i = i as u32;
        self.set_u32(SLOT_TYPE0 + i, value.type_tag());
        match value {
            ParamValue::Null => {}
            ParamValue::Bool(v) => self.set_u32(SLOT_VALUE0 + i, u32::from(*v)),
            ParamValue::I64(v) => self.set_i64(SLOT_VALUE0 + i, *v),
            ParamValue::F64(v) => self.set_f64(SLOT_VALUE0 + i, *v),
            ParamValue::String(v) => self.set_str(SLOT_VALUE0 + i, v),
        }
        Ok(())
    }

    /// Name of parameter `i`, if present.
    pub fn param_name(&self, i: usize) -> Option<&str> {
        self.get_str(SLOT_NAME0 + i as u32)
    }

    /// Decode the value of parameter `i` from its type/value slots.
    pub fn param_value(&self, i: usize) -> Result<ParamValue, RpcError> {
        let i = i as u32;
        let tag = self
            .get_u32(SLOT_TYPE0 + i)
            .ok_or(RpcError::MissingSlot(SLOT_TYPE0 + i))?;
        let value_slot = SLOT_VALUE0 + i;
        match tag {
            TYPE_NULL => Ok(ParamValue::Null),
            TYPE_BOOL => self
                .get_u32(value_slot)
                .map(|v| ParamValue::Bool(v != 0))
                .ok_or(RpcError::MissingSlot(value_slot)),
            TYPE_I64 => self
                .get_i64(value_slot)
                .map(ParamValue::I64)
                .ok_or(RpcError::MissingSlot(value_slot)),
            TYPE_F64 => self
                .get_f64(value_slot)
                .map(ParamValue::F64)
                .ok_or(RpcError::MissingSlot(value_slot)),
            TYPE_STRING => self
                .get_str(value_slot)
                .map(|v| ParamValue::String(v.to_owned()))
                .ok_or(RpcError::MissingSlot(value_slot)),
            other => Err(RpcError::BadTypeTag(other)),
        }
    }

    // ── Encoding ─────────────────────────────────────────────────────────────

    pub fn encode(&self) -> Result<Vec<u8>, RpcError> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.slots.len() * 16);
        out.extend_from_slice(&RPC_MAGIC.to_le_bytes());
        out.extend_from_slice(&RPC_VERSION.to_le_bytes());
        out.extend_from_slice(&self.session.to_le_bytes());
        out.extend_from_slice(&self.seq.to_le_bytes());
        let flags: u32 = if self.reply { FLAG_REPLY } else { 0 };
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&self.proc.to_le_bytes());
        out.extend_from_slice(&(self.slots.len() as u32).to_le_bytes());

        for (id, value) in &self.slots {
            let (kind, data): (u32, Vec<u8>) = match value {
                SlotValue::U32(v) => (KIND_U32, v.to_le_bytes().to_vec()),
                SlotValue::I64(v) => (KIND_I64, v.to_le_bytes().to_vec()),
                SlotValue::F64(v) => (KIND_F64, v.to_le_bytes().to_vec()),
                SlotValue::Str(v) => (KIND_STR, v.as_bytes().to_vec()),
                SlotValue::Bytes(v) => (KIND_BYTES, v.clone()),
            };
            out.extend_from_slice(&id.to_le_bytes());
            out.extend_from_slice(&kind.to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&data);
            let pad = (4 - data.len() % 4) % 4;
            out.extend_from_slice(&[0u8; 3][..pad]);

            if out.len() > RPC_MAX_FRAME {
                return Err(RpcError::FrameTooLarge);
            }
        }

        if out.len() > RPC_MAX_FRAME {
            return Err(RpcError::FrameTooLarge);
        }
        Ok(out)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, RpcError> {
        if datagram.len() < HEADER_LEN {
            return Err(RpcError::Truncated(datagram.len()));
        }

        let u32_at = |off: usize| u32::from_le_bytes(datagram[off..off + 4].try_into().unwrap());

        let magic = u32_at(0);
        if magic != RPC_MAGIC {
            return Err(RpcError::BadMagic(magic));
        }
        let version = u32_at(4);
        if version != RPC_VERSION {
            return Err(RpcError::BadVersion(version));
        }

        let mut frame = Frame {
            session: u32_at(8),
            seq: u32_at(12),
            reply: u32_at(16) & FLAG_REPLY != 0,
            proc: u32_at(20),
            slots: Vec::new(),
        };
        let n_slots = u32_at(24) as usize;

        let mut pos = HEADER_LEN;
        for _ in 0..n_slots {
            if datagram.len() < pos + 12 {
                return Err(RpcError::Truncated(datagram.len()));
            }
            let id = u32_at(pos);
            let kind = u32_at(pos + 4);
            let len = u32_at(pos + 8) as usize;
            pos += 12;

            if datagram.len() < pos + len {
                return Err(RpcError::Truncated(datagram.len()));
            }
            let data = &datagram[pos..pos + len];

            let value = match kind {
                KIND_U32 => {
                    let raw: [u8; 4] =
                        data.try_into().map_err(|_| RpcError::BadSlotLength { id, len })?;
                    SlotValue::U32(u32::from_le_bytes(raw))
                }
                KIND_I64 => {
                    let raw: [u8; 8] =
                        data.try_into().map_err(|_| RpcError::BadSlotLength { id, len })?;
                    SlotValue::I64(i64::from_le_bytes(raw))
                }
                KIND_F64 => {
                    let raw: [u8; 8] =
                        data.try_into().map_err(|_| RpcError::BadSlotLength { id, len })?;
                    SlotValue::F64(f64::from_le_bytes(raw))
                }
                KIND_STR => SlotValue::Str(
                    String::from_utf8(data.to_vec()).map_err(|_| RpcError::InvalidString(id))?,
                ),
                KIND_BYTES => SlotValue::Bytes(data.to_vec()),
                other => return Err(RpcError::BadSlotKind { id, kind: other }),
            };
            frame.slots.push((id, value));

            pos += len + (4 - len % 4) % 4;
        }

        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip_all_slot_kinds() {
        let mut frame = Frame::request(0xAABB, 17, PROC_SET);
        frame.set_u32(SLOT_STATUS, STATUS_OK);
        frame.set_i64(10, -42);
        frame.set_f64(11, 2.75);
        frame.set_str(12, "starboard/tvg/gain");
        frame.set_bytes(13, vec![1, 2, 3, 4, 5]);

        let bytes = frame.encode().unwrap();
        let decoded = Frame::decode(&bytes).unwrap();

        assert_eq!(decoded.session, 0xAABB);
        assert_eq!(decoded.seq, 17);
        assert!(!decoded.reply);
        assert_eq!(decoded.proc, PROC_SET);
        assert_eq!(decoded.get_u32(SLOT_STATUS), Some(STATUS_OK));
        assert_eq!(decoded.get_i64(10), Some(-42));
        assert_eq!(decoded.get_f64(11), Some(2.75));
        assert_eq!(decoded.get_str(12), Some("starboard/tvg/gain"));
        assert_eq!(decoded.get_bytes(13), Some(&[1u8, 2, 3, 4, 5][..]));
    }

    #[test]
    fn reply_mirrors_request_routing() {
        let request = Frame::request(5, 99, PROC_GET);
        let reply = Frame::reply_to(&request);
        assert_eq!(reply.session, 5);
        assert_eq!(reply.seq, 99);
        assert_eq!(reply.proc, PROC_GET);
        assert!(reply.reply);
    }

    #[test]
    fn params_round_trip_every_type() {
        let values = [
            ParamValue::Null,
            ParamValue::Bool(true),
            ParamValue::I64(-7),
            ParamValue::F64(0.5),
            ParamValue::String("echo".into()),
        ];

        let mut frame = Frame::request(1, 1, PROC_SET);
        for (i, value) in values.iter().enumerate() {
            frame.set_param(i, &format!("key{i}"), value).unwrap();
        }

        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        for (i, value) in values.iter().enumerate() {
            assert_eq!(decoded.param_name(i), Some(format!("key{i}").as_str()));
            assert_eq!(&decoded.param_value(i).unwrap(), value);
        }
        assert_eq!(decoded.param_name(values.len()), None);
    }

    #[test]
    fn set_replaces_existing_slot() {
        let mut frame = Frame::request(1, 1, PROC_GET_SCHEMA);
        frame.set_u32(SLOT_SCHEMA_SIZE, 0);
        frame.set_u32(SLOT_SCHEMA_SIZE, 4096);
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded.get_u32(SLOT_SCHEMA_SIZE), Some(4096));
    }

    #[test]
    fn param_index_limit_is_enforced() {
        let mut frame = Frame::request(1, 1, PROC_SET);
        assert!(frame.set_param(MAX_PARAMS - 2, "last", &ParamValue::Null).is_ok());
        assert!(matches!(
            frame.set_param(MAX_PARAMS - 1, "overflow", &ParamValue::Null),
            Err(RpcError::TooManyParams)
        ));
    }

    #[test]
    fn oversized_frame_is_rejected_at_encode() {
        let mut frame = Frame::request(1, 1, PROC_GET_SCHEMA);
        frame.set_bytes(SLOT_SCHEMA_DATA, vec![0u8; RPC_MAX_FRAME]);
        assert!(matches!(frame.encode(), Err(RpcError::FrameTooLarge)));
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(Frame::decode(&[0u8; 4]), Err(RpcError::Truncated(_))));

        let mut frame = Frame::request(1, 1, PROC_VERSION);
        frame.set_u32(SLOT_MAGIC, 1);
        let mut bytes = frame.encode().unwrap();

        bytes[0] ^= 0xff;
        assert!(matches!(Frame::decode(&bytes), Err(RpcError::BadMagic(_))));
        bytes[0] ^= 0xff;

        bytes.truncate(bytes.len() - 2);
        assert!(matches!(Frame::decode(&bytes), Err(RpcError::Truncated(_))));
    }

    #[test]
    fn missing_status_reads_as_fail() {
        let frame = Frame::request(1, 1, PROC_SET);
        assert_eq!(frame.status(), STATUS_FAIL);
    }
}
