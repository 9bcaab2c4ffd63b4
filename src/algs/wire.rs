//! Fixed, versioned, little-endian wire records for collective traffic.
//!
//! A state message is `[WireHdr][WireCount]` followed by `count` entries of
//! `[WireStateHdr][payload bytes]`.

use crate::mesh_error::MeshForestError;
use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::size_of;

/// Bump when the layout or semantics change in incompatible ways.
pub const WIRE_VERSION: u16 = 1;

/// Message kinds carried in [`WireHdr`].
pub const KIND_MIGRATE: u16 = 1;
pub const KIND_GHOST: u16 = 2;

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireHdr {
    pub version_le: u16,
    pub kind_le: u16,
    pub reserved_le: u32,
    pub generation_le: u64,
}

impl WireHdr {
    pub fn new(kind: u16, generation: u64) -> Self {
        Self {
            version_le: WIRE_VERSION.to_le(),
            kind_le: kind.to_le(),
            reserved_le: 0,
            generation_le: generation.to_le(),
        }
    }
    pub fn version(&self) -> u16 {
        u16::from_le(self.version_le)
    }
    pub fn kind(&self) -> u16 {
        u16::from_le(self.kind_le)
    }
    pub fn generation(&self) -> u64 {
        u64::from_le(self.generation_le)
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32,
}

impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u32).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

/// Per-patch header: global curve index, age and payload length.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireStateHdr {
    pub patch_le: u64,
    pub age_le: u32,
    pub len_le: u32,
}

impl WireStateHdr {
    pub fn new(patch: usize, age: u32, len: usize) -> Self {
        Self {
            patch_le: (patch as u64).to_le(),
            age_le: age.to_le(),
            len_le: (len as u32).to_le(),
        }
    }
    pub fn patch(&self) -> usize {
        u64::from_le(self.patch_le) as usize
    }
    pub fn age(&self) -> u32 {
        u32::from_le(self.age_le)
    }
    pub fn len(&self) -> usize {
        u32::from_le(self.len_le) as usize
    }
}

const_assert_eq!(size_of::<WireHdr>(), 16);
const_assert_eq!(size_of::<WireCount>(), 4);
const_assert_eq!(size_of::<WireStateHdr>(), 16);

/// One patch on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct WireState {
    pub patch: usize,
    pub age: u32,
    pub payload: Vec<u8>,
}

pub fn encode_states(kind: u16, generation: u64, states: &[WireState]) -> Vec<u8> {
    let body: usize = states
        .iter()
        .map(|s| size_of::<WireStateHdr>() + s.payload.len())
        .sum();
    let mut out = Vec::with_capacity(size_of::<WireHdr>() + size_of::<WireCount>() + body);
    out.extend_from_slice(bytemuck::bytes_of(&WireHdr::new(kind, generation)));
    out.extend_from_slice(bytemuck::bytes_of(&WireCount::new(states.len())));
    for s in states {
        let hdr = WireStateHdr::new(s.patch, s.age, s.payload.len());
        out.extend_from_slice(bytemuck::bytes_of(&hdr));
        out.extend_from_slice(&s.payload);
    }
    out
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    neighbor: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], MeshForestError> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len());
        let Some(end) = end else {
            return Err(MeshForestError::WireFormat {
                neighbor: self.neighbor,
                reason: format!(
                    "truncated message: need {n} bytes at offset {}, have {}",
                    self.pos,
                    self.buf.len()
                ),
            });
        };
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn record<T: Pod>(&mut self) -> Result<T, MeshForestError> {
        Ok(bytemuck::pod_read_unaligned(self.take(size_of::<T>())?))
    }
}

/// Decode a state message, checking version, kind and generation.
pub fn decode_states(
    neighbor: usize,
    kind: u16,
    generation: u64,
    buf: &[u8],
) -> Result<Vec<WireState>, MeshForestError> {
    let mut r = Reader {
        buf,
        pos: 0,
        neighbor,
    };
    let hdr: WireHdr = r.record()?;
    if hdr.version() != WIRE_VERSION || hdr.kind() != kind {
        return Err(MeshForestError::WireFormat {
            neighbor,
            reason: format!(
                "unexpected header version {} kind {} (want {WIRE_VERSION}/{kind})",
                hdr.version(),
                hdr.kind()
            ),
        });
    }
    if hdr.generation() != generation {
        return Err(MeshForestError::GenerationMismatch {
            operation: "state transfer",
            local: generation,
            remote: hdr.generation(),
        });
    }
    let count: WireCount = r.record()?;
    let mut out = Vec::with_capacity(count.get());
    for _ in 0..count.get() {
        let sh: WireStateHdr = r.record()?;
        let payload = r.take(sh.len())?.to_vec();
        out.push(WireState {
            patch: sh.patch(),
            age: sh.age(),
            payload,
        });
    }
    if r.pos != buf.len() {
        return Err(MeshForestError::WireFormat {
            neighbor,
            reason: format!("{} trailing bytes", buf.len() - r.pos),
        });
    }
    Ok(out)
}

/// Decode a buffer of little-endian `u64` values.
pub fn decode_u64s(neighbor: usize, buf: &[u8]) -> Result<Vec<u64>, MeshForestError> {
    if buf.len() % size_of::<u64>() != 0 {
        return Err(MeshForestError::WireFormat {
            neighbor,
            reason: format!("{} bytes is not a whole number of u64 values", buf.len()),
        });
    }
    Ok(buf
        .chunks_exact(size_of::<u64>())
        .map(|c| u64::from_le_bytes(bytemuck::pod_read_unaligned(c)))
        .collect())
}

pub fn encode_u64s(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_message_decodes() {
        let states = vec![
            WireState {
                patch: 12,
                age: 3,
                payload: vec![1, 2, 3],
            },
            WireState {
                patch: 13,
                age: 0,
                payload: vec![],
            },
        ];
        let buf = encode_states(KIND_GHOST, 7, &states);
        assert_eq!(decode_states(1, KIND_GHOST, 7, &buf).unwrap(), states);
    }

    #[test]
    fn rejects_wrong_generation_and_truncation() {
        let buf = encode_states(
            KIND_MIGRATE,
            2,
            &[WireState {
                patch: 0,
                age: 0,
                payload: vec![9; 8],
            }],
        );
        assert!(matches!(
            decode_states(0, KIND_MIGRATE, 3, &buf),
            Err(MeshForestError::GenerationMismatch { .. })
        ));
        assert!(matches!(
            decode_states(0, KIND_MIGRATE, 2, &buf[..buf.len() - 1]),
            Err(MeshForestError::WireFormat { .. })
        ));
        assert!(matches!(
            decode_states(0, KIND_GHOST, 2, &buf),
            Err(MeshForestError::WireFormat { .. })
        ));
    }

    #[test]
    fn u64_values_are_little_endian() {
        let buf = encode_u64s(&[1, 256]);
        assert_eq!(&buf[..2], &[1, 0]);
        assert_eq!(decode_u64s(0, &buf).unwrap(), vec![1, 256]);
        assert!(decode_u64s(0, &buf[..3]).is_err());
    }
}
