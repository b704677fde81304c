// MIT License
// Copyright 2023--present potserve developers

//! Binary request/response framing.
//!
//! ```text
//! request:
//! ┌───────────┬──────────┬────────────────┬────────────────┬──────────────────┐
//! │ int_width │ n_atoms  │ atomic_numbers │ positions      │ contributing     │
//! │ 4 bytes   │ w bytes  │ n × w bytes    │ n × 3 × f64    │ n × w bytes      │
//! │ i32 (4|8) │ signed   │ signed         │ row-major      │ signed, 0/1      │
//! └───────────┴──────────┴────────────────┴────────────────┴──────────────────┘
//!
//! response:
//! ┌──────────┬──────────────────┐
//! │ energy   │ forces           │
//! │ 1 × f64  │ n × 3 × f64      │
//! └──────────┴──────────────────┘
//! ```
//!
//! All integers and floats are little-endian. The energy is exactly one
//! `f64`, so the response length follows from the request's atom count.
//!
//! Everything here is pure; the socket side lives in
//! [`net::connection`](crate::net::connection), which reads the sections one
//! by one and hands the bytes to these functions.

use crate::error::ProtocolError;
use crate::potential::Evaluation;

/// Size of the leading width tag.
pub const WIDTH_TAG_SIZE: usize = 4;

/// Bytes of one `f64` on the wire.
pub const F64_SIZE: usize = 8;

/// Bytes of one position or force row.
pub const VEC3_SIZE: usize = 3 * F64_SIZE;

/// Bytes of the energy section of a response.
pub const ENERGY_SIZE: usize = F64_SIZE;

/// Integer encoding selected by the width tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IntWidth {
    #[default]
    Four,
    Eight,
}

impl IntWidth {
    /// Parse the 4-byte width tag.
    pub fn from_tag(tag: [u8; WIDTH_TAG_SIZE]) -> Result<Self, ProtocolError> {
        match i32::from_le_bytes(tag) {
            4 => Ok(IntWidth::Four),
            8 => Ok(IntWidth::Eight),
            other => Err(ProtocolError::MalformedHeader(other)),
        }
    }

    /// The width tag as sent on the wire.
    pub fn tag(self) -> [u8; WIDTH_TAG_SIZE] {
        (self.bytes() as i32).to_le_bytes()
    }

    /// Number of bytes per integer.
    pub const fn bytes(self) -> usize {
        match self {
            IntWidth::Four => 4,
            IntWidth::Eight => 8,
        }
    }

    /// Read one integer from the front of `buf`.
    ///
    /// `buf` must hold at least [`bytes`](Self::bytes) bytes.
    fn read(self, buf: &[u8]) -> i64 {
        match self {
            IntWidth::Four => {
                let mut b = [0u8; 4];
                b.copy_from_slice(&buf[..4]);
                i64::from(i32::from_le_bytes(b))
            }
            IntWidth::Eight => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&buf[..8]);
                i64::from_le_bytes(b)
            }
        }
    }

    fn write(self, value: i64, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        match self {
            IntWidth::Four => {
                let v = i32::try_from(value).map_err(|_| ProtocolError::IntegerOverflow {
                    value,
                    width: 4,
                })?;
                out.extend_from_slice(&v.to_le_bytes());
            }
            IntWidth::Eight => out.extend_from_slice(&value.to_le_bytes()),
        }
        Ok(())
    }
}

/// One decoded request frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Request {
    pub int_width: IntWidth,
    pub atomic_numbers: Vec<i64>,
    pub positions: Vec<[f64; 3]>,
    pub contributing: Vec<i64>,
}

impl Request {
    /// Build a request with every atom contributing.
    pub fn new(atomic_numbers: Vec<i64>, positions: Vec<[f64; 3]>) -> Self {
        let contributing = vec![1; atomic_numbers.len()];
        Self {
            int_width: IntWidth::Four,
            atomic_numbers,
            positions,
            contributing,
        }
    }

    pub fn with_contributing(mut self, contributing: Vec<i64>) -> Self {
        self.contributing = contributing;
        self
    }

    pub fn with_int_width(mut self, int_width: IntWidth) -> Self {
        self.int_width = int_width;
        self
    }

    pub fn n_atoms(&self) -> usize {
        self.atomic_numbers.len()
    }
}

/// Byte sizes of the payload sections following `n_atoms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadLayout {
    pub int_width: IntWidth,
    pub n_atoms: usize,
}

impl PayloadLayout {
    pub fn new(int_width: IntWidth, n_atoms: usize) -> Self {
        Self { int_width, n_atoms }
    }

    pub fn atomic_numbers_len(&self) -> usize {
        self.n_atoms * self.int_width.bytes()
    }

    pub fn positions_len(&self) -> usize {
        self.n_atoms * VEC3_SIZE
    }

    pub fn contributing_len(&self) -> usize {
        self.n_atoms * self.int_width.bytes()
    }

    /// Total payload bytes after the `n_atoms` field.
    pub fn total(&self) -> usize {
        self.atomic_numbers_len() + self.positions_len() + self.contributing_len()
    }

    /// Total bytes of a full request frame with this layout.
    pub fn frame_len(&self) -> usize {
        WIDTH_TAG_SIZE + self.int_width.bytes() + self.total()
    }
}

/// Decode and validate the `n_atoms` field.
pub fn decode_atom_count(
    int_width: IntWidth,
    bytes: &[u8],
    max_atoms: usize,
) -> Result<usize, ProtocolError> {
    ensure_len(bytes, int_width.bytes())?;
    let n_atoms = int_width.read(bytes);
    if n_atoms <= 0 || n_atoms as u64 > max_atoms as u64 {
        return Err(ProtocolError::InvalidAtomCount { n_atoms, max_atoms });
    }
    Ok(n_atoms as usize)
}

/// Decode the three payload sections of a request.
pub fn decode_payload(
    layout: PayloadLayout,
    atomic_numbers: &[u8],
    positions: &[u8],
    contributing: &[u8],
) -> Result<Request, ProtocolError> {
    ensure_len(atomic_numbers, layout.atomic_numbers_len())?;
    ensure_len(positions, layout.positions_len())?;
    ensure_len(contributing, layout.contributing_len())?;

    let width = layout.int_width;
    Ok(Request {
        int_width: width,
        atomic_numbers: read_ints(width, atomic_numbers, layout.n_atoms),
        positions: read_vec3s(positions, layout.n_atoms),
        contributing: read_ints(width, contributing, layout.n_atoms),
    })
}

/// Decode a complete request frame held in memory.
pub fn decode_request(bytes: &[u8], max_atoms: usize) -> Result<Request, ProtocolError> {
    ensure_len(bytes, WIDTH_TAG_SIZE)?;
    let mut tag = [0u8; WIDTH_TAG_SIZE];
    tag.copy_from_slice(&bytes[..WIDTH_TAG_SIZE]);
    let width = IntWidth::from_tag(tag)?;

    let rest = &bytes[WIDTH_TAG_SIZE..];
    let n_atoms = decode_atom_count(width, rest, max_atoms)?;
    let layout = PayloadLayout::new(width, n_atoms);
    ensure_len(bytes, layout.frame_len())?;

    let payload = &rest[width.bytes()..];
    let (numbers, payload) = payload.split_at(layout.atomic_numbers_len());
    let (positions, payload) = payload.split_at(layout.positions_len());
    let contributing = &payload[..layout.contributing_len()];
    decode_payload(layout, numbers, positions, contributing)
}

/// Encode a request frame, as a simulation driver would send it.
pub fn encode_request(request: &Request) -> Result<Vec<u8>, ProtocolError> {
    let n = request.n_atoms();
    if request.positions.len() != n {
        return Err(ProtocolError::ShapeMismatch {
            field: "positions",
            expected: n,
            actual: request.positions.len(),
        });
    }
    if request.contributing.len() != n {
        return Err(ProtocolError::ShapeMismatch {
            field: "contributing",
            expected: n,
            actual: request.contributing.len(),
        });
    }

    let width = request.int_width;
    let layout = PayloadLayout::new(width, n);
    let mut out = Vec::with_capacity(layout.frame_len());
    out.extend_from_slice(&width.tag());
    width.write(n as i64, &mut out)?;
    for &z in &request.atomic_numbers {
        width.write(z, &mut out)?;
    }
    write_vec3s(&request.positions, &mut out);
    for &c in &request.contributing {
        width.write(c, &mut out)?;
    }
    Ok(out)
}

/// Number of bytes in a response for `n_atoms` atoms.
pub const fn response_len(n_atoms: usize) -> usize {
    ENERGY_SIZE + n_atoms * VEC3_SIZE
}

/// Encode the response to a request with `n_atoms` atoms.
pub fn encode_response(evaluation: &Evaluation, n_atoms: usize) -> Result<Vec<u8>, ProtocolError> {
    if evaluation.forces.len() != n_atoms {
        return Err(ProtocolError::ForceCountMismatch {
            expected: n_atoms,
            actual: evaluation.forces.len(),
        });
    }
    let mut out = Vec::with_capacity(response_len(n_atoms));
    out.extend_from_slice(&evaluation.energy.to_le_bytes());
    write_vec3s(&evaluation.forces, &mut out);
    Ok(out)
}

/// Decode a response for a request that had `n_atoms` atoms.
pub fn decode_response(bytes: &[u8], n_atoms: usize) -> Result<Evaluation, ProtocolError> {
    ensure_len(bytes, response_len(n_atoms))?;
    let mut e = [0u8; F64_SIZE];
    e.copy_from_slice(&bytes[..ENERGY_SIZE]);
    Ok(Evaluation {
        energy: f64::from_le_bytes(e),
        forces: read_vec3s(&bytes[ENERGY_SIZE..], n_atoms),
    })
}

fn ensure_len(bytes: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if bytes.len() < expected {
        return Err(ProtocolError::Truncated {
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn read_ints(width: IntWidth, bytes: &[u8], n: usize) -> Vec<i64> {
    bytes
        .chunks_exact(width.bytes())
        .take(n)
        .map(|chunk| width.read(chunk))
        .collect()
}

fn read_vec3s(bytes: &[u8], n: usize) -> Vec<[f64; 3]> {
    bytes
        .chunks_exact(VEC3_SIZE)
        .take(n)
        .map(|row| {
            let mut v = [0.0; 3];
            for (k, c) in row.chunks_exact(F64_SIZE).enumerate() {
                let mut b = [0u8; F64_SIZE];
                b.copy_from_slice(c);
                v[k] = f64::from_le_bytes(b);
            }
            v
        })
        .collect()
}

fn write_vec3s(rows: &[[f64; 3]], out: &mut Vec<u8>) {
    for row in rows {
        for c in row {
            out.extend_from_slice(&c.to_le_bytes());
        }
    }
}
