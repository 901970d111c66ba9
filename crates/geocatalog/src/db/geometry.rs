//! GeoPackage geometry blobs: the `GP` header followed by WKB.

use thiserror::Error;

use crate::record::{Extent, Footprint};

const MAGIC: [u8; 2] = *b"GP";
const WKB_POLYGON: u32 = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("not a GeoPackage geometry blob")]
    BadMagic,

    #[error("unsupported GeoPackage geometry version {0}")]
    Version(u8),

    #[error("geometry blob truncated")]
    Truncated,

    #[error("unsupported WKB geometry type {0}")]
    UnsupportedType(u32),

    #[error("invalid envelope indicator {0}")]
    Envelope(u8),
}

/// A decoded GeoPackage geometry header plus its WKB payload.
#[derive(Debug, Clone, PartialEq)]
pub struct GpkgGeometry<'a> {
    pub srs_id: i32,
    pub envelope: Option<Extent>,
    pub empty: bool,
    pub wkb: &'a [u8],
}

pub fn decode(blob: &[u8]) -> Result<GpkgGeometry<'_>, GeometryError> {
    if blob.len() < 8 {
        return Err(GeometryError::Truncated);
    }
    if blob[..2] != MAGIC {
        return Err(GeometryError::BadMagic);
    }
    if blob[2] != 0 {
        return Err(GeometryError::Version(blob[2]));
    }
    let flags = blob[3];
    let little = flags & 0x01 == 1;
    let indicator = (flags >> 1) & 0x07;
    let empty = flags & 0x10 != 0;
    let mut cursor = Cursor::new(&blob[4..], little);
    let srs_id = cursor.u32()? as i32;

    let doubles = match indicator {
        0 => 0,
        1 => 4,
        2 | 3 => 6,
        4 => 8,
        other => return Err(GeometryError::Envelope(other)),
    };
    let envelope = if doubles > 0 {
        let min_x = cursor.f64()?;
        let max_x = cursor.f64()?;
        let min_y = cursor.f64()?;
        let max_y = cursor.f64()?;
        for _ in 4..doubles {
            cursor.f64()?;
        }
        Some(Extent::new(min_x, min_y, max_x, max_y)).filter(Extent::is_finite)
    } else {
        None
    };

    let header_len = 8 + doubles * 8;
    Ok(GpkgGeometry {
        srs_id,
        envelope,
        empty,
        wkb: &blob[header_len..],
    })
}

/// Encodes a footprint as a little-endian blob with an XY envelope.
pub fn encode_footprint(footprint: &Footprint, srs_id: i32) -> Vec<u8> {
    let envelope = footprint.envelope();
    let mut out = Vec::with_capacity(8 + 32 + 13 + 5 * 16);
    out.extend_from_slice(&MAGIC);
    out.push(0);
    out.push(0x01 | (1 << 1));
    out.extend_from_slice(&srs_id.to_le_bytes());
    for v in [envelope.min_x, envelope.max_x, envelope.min_y, envelope.max_y] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.push(1);
    out.extend_from_slice(&WKB_POLYGON.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&(footprint.ring.len() as u32).to_le_bytes());
    for (x, y) in footprint.ring {
        out.extend_from_slice(&x.to_le_bytes());
        out.extend_from_slice(&y.to_le_bytes());
    }
    out
}

/// Reads a footprint back from a blob written by [`encode_footprint`].
pub fn decode_footprint(blob: &[u8]) -> Option<Footprint> {
    let geometry = decode(blob).ok()?;
    match parse_wkb(geometry.wkb).ok()? {
        Wkb::Polygon(rings) => {
            let ring = rings.into_iter().next()?;
            let ring: [(f64, f64); 5] = ring.try_into().ok()?;
            Some(Footprint { ring })
        }
        _ => None,
    }
}

/// A parsed WKB geometry, reduced to XY.
#[derive(Debug, Clone, PartialEq)]
pub enum Wkb {
    Point(Option<(f64, f64)>),
    LineString(Vec<(f64, f64)>),
    Polygon(Vec<Vec<(f64, f64)>>),
    Collection(Vec<Wkb>),
}

impl Wkb {
    fn visit(&self, f: &mut dyn FnMut(f64, f64)) {
        match self {
            Wkb::Point(Some((x, y))) => f(*x, *y),
            Wkb::Point(None) => {}
            Wkb::LineString(points) => points.iter().for_each(|(x, y)| f(*x, *y)),
            Wkb::Polygon(rings) => rings.iter().flatten().for_each(|(x, y)| f(*x, *y)),
            Wkb::Collection(members) => members.iter().for_each(|m| m.visit(f)),
        }
    }

    pub fn bounds(&self) -> Option<Extent> {
        let mut points = Vec::new();
        self.visit(&mut |x, y| {
            if x.is_finite() && y.is_finite() {
                points.push((x, y));
            }
        });
        Extent::from_points(points)
    }

    /// Lightweight structural check: finite points, lines with two
    /// positions, closed rings of four.
    pub fn is_valid(&self) -> bool {
        match self {
            Wkb::Point(Some((x, y))) => x.is_finite() && y.is_finite(),
            Wkb::Point(None) => true,
            Wkb::LineString(points) => points.is_empty() || points.len() >= 2,
            Wkb::Polygon(rings) => rings.iter().all(|r| crate::probe::ring_is_valid(r)),
            Wkb::Collection(members) => members.iter().all(Wkb::is_valid),
        }
    }
}

pub fn parse_wkb(bytes: &[u8]) -> Result<Wkb, GeometryError> {
    let mut cursor = Cursor::new(bytes, true);
    read_geometry(&mut cursor, 0)
}

fn read_geometry(cursor: &mut Cursor<'_>, depth: usize) -> Result<Wkb, GeometryError> {
    if depth > 32 {
        return Err(GeometryError::Truncated);
    }
    cursor.little = cursor.u8()? == 1;
    let raw = cursor.u32()?;

    let mut dims = 2;
    if raw & 0x8000_0000 != 0 {
        dims += 1;
    }
    if raw & 0x4000_0000 != 0 {
        dims += 1;
    }
    if raw & 0x2000_0000 != 0 {
        cursor.u32()?;
    }
    let code = raw & 0x0fff_ffff;
    let base = code % 1000;
    dims += match code / 1000 {
        1 | 2 => 1,
        3 => 2,
        _ => 0,
    };

    match base {
        1 => {
            let (x, y) = cursor.position(dims)?;
            if x.is_nan() && y.is_nan() {
                Ok(Wkb::Point(None))
            } else {
                Ok(Wkb::Point(Some((x, y))))
            }
        }
        2 => Ok(Wkb::LineString(cursor.positions(dims)?)),
        3 => {
            let rings = cursor.count(4)?;
            let mut out = Vec::with_capacity(rings);
            for _ in 0..rings {
                out.push(cursor.positions(dims)?);
            }
            Ok(Wkb::Polygon(out))
        }
        4..=7 => {
            let members = cursor.count(5)?;
            let mut out = Vec::with_capacity(members);
            for _ in 0..members {
                out.push(read_geometry(cursor, depth + 1)?);
            }
            Ok(Wkb::Collection(out))
        }
        _ => Err(GeometryError::UnsupportedType(code)),
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    at: usize,
    little: bool,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], little: bool) -> Self {
        Self {
            bytes,
            at: 0,
            little,
        }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], GeometryError> {
        let slice = self
            .bytes
            .get(self.at..self.at + N)
            .ok_or(GeometryError::Truncated)?;
        self.at += N;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, GeometryError> {
        Ok(self.take::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, GeometryError> {
        let b = self.take::<4>()?;
        Ok(if self.little {
            u32::from_le_bytes(b)
        } else {
            u32::from_be_bytes(b)
        })
    }

    fn f64(&mut self) -> Result<f64, GeometryError> {
        let b = self.take::<8>()?;
        Ok(if self.little {
            f64::from_le_bytes(b)
        } else {
            f64::from_be_bytes(b)
        })
    }

    /// Element count, rejected when the remaining bytes cannot hold it.
    fn count(&mut self, min_element_len: usize) -> Result<usize, GeometryError> {
        let n = self.u32()? as usize;
        let remaining = self.bytes.len().saturating_sub(self.at);
        if n.saturating_mul(min_element_len) > remaining {
            return Err(GeometryError::Truncated);
        }
        Ok(n)
    }

    fn position(&mut self, dims: usize) -> Result<(f64, f64), GeometryError> {
        let x = self.f64()?;
        let y = self.f64()?;
        for _ in 2..dims {
            self.f64()?;
        }
        Ok((x, y))
    }

    fn positions(&mut self, dims: usize) -> Result<Vec<(f64, f64)>, GeometryError> {
        let n = self.count(dims * 8)?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.position(dims)?);
        }
        Ok(out)
    }
}
