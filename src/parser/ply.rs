use std::fs;
use std::path::Path;

use super::{ParseError, ParseResult};
use crate::math::{clamp_u8, quat_normalize, sigmoid};
use crate::splat::SplatAttributes;

/// How decoded vertices are laid out for the compute unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttributeEncoding {
    /// Linear scales, RGBA colours.
    #[default]
    Geometry,
    /// Log scales as stored in the file, RGB colours plus separate alphas.
    Compressed,
}

#[derive(Debug, Clone, Copy)]
enum PlyType {
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Float,
    Double,
}

impl PlyType {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "char" | "int8" => Some(Self::Char),
            "uchar" | "uint8" => Some(Self::UChar),
            "short" | "int16" => Some(Self::Short),
            "ushort" | "uint16" => Some(Self::UShort),
            "int" | "int32" => Some(Self::Int),
            "uint" | "uint32" => Some(Self::UInt),
            "float" | "float32" => Some(Self::Float),
            "double" | "float64" => Some(Self::Double),
            _ => None,
        }
    }

    fn size(self) -> usize {
        match self {
            Self::Char | Self::UChar => 1,
            Self::Short | Self::UShort => 2,
            Self::Int | Self::UInt | Self::Float => 4,
            Self::Double => 8,
        }
    }

    fn read_as_f32(self, bytes: &[u8]) -> f32 {
        match self {
            Self::Char => i8::from_le_bytes([bytes[0]]) as f32,
            Self::UChar => u8::from_le_bytes([bytes[0]]) as f32,
            Self::Short => i16::from_le_bytes([bytes[0], bytes[1]]) as f32,
            Self::UShort => u16::from_le_bytes([bytes[0], bytes[1]]) as f32,
            Self::Int => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32,
            Self::UInt => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32,
            Self::Float => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            Self::Double => {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&bytes[0..8]);
                f64::from_le_bytes(arr) as f32
            }
        }
    }
}

#[derive(Debug, Clone)]
struct PlyProperty {
    name: String,
    ty: PlyType,
}

fn ply_err(message: impl Into<String>) -> ParseError {
    ParseError::Ply(message.into())
}

fn find_ply_header_end(data: &[u8]) -> Option<usize> {
    let marker = b"end_header";
    let pos = data.windows(marker.len()).position(|w| w == marker)?;
    let mut end = pos + marker.len();
    while end < data.len() && data[end] != b'\n' {
        end += 1;
    }
    if end < data.len() {
        end += 1;
    }
    Some(end)
}

pub fn load_ply_file(path: &Path, encoding: AttributeEncoding) -> ParseResult<SplatAttributes> {
    let data = fs::read(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_ply(&data, encoding)
}

pub fn parse_ply(data: &[u8], encoding: AttributeEncoding) -> ParseResult<SplatAttributes> {
    let header_end = find_ply_header_end(data).ok_or_else(|| ply_err("missing end_header"))?;
    let header_text = std::str::from_utf8(&data[..header_end])
        .map_err(|e| ply_err(format!("header is not UTF-8: {e}")))?;

    let mut is_binary_le = false;
    let mut vertex_count: usize = 0;
    let mut in_vertex_element = false;
    let mut vertex_props: Vec<PlyProperty> = Vec::new();

    for line in header_text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("comment") {
            continue;
        }
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts[0] {
            "format" => {
                if parts.len() >= 2 && parts[1] == "binary_little_endian" {
                    is_binary_le = true;
                }
            }
            "element" => {
                if parts.len() >= 3 {
                    in_vertex_element = parts[1] == "vertex";
                    if in_vertex_element {
                        vertex_count = parts[2]
                            .parse::<usize>()
                            .map_err(|e| ply_err(format!("bad vertex count '{}': {e}", parts[2])))?;
                    }
                }
            }
            "property" if in_vertex_element => {
                if parts.len() >= 3 && parts[1] == "list" {
                    return Err(ply_err("list properties in vertex element are unsupported"));
                }
                if parts.len() >= 3 {
                    let ty = PlyType::parse(parts[1])
                        .ok_or_else(|| ply_err(format!("unsupported property type '{}'", parts[1])))?;
                    vertex_props.push(PlyProperty {
                        name: parts[2].to_string(),
                        ty,
                    });
                }
            }
            _ => {}
        }
    }

    if !is_binary_le {
        return Err(ply_err("only binary_little_endian format is supported"));
    }
    if vertex_count == 0 || vertex_props.is_empty() {
        return Err(ply_err("missing vertex element or properties"));
    }

    let stride: usize = vertex_props.iter().map(|p| p.ty.size()).sum();
    let needed = vertex_count
        .checked_mul(stride)
        .and_then(|bytes| bytes.checked_add(header_end))
        .ok_or_else(|| ply_err("size overflow computing buffer size"))?;
    if data.len() < needed {
        return Err(ply_err(format!(
            "file truncated (need {needed} bytes, have {})",
            data.len()
        )));
    }

    let compressed = encoding == AttributeEncoding::Compressed;
    let color_stride = if compressed { 3 } else { 4 };
    let mut out = SplatAttributes {
        positions: Vec::with_capacity(vertex_count * 3),
        scales: Vec::with_capacity(vertex_count * 3),
        rotations: Vec::with_capacity(vertex_count * 4),
        colors: Vec::with_capacity(vertex_count * color_stride),
        alphas: compressed.then(|| Vec::with_capacity(vertex_count)),
    };

    for chunk in data[header_end..needed].chunks_exact(stride) {
        let mut position = [0.0_f32; 3];
        let mut dc = [0.0_f32; 3];
        let mut rgb = [0.0_f32; 3];
        let mut have_dc = false;
        let mut have_rgb = false;
        let mut opacity_raw = 4.0_f32;
        let mut log_scale = [-3.0_f32; 3];
        let mut rotation = [1.0_f32, 0.0, 0.0, 0.0];

        let mut cursor = 0;
        for prop in &vertex_props {
            let field_end = cursor + prop.ty.size();
            let value = prop.ty.read_as_f32(&chunk[cursor..field_end]);
            cursor = field_end;

            match prop.name.as_str() {
                "x" => position[0] = value,
                "y" => position[1] = value,
                "z" => position[2] = value,
                "f_dc_0" | "f_dc_1" | "f_dc_2" => {
                    dc[channel_index(&prop.name)] = value;
                    have_dc = true;
                }
                "red" | "r" => {
                    rgb[0] = value;
                    have_rgb = true;
                }
                "green" | "g" => {
                    rgb[1] = value;
                    have_rgb = true;
                }
                "blue" | "b" => {
                    rgb[2] = value;
                    have_rgb = true;
                }
                "opacity" => opacity_raw = value,
                "scale_0" | "scale_1" | "scale_2" => log_scale[channel_index(&prop.name)] = value,
                "rot_0" | "rot_1" | "rot_2" | "rot_3" => rotation[channel_index(&prop.name)] = value,
                _ => {}
            }
        }

        let color = if have_dc {
            dc.map(|c| clamp_u8(sigmoid(c) * 255.0))
        } else if have_rgb {
            rgb.map(clamp_u8)
        } else {
            [220, 220, 220]
        };
        let alpha = clamp_u8(sigmoid(opacity_raw).clamp(0.0, 1.0) * 255.0);

        out.positions.extend_from_slice(&position);
        out.rotations.extend_from_slice(&quat_normalize(rotation));
        out.colors.extend_from_slice(&color);
        match &mut out.alphas {
            Some(alphas) => {
                alphas.push(alpha);
                out.scales.extend_from_slice(&log_scale);
            }
            None => {
                out.colors.push(alpha);
                out.scales.extend(log_scale.map(|s| s.exp().max(1e-4)));
            }
        }
    }

    Ok(out)
}

/// Trailing digit of `f_dc_N`, `scale_N` or `rot_N`.
fn channel_index(name: &str) -> usize {
    name.bytes()
        .last()
        .map(|b| b.wrapping_sub(b'0') as usize)
        .unwrap_or(0)
}
