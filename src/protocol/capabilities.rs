//! Tensor stream capability descriptors.
//!
//! A descriptor is the shape/type contract of a tensor stream. It is
//! exchanged during the CAPABILITY/ACCEPT handshake in its text (caps string)
//! form:
//!
//! ```text
//! other/tensors,num_tensors=1,dimensions=3:300:300:1,types=uint8
//! other/tensors,num_tensors=2,dimensions="3:4,5:6",types="uint8,float32"
//! ```

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::negotiation::NegotiationPolicy;
use crate::error::{NegotiationError, QueryError, Result};

/// Maximum rank of a tensor dimension.
pub const RANK_LIMIT: usize = 4;

/// Maximum number of tensors in one frame.
pub const TENSOR_LIMIT: usize = 16;

/// Media type prefix of the caps string.
pub const CAPS_MEDIA_TYPE: &str = "other/tensors";

/// Single-tensor media type, accepted on input.
const CAPS_MEDIA_TYPE_SINGLE: &str = "other/tensor";

/// Tensor element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorType {
    /// Signed 8-bit integer
    Int8,
    /// Unsigned 8-bit integer
    UInt8,
    /// Signed 16-bit integer
    Int16,
    /// Unsigned 16-bit integer
    UInt16,
    /// Signed 32-bit integer
    Int32,
    /// Unsigned 32-bit integer
    UInt32,
    /// Signed 64-bit integer
    Int64,
    /// Unsigned 64-bit integer
    UInt64,
    /// IEEE half precision float
    Float16,
    /// IEEE single precision float
    Float32,
    /// IEEE double precision float
    Float64,
}

impl TensorType {
    /// Caps-string name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::UInt8 => "uint8",
            Self::Int16 => "int16",
            Self::UInt16 => "uint16",
            Self::Int32 => "int32",
            Self::UInt32 => "uint32",
            Self::Int64 => "int64",
            Self::UInt64 => "uint64",
            Self::Float16 => "float16",
            Self::Float32 => "float32",
            Self::Float64 => "float64",
        }
    }

    /// Size of one element in bytes.
    pub fn element_size(&self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 | Self::Float16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TensorType {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "int8" => Ok(Self::Int8),
            "uint8" => Ok(Self::UInt8),
            "int16" => Ok(Self::Int16),
            "uint16" => Ok(Self::UInt16),
            "int32" => Ok(Self::Int32),
            "uint32" => Ok(Self::UInt32),
            "int64" => Ok(Self::Int64),
            "uint64" => Ok(Self::UInt64),
            "float16" => Ok(Self::Float16),
            "float32" => Ok(Self::Float32),
            "float64" => Ok(Self::Float64),
            other => Err(QueryError::InvalidCapability(format!(
                "unknown tensor type '{other}'"
            ))),
        }
    }
}

/// Shape/type contract of a multi-tensor stream.
///
/// A dimension entry of `0` is a wildcard. Wildcards in the server's
/// descriptor match any offered extent when the negotiation policy allows
/// them; a descriptor containing a wildcard has no fixed frame size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CapabilityDescriptor {
    /// Number of tensors per frame
    pub tensor_count: u32,
    /// Per-tensor dimensions, innermost first, up to [`RANK_LIMIT`] entries
    pub dimensions: Vec<Vec<u32>>,
    /// Per-tensor element types
    pub element_types: Vec<TensorType>,
}

impl CapabilityDescriptor {
    /// Build and validate a descriptor.
    pub fn new(dimensions: Vec<Vec<u32>>, element_types: Vec<TensorType>) -> Result<Self> {
        let descriptor = Self {
            tensor_count: dimensions.len() as u32,
            dimensions,
            element_types,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Descriptor for a stream of one tensor.
    pub fn single(dimension: &[u32], element_type: TensorType) -> Result<Self> {
        Self::new(vec![dimension.to_vec()], vec![element_type])
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        let count = self.tensor_count as usize;
        if count == 0 || count > TENSOR_LIMIT {
            return Err(QueryError::InvalidCapability(format!(
                "tensor count {count} outside 1..={TENSOR_LIMIT}"
            )));
        }
        if self.dimensions.len() != count || self.element_types.len() != count {
            return Err(QueryError::InvalidCapability(format!(
                "num_tensors={count} but {} dimension(s) and {} type(s) given",
                self.dimensions.len(),
                self.element_types.len()
            )));
        }
        for (index, dim) in self.dimensions.iter().enumerate() {
            if dim.is_empty() || dim.len() > RANK_LIMIT {
                return Err(QueryError::InvalidCapability(format!(
                    "tensor {index} has rank {}, expected 1..={RANK_LIMIT}",
                    dim.len()
                )));
            }
        }
        Ok(())
    }

    /// Dimension of tensor `index` padded with trailing 1s to full rank.
    pub fn padded_dimension(&self, index: usize) -> Option<[u32; RANK_LIMIT]> {
        let dim = self.dimensions.get(index)?;
        let mut padded = [1u32; RANK_LIMIT];
        for (slot, extent) in padded.iter_mut().zip(dim) {
            *slot = *extent;
        }
        Some(padded)
    }

    /// Whether any dimension is a wildcard.
    pub fn has_wildcard(&self) -> bool {
        self.dimensions.iter().flatten().any(|extent| *extent == 0)
    }

    /// Byte size of tensor `index`, `None` when it has a wildcard extent.
    pub fn tensor_size(&self, index: usize) -> Option<usize> {
        let dim = self.dimensions.get(index)?;
        let element = self.element_types.get(index)?.element_size();
        dim.iter().try_fold(element, |acc, extent| match *extent {
            0 => None,
            extent => acc.checked_mul(extent as usize),
        })
    }

    /// Check that a frame payload fits this contract.
    ///
    /// The tensor count must match; sizes are checked for every tensor whose
    /// extent is fully specified.
    pub fn check_payload(&self, payload: &[Bytes]) -> Result<()> {
        if payload.len() != self.tensor_count as usize {
            return Err(QueryError::InvalidCapability(format!(
                "frame carries {} tensor(s), negotiated {}",
                payload.len(),
                self.tensor_count
            )));
        }
        for (index, tensor) in payload.iter().enumerate() {
            if let Some(expected) = self.tensor_size(index) {
                if tensor.len() != expected {
                    return Err(QueryError::InvalidCapability(format!(
                        "tensor {index} is {} bytes, expected {expected}",
                        tensor.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Check an offered descriptor against this (server-side) descriptor.
    ///
    /// Tensor count is compared first, then every dimension, then every
    /// element type; the first difference decides the rejection reason.
    pub fn check_compatible(
        &self,
        offered: &CapabilityDescriptor,
        policy: NegotiationPolicy,
    ) -> std::result::Result<(), NegotiationError> {
        if self.tensor_count != offered.tensor_count {
            return Err(NegotiationError::MismatchTensorCount(format!(
                "expected {}, offered {}",
                self.tensor_count, offered.tensor_count
            )));
        }

        for index in 0..self.tensor_count as usize {
            let (Some(ours), Some(theirs)) =
                (self.padded_dimension(index), offered.padded_dimension(index))
            else {
                return Err(NegotiationError::MismatchDimension(format!(
                    "tensor {index} has no dimension"
                )));
            };

            let matches = ours
                .iter()
                .zip(theirs.iter())
                .all(|(a, b)| a == b || (*a == 0 && policy.allow_wildcard));
            if !matches {
                return Err(NegotiationError::MismatchDimension(format!(
                    "tensor {index}: expected {}, offered {}",
                    join_dimension(&self.dimensions[index]),
                    join_dimension(&offered.dimensions[index])
                )));
            }
        }

        for (index, (ours, theirs)) in self
            .element_types
            .iter()
            .zip(offered.element_types.iter())
            .enumerate()
        {
            if ours != theirs {
                return Err(NegotiationError::MismatchType(format!(
                    "tensor {index}: expected {ours}, offered {theirs}"
                )));
            }
        }

        Ok(())
    }

    /// Whether an offered descriptor is compatible with this one.
    pub fn is_compatible(&self, offered: &CapabilityDescriptor, policy: NegotiationPolicy) -> bool {
        self.check_compatible(offered, policy).is_ok()
    }
}

fn join_dimension(dim: &[u32]) -> String {
    dim.iter()
        .map(|extent| extent.to_string())
        .collect::<Vec<_>>()
        .join(":")
}

impl fmt::Display for CapabilityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims = self
            .dimensions
            .iter()
            .map(|d| join_dimension(d))
            .collect::<Vec<_>>()
            .join(",");
        let types = self
            .element_types
            .iter()
            .map(|t| t.name())
            .collect::<Vec<_>>()
            .join(",");

        if self.tensor_count > 1 {
            write!(
                f,
                "{CAPS_MEDIA_TYPE},num_tensors={},dimensions=\"{dims}\",types=\"{types}\"",
                self.tensor_count
            )
        } else {
            write!(
                f,
                "{CAPS_MEDIA_TYPE},num_tensors={},dimensions={dims},types={types}",
                self.tensor_count
            )
        }
    }
}

/// Split on commas that are not inside double quotes.
fn split_fields(s: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (pos, ch) in s.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                fields.push(&s[start..pos]);
                start = pos + 1;
            },
            _ => {},
        }
    }
    fields.push(&s[start..]);
    fields
}

/// Strip a `(type)` annotation and surrounding quotes from a field value.
fn field_value(raw: &str) -> &str {
    let mut value = raw.trim();
    if value.starts_with('(') {
        if let Some(end) = value.find(')') {
            value = value[end + 1..].trim();
        }
    }
    value.trim_matches('"')
}

fn parse_dimensions(value: &str) -> Result<Vec<Vec<u32>>> {
    value
        .split(',')
        .map(|tensor| {
            tensor
                .trim()
                .split(':')
                .map(|extent| {
                    extent.trim().parse::<u32>().map_err(|_| {
                        QueryError::InvalidCapability(format!("bad dimension '{tensor}'"))
                    })
                })
                .collect()
        })
        .collect()
}

impl FromStr for CapabilityDescriptor {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self> {
        let fields = split_fields(s.trim());
        let media = fields.first().map(|m| m.trim()).unwrap_or_default();
        let single = match media {
            CAPS_MEDIA_TYPE => false,
            CAPS_MEDIA_TYPE_SINGLE => true,
            other => {
                return Err(QueryError::InvalidCapability(format!(
                    "unsupported media type '{other}'"
                )))
            },
        };

        let mut num_tensors: Option<u32> = None;
        let mut dimensions = None;
        let mut element_types = None;

        for field in fields.iter().skip(1) {
            if field.trim().is_empty() {
                continue;
            }
            let (key, raw) = field.split_once('=').ok_or_else(|| {
                QueryError::InvalidCapability(format!("field without value: '{field}'"))
            })?;
            let value = field_value(raw);
            match key.trim() {
                "num_tensors" => {
                    num_tensors = Some(value.parse().map_err(|_| {
                        QueryError::InvalidCapability(format!("bad num_tensors '{value}'"))
                    })?);
                },
                "dimensions" | "dimension" => dimensions = Some(parse_dimensions(value)?),
                "types" | "type" => {
                    element_types = Some(
                        value
                            .split(',')
                            .map(str::parse)
                            .collect::<Result<Vec<TensorType>>>()?,
                    );
                },
                // framerate, format and friends do not affect the contract
                _ => {},
            }
        }

        let dimensions = dimensions
            .ok_or_else(|| QueryError::InvalidCapability("missing dimensions".to_string()))?;
        let element_types = element_types
            .ok_or_else(|| QueryError::InvalidCapability("missing types".to_string()))?;
        let tensor_count = match (single, num_tensors) {
            (true, _) => 1,
            (false, Some(n)) => n,
            (false, None) => dimensions.len() as u32,
        };

        let descriptor = Self {
            tensor_count,
            dimensions,
            element_types,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

impl TryFrom<String> for CapabilityDescriptor {
    type Error = QueryError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<CapabilityDescriptor> for String {
    fn from(descriptor: CapabilityDescriptor) -> Self {
        descriptor.to_string()
    }
}
