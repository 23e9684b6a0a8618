use std::fmt;

// DType: element types a tensor may hold
//
// Training runs in either single or double precision. Every tensor, layer,
// net, and solver is generic over the element type T: WithDType, so an f64
// net can be used for gradient checking while f32 is the default workhorse.
//
//   F32  - 32-bit float
//   F64  - 64-bit float
//
// Snapshots store values as f64 regardless of T, so a model trained in f32
// can be restored into an f64 net and vice versa.

/// Enum of supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        write!(f, "{}", s)
    }
}

// WithDType: the bridge between Rust element types and DType
//
// Layers do arithmetic directly on host slices, so the trait pulls in
// num_traits::Float for the math and bytemuck::Pod so buffers can be moved
// to and from accelerator memory as raw bytes.

/// Trait implemented by Rust types that can be stored in a tensor.
pub trait WithDType:
    num_traits::Float
    + num_traits::NumAssign
    + bytemuck::Pod
    + Default
    + std::iter::Sum
    + Send
    + Sync
    + 'static
    + fmt::Debug
    + fmt::Display
{
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    ///
    /// Named `as_f64` so it does not collide with `ToPrimitive::to_f64`.
    fn as_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn as_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
    fn as_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}
