use crate::RuntimeError;
use alloc::{format, sync::Arc, vec, vec::Vec};
use half::bf16;

/// Element type of a memory buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DataType {
    /// 32-bit float.
    F32,
    /// bfloat16.
    Bf16,
    /// Signed 8-bit integer.
    S8,
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 32-bit integer, used for int8 biases.
    S32,
}

impl DataType {
    /// Whether the type is one of the 8-bit quantized types.
    pub fn is_int8(&self) -> bool {
        matches!(self, DataType::S8 | DataType::U8)
    }

    fn saturate(&self, value: f32) -> f32 {
        match self {
            DataType::S8 => value.round_ties_even().clamp(i8::MIN as f32, i8::MAX as f32),
            DataType::U8 => value.round_ties_even().clamp(u8::MIN as f32, u8::MAX as f32),
            DataType::S32 => value
                .round_ties_even()
                .clamp(i32::MIN as f32, i32::MAX as f32),
            DataType::F32 | DataType::Bf16 => value,
        }
    }
}

/// Physical ordering of the logical dimensions of a buffer.
///
/// Logical dimensions are always `[n, c, h, w]` for activations, `[o, i, h, w]` for weights and
/// `[g, o, i, h, w]` for grouped weights. Formats that swap input and output channels describe
/// weights stored the way a transposed convolution receives them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Format {
    /// Let the primitive pick its preferred format.
    Any,
    /// One dimensional.
    X,
    /// Plain activations.
    Nchw,
    /// Plain weights.
    Oihw,
    /// Weights stored input channels first.
    Iohw,
    /// Plain grouped weights.
    Goihw,
    /// Grouped weights stored input channels first.
    Giohw,
}

impl Format {
    /// The logical dimension stored at each physical position.
    pub fn permutation(&self, rank: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..rank).collect();
        match self {
            Format::Iohw if rank >= 2 => order.swap(0, 1),
            Format::Giohw if rank >= 3 => order.swap(1, 2),
            _ => {}
        }
        order
    }

    /// The plain format matching a rank, used when a primitive resolves [Format::Any].
    pub fn plain(rank: usize) -> Self {
        match rank {
            1 => Format::X,
            5 => Format::Goihw,
            _ => Format::Nchw,
        }
    }

    fn is_compatible(&self, rank: usize) -> bool {
        match self {
            Format::Any => true,
            Format::X => rank == 1,
            Format::Nchw | Format::Oihw | Format::Iohw => rank == 4,
            Format::Goihw | Format::Giohw => rank == 5,
        }
    }
}

/// Describes the logical shape, element type and physical layout of a buffer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct MemoryDesc {
    dims: Vec<i64>,
    dtype: DataType,
    format: Format,
}

impl MemoryDesc {
    /// Create a new descriptor, checking that the format fits the rank.
    pub fn new(
        dims: Vec<i64>,
        dtype: DataType,
        format: Format,
    ) -> Result<Self, RuntimeError> {
        if dims.iter().any(|dim| *dim <= 0) {
            return Err(RuntimeError::invalid_descriptor(format!(
                "dimensions must be positive, got {dims:?}"
            )));
        }
        if !format.is_compatible(dims.len()) {
            return Err(RuntimeError::invalid_descriptor(format!(
                "format {format:?} can't describe {} dimensions",
                dims.len()
            )));
        }

        Ok(Self {
            dims,
            dtype,
            format,
        })
    }

    /// Logical dimensions.
    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    /// Element type.
    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Physical format.
    pub fn format(&self) -> Format {
        self.format
    }

    /// Number of elements.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product::<i64>() as usize
    }

    /// The same descriptor with [Format::Any] replaced by the plain format of its rank.
    pub fn resolved(&self) -> Self {
        let mut desc = self.clone();
        if desc.format == Format::Any {
            desc.format = Format::plain(desc.dims.len());
        }
        desc
    }

    /// Physical offset of every logical index, in logical row-major order.
    pub(crate) fn physical_offsets(&self) -> Vec<usize> {
        let rank = self.dims.len();
        let order = self.format.permutation(rank);

        // Stride of each logical dim given the physical order.
        let mut strides = vec![0usize; rank];
        let mut stride = 1usize;
        for &dim in order.iter().rev() {
            strides[dim] = stride;
            stride *= self.dims[dim] as usize;
        }

        let mut offsets = Vec::with_capacity(self.num_elements());
        let mut index = vec![0usize; rank];
        for _ in 0..self.num_elements() {
            offsets.push(index.iter().zip(&strides).map(|(i, s)| i * s).sum());
            increment(&mut index, &self.dims);
        }
        offsets
    }
}

pub(crate) fn increment(index: &mut [usize], dims: &[i64]) {
    for axis in (0..index.len()).rev() {
        index[axis] += 1;
        if index[axis] < dims[axis] as usize {
            return;
        }
        index[axis] = 0;
    }
}

/// Owned data of a memory object.
#[derive(Clone, Debug, PartialEq)]
pub enum Buffer {
    /// 32-bit floats.
    F32(Vec<f32>),
    /// bfloat16 values.
    Bf16(Vec<bf16>),
    /// Signed bytes.
    S8(Vec<i8>),
    /// Unsigned bytes.
    U8(Vec<u8>),
    /// Signed 32-bit integers.
    S32(Vec<i32>),
}

impl Buffer {
    /// A zero filled buffer.
    pub fn zeros(dtype: DataType, len: usize) -> Self {
        match dtype {
            DataType::F32 => Buffer::F32(vec![0.0; len]),
            DataType::Bf16 => Buffer::Bf16(vec![bf16::ZERO; len]),
            DataType::S8 => Buffer::S8(vec![0; len]),
            DataType::U8 => Buffer::U8(vec![0; len]),
            DataType::S32 => Buffer::S32(vec![0; len]),
        }
    }

    /// Convert float values, rounding half to even and saturating for integer types.
    pub fn from_f32(dtype: DataType, values: &[f32]) -> Self {
        let convert = |value: &f32| dtype.saturate(*value);
        match dtype {
            DataType::F32 => Buffer::F32(values.to_vec()),
            DataType::Bf16 => Buffer::Bf16(values.iter().map(|v| bf16::from_f32(*v)).collect()),
            DataType::S8 => Buffer::S8(values.iter().map(|v| convert(v) as i8).collect()),
            DataType::U8 => Buffer::U8(values.iter().map(|v| convert(v) as u8).collect()),
            DataType::S32 => Buffer::S32(values.iter().map(|v| convert(v) as i32).collect()),
        }
    }

    /// Element type.
    pub fn dtype(&self) -> DataType {
        match self {
            Buffer::F32(_) => DataType::F32,
            Buffer::Bf16(_) => DataType::Bf16,
            Buffer::S8(_) => DataType::S8,
            Buffer::U8(_) => DataType::U8,
            Buffer::S32(_) => DataType::S32,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Buffer::F32(values) => values.len(),
            Buffer::Bf16(values) => values.len(),
            Buffer::S8(values) => values.len(),
            Buffer::U8(values) => values.len(),
            Buffer::S32(values) => values.len(),
        }
    }

    /// Whether the buffer holds no element.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values widened to `f32`.
    pub fn to_f32(&self) -> Vec<f32> {
        match self {
            Buffer::F32(values) => values.clone(),
            Buffer::Bf16(values) => values.iter().map(|v| v.to_f32()).collect(),
            Buffer::S8(values) => values.iter().map(|v| *v as f32).collect(),
            Buffer::U8(values) => values.iter().map(|v| *v as f32).collect(),
            Buffer::S32(values) => values.iter().map(|v| *v as f32).collect(),
        }
    }

    /// Integer values widened to `i32`, `None` for float buffers.
    pub fn to_i32(&self) -> Option<Vec<i32>> {
        match self {
            Buffer::S8(values) => Some(values.iter().map(|v| *v as i32).collect()),
            Buffer::U8(values) => Some(values.iter().map(|v| *v as i32).collect()),
            Buffer::S32(values) => Some(values.clone()),
            Buffer::F32(_) | Buffer::Bf16(_) => None,
        }
    }
}

/// A buffer bound to a descriptor.
///
/// The data handle can be rebound to another buffer without touching the descriptor, which is how
/// cached memory objects follow the tensors of each inference call.
#[derive(Debug)]
pub struct Memory {
    desc: MemoryDesc,
    data: spin::RwLock<Arc<Buffer>>,
}

impl Memory {
    /// Bind an existing buffer to a descriptor.
    pub fn new(desc: MemoryDesc, data: Arc<Buffer>) -> Result<Self, RuntimeError> {
        check_binding(&desc, &data)?;

        Ok(Self {
            desc,
            data: spin::RwLock::new(data),
        })
    }

    /// Allocate a zeroed buffer for a descriptor.
    pub fn allocate(desc: MemoryDesc) -> Self {
        let data = Arc::new(Buffer::zeros(desc.dtype(), desc.num_elements()));

        Self {
            desc,
            data: spin::RwLock::new(data),
        }
    }

    /// The descriptor.
    pub fn desc(&self) -> &MemoryDesc {
        &self.desc
    }

    /// The current data handle.
    pub fn data(&self) -> Arc<Buffer> {
        self.data.read().clone()
    }

    /// Rebind the memory to another buffer.
    pub fn set_data_handle(&self, data: Arc<Buffer>) -> Result<(), RuntimeError> {
        check_binding(&self.desc, &data)?;
        *self.data.write() = data;
        Ok(())
    }
}

fn check_binding(desc: &MemoryDesc, data: &Buffer) -> Result<(), RuntimeError> {
    if data.dtype() != desc.dtype() || data.len() != desc.num_elements() {
        return Err(RuntimeError::invalid_descriptor(format!(
            "a buffer of {} {:?} elements can't back {:?}",
            data.len(),
            data.dtype(),
            desc
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_conversion() {
        let buffer = Buffer::from_f32(DataType::S8, &[-200.0, -1.5, 0.5, 2.5, 127.4, 300.0]);

        assert_eq!(buffer, Buffer::S8(vec![-128, -2, 0, 2, 127, 127]));
        assert_eq!(
            Buffer::from_f32(DataType::U8, &[-3.0, 254.6]),
            Buffer::U8(vec![0, 255])
        );
    }

    #[test]
    fn iohw_offsets_swap_channels() {
        let desc = MemoryDesc::new(vec![2, 3, 1, 1], DataType::F32, Format::Iohw).unwrap();

        // Logical [o, i] walks the physical [i, o] buffer column-wise.
        assert_eq!(desc.physical_offsets(), vec![0, 2, 4, 1, 3, 5]);
    }

    #[test]
    fn rejects_mismatched_binding() {
        let desc = MemoryDesc::new(vec![4], DataType::F32, Format::X).unwrap();

        assert!(Memory::new(desc.clone(), Arc::new(Buffer::F32(vec![0.0; 3]))).is_err());
        assert!(Memory::new(desc, Arc::new(Buffer::S8(vec![0; 4]))).is_err());
    }

    #[test]
    fn rejects_incompatible_format() {
        assert!(MemoryDesc::new(vec![2, 3], DataType::F32, Format::Nchw).is_err());
        assert!(MemoryDesc::new(vec![2, 2, 3, 1, 1], DataType::S8, Format::Giohw).is_ok());
    }
}
