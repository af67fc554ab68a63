use crate::{
    memory::{increment, Buffer, Format, Memory, MemoryDesc},
    RuntimeError,
};
use alloc::{format, sync::Arc, vec, vec::Vec};

/// Scales applied while reordering.
///
/// Bit `d` of the mask means logical dimension `d` carries a distinct scale. With several bits
/// set, scales are indexed row-major over the selected dimensions.
#[derive(new, Clone, Debug, PartialEq)]
pub struct ReorderAttr {
    /// Dimensions carrying distinct scales.
    pub mask: i32,
    /// The scales.
    pub scales: Vec<f32>,
}

impl Default for ReorderAttr {
    fn default() -> Self {
        Self {
            mask: 0,
            scales: vec![1.0],
        }
    }
}

/// Converts a buffer between two descriptors of the same logical shape.
///
/// The physical layout and the element type may change, values are multiplied by the scales
/// and rounded half to even with saturation when converted to integers.
#[derive(Debug)]
pub struct Reorder {
    src: MemoryDesc,
    dst: MemoryDesc,
    attr: ReorderAttr,
    src_offsets: Vec<usize>,
    dst_offsets: Vec<usize>,
    scale_indices: Vec<usize>,
}

impl Reorder {
    /// Create the reorder primitive between two descriptors.
    pub fn new(src: &MemoryDesc, dst: &MemoryDesc, attr: ReorderAttr) -> Result<Self, RuntimeError> {
        if src.dims() != dst.dims() {
            return Err(RuntimeError::invalid_descriptor(format!(
                "can't reorder {:?} into {:?}",
                src.dims(),
                dst.dims()
            )));
        }
        if src.format() == Format::Any || dst.format() == Format::Any {
            return Err(RuntimeError::invalid_descriptor(
                "reorder descriptors must have a concrete format".into(),
            ));
        }

        let dims = src.dims();
        if attr.mask < 0 || attr.mask >> dims.len() != 0 {
            return Err(RuntimeError::invalid_descriptor(format!(
                "scale mask {:#b} selects dimensions outside of {dims:?}",
                attr.mask
            )));
        }

        let masked: Vec<usize> = (0..dims.len())
            .filter(|dim| attr.mask & (1 << dim) != 0)
            .collect();
        let required: i64 = masked.iter().map(|dim| dims[*dim]).product();
        if attr.scales.is_empty() || (attr.mask != 0 && (attr.scales.len() as i64) < required) {
            return Err(RuntimeError::invalid_descriptor(format!(
                "{} scales provided, mask {:#b} over {dims:?} requires {required}",
                attr.scales.len(),
                attr.mask
            )));
        }

        let mut scale_indices = Vec::with_capacity(src.num_elements());
        let mut index = vec![0usize; dims.len()];
        for _ in 0..src.num_elements() {
            let scale_index = masked
                .iter()
                .fold(0usize, |acc, dim| acc * dims[*dim] as usize + index[*dim]);
            scale_indices.push(scale_index);
            increment(&mut index, dims);
        }

        Ok(Self {
            src_offsets: src.physical_offsets(),
            dst_offsets: dst.physical_offsets(),
            src: src.clone(),
            dst: dst.clone(),
            attr,
            scale_indices,
        })
    }

    /// Source descriptor.
    pub fn src_desc(&self) -> &MemoryDesc {
        &self.src
    }

    /// Destination descriptor.
    pub fn dst_desc(&self) -> &MemoryDesc {
        &self.dst
    }

    /// Scales applied by the reorder.
    pub fn attr(&self) -> &ReorderAttr {
        &self.attr
    }

    /// Run the reorder to completion, replacing the content of `to`.
    pub fn execute(&self, from: &Memory, to: &Memory) -> Result<(), RuntimeError> {
        if from.desc() != &self.src || to.desc() != &self.dst {
            return Err(RuntimeError::invalid_descriptor(format!(
                "reorder from {:?} to {:?} executed on {:?} and {:?}",
                self.src,
                self.dst,
                from.desc(),
                to.desc()
            )));
        }

        let values = from.data().to_f32();
        let mut output = vec![0.0f32; values.len()];
        for ((src, dst), scale) in self
            .src_offsets
            .iter()
            .zip(&self.dst_offsets)
            .zip(&self.scale_indices)
        {
            output[*dst] = values[*src] * self.attr.scales[*scale];
        }

        to.set_data_handle(Arc::new(Buffer::from_f32(self.dst.dtype(), &output)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DataType;

    fn desc(dims: &[i64], dtype: DataType, format: Format) -> MemoryDesc {
        MemoryDesc::new(dims.to_vec(), dtype, format).unwrap()
    }

    #[test]
    fn transposes_channels() {
        let src = desc(&[2, 3, 1, 1], DataType::F32, Format::Iohw);
        let dst = desc(&[2, 3, 1, 1], DataType::F32, Format::Oihw);
        // Physical [i, o] buffer.
        let data = Arc::new(Buffer::F32(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]));
        let from = Memory::new(src.clone(), data).unwrap();
        let to = Memory::allocate(dst.clone());

        Reorder::new(&src, &dst, ReorderAttr::default())
            .unwrap()
            .execute(&from, &to)
            .unwrap();

        assert_eq!(
            *to.data(),
            Buffer::F32(vec![0.0, 2.0, 4.0, 1.0, 3.0, 5.0])
        );
    }

    #[test]
    fn quantizes_per_output_channel() {
        let src = desc(&[2, 2, 1, 1], DataType::F32, Format::Oihw);
        let dst = desc(&[2, 2, 1, 1], DataType::S8, Format::Oihw);
        let from = Memory::new(src.clone(), Arc::new(Buffer::F32(vec![0.5, -1.0, 0.25, 2.0])))
            .unwrap();
        let to = Memory::allocate(dst.clone());

        Reorder::new(&src, &dst, ReorderAttr::new(1, vec![100.0, 10.0]))
            .unwrap()
            .execute(&from, &to)
            .unwrap();

        assert_eq!(*to.data(), Buffer::S8(vec![50, -100, 2, 20]));
    }

    #[test]
    fn grouped_mask_spans_group_and_output() {
        let src = desc(&[2, 2, 1, 1, 1], DataType::F32, Format::Goihw);
        let dst = desc(&[2, 2, 1, 1, 1], DataType::S32, Format::Goihw);
        let from = Memory::new(src.clone(), Arc::new(Buffer::F32(vec![1.0; 4]))).unwrap();
        let to = Memory::allocate(dst.clone());

        Reorder::new(&src, &dst, ReorderAttr::new(3, vec![1.0, 2.0, 3.0, 4.0]))
            .unwrap()
            .execute(&from, &to)
            .unwrap();

        assert_eq!(*to.data(), Buffer::S32(vec![1, 2, 3, 4]));
    }

    #[test]
    fn rejects_missing_scales() {
        let src = desc(&[4, 1, 1, 1], DataType::F32, Format::Oihw);
        let dst = desc(&[4, 1, 1, 1], DataType::S8, Format::Oihw);

        assert!(Reorder::new(&src, &dst, ReorderAttr::new(1, vec![1.0, 2.0])).is_err());
        assert!(Reorder::new(&src, &dst, ReorderAttr::new(1 << 5, vec![1.0])).is_err());
    }

    #[test]
    fn rejects_shape_mismatch() {
        let src = desc(&[4, 1, 1, 1], DataType::F32, Format::Oihw);
        let dst = desc(&[2, 2, 1, 1], DataType::F32, Format::Oihw);

        assert!(Reorder::new(&src, &dst, ReorderAttr::default()).is_err());
    }
}
