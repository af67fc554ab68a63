use crate::ConvError;
use convq_runtime::memory::{Buffer, DataType};
use std::sync::Arc;

/// How the data of a tensor is laid out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataLayout {
    /// Laid out by the engine primitives, the only layout the kernels accept.
    Engine,
    /// Framework native layout, must be converted before reaching a kernel.
    Native,
}

/// A tensor flowing between operators.
#[derive(Clone, Debug)]
pub struct Tensor {
    dims: Vec<i64>,
    layout: DataLayout,
    data: Arc<Buffer>,
}

impl Tensor {
    /// Create an engine laid out tensor, checking that the buffer matches the dimensions.
    pub fn new(dims: Vec<i64>, data: Buffer) -> Result<Self, ConvError> {
        let expected = dims.iter().product::<i64>();
        if dims.iter().any(|dim| *dim <= 0) || expected as usize != data.len() {
            return Err(ConvError::invalid(format!(
                "a buffer of {} elements can't hold a tensor of dims {dims:?}",
                data.len()
            )));
        }

        Ok(Self {
            dims,
            layout: DataLayout::Engine,
            data: Arc::new(data),
        })
    }

    pub fn with_layout(mut self, layout: DataLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    pub fn layout(&self) -> DataLayout {
        self.layout
    }

    pub fn dtype(&self) -> DataType {
        self.data.dtype()
    }

    /// Shared handle on the data, rebound into cached memories without copying.
    pub fn data(&self) -> Arc<Buffer> {
        self.data.clone()
    }

    pub fn to_f32(&self) -> Vec<f32> {
        self.data.to_f32()
    }
}
