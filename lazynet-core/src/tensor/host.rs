use std::fmt;

use crate::{shape::contiguous_strides, Error, Result, Shape};

/// Concrete row-major `f32` data with a shape.
#[derive(Clone, PartialEq)]
pub struct HostTensor {
    shape: Shape,
    data: Vec<f32>,
}

impl HostTensor {
    pub fn new(shape: impl Into<Shape>, data: Vec<f32>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.element_count() {
            return Err(Error::shape(
                "HostTensor",
                &shape,
                &Shape::new(vec![data.len()]),
                "data length does not match the element count",
            ));
        }
        Ok(Self { shape, data })
    }

    pub fn filled(shape: impl Into<Shape>, value: f32) -> Self {
        let shape = shape.into();
        let data = vec![value; shape.element_count()];
        Self { shape, data }
    }

    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Shape::scalar(),
            data: vec![value],
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.clone()
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Element at `index`. Missing trailing indices are taken as 0.
    pub fn get(&self, index: &[usize]) -> Result<f32> {
        let strides = contiguous_strides(self.shape.dims());
        let mut offset = 0;
        for (axis, (&i, &dim)) in index.iter().zip(self.shape.dims()).enumerate() {
            if i >= dim {
                return Err(Error::msg(format!(
                    "index {i} out of range for axis {axis} of {}",
                    self.shape
                )));
            }
            offset += i * strides[axis];
        }
        Ok(self.data[offset])
    }

    pub fn mean(&self) -> f32 {
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }
}

impl fmt::Debug for HostTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const SHOWN: usize = 8;
        write!(f, "HostTensor{} [", self.shape)?;
        for (i, v) in self.data.iter().take(SHOWN).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        if self.data.len() > SHOWN {
            write!(f, ", ...")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexing() {
        let t = HostTensor::new([2, 3], vec![0., 1., 2., 3., 4., 5.]).unwrap();
        assert_eq!(t.get(&[1, 2]).unwrap(), 5.0);
        assert_eq!(t.get(&[1]).unwrap(), 3.0);
        assert!(t.get(&[2, 0]).is_err());
        assert!(HostTensor::new([2], vec![1.0]).unwrap_err().is_shape());
    }
}
