use std::fmt;

/// An ordered list of positive dimensions.
///
/// Shapes are always normalized: a rank-0 shape becomes `[1]` and every
/// dimension is at least 1.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self::normalize(dims.into())
    }

    pub fn scalar() -> Self {
        Shape(vec![1])
    }

    fn normalize(mut dims: Vec<usize>) -> Self {
        if dims.is_empty() {
            dims.push(1);
        }
        for d in dims.iter_mut() {
            *d = (*d).max(1);
        }
        Shape(dims)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn element_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Last dimension, the feature channels for image-like shapes.
    pub fn channels(&self) -> usize {
        self.0[self.0.len() - 1]
    }

    /// Product of every dimension but the last.
    pub fn positions(&self) -> usize {
        self.element_count() / self.channels()
    }

    pub fn with_channels(&self, channels: usize) -> Self {
        let mut dims = self.0.clone();
        let last = dims.len() - 1;
        dims[last] = channels;
        Self::normalize(dims)
    }

    /// Interpret as `[height, width, channels]`, padding missing leading
    /// dimensions with 1.
    pub(crate) fn hwc(&self) -> (usize, usize, usize) {
        match self.0.as_slice() {
            [c] => (1, 1, *c),
            [w, c] => (1, *w, *c),
            [h, w, c] => (*h, *w, *c),
            dims => {
                let n = dims.len();
                (dims[..n - 2].iter().product(), dims[n - 2], dims[n - 1])
            }
        }
    }
}

impl From<Vec<usize>> for Shape {
    fn from(value: Vec<usize>) -> Self {
        Shape::new(value)
    }
}

impl From<&[usize]> for Shape {
    fn from(value: &[usize]) -> Self {
        Shape::new(value.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(value: [usize; N]) -> Self {
        Shape::new(value.to_vec())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape{self}")
    }
}

/// How convolution-like layers pad their input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConvPadding {
    /// Output keeps the input size (divided by the stride).
    #[default]
    Same,
    /// No padding; the window never leaves the input.
    Valid,
}

pub fn conv_output_length(
    input: usize,
    size: usize,
    stride: usize,
    dilation: usize,
    padding: ConvPadding,
) -> usize {
    let length = match padding {
        ConvPadding::Same => input,
        ConvPadding::Valid => {
            let dilated = (size - 1) * dilation + 1;
            (input + 1).saturating_sub(dilated)
        }
    };
    length.div_ceil(stride).max(1)
}

pub fn conv_transpose_output_length(
    input: usize,
    size: usize,
    stride: usize,
    padding: ConvPadding,
) -> usize {
    match padding {
        ConvPadding::Same => input * stride,
        ConvPadding::Valid => input * stride + size.saturating_sub(stride),
    }
}

/// Leading padding applied by a `Same` convolution window.
pub(crate) fn same_padding_before(input: usize, output: usize, size: usize, stride: usize) -> usize {
    let needed = ((output - 1) * stride + size).saturating_sub(input);
    needed / 2
}

/// Compute default (contiguous) strides for a shape.
pub(crate) fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = Vec::with_capacity(shape.len());
    let mut acc = 1;
    for dim in shape.iter().rev() {
        strides.push(acc);
        acc *= *dim;
    }
    strides.reverse();
    strides
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes() {
        assert_eq!(Shape::new(vec![]).dims(), &[1]);
        assert_eq!(Shape::new(vec![0, 3]).dims(), &[1, 3]);
        assert_eq!(Shape::from([2, 3, 4]).element_count(), 24);
        assert_eq!(Shape::from([2, 3]).to_string(), "(2, 3)");
    }

    #[test]
    fn conv_lengths() {
        assert_eq!(conv_output_length(28, 3, 1, 1, ConvPadding::Same), 28);
        assert_eq!(conv_output_length(28, 3, 2, 1, ConvPadding::Same), 14);
        assert_eq!(conv_output_length(28, 3, 1, 1, ConvPadding::Valid), 26);
        assert_eq!(conv_output_length(28, 5, 2, 1, ConvPadding::Valid), 12);
        assert_eq!(conv_transpose_output_length(7, 4, 2, ConvPadding::Same), 14);
        assert_eq!(conv_transpose_output_length(7, 4, 2, ConvPadding::Valid), 16);
    }

    #[test]
    fn strides() {
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
    }
}
