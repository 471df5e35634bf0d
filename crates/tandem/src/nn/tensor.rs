//! Tensor API.
//!
//! Tensors are what flows between the pipeline stages: the image batch going into the fast stage,
//! the intermediate score/box tensors handed from the fast to the slow stage, and the final
//! detection outputs. They are plain N-dimensional `f32` arrays.

use std::fmt;

use crate::iter::zip_exact;
use tinyvec::TinyVec;

#[derive(Clone, PartialEq, Eq)]
struct Layout(TinyVec<[usize; 8]>);

impl Layout {
    fn from_shape(shape: &[usize]) -> Self {
        let mut vec = TinyVec::from(shape);
        vec.extend(shape.iter().map(|_| 0));

        let mut stride = 1;
        for (out, size) in zip_exact(
            vec[shape.len()..].iter_mut().rev(),
            shape.iter().copied().rev(),
        ) {
            *out = stride;
            stride *= size;
        }

        Self(vec)
    }

    fn shape(&self) -> &[usize] {
        &self.0[..self.0.len() / 2]
    }

    fn elements(&self) -> usize {
        self.shape().iter().product()
    }

    fn strides(&self) -> &[usize] {
        &self.0[self.0.len() / 2..]
    }

    fn remove_prefix(&self, num: usize) -> Layout {
        assert!(num <= self.shape().len());

        let mut vec = TinyVec::with_capacity((self.shape().len() - num) * 2);
        vec.extend(self.shape()[num..].iter().copied());
        vec.extend(self.strides()[num..].iter().copied());
        Layout(vec)
    }
}

impl fmt::Debug for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.shape()).finish()
    }
}

/// A dynamically shaped `f32` tensor.
///
/// Tensors are either built from an iterator of elements ([`Tensor::from_iter`]), filled with zeros
/// ([`Tensor::zeros`], used for warm-up jobs), or converted from the inference backend's output.
///
/// Data is accessed by indexing a prefix of the dimensions with [`Tensor::index`], which yields a
/// [`TensorView`], and then reading 1-dimensional data with [`TensorView::as_slice`] or single
/// elements with [`TensorView::as_singular`].
#[derive(Clone, PartialEq)]
pub struct Tensor {
    layout: Layout,
    data: Box<[f32]>,
}

/// A borrowed view into a suffix of a [`Tensor`]'s dimensions.
#[derive(Clone)]
pub struct TensorView<'a> {
    layout: Layout,
    data: &'a [f32],
}

impl Tensor {
    /// Creates a tensor of the given shape with every element set to `0.0`.
    pub fn zeros(shape: &[usize]) -> Self {
        let layout = Layout::from_shape(shape);
        let data = vec![0.0; layout.elements()].into_boxed_slice();
        Self { layout, data }
    }

    /// Creates a tensor of the given shape by pulling elements from an iterator.
    ///
    /// # Panics
    ///
    /// `iter` must yield exactly as many elements as specified by `shape` (by multiplying all of
    /// its entries), otherwise this method will panic.
    pub fn from_iter<I: IntoIterator<Item = f32>>(shape: &[usize], iter: I) -> Self {
        let layout = Layout::from_shape(shape);
        let data: Box<_> = iter.into_iter().collect();
        assert_eq!(
            data.len(),
            layout.elements(),
            "element count does not match tensor shape {shape:?}"
        );
        Self { layout, data }
    }

    pub(super) fn from_tract(tract: &tract_onnx::prelude::Tensor) -> anyhow::Result<Self> {
        let tract = tract.cast_to::<f32>()?;
        let data = tract.as_slice::<f32>()?;
        Ok(Self::from_iter(tract.shape(), data.iter().copied()))
    }

    pub(super) fn to_tract(&self) -> anyhow::Result<tract_onnx::prelude::Tensor> {
        Ok(tract_onnx::prelude::Tensor::from_shape(
            self.shape(),
            &self.data,
        )?)
    }

    /// Returns the raw element data in row-major order.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Returns the shape of this tensor.
    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    /// Returns the number of dimensions of this tensor.
    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    /// Indexes a prefix of the tensor's dimensions with `indices`.
    ///
    /// Indexing a tensor of shape `[1, 100, 4]` with `[0, 7]` yields a view of shape `[4]`.
    ///
    /// # Panics
    ///
    /// This method will panic if `indices` has more entries than `self` has dimensions, or if any
    /// index is out of bounds.
    #[track_caller]
    pub fn index<const N: usize>(&self, indices: [usize; N]) -> TensorView<'_> {
        self.view().index(indices)
    }

    /// Returns a view of the whole tensor.
    pub fn view(&self) -> TensorView<'_> {
        TensorView {
            layout: self.layout.clone(),
            data: &self.data,
        }
    }
}

impl<'d> TensorView<'d> {
    /// Returns the shape of this tensor view.
    pub fn shape(&self) -> &[usize] {
        self.layout.shape()
    }

    /// Returns the number of dimensions of this view.
    pub fn rank(&self) -> usize {
        self.shape().len()
    }

    /// Indexes a prefix of the view's dimensions with `indices`.
    #[track_caller]
    pub fn index<const N: usize>(&self, indices: [usize; N]) -> TensorView<'d> {
        assert!(
            N <= self.rank(),
            "attempted to index tensor view of shape {:?} with {:?}",
            self.shape(),
            indices
        );
        let mut data = self.data;
        for ((&length, &stride), &index) in self
            .shape()
            .iter()
            .zip(self.layout.strides())
            .zip(&indices)
        {
            assert!(
                index < length,
                "attempted to index tensor view of shape {:?} with {:?}",
                self.shape(),
                indices
            );
            data = &data[index * stride..(index + 1) * stride];
        }
        TensorView {
            layout: self.layout.remove_prefix(indices.len()),
            data,
        }
    }

    /// Returns the values stored in a 1-dimensional view as a slice.
    ///
    /// # Panics
    ///
    /// `self` must have exactly 1 dimension, otherwise this method panics.
    #[track_caller]
    pub fn as_slice(&self) -> &'d [f32] {
        assert_eq!(
            self.rank(),
            1,
            "attempted to access tensor view of shape {:?} as slice",
            self.shape()
        );
        self.data
    }

    /// Returns the value stored in a 0-dimensional view.
    ///
    /// # Panics
    ///
    /// `self` must have exactly 0 dimensions, otherwise this method will panic.
    #[track_caller]
    pub fn as_singular(&self) -> f32 {
        assert_eq!(
            self.rank(),
            0,
            "attempted to access view of shape {:?} as singular element",
            self.shape(),
        );
        self.data[0]
    }
}

impl From<f32> for Tensor {
    fn from(value: f32) -> Self {
        Tensor::from_iter(&[], [value])
    }
}

impl<const N: usize> From<[f32; N]> for Tensor {
    fn from(arr: [f32; N]) -> Self {
        Tensor::from_iter(&[N], arr)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape())
            .finish()
    }
}

impl fmt::Debug for TensorView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TensorView")
            .field("shape", &self.shape())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeros_have_requested_shape() {
        let tensor = Tensor::zeros(&[1, 1917, 90]);
        assert_eq!(tensor.shape(), &[1, 1917, 90]);
        assert_eq!(tensor.data().len(), 1917 * 90);
        assert!(tensor.data().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn empty_dimension() {
        let tensor = Tensor::zeros(&[1, 0, 4]);
        assert_eq!(tensor.shape(), &[1, 0, 4]);
        assert!(tensor.data().is_empty());
        assert_eq!(tensor.index([0]).shape(), &[0, 4]);
    }

    #[test]
    fn singular() {
        let tensor = Tensor::from(3.0);
        assert_eq!(tensor.shape(), &[] as &[usize]);
        assert_eq!(tensor.rank(), 0);
        assert_eq!(tensor.view().as_singular(), 3.0);
    }

    #[test]
    fn index_boxes() {
        let data = (0..8).map(|i| i as f32);
        let boxes = Tensor::from_iter(&[1, 2, 4], data);

        let first = boxes.index([0, 0]);
        assert_eq!(first.shape(), &[4]);
        assert_eq!(first.as_slice(), &[0.0, 1.0, 2.0, 3.0]);

        let second = boxes.index([0, 1]);
        assert_eq!(second.as_slice(), &[4.0, 5.0, 6.0, 7.0]);

        assert_eq!(boxes.index([0, 1, 2]).as_singular(), 6.0);
        assert_eq!(boxes.index([0]).index([1, 3]).as_singular(), 7.0);
    }

    #[test]
    #[should_panic]
    fn index_out_of_bounds() {
        let tensor = Tensor::from([1.0, 2.0]);
        tensor.index([2]);
    }

    #[test]
    #[should_panic]
    fn wrong_element_count() {
        Tensor::from_iter(&[2, 2], [1.0, 2.0, 3.0]);
    }
}
