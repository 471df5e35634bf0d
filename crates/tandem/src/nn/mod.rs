//! Neural network inference.
//!
//! Networks are loaded from ONNX files with [`tract_onnx`] and exposed as an
//! [`ExecutionResource`], so a stage can run them by input and output *name*. A split detector
//! consists of two networks whose output/input names meet at the intermediate score and box
//! tensors.

pub mod tensor;

use std::{
    borrow::Cow,
    collections::{btree_map, BTreeMap},
    path::Path,
    sync::Arc,
};

use anyhow::{anyhow, bail};
use image::{imageops, RgbImage};
use tract_onnx::prelude::{
    DatumType, Framework, Graph, InferenceModelExt, SimplePlan, TValue, TVec, TypedFact, TypedOp,
};

use crate::stage::ExecutionResource;
pub use tensor::{Tensor, TensorView};

type Model = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Named input tensors for a stage.
#[derive(Debug, Default, Clone)]
pub struct Feeds {
    inner: BTreeMap<String, Tensor>,
}

impl Feeds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `tensor` to the input called `name`, replacing any previous binding.
    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor) {
        self.inner.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.inner.get(name)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.inner.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<S: Into<String>> FromIterator<(S, Tensor)> for Feeds {
    fn from_iter<T: IntoIterator<Item = (S, Tensor)>>(iter: T) -> Self {
        Self {
            inner: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

impl<S: Into<String>, const N: usize> From<[(S, Tensor); N]> for Feeds {
    fn from(feeds: [(S, Tensor); N]) -> Self {
        feeds.into_iter().collect()
    }
}

impl IntoIterator for Feeds {
    type Item = (String, Tensor);
    type IntoIter = btree_map::IntoIter<String, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

/// Neural network loader.
pub struct Loader<'a> {
    model_data: Cow<'a, [u8]>,
    outputs: Option<Vec<String>>,
}

impl<'a> Loader<'a> {
    fn new(data: Cow<'a, [u8]>) -> Self {
        Self {
            model_data: data,
            outputs: None,
        }
    }

    /// Computes the given nodes as the network's outputs instead of its declared outputs.
    ///
    /// This is how a network is cut at an intermediate tensor: the nodes do not need to be outputs
    /// of the original graph. The order given here is the order of the tensors returned by
    /// [`NeuralNetwork::run`].
    pub fn with_outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Loads and optimizes the network.
    ///
    /// Returns an error if the network data is malformed, if a requested output does not exist,
    /// or if the network uses unimplemented operations.
    pub fn load(self) -> anyhow::Result<NeuralNetwork> {
        let mut model = tract_onnx::onnx().model_for_read(&mut &*self.model_data)?;
        if let Some(names) = &self.outputs {
            model.set_output_names(names)?;
        }
        let graph = model.into_optimized()?;

        let mut inputs = Vec::new();
        for (id, outlet) in graph.input_outlets()?.iter().enumerate() {
            let fact = graph.input_fact(id)?;
            inputs.push(InputInfo {
                name: graph.node(outlet.node).name.clone(),
                shape: fact.shape.as_concrete().map(|shape| shape.to_vec()),
                datum_type: fact.datum_type,
            });
        }
        let outputs = match self.outputs {
            Some(names) => names,
            None => graph
                .output_outlets()?
                .iter()
                .map(|outlet| graph.node(outlet.node).name.clone())
                .collect(),
        };

        log::debug!(
            "loaded network with inputs {:?} and outputs {:?}",
            inputs,
            outputs
        );

        Ok(NeuralNetwork {
            plan: Arc::new(SimplePlan::new(graph)?),
            inputs,
            outputs,
        })
    }
}

/// Information about a network input.
#[derive(Debug, Clone)]
pub struct InputInfo {
    name: String,
    shape: Option<Vec<usize>>,
    datum_type: DatumType,
}

impl InputInfo {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the input's shape, or [`None`] if it has symbolic dimensions.
    pub fn shape(&self) -> Option<&[usize]> {
        self.shape.as_deref()
    }
}

/// A loaded neural network that can be run by a stage.
///
/// This is a cheaply [`Clone`]able handle to the underlying plan.
#[derive(Clone)]
pub struct NeuralNetwork {
    plan: Arc<Model>,
    inputs: Vec<InputInfo>,
    outputs: Vec<String>,
}

impl NeuralNetwork {
    /// Starts loading a pre-trained model from an ONNX file path.
    pub fn from_path<'a, P: AsRef<Path>>(path: P) -> anyhow::Result<Loader<'a>> {
        Self::from_path_impl(path.as_ref())
    }

    fn from_path_impl<'a>(path: &Path) -> anyhow::Result<Loader<'a>> {
        match path.extension() {
            Some(ext) if ext == "onnx" => {}
            _ => bail!(
                "neural network file `{}` must have `.onnx` extension",
                path.display()
            ),
        }

        let model_data = std::fs::read(path)
            .map_err(|e| anyhow!("failed to read `{}`: {e}", path.display()))?;
        Ok(Loader::new(model_data.into()))
    }

    pub fn inputs(&self) -> &[InputInfo] {
        &self.inputs
    }

    pub fn input(&self, name: &str) -> Option<&InputInfo> {
        self.inputs.iter().find(|info| info.name == name)
    }

    /// Returns the names of the computed outputs, in order.
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Returns the `(width, height)` of an `[1, H, W, 3]` image input, if its shape is fixed.
    pub fn image_input_resolution(&self, name: &str) -> Option<(u32, u32)> {
        match self.input(name)?.shape()? {
            &[1, h, w, 3] => Some((w.try_into().ok()?, h.try_into().ok()?)),
            _ => None,
        }
    }

    /// Runs the network, binding `feeds` to the inputs by name.
    ///
    /// `fetches` must name the outputs the network was loaded with, in the same order.
    #[doc(alias = "infer")]
    pub fn run(&self, fetches: &[String], feeds: &Feeds) -> anyhow::Result<Vec<Tensor>> {
        if fetches != self.outputs.as_slice() {
            bail!(
                "requested outputs {:?}, but the network computes {:?}",
                fetches,
                self.outputs
            );
        }

        let mut inputs = TVec::new();
        for info in &self.inputs {
            let tensor = feeds
                .get(&info.name)
                .ok_or_else(|| anyhow!("missing input tensor `{}`", info.name))?;
            if let Some(shape) = info.shape() {
                if shape != tensor.shape() {
                    bail!(
                        "input `{}` expects shape {:?}, got {:?}",
                        info.name,
                        shape,
                        tensor.shape()
                    );
                }
            }
            let tract = tensor.to_tract()?.cast_to_dt(info.datum_type)?.into_owned();
            inputs.push(TValue::from_const(Arc::new(tract)));
        }

        self.plan
            .run(inputs)?
            .iter()
            .map(|tract| Tensor::from_tract(tract))
            .collect()
    }
}

impl ExecutionResource for NeuralNetwork {
    fn run(&mut self, fetches: &[String], inputs: &Feeds) -> anyhow::Result<Vec<Tensor>> {
        NeuralNetwork::run(self, fetches, inputs)
    }
}

/// Converts an RGB frame into a `[1, H, W, 3]` image batch.
///
/// If `resolution` is given and differs from the frame's size, the frame is resized first. Pixel
/// values are kept in their 0-255 range.
pub fn frame_to_tensor(image: &RgbImage, resolution: Option<(u32, u32)>) -> Tensor {
    let resized;
    let image = match resolution {
        Some((w, h)) if image.dimensions() != (w, h) => {
            resized = imageops::resize(image, w, h, imageops::FilterType::Triangle);
            &resized
        }
        _ => image,
    };

    let (w, h) = image.dimensions();
    Tensor::from_iter(
        &[1, h as usize, w as usize, 3],
        image.as_raw().iter().map(|&b| f32::from(b)),
    )
}
