//! Layer Graph Primitives
//!
//! A layer is a fixed-shape stage in the compute graph: a common core (shape,
//! device buffers, barriers, links) plus a kind-specific payload with four
//! capability slots — compile, forward, backward, release. Kernels are
//! compiled lazily on first use, with the layer's shape baked into the
//! program as constants.

mod conv;
mod dense;
mod input;
mod output;

pub use conv::ConvInit;

use std::sync::Arc;

use wgpu::Buffer;

use crate::context::{Barrier, Context};
use crate::network::Hyper;

use conv::ConvState;
use dense::DenseState;
use input::InputState;
use output::OutputState;

/// Index of a layer inside its owning network's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LayerId(pub(crate) usize);

/// 3-D output shape of a layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Shape {
    /// Extent along x.
    pub width: usize,
    /// Extent along y.
    pub height: usize,
    /// Channel count.
    pub depth: usize,
}

impl Shape {
    /// Shape from explicit extents.
    pub fn new(width: usize, height: usize, depth: usize) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// Flat element count, `width * height * depth`.
    pub fn size(&self) -> usize {
        self.width * self.height * self.depth
    }
}

/// Activation function applied by Dense and Convolution layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[allow(missing_docs)]
pub enum Activation {
    Linear,
    #[default]
    ReLU,
    LeakyReLU,
    Sigmoid,
    Tanh,
}

impl Activation {
    /// Name of the WGSL source fragment implementing this activation.
    pub(crate) fn source_name(&self) -> &'static str {
        match self {
            Activation::Linear => "act_linear",
            Activation::ReLU => "act_relu",
            Activation::LeakyReLU => "act_leaky_relu",
            Activation::Sigmoid => "act_sigmoid",
            Activation::Tanh => "act_tanh",
        }
    }
}

/// Hyper-parameters in the WGSL `Hyper` uniform layout.
#[repr(C)]
#[derive(Copy, Clone, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct HyperUniform {
    rate: f32,
    momentum: f32,
    decay: f32,
    _pad: f32,
}

impl From<&Hyper> for HyperUniform {
    fn from(h: &Hyper) -> Self {
        Self {
            rate: h.rate,
            momentum: h.momentum,
            decay: h.decay,
            _pad: 0.0,
        }
    }
}

/// Borrowed view of a predecessor layer's compiled state, captured while a
/// dependent layer builds its bind groups. The `Arc` clones keep the buffers
/// alive inside the bind groups without transferring ownership.
pub(crate) struct PrevView {
    pub value: Arc<Buffer>,
    pub gradient: Arc<Buffer>,
    pub shape: Shape,
}

/// State shared by every layer kind.
pub(crate) struct LayerCore {
    pub label: String,
    pub shape: Shape,
    pub activation: Activation,
    pub weight_count: usize,
    pub prev: Vec<LayerId>,
    pub next: Vec<LayerId>,
    pub value: Option<Arc<Buffer>>,
    pub derivative: Option<Arc<Buffer>>,
    pub gradient: Option<Arc<Buffer>>,
    pub bias: Option<Arc<Buffer>>,
    pub bias_delta: Option<Arc<Buffer>>,
    pub weight: Option<Arc<Buffer>>,
    pub weight_delta: Option<Arc<Buffer>>,
    pub forward_barrier: Barrier,
    pub backward_barrier: Barrier,
    pub compiled: bool,
}

impl LayerCore {
    fn new(label: String, shape: Shape, activation: Activation) -> Self {
        Self {
            label,
            shape,
            activation,
            weight_count: 0,
            prev: Vec::new(),
            next: Vec::new(),
            value: None,
            derivative: None,
            gradient: None,
            bias: None,
            bias_delta: None,
            weight: None,
            weight_delta: None,
            forward_barrier: Barrier::none(),
            backward_barrier: Barrier::none(),
            compiled: false,
        }
    }

    pub fn size(&self) -> usize {
        self.shape.size()
    }
}

enum LayerKind {
    Input(InputState),
    Dense(DenseState),
    Conv(ConvState),
    Output(OutputState),
}

/// One stage of the compute graph: common core plus kind payload.
pub(crate) struct Layer {
    pub core: LayerCore,
    kind: LayerKind,
}

impl Layer {
    pub fn new_input(label: String, shape: Shape) -> Self {
        Self {
            core: LayerCore::new(label, shape, Activation::Linear),
            kind: LayerKind::Input(InputState::new()),
        }
    }

    pub fn new_dense(label: String, shape: Shape, activation: Activation) -> Self {
        assert!(shape.size() > 0, "dense layer with empty shape");
        Self {
            core: LayerCore::new(label, shape, activation),
            kind: LayerKind::Dense(DenseState::new()),
        }
    }

    pub fn new_conv(
        label: String,
        range: usize,
        filters: usize,
        activation: Activation,
        init: ConvInit,
    ) -> Self {
        assert!(filters > 0, "convolution layer with zero filters");
        // Plane extent mirrors the predecessor and is resolved at compile.
        Self {
            core: LayerCore::new(label, Shape::new(0, 0, filters), activation),
            kind: LayerKind::Conv(ConvState::new(range, filters, init)),
        }
    }

    pub fn new_output(label: String) -> Self {
        Self {
            core: LayerCore::new(label, Shape::new(0, 0, 0), Activation::Linear),
            kind: LayerKind::Output(OutputState::new()),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            LayerKind::Input(_) => "input",
            LayerKind::Dense(_) => "dense",
            LayerKind::Conv(_) => "conv",
            LayerKind::Output(_) => "output",
        }
    }

    /// Allocate buffers and compile kernels. Idempotent; the kind-specific
    /// routine must set `compiled` before returning.
    pub fn compile(&mut self, ctx: &Context, prev: Option<&PrevView>) {
        if self.core.compiled {
            return;
        }
        match &mut self.kind {
            LayerKind::Input(state) => state.compile(&mut self.core, ctx),
            LayerKind::Dense(state) => state.compile(&mut self.core, ctx, prev),
            LayerKind::Conv(state) => state.compile(&mut self.core, ctx, prev),
            LayerKind::Output(state) => state.compile(&mut self.core, ctx, prev),
        }
        debug_assert!(
            self.core.compiled,
            "layer '{}' did not set the compiled flag",
            self.core.label
        );
    }

    /// Run the kind's forward kernels and advance the forward barrier.
    pub fn forward(&mut self, ctx: &Context) {
        assert!(self.core.compiled, "forward before compile");
        match &mut self.kind {
            LayerKind::Input(_) | LayerKind::Output(_) => {}
            LayerKind::Dense(state) => state.forward(&mut self.core, ctx),
            LayerKind::Conv(state) => state.forward(&mut self.core, ctx),
        }
    }

    /// Run the kind's backward kernels; the output kind returns its loss
    /// contribution.
    pub fn backward(&mut self, ctx: &Context, hyper: &Hyper) -> Option<f32> {
        assert!(self.core.compiled, "backward before compile");
        match &mut self.kind {
            LayerKind::Input(_) => None,
            LayerKind::Dense(state) => {
                state.backward(&mut self.core, ctx, hyper);
                None
            }
            LayerKind::Conv(state) => {
                state.backward(&mut self.core, ctx, hyper);
                None
            }
            LayerKind::Output(state) => Some(state.backward(&mut self.core, ctx)),
        }
    }

    /// Drop every owned device object. Safe before compile; the network's
    /// layers release on drop. The output kind's aliased value buffer is a
    /// shared handle and never freed here.
    pub fn release(&mut self) {
        match &mut self.kind {
            LayerKind::Input(state) => state.release(),
            LayerKind::Dense(state) => state.release(),
            LayerKind::Conv(state) => state.release(),
            LayerKind::Output(state) => state.release(),
        }
        let core = &mut self.core;
        core.value = None;
        core.derivative = None;
        core.gradient = None;
        core.bias = None;
        core.bias_delta = None;
        core.weight = None;
        core.weight_delta = None;
        core.forward_barrier = Barrier::none();
        core.backward_barrier = Barrier::none();
        core.compiled = false;
    }

    /// Synchronous readback of a value sub-range.
    pub fn load_value(&self, ctx: &Context, offset: usize, count: usize) -> Vec<f32> {
        assert!(self.core.compiled, "load_value before compile");
        assert!(
            offset + count <= self.core.size(),
            "value range {}..{} out of bounds for size {}",
            offset,
            offset + count,
            self.core.size()
        );
        self.core.forward_barrier.wait(ctx);
        ctx.read_buffer(self.core.value.as_ref().unwrap(), offset, count)
    }

    /// Synchronous readback of the gradient buffer, for diagnostics and
    /// gradient checks.
    pub fn load_gradient(&self, ctx: &Context) -> Vec<f32> {
        assert!(self.core.compiled, "load_gradient before compile");
        let gradient = self
            .core
            .gradient
            .as_ref()
            .expect("layer owns no gradient buffer");
        self.core.backward_barrier.wait(ctx);
        ctx.read_buffer(gradient, 0, self.core.size())
    }

    /// Zero the gradient buffer via the device-side pattern fill. No-op for
    /// layers that own no gradient buffer.
    pub fn clear_gradient(&mut self, ctx: &Context) {
        if let Some(gradient) = &self.core.gradient {
            let bytes = (self.core.size() * std::mem::size_of::<f32>()) as u64;
            self.core.backward_barrier = ctx.fill_pattern(gradient, bytes, &0.0f32.to_ne_bytes());
        }
    }

    /// Host ingestion into an input layer's value buffer.
    pub fn set_input_data(&mut self, ctx: &Context, data: &[f32]) {
        match &mut self.kind {
            LayerKind::Input(state) => state.set_data(&mut self.core, ctx, data),
            _ => panic!("set_input_data on a {} layer", self.kind_name()),
        }
    }

    /// Host ingestion of target values into an output layer's truth buffer.
    pub fn set_truth(&mut self, ctx: &Context, data: &[f32]) {
        match &mut self.kind {
            LayerKind::Output(state) => state.set_truth(&mut self.core, ctx, data),
            _ => panic!("set_truth on a {} layer", self.kind_name()),
        }
    }

    /// Overwrite the weight buffer, e.g. to inject known coefficients.
    pub fn write_weights(&self, ctx: &Context, data: &[f32]) {
        assert!(self.core.compiled, "write_weights before compile");
        let weight = self
            .core
            .weight
            .as_ref()
            .unwrap_or_else(|| panic!("{} layer owns no weights", self.kind_name()));
        assert_eq!(data.len(), self.core.weight_count, "weight count mismatch");
        ctx.write_buffer(weight, data);
    }

    /// Overwrite the bias buffer.
    pub fn write_bias(&self, ctx: &Context, data: &[f32]) {
        assert!(self.core.compiled, "write_bias before compile");
        let bias = self
            .core
            .bias
            .as_ref()
            .unwrap_or_else(|| panic!("{} layer owns no bias", self.kind_name()));
        assert_eq!(data.len(), self.core.size(), "bias size mismatch");
        ctx.write_buffer(bias, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_size_is_the_product_of_extents() {
        assert_eq!(Shape::new(4, 3, 2).size(), 24);
        assert_eq!(Shape::new(1, 1, 1).size(), 1);
        assert_eq!(Shape::new(5, 0, 2).size(), 0);
    }

    #[test]
    fn dense_weight_count_formula() {
        assert_eq!(dense::weight_count(784, 128), 784 * 128);
        assert_eq!(dense::weight_count(2, 1), 2);
    }

    #[test]
    fn conv_weight_count_formula() {
        // K = 2*range + 1
        assert_eq!(conv::weight_count(3, 3, 8), 3 * 3 * 3 * 8);
        assert_eq!(conv::weight_count(5, 1, 2), 5 * 5 * 1 * 2);
    }

    #[test]
    #[should_panic(expected = "empty shape")]
    fn dense_rejects_empty_shape() {
        Layer::new_dense("d".into(), Shape::new(0, 1, 1), Activation::Linear);
    }
}
