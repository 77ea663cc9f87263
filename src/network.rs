//! Network
//!
//! Owns the layer arena, wires the graph, and drives the forward and backward
//! passes over the propagation order. Hyper-parameters are network-level
//! scalars shared by every learning layer.

use std::sync::Arc;

use crate::context::Context;
use crate::layers::{Activation, ConvInit, Layer, LayerId, PrevView, Shape};
use crate::schedule;

/// Shared learning hyper-parameters, each in `[0, 1]`.
#[derive(Clone, Copy, Debug)]
pub struct Hyper {
    /// Learning rate.
    pub rate: f32,
    /// Momentum of the delta moving average.
    pub momentum: f32,
    /// Multiplicative weight decay applied each update; `1.0` disables it.
    pub decay: f32,
}

impl Default for Hyper {
    fn default() -> Self {
        Self {
            rate: 0.01,
            momentum: 0.9,
            decay: 1.0,
        }
    }
}

/// A layer graph bound to one compute context.
///
/// Layers are created and wired by identity, compiled lazily as a whole, and
/// released together with the network.
pub struct Network {
    ctx: Arc<Context>,
    layers: Vec<Layer>,
    order: Vec<LayerId>,
    compiled: bool,
    hyper: Hyper,
    loss: f32,
    avg_loss: f32,
}

impl Network {
    /// An empty graph bound to a context.
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            layers: Vec::new(),
            order: Vec::new(),
            compiled: false,
            hyper: Hyper::default(),
            loss: 0.0,
            // Sentinel: replaced by the first observed loss.
            avg_loss: -1.0,
        }
    }

    // ========================================================================
    // GRAPH CONSTRUCTION
    // ========================================================================

    fn append(&mut self, layer: Layer) -> LayerId {
        assert!(!self.compiled, "graph construction after compile");
        let id = LayerId(self.layers.len());
        self.layers.push(layer);
        id
    }

    /// Append an input layer of the given shape.
    pub fn create_input(&mut self, width: usize, height: usize, depth: usize) -> LayerId {
        let label = format!("input{}", self.layers.len());
        self.append(Layer::new_input(label, Shape::new(width, height, depth)))
    }

    /// Append a fully-connected layer.
    pub fn create_dense(
        &mut self,
        width: usize,
        height: usize,
        depth: usize,
        activation: Activation,
    ) -> LayerId {
        let label = format!("dense{}", self.layers.len());
        self.append(Layer::new_dense(
            label,
            Shape::new(width, height, depth),
            activation,
        ))
    }

    /// Append a convolution layer with a `(2·range + 1)²` kernel and
    /// `filters` output channels; its plane extent mirrors the predecessor.
    pub fn create_conv(
        &mut self,
        range: usize,
        filters: usize,
        activation: Activation,
        init: ConvInit,
    ) -> LayerId {
        let label = format!("conv{}", self.layers.len());
        self.append(Layer::new_conv(label, range, filters, activation, init))
    }

    /// Append an output (loss) layer; its shape mirrors the predecessor.
    pub fn create_output(&mut self) -> LayerId {
        let label = format!("output{}", self.layers.len());
        self.append(Layer::new_output(label))
    }

    /// Wire `from` as a predecessor of `to`.
    pub fn connect(&mut self, from: LayerId, to: LayerId) {
        assert!(!self.compiled, "graph construction after compile");
        assert!(from != to, "layer connected to itself");
        self.layer(from);
        self.layer(to);
        self.layers[to.0].core.prev.push(from);
        self.layers[from.0].core.next.push(to);
    }

    fn layer(&self, id: LayerId) -> &Layer {
        self.layers.get(id.0).expect("layer id out of range")
    }

    // ========================================================================
    // HYPER-PARAMETERS
    // ========================================================================

    /// Set the learning rate, in `[0, 1]`.
    pub fn set_rate(&mut self, rate: f32) {
        assert!((0.0..=1.0).contains(&rate), "rate out of [0, 1]");
        self.hyper.rate = rate;
    }

    /// Set the delta-average momentum, in `[0, 1]`.
    pub fn set_momentum(&mut self, momentum: f32) {
        assert!((0.0..=1.0).contains(&momentum), "momentum out of [0, 1]");
        self.hyper.momentum = momentum;
    }

    /// Set the weight decay factor, in `[0, 1]`; `1.0` disables decay.
    pub fn set_decay(&mut self, decay: f32) {
        assert!((0.0..=1.0).contains(&decay), "decay out of [0, 1]");
        self.hyper.decay = decay;
    }

    /// The current hyper-parameter set.
    pub fn hyper(&self) -> Hyper {
        self.hyper
    }

    // ========================================================================
    // COMPILATION & SCHEDULING
    // ========================================================================

    /// Compile every layer and derive the propagation order. Idempotent.
    ///
    /// The order is built first (reverse BFS from the output roots) and
    /// layers compile along it, so a predecessor's buffers always exist when
    /// a dependent layer captures them in its bind groups.
    pub fn compile(&mut self) {
        if self.compiled {
            return;
        }
        assert!(!self.layers.is_empty(), "compile of an empty network");

        let roots: Vec<LayerId> = self
            .layers
            .iter()
            .enumerate()
            .filter(|(_, l)| l.core.next.is_empty())
            .map(|(i, _)| LayerId(i))
            .collect();
        assert!(!roots.is_empty(), "network has no output roots");

        let layers = &self.layers;
        self.order = schedule::build_order(&roots, |id| layers[id.0].core.prev.clone());
        assert_eq!(
            self.order.len(),
            self.layers.len(),
            "unreachable layers in the graph"
        );

        for idx in 0..self.order.len() {
            let id = self.order[idx];
            let prev_view = self.prev_view(id);
            self.layers[id.0].compile(&self.ctx, prev_view.as_ref());
        }
        self.compiled = true;
        log::debug!(
            "network compiled: {} layers, order {:?}",
            self.layers.len(),
            self.order
        );
    }

    /// View of a layer's first predecessor, if it has one. The current layer
    /// kinds consume at most one.
    fn prev_view(&self, id: LayerId) -> Option<PrevView> {
        let prev_id = *self.layers[id.0].core.prev.first()?;
        let prev = &self.layers[prev_id.0].core;
        assert!(
            prev.compiled,
            "predecessor '{}' compiles after its dependent",
            prev.label
        );
        Some(PrevView {
            value: prev.value.clone().unwrap(),
            gradient: prev.gradient.clone().unwrap(),
            shape: prev.shape,
        })
    }

    // ========================================================================
    // EXECUTION
    // ========================================================================

    /// Walk the propagation order forward.
    pub fn forward(&mut self) {
        self.compile();
        for idx in 0..self.order.len() {
            let id = self.order[idx];
            self.layers[id.0].forward(&self.ctx);
        }
    }

    /// Clear gradients, walk the propagation order in reverse, and update the
    /// loss statistics from the output layers' contributions.
    pub fn backward(&mut self) {
        self.compile();
        for layer in &mut self.layers {
            layer.clear_gradient(&self.ctx);
        }

        let mut loss = 0.0;
        for idx in (0..self.order.len()).rev() {
            let id = self.order[idx];
            if let Some(contribution) = self.layers[id.0].backward(&self.ctx, &self.hyper) {
                loss += contribution;
            }
        }
        self.loss = loss;
        self.avg_loss = smooth_loss(self.avg_loss, loss);
        if !loss.is_finite() {
            log::warn!("loss diverged: {}", loss);
        }
    }

    // ========================================================================
    // DATA INGESTION & READBACK
    // ========================================================================

    /// Write floats into an input layer; `data.len()` must equal the layer
    /// size.
    pub fn set_input_data(&mut self, id: LayerId, data: &[f32]) {
        self.compile();
        self.layers[id.0].set_input_data(&self.ctx, data);
    }

    /// Byte-normalized ingestion: each byte is divided by 255.
    pub fn set_input_bytes(&mut self, id: LayerId, data: &[u8]) {
        let floats: Vec<f32> = data.iter().map(|&b| b as f32 / 255.0).collect();
        self.set_input_data(id, &floats);
    }

    /// Write target values into an output layer; synchronized before any
    /// later backward pass reads them.
    pub fn set_truth(&mut self, id: LayerId, data: &[f32]) {
        self.compile();
        self.layers[id.0].set_truth(&self.ctx, data);
    }

    /// Synchronous readback of a layer's full value vector.
    pub fn get_data(&mut self, id: LayerId) -> Vec<f32> {
        self.compile();
        let layer = &self.layers[id.0];
        layer.load_value(&self.ctx, 0, layer.core.size())
    }

    /// Synchronous readback of a layer's gradient vector, for diagnostics.
    pub fn get_gradient(&mut self, id: LayerId) -> Vec<f32> {
        self.compile();
        self.layers[id.0].load_gradient(&self.ctx)
    }

    /// Overwrite a layer's weights, e.g. to inject known coefficients.
    pub fn set_weights(&mut self, id: LayerId, data: &[f32]) {
        self.compile();
        self.layers[id.0].write_weights(&self.ctx, data);
    }

    /// Overwrite a layer's bias vector.
    pub fn set_bias(&mut self, id: LayerId, data: &[f32]) {
        self.compile();
        self.layers[id.0].write_bias(&self.ctx, data);
    }

    /// Flat size of a layer.
    pub fn layer_size(&self, id: LayerId) -> usize {
        self.layer(id).core.size()
    }

    /// Weight count of a layer (0 until compile resolves it).
    pub fn layer_weight_count(&self, id: LayerId) -> usize {
        self.layer(id).core.weight_count
    }

    /// Loss of the most recent backward pass.
    pub fn get_loss(&self) -> f32 {
        self.loss
    }

    /// Exponentially smoothed loss, `0.99·avg + 0.01·loss`, seeded by the
    /// first observation.
    pub fn get_average_loss(&self) -> f32 {
        self.avg_loss
    }

    /// The derived propagation order; valid only after compile.
    pub fn propagation_order(&self) -> &[LayerId] {
        assert!(self.compiled, "propagation order before compile");
        &self.order
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        for layer in &mut self.layers {
            layer.release();
        }
    }
}

fn smooth_loss(avg: f32, loss: f32) -> f32 {
    if avg < 0.0 {
        loss
    } else {
        0.99 * avg + 0.01 * loss
    }
}

#[cfg(test)]
mod tests {
    use super::smooth_loss;

    #[test]
    fn first_loss_seeds_the_average() {
        assert_eq!(smooth_loss(-1.0, 0.5), 0.5);
    }

    #[test]
    fn later_losses_are_smoothed() {
        let l0 = 0.5;
        let l1 = 0.1;
        let avg = smooth_loss(smooth_loss(-1.0, l0), l1);
        assert!((avg - (0.99 * l0 + 0.01 * l1)).abs() < 1e-7);
    }

    #[test]
    fn hyper_defaults_are_in_range() {
        let h = super::Hyper::default();
        assert!((0.0..=1.0).contains(&h.rate));
        assert!((0.0..=1.0).contains(&h.momentum));
        assert!((0.0..=1.0).contains(&h.decay));
    }
}
