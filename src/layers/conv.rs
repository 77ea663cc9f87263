//! Convolution Layer
//!
//! Square `K×K` kernel (`K = 2·range + 1`) with `filters` output channels over
//! a plane matching the predecessor's extent. Window cells outside the input
//! read zero. Backward is the transpose of the forward index map, split into
//! race-free dispatches: error propagation per predecessor cell, weight
//! updates per coefficient.

use std::sync::Arc;

use wgpu::{BindGroup, Buffer};

use crate::context::{Context, Kernel, Program};
use crate::network::Hyper;

use super::{dense::gaussian_weights, HyperUniform, LayerCore, PrevView, Shape};

/// `K * K * prev.depth * filters` coefficients, laid out
/// `[filter][ky][kx][prev_depth]`.
pub(super) fn weight_count(k: usize, prev_depth: usize, filters: usize) -> usize {
    k * k * prev_depth * filters
}

/// Weight initialization for a convolution filter bank.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConvInit {
    /// Gaussian with fan-in `K·K·prev.depth`, like the dense initializer.
    #[default]
    Gaussian,
    /// Pass-through bank: `1/K²` where the input channel equals the filter
    /// index, zero elsewhere. Useful when debugging a new graph.
    Identity,
}

pub(super) struct ConvState {
    range: usize,
    filters: usize,
    init: ConvInit,
    prev_size: usize,
    program: Option<Program>,
    forward_kernel: Option<Kernel>,
    derive_kernel: Option<Kernel>,
    backprop_kernel: Option<Kernel>,
    update_weights_kernel: Option<Kernel>,
    forward_bind: Option<BindGroup>,
    derive_bind: Option<BindGroup>,
    backprop_bind: Option<BindGroup>,
    update_weights_bind: Option<BindGroup>,
    hyper: Option<Arc<Buffer>>,
}

impl ConvState {
    pub fn new(range: usize, filters: usize, init: ConvInit) -> Self {
        Self {
            range,
            filters,
            init,
            prev_size: 0,
            program: None,
            forward_kernel: None,
            derive_kernel: None,
            backprop_kernel: None,
            update_weights_kernel: None,
            forward_bind: None,
            derive_bind: None,
            backprop_bind: None,
            update_weights_bind: None,
            hyper: None,
        }
    }

    fn kernel_extent(&self) -> usize {
        2 * self.range + 1
    }

    fn initial_weights(&self, k: usize, prev_depth: usize) -> Vec<f32> {
        let count = weight_count(k, prev_depth, self.filters);
        match self.init {
            ConvInit::Gaussian => gaussian_weights(count, k * k * prev_depth),
            ConvInit::Identity => {
                let cell = 1.0 / (k * k) as f32;
                let mut weights = vec![0.0; count];
                for f in 0..self.filters {
                    for ky in 0..k {
                        for kx in 0..k {
                            if f < prev_depth {
                                weights[((f * k + ky) * k + kx) * prev_depth + f] = cell;
                            }
                        }
                    }
                }
                weights
            }
        }
    }

    pub fn compile(&mut self, core: &mut LayerCore, ctx: &Context, prev: Option<&PrevView>) {
        let prev = prev
            .unwrap_or_else(|| panic!("conv layer '{}' has no predecessor", core.label));
        let k = self.kernel_extent();
        let prev_shape = prev.shape;
        assert!(prev_shape.size() > 0, "malformed conv predecessor shape");

        // The output plane mirrors the predecessor; depth is the filter count.
        core.shape = Shape::new(prev_shape.width, prev_shape.height, self.filters);
        core.weight_count = weight_count(k, prev_shape.depth, self.filters);
        self.prev_size = prev_shape.size();
        let size = core.size();
        let shift = -(self.range as i64);

        let label = core.label.clone();
        core.value = Some(ctx.create_storage_buffer(&format!("{label} value"), size));
        core.derivative = Some(ctx.create_storage_buffer(&format!("{label} derivative"), size));
        core.gradient = Some(ctx.create_storage_buffer(&format!("{label} gradient"), size));
        core.weight = Some(ctx.create_storage_buffer_init(
            &format!("{label} weight"),
            &self.initial_weights(k, prev_shape.depth),
        ));
        core.weight_delta = Some(ctx.create_storage_buffer_init(
            &format!("{label} weight delta"),
            &vec![0.0; core.weight_count],
        ));
        self.hyper = Some(ctx.create_uniform_buffer(
            &format!("{label} hyper"),
            bytemuck::bytes_of(&HyperUniform::from(&Hyper::default())),
        ));

        ctx.begin_program(&label);
        ctx.add_option(format!("const OUT_W: u32 = {}u;", core.shape.width));
        ctx.add_option(format!("const OUT_H: u32 = {}u;", core.shape.height));
        ctx.add_option(format!("const FILTERS: u32 = {}u;", self.filters));
        ctx.add_option(format!("const PREV_W: u32 = {}u;", prev_shape.width));
        ctx.add_option(format!("const PREV_H: u32 = {}u;", prev_shape.height));
        ctx.add_option(format!("const PREV_D: u32 = {}u;", prev_shape.depth));
        ctx.add_option(format!("const KW: u32 = {}u;", k));
        ctx.add_option(format!("const KH: u32 = {}u;", k));
        ctx.add_option(format!("const X_SHIFT: i32 = {};", shift));
        ctx.add_option(format!("const Y_SHIFT: i32 = {};", shift));
        ctx.add_activation_source(core.activation);
        ctx.add_source_file("conv");
        let program = ctx.build_program();

        let forward = ctx.get_kernel(&program, "conv_forward");
        let derive = ctx.derive_gradient_kernel();
        let backprop = ctx.get_kernel(&program, "conv_backprop");
        let update_weights = ctx.get_kernel(&program, "conv_update_weights");

        self.forward_bind = Some(ctx.bind_group(
            &format!("{label} forward"),
            &forward,
            &[
                &prev.value,
                core.weight.as_ref().unwrap(),
                core.value.as_ref().unwrap(),
                core.derivative.as_ref().unwrap(),
            ],
        ));
        self.derive_bind = Some(ctx.bind_group(
            &format!("{label} derive"),
            &derive,
            &[
                core.derivative.as_ref().unwrap(),
                core.gradient.as_ref().unwrap(),
            ],
        ));
        self.backprop_bind = Some(ctx.bind_group(
            &format!("{label} backprop"),
            &backprop,
            &[
                core.gradient.as_ref().unwrap(),
                core.weight.as_ref().unwrap(),
                &prev.gradient,
            ],
        ));
        self.update_weights_bind = Some(ctx.bind_group(
            &format!("{label} update weights"),
            &update_weights,
            &[
                core.gradient.as_ref().unwrap(),
                &prev.value,
                core.weight.as_ref().unwrap(),
                core.weight_delta.as_ref().unwrap(),
                self.hyper.as_ref().unwrap(),
            ],
        ));

        self.forward_kernel = Some(forward);
        self.derive_kernel = Some(derive);
        self.backprop_kernel = Some(backprop);
        self.update_weights_kernel = Some(update_weights);
        self.program = Some(program);
        core.compiled = true;
    }

    pub fn forward(&mut self, core: &mut LayerCore, ctx: &Context) {
        core.forward_barrier = ctx.dispatch(
            self.forward_kernel.as_ref().unwrap(),
            self.forward_bind.as_ref().unwrap(),
            core.size() as u32,
        );
    }

    pub fn backward(&mut self, core: &mut LayerCore, ctx: &Context, hyper: &Hyper) {
        ctx.queue.write_buffer(
            self.hyper.as_ref().unwrap(),
            0,
            bytemuck::bytes_of(&HyperUniform::from(hyper)),
        );
        ctx.dispatch(
            self.derive_kernel.as_ref().unwrap(),
            self.derive_bind.as_ref().unwrap(),
            core.size() as u32,
        );
        // Propagate before updating: the transpose map must see the weights
        // the forward pass used.
        ctx.dispatch(
            self.backprop_kernel.as_ref().unwrap(),
            self.backprop_bind.as_ref().unwrap(),
            self.prev_size as u32,
        );
        core.backward_barrier = ctx.dispatch(
            self.update_weights_kernel.as_ref().unwrap(),
            self.update_weights_bind.as_ref().unwrap(),
            core.weight_count as u32,
        );
    }

    pub fn release(&mut self) {
        let (range, filters, init) = (self.range, self.filters, self.init);
        *self = Self::new(range, filters, init);
    }
}
