//! Dense (Fully-Connected) Layer
//!
//! `value[i] = act(bias[i] + Σ_j weight[i,j] · prev.value[j])`, with the
//! activation derivative captured in the same pass. Backward runs three
//! dispatches: derive the gradient, update weights while propagating error to
//! the predecessor, update the bias. Weights and biases learn through the
//! gradient-descent-with-momentum rule; the effective step is
//! `rate · (1 − momentum)`, so rate and momentum act as one exponentially
//! weighted moving average of gradients.

use std::sync::Arc;

use wgpu::{BindGroup, Buffer};

use crate::context::{Context, Kernel, Program};
use crate::network::Hyper;

use super::{HyperUniform, LayerCore, PrevView};

/// `prev.size * size` coefficients, row-major `[output][input]`.
pub(super) fn weight_count(prev_size: usize, size: usize) -> usize {
    prev_size * size
}

/// Zero-mean Gaussian draws scaled by `sqrt(2 / fan_in)`, via Box-Muller from
/// two independent uniform draws. Variance-preserving for the ReLU family.
pub(super) fn gaussian_weights(count: usize, fan_in: usize) -> Vec<f32> {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let scale = (2.0 / fan_in as f32).sqrt();
    (0..count)
        .map(|_| {
            let u1: f32 = rng.gen();
            let u2: f32 = rng.gen();
            scale * (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
        })
        .collect()
}

pub(super) struct DenseState {
    prev_size: usize,
    program: Option<Program>,
    forward_kernel: Option<Kernel>,
    derive_kernel: Option<Kernel>,
    update_weights_kernel: Option<Kernel>,
    update_bias_kernel: Option<Kernel>,
    forward_bind: Option<BindGroup>,
    derive_bind: Option<BindGroup>,
    update_weights_bind: Option<BindGroup>,
    update_bias_bind: Option<BindGroup>,
    hyper: Option<Arc<Buffer>>,
}

impl DenseState {
    pub fn new() -> Self {
        Self {
            prev_size: 0,
            program: None,
            forward_kernel: None,
            derive_kernel: None,
            update_weights_kernel: None,
            update_bias_kernel: None,
            forward_bind: None,
            derive_bind: None,
            update_weights_bind: None,
            update_bias_bind: None,
            hyper: None,
        }
    }

    pub fn compile(&mut self, core: &mut LayerCore, ctx: &Context, prev: Option<&PrevView>) {
        let prev = prev.unwrap_or_else(|| {
            panic!("dense layer '{}' has no predecessor", core.label)
        });
        let size = core.size();
        let prev_size = prev.shape.size();
        assert!(size > 0 && prev_size > 0, "malformed dense shape");
        self.prev_size = prev_size;
        core.weight_count = weight_count(prev_size, size);

        let label = core.label.clone();
        core.value = Some(ctx.create_storage_buffer(&format!("{label} value"), size));
        core.derivative = Some(ctx.create_storage_buffer(&format!("{label} derivative"), size));
        core.gradient = Some(ctx.create_storage_buffer(&format!("{label} gradient"), size));
        core.bias = Some(ctx.create_storage_buffer_init(&format!("{label} bias"), &vec![0.0; size]));
        core.bias_delta =
            Some(ctx.create_storage_buffer_init(&format!("{label} bias delta"), &vec![0.0; size]));
        core.weight = Some(ctx.create_storage_buffer_init(
            &format!("{label} weight"),
            &gaussian_weights(core.weight_count, prev_size),
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
        ctx.add_option(format!("const SIZE: u32 = {}u;", size));
        ctx.add_option(format!("const PREV_SIZE: u32 = {}u;", prev_size));
        ctx.add_activation_source(core.activation);
        ctx.add_source_file("dense");
        let program = ctx.build_program();

        let forward = ctx.get_kernel(&program, "dense_forward");
        let derive = ctx.derive_gradient_kernel();
        let update_weights = ctx.get_kernel(&program, "dense_update_weights");
        let update_bias = ctx.get_kernel(&program, "dense_update_bias");

        self.forward_bind = Some(ctx.bind_group(
            &format!("{label} forward"),
            &forward,
            &[
                &prev.value,
                core.weight.as_ref().unwrap(),
                core.bias.as_ref().unwrap(),
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
        self.update_weights_bind = Some(ctx.bind_group(
            &format!("{label} update weights"),
            &update_weights,
            &[
                core.gradient.as_ref().unwrap(),
                &prev.value,
                core.weight.as_ref().unwrap(),
                core.weight_delta.as_ref().unwrap(),
                &prev.gradient,
                self.hyper.as_ref().unwrap(),
            ],
        ));
        self.update_bias_bind = Some(ctx.bind_group(
            &format!("{label} update bias"),
            &update_bias,
            &[
                core.gradient.as_ref().unwrap(),
                core.bias.as_ref().unwrap(),
                core.bias_delta.as_ref().unwrap(),
                self.hyper.as_ref().unwrap(),
            ],
        ));

        self.forward_kernel = Some(forward);
        self.derive_kernel = Some(derive);
        self.update_weights_kernel = Some(update_weights);
        self.update_bias_kernel = Some(update_bias);
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
        ctx.dispatch(
            self.update_weights_kernel.as_ref().unwrap(),
            self.update_weights_bind.as_ref().unwrap(),
            self.prev_size as u32,
        );
        core.backward_barrier = ctx.dispatch(
            self.update_bias_kernel.as_ref().unwrap(),
            self.update_bias_bind.as_ref().unwrap(),
            core.size() as u32,
        );
    }

    pub fn release(&mut self) {
        *self = Self::new();
    }
}
