//! Output (Loss) Layer
//!
//! Mirrors its predecessor's shape and aliases its value buffer — forward
//! performs no computation. Backward seeds the predecessor's gradient with
//! `truth − value` and reduces the squared error into a one-element loss
//! buffer that is read back synchronously.

use std::sync::Arc;

use wgpu::{BindGroup, Buffer};

use crate::context::{Context, Kernel, Program};

use super::{LayerCore, PrevView};

pub(super) struct OutputState {
    program: Option<Program>,
    backward_kernel: Option<Kernel>,
    loss_kernel: Option<Kernel>,
    backward_bind: Option<BindGroup>,
    loss_bind: Option<BindGroup>,
    truth: Option<Arc<Buffer>>,
    loss: Option<Arc<Buffer>>,
}

impl OutputState {
    pub fn new() -> Self {
        Self {
            program: None,
            backward_kernel: None,
            loss_kernel: None,
            backward_bind: None,
            loss_bind: None,
            truth: None,
            loss: None,
        }
    }

    pub fn compile(&mut self, core: &mut LayerCore, ctx: &Context, prev: Option<&PrevView>) {
        let prev = prev
            .unwrap_or_else(|| panic!("output layer '{}' has no predecessor", core.label));
        core.shape = prev.shape;
        let size = core.size();
        assert!(size > 0, "output layer '{}' mirrors an empty shape", core.label);

        // Non-owning alias: the output layer reads the predecessor's values
        // in place and must never free this buffer.
        core.value = Some(prev.value.clone());

        let label = core.label.clone();
        let truth = ctx.create_storage_buffer(&format!("{label} truth"), size);
        let loss = ctx.create_storage_buffer_init(&format!("{label} loss"), &[0.0]);

        ctx.begin_program(&label);
        ctx.add_option(format!("const SIZE: u32 = {}u;", size));
        ctx.add_source_file("output");
        let program = ctx.build_program();

        let backward = ctx.get_kernel(&program, "output_backward");
        let loss_kernel = ctx.get_kernel(&program, "output_loss");

        self.backward_bind = Some(ctx.bind_group(
            &format!("{label} backward"),
            &backward,
            &[&truth, core.value.as_ref().unwrap(), &prev.gradient],
        ));
        self.loss_bind = Some(ctx.bind_group(
            &format!("{label} loss"),
            &loss_kernel,
            &[&truth, core.value.as_ref().unwrap(), &loss],
        ));

        self.truth = Some(truth);
        self.loss = Some(loss);
        self.backward_kernel = Some(backward);
        self.loss_kernel = Some(loss_kernel);
        self.program = Some(program);
        core.compiled = true;
    }

    /// Write target values and wait for residency. The explicit wait is the
    /// synchronization point the backward pass relies on.
    pub fn set_truth(&mut self, core: &mut LayerCore, ctx: &Context, data: &[f32]) {
        assert!(core.compiled, "set_truth before compile");
        assert_eq!(
            data.len(),
            core.size(),
            "truth length {} does not match layer size {}",
            data.len(),
            core.size()
        );
        ctx.write_buffer(self.truth.as_ref().unwrap(), data);
        core.backward_barrier = ctx.flush_and_wait();
    }

    /// Seed the predecessor's gradient with `truth − value`, reduce the
    /// squared error, and return it.
    pub fn backward(&mut self, core: &mut LayerCore, ctx: &Context) -> f32 {
        ctx.dispatch(
            self.backward_kernel.as_ref().unwrap(),
            self.backward_bind.as_ref().unwrap(),
            core.size() as u32,
        );
        // Single-workgroup reduction; the work-item count only has to cover
        // one group.
        core.backward_barrier = ctx.dispatch(
            self.loss_kernel.as_ref().unwrap(),
            self.loss_bind.as_ref().unwrap(),
            1,
        );
        core.backward_barrier.wait(ctx);
        ctx.read_buffer(self.loss.as_ref().unwrap(), 0, 1)[0]
    }

    pub fn release(&mut self) {
        *self = Self::new();
    }
}
