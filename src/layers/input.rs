//! Input Layer
//!
//! Holds externally supplied values; no kernels. The gradient buffer exists
//! so that a dependent layer can propagate error into it without branching.

use crate::context::Context;

use super::LayerCore;

pub(super) struct InputState;

impl InputState {
    pub fn new() -> Self {
        Self
    }

    pub fn compile(&mut self, core: &mut LayerCore, ctx: &Context) {
        let size = core.size();
        assert!(size > 0, "input layer '{}' has an empty shape", core.label);
        core.value = Some(ctx.create_storage_buffer(&format!("{} value", core.label), size));
        core.gradient = Some(ctx.create_storage_buffer(&format!("{} gradient", core.label), size));
        core.compiled = true;
    }

    pub fn release(&mut self) {}

    /// Queue-ordered write of host floats into the value buffer. The write
    /// is staged before any later dispatch, so no explicit wait is needed.
    pub fn set_data(&mut self, core: &mut LayerCore, ctx: &Context, data: &[f32]) {
        assert!(core.compiled, "set_data before compile");
        assert_eq!(
            data.len(),
            core.size(),
            "input data length {} does not match layer size {}",
            data.len(),
            core.size()
        );
        ctx.write_buffer(core.value.as_ref().unwrap(), data);
    }
}
