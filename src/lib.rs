//! # Synapse - GPU Neural-Network Execution Engine
//!
//! Synapse compiles a hand-declared layer graph into GPU compute kernels and
//! drives forward/backward passes over a single wgpu queue. Kernels are
//! JIT-compiled WGSL, specialized per layer with the shape baked in as
//! constants; device operations overlap through queue ordering, with explicit
//! barriers only at host readback points.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use synapse::prelude::*;
//! use std::sync::Arc;
//!
//! let ctx = Arc::new(Context::new());
//! let mut net = Network::new(ctx);
//!
//! let input = net.create_input(2, 1, 1);
//! let hidden = net.create_dense(4, 1, 1, Activation::Tanh);
//! let logits = net.create_dense(1, 1, 1, Activation::Sigmoid);
//! let output = net.create_output();
//! net.connect(input, hidden);
//! net.connect(hidden, logits);
//! net.connect(logits, output);
//!
//! net.set_rate(0.5);
//! net.set_input_data(input, &[1.0, 0.0]);
//! net.set_truth(output, &[1.0]);
//! net.forward();
//! net.backward();
//! println!("loss = {}", net.get_loss());
//! ```

#![warn(missing_docs)]

pub mod context;
pub mod layers;
pub mod network;
pub mod schedule;

mod kernels;

pub use context::{Barrier, Context};
pub use layers::{Activation, ConvInit, LayerId, Shape};
pub use network::{Hyper, Network};

/// Prelude module - import everything you need with `use synapse::prelude::*`
pub mod prelude {
    pub use crate::context::Context;
    pub use crate::layers::{Activation, ConvInit, LayerId, Shape};
    pub use crate::network::Network;
}
