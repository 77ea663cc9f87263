//! End-to-end engine tests against a real device.
//!
//! Every test probes for an adapter first and skips with a notice when the
//! host has none, so the suite stays green on headless CI machines.

use std::sync::Arc;

use synapse::prelude::*;

fn context() -> Option<Arc<Context>> {
    let _ = env_logger::builder().is_test(true).try_init();
    match Context::try_new() {
        Some(ctx) => Some(Arc::new(ctx)),
        None => {
            eprintln!("no GPU adapter available, skipping");
            None
        }
    }
}

/// input(2) -> dense(1, linear) -> output, with injected weights.
fn unit_dense_net(ctx: Arc<Context>) -> (Network, LayerId, LayerId, LayerId) {
    let mut net = Network::new(ctx);
    let input = net.create_input(2, 1, 1);
    let dense = net.create_dense(1, 1, 1, Activation::Linear);
    let output = net.create_output();
    net.connect(input, dense);
    net.connect(dense, output);
    net.compile();
    net.set_weights(dense, &[1.0, 1.0]);
    net.set_bias(dense, &[0.0]);
    (net, input, dense, output)
}

#[test]
fn dense_forward_matches_hand_computation() {
    let Some(ctx) = context() else { return };
    let (mut net, input, dense, _) = unit_dense_net(ctx);

    net.set_input_data(input, &[1.0, 0.0]);
    net.forward();
    assert_eq!(net.get_data(dense), vec![1.0]);

    net.set_input_data(input, &[1.0, 1.0]);
    net.forward();
    assert_eq!(net.get_data(dense), vec![2.0]);
}

#[test]
fn output_loss_and_error_seed() {
    let Some(ctx) = context() else { return };
    let mut net = Network::new(ctx);
    let input = net.create_input(1, 1, 1);
    let dense = net.create_dense(1, 1, 1, Activation::Linear);
    let output = net.create_output();
    net.connect(input, dense);
    net.connect(dense, output);
    net.compile();

    // Freeze learning so backward only computes error and loss.
    net.set_rate(0.0);
    net.set_momentum(0.0);
    net.set_weights(dense, &[0.6]);
    net.set_bias(dense, &[0.0]);

    net.set_input_data(input, &[1.0]);
    net.set_truth(output, &[1.0]);
    net.forward();
    net.backward();

    // value 0.6, truth 1.0 -> error 0.4, squared loss 0.16
    assert!((net.get_loss() - 0.16).abs() < 1e-6);
    let grad = net.get_gradient(input);
    // dense propagates error * weight into its predecessor
    assert!((grad[0] - 0.4 * 0.6).abs() < 1e-6);
}

#[test]
fn single_weight_backward_update() {
    let Some(ctx) = context() else { return };
    let mut net = Network::new(ctx);
    let input = net.create_input(1, 1, 1);
    let dense = net.create_dense(1, 1, 1, Activation::Linear);
    let output = net.create_output();
    net.connect(input, dense);
    net.connect(dense, output);
    net.compile();

    net.set_rate(1.0);
    net.set_momentum(0.0);
    net.set_decay(1.0);
    net.set_weights(dense, &[0.0]);
    net.set_bias(dense, &[0.0]);

    // weight 0, input 1 -> value 0; truth 1 -> gradient 1
    net.set_input_data(input, &[1.0]);
    net.set_truth(output, &[1.0]);
    net.forward();
    net.backward();

    // delta = (1 - momentum) * rate * gradient * input = 1, weight += delta
    // prev gradient sees the post-update weight: 1 * 1
    let grad = net.get_gradient(input);
    assert!((grad[0] - 1.0).abs() < 1e-6);

    // The bias follows the same rule without the input term, so it also
    // stepped to 1. Second forward: value = 1*1 + 1 = 2, error -1, loss 1.
    net.forward();
    net.backward();
    assert!((net.get_loss() - 1.0).abs() < 1e-6);
}

#[test]
fn compile_is_idempotent() {
    let Some(ctx) = context() else { return };
    let (mut net, input, dense, _) = unit_dense_net(ctx);

    net.set_input_data(input, &[0.5, 0.25]);
    net.forward();
    let before = net.get_data(dense);

    // A second compile must not reallocate: injected weights and computed
    // values survive.
    net.compile();
    assert_eq!(net.get_data(dense), before);
    assert_eq!(net.layer_weight_count(dense), 2);
}

#[test]
fn average_loss_smoothing() {
    let Some(ctx) = context() else { return };
    let (mut net, input, _, output) = unit_dense_net(ctx);
    net.set_rate(0.0);
    net.set_momentum(0.0);

    net.set_input_data(input, &[1.0, 0.0]);
    net.set_truth(output, &[0.0]);
    net.forward();
    net.backward();
    let l0 = net.get_loss();
    assert_eq!(net.get_average_loss(), l0);

    net.set_truth(output, &[1.0]);
    net.forward();
    net.backward();
    let l1 = net.get_loss();
    assert!((net.get_average_loss() - (0.99 * l0 + 0.01 * l1)).abs() < 1e-6);
}

#[test]
fn conv_forward_identity_bank_averages_window() {
    let Some(ctx) = context() else { return };
    let mut net = Network::new(ctx);
    let input = net.create_input(3, 3, 1);
    let conv = net.create_conv(1, 1, Activation::Linear, ConvInit::Identity);
    let output = net.create_output();
    net.connect(input, conv);
    net.connect(conv, output);
    net.compile();

    assert_eq!(net.layer_size(conv), 9);
    assert_eq!(net.layer_weight_count(conv), 9);

    net.set_input_data(input, &[1.0; 9]);
    net.forward();
    let values = net.get_data(conv);

    // 1/9 box filter over an all-ones plane: the center cell sees the full
    // window, the corners only 4 of 9 cells.
    assert!((values[4] - 1.0).abs() < 1e-5);
    assert!((values[0] - 4.0 / 9.0).abs() < 1e-5);
}

#[test]
fn conv_gradient_matches_finite_differences() {
    let Some(ctx) = context() else { return };
    let mut net = Network::new(ctx);
    let input = net.create_input(4, 4, 1);
    let conv = net.create_conv(1, 2, Activation::Tanh, ConvInit::Gaussian);
    let output = net.create_output();
    net.connect(input, conv);
    net.connect(conv, output);
    net.compile();

    // Freeze learning so repeated passes keep the same weights.
    net.set_rate(0.0);
    net.set_momentum(0.0);

    let mut data = vec![0.0f32; 16];
    for (i, v) in data.iter_mut().enumerate() {
        *v = (i as f32 * 0.37).sin();
    }
    let truth = vec![0.25f32; 32];
    net.set_truth(output, &truth);

    net.set_input_data(input, &data);
    net.forward();
    net.backward();
    let analytic = net.get_gradient(input);

    // With error defined as truth - value and loss as sum of squared errors,
    // dLoss/dx = -2 * gradient.
    let eps = 1e-3;
    for &idx in &[0usize, 5, 10, 15] {
        let mut plus = data.clone();
        plus[idx] += eps;
        net.set_input_data(input, &plus);
        net.forward();
        net.backward();
        let loss_plus = net.get_loss();

        let mut minus = data.clone();
        minus[idx] -= eps;
        net.set_input_data(input, &minus);
        net.forward();
        net.backward();
        let loss_minus = net.get_loss();

        let numeric = (loss_plus - loss_minus) / (2.0 * eps);
        let expected = -2.0 * analytic[idx];
        assert!(
            (numeric - expected).abs() < 1e-2,
            "gradient mismatch at {}: numeric {} vs analytic {}",
            idx,
            numeric,
            expected
        );
    }
}

#[test]
fn training_reduces_loss_on_xor() {
    let Some(ctx) = context() else { return };
    let mut net = Network::new(ctx);
    let input = net.create_input(2, 1, 1);
    let hidden = net.create_dense(8, 1, 1, Activation::Tanh);
    let logits = net.create_dense(1, 1, 1, Activation::Sigmoid);
    let output = net.create_output();
    net.connect(input, hidden);
    net.connect(hidden, logits);
    net.connect(logits, output);

    net.set_rate(0.5);
    net.set_momentum(0.5);
    net.set_decay(1.0);

    let samples: [([f32; 2], [f32; 1]); 4] = [
        ([0.0, 0.0], [0.0]),
        ([0.0, 1.0], [1.0]),
        ([1.0, 0.0], [1.0]),
        ([1.0, 1.0], [0.0]),
    ];

    let epoch_loss = |net: &mut Network| -> f32 {
        let mut total = 0.0;
        for (x, y) in &samples {
            net.set_input_data(input, x);
            net.set_truth(output, y);
            net.forward();
            net.backward();
            total += net.get_loss();
        }
        total
    };

    let initial = epoch_loss(&mut net);
    for _ in 0..500 {
        epoch_loss(&mut net);
    }
    let trained = epoch_loss(&mut net);

    assert!(
        trained < initial * 0.5,
        "loss failed to improve: {} -> {}",
        initial,
        trained
    );
    assert!(net.get_average_loss().is_finite());
}

#[test]
fn pattern_fill_repeats_pattern() {
    let Some(ctx) = context() else { return };

    // 16-byte destination, 4-byte pattern -> pattern written 4 times.
    let buffer = ctx_storage(&ctx, 4);
    let pattern = 7.5f32.to_ne_bytes();
    ctx.fill_pattern(&buffer, 16, &pattern).wait(&ctx);
    // Readback through a throwaway network-free path.
    let values = read_back(&ctx, &buffer, 4);
    assert_eq!(values, vec![7.5; 4]);
}

#[test]
fn pattern_fill_rejects_misaligned_total() {
    let Some(ctx) = context() else { return };
    let buffer = ctx_storage(&ctx, 4);
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        ctx.fill_pattern(&buffer, 10, &7.5f32.to_ne_bytes());
    }));
    assert!(result.is_err(), "misaligned fill must panic");
}

// Small helpers so the fill tests can work with raw buffers.

fn ctx_storage(ctx: &Context, len: usize) -> wgpu::Buffer {
    ctx.device().create_buffer(&wgpu::BufferDescriptor {
        label: Some("test buffer"),
        size: (len * 4) as u64,
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn read_back(ctx: &Context, buffer: &wgpu::Buffer, len: usize) -> Vec<f32> {
    ctx.read_buffer(buffer, 0, len)
}
