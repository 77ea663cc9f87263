//! WGSL Kernel Sources
//!
//! Every compute kernel shipped by the engine lives here as named WGSL text.
//! Layer programs are assembled at compile time from three pieces: generated
//! `const` option lines (shape parameters), an activation source fragment, and
//! one of the kernel files below. The `Context` reads them through [`lookup`].

/// Resolve a kernel source file by name. Unknown names are a programming
/// defect, not a runtime condition.
pub(crate) fn lookup(name: &str) -> &'static str {
    match name {
        "common" => COMMON_WGSL,
        "dense" => DENSE_WGSL,
        "conv" => CONV_WGSL,
        "output" => OUTPUT_WGSL,
        "act_linear" => ACT_LINEAR_WGSL,
        "act_relu" => ACT_RELU_WGSL,
        "act_leaky_relu" => ACT_LEAKY_RELU_WGSL,
        "act_sigmoid" => ACT_SIGMOID_WGSL,
        "act_tanh" => ACT_TANH_WGSL,
        _ => panic!("no kernel source named '{}'", name),
    }
}

// ============================================================================
// ACTIVATION FRAGMENTS
// ============================================================================
// Each fragment defines `activation(x)` and `activation_prime(x, y)` where `x`
// is the pre-activation sum and `y` the post-activation value. The derivative
// is written to the layer's derivative buffer during the forward pass.

const ACT_LINEAR_WGSL: &str = r#"
fn activation(x: f32) -> f32 { return x; }
fn activation_prime(x: f32, y: f32) -> f32 { return 1.0; }
"#;

const ACT_RELU_WGSL: &str = r#"
fn activation(x: f32) -> f32 { return max(0.0, x); }
fn activation_prime(x: f32, y: f32) -> f32 { return select(0.0, 1.0, x > 0.0); }
"#;

const ACT_LEAKY_RELU_WGSL: &str = r#"
fn activation(x: f32) -> f32 { return select(0.01 * x, x, x > 0.0); }
fn activation_prime(x: f32, y: f32) -> f32 { return select(0.01, 1.0, x > 0.0); }
"#;

const ACT_SIGMOID_WGSL: &str = r#"
fn activation(x: f32) -> f32 { return 1.0 / (1.0 + exp(-x)); }
fn activation_prime(x: f32, y: f32) -> f32 { return y * (1.0 - y); }
"#;

const ACT_TANH_WGSL: &str = r#"
fn activation(x: f32) -> f32 { return tanh(x); }
fn activation_prime(x: f32, y: f32) -> f32 { return 1.0 - y * y; }
"#;

// ============================================================================
// COMMON KERNELS
// ============================================================================
// Shape-independent utilities shared by every layer: the device-side pattern
// fill and the elementwise gradient derivation. Built once per context.

const COMMON_WGSL: &str = r#"
// --- Pattern fill ---
// Writes `fill_src` repeated across the first `total_words` words of the
// destination without any host-side loop.

struct FillParams {
    total_words: u32,
    pattern_words: u32,
    _pad0: u32,
    _pad1: u32,
}

@group(0) @binding(0) var<storage, read> fill_src: array<u32>;
@group(0) @binding(1) var<storage, read_write> fill_dst: array<u32>;
@group(0) @binding(2) var<uniform> fill_params: FillParams;

@compute @workgroup_size(64)
fn fill_pattern(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i >= fill_params.total_words) { return; }
    fill_dst[i] = fill_src[i % fill_params.pattern_words];
}

// --- Gradient derivation ---
// gradient[i] holds the error accumulated from successor layers; scale it by
// the activation derivative captured during the forward pass.

@group(0) @binding(0) var<storage, read> dg_derivative: array<f32>;
@group(0) @binding(1) var<storage, read_write> dg_gradient: array<f32>;

@compute @workgroup_size(64)
fn derive_gradient(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i >= arrayLength(&dg_gradient)) { return; }
    dg_gradient[i] = dg_gradient[i] * dg_derivative[i];
}
"#;

// ============================================================================
// DENSE (FULLY-CONNECTED) KERNELS
// ============================================================================
// Compiled per layer with options: SIZE, PREV_SIZE. Weight layout is row-major
// [output][input].

const DENSE_WGSL: &str = r#"
struct Hyper {
    rate: f32,
    momentum: f32,
    decay: f32,
    _pad: f32,
}

// --- Forward ---
@group(0) @binding(0) var<storage, read> fw_prev_value: array<f32>;
@group(0) @binding(1) var<storage, read> fw_weight: array<f32>;
@group(0) @binding(2) var<storage, read> fw_bias: array<f32>;
@group(0) @binding(3) var<storage, read_write> fw_value: array<f32>;
@group(0) @binding(4) var<storage, read_write> fw_derivative: array<f32>;

@compute @workgroup_size(64)
fn dense_forward(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i >= SIZE) { return; }
    let row = i * PREV_SIZE;
    var sum = fw_bias[i];
    for (var j = 0u; j < PREV_SIZE; j = j + 1u) {
        sum = sum + fw_weight[row + j] * fw_prev_value[j];
    }
    let y = activation(sum);
    fw_value[i] = y;
    fw_derivative[i] = activation_prime(sum, y);
}

// --- Weight update + error propagation ---
// One invocation per predecessor unit j, so every weight column and every
// prev_gradient cell is written by exactly one invocation.

@group(0) @binding(0) var<storage, read> uw_gradient: array<f32>;
@group(0) @binding(1) var<storage, read> uw_prev_value: array<f32>;
@group(0) @binding(2) var<storage, read_write> uw_weight: array<f32>;
@group(0) @binding(3) var<storage, read_write> uw_delta: array<f32>;
@group(0) @binding(4) var<storage, read_write> uw_prev_gradient: array<f32>;
@group(0) @binding(5) var<uniform> uw_hyper: Hyper;

@compute @workgroup_size(64)
fn dense_update_weights(@builtin(global_invocation_id) gid: vec3<u32>) {
    let j = gid.x;
    if (j >= PREV_SIZE) { return; }
    let x = uw_prev_value[j];
    var acc = 0.0;
    for (var i = 0u; i < SIZE; i = i + 1u) {
        let idx = i * PREV_SIZE + j;
        let g = uw_gradient[i];
        let d = uw_hyper.momentum * uw_delta[idx]
            + (1.0 - uw_hyper.momentum) * uw_hyper.rate * g * x;
        let w = uw_weight[idx] * uw_hyper.decay + d;
        uw_weight[idx] = w;
        uw_delta[idx] = d;
        acc = acc + g * w;
    }
    uw_prev_gradient[j] = uw_prev_gradient[j] + acc;
}

// --- Bias update ---
// Same momentum rule with an implicit input of 1. Decay applies to weights
// only.

@group(0) @binding(0) var<storage, read> ub_gradient: array<f32>;
@group(0) @binding(1) var<storage, read_write> ub_bias: array<f32>;
@group(0) @binding(2) var<storage, read_write> ub_delta: array<f32>;
@group(0) @binding(3) var<uniform> ub_hyper: Hyper;

@compute @workgroup_size(64)
fn dense_update_bias(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i >= SIZE) { return; }
    let d = ub_hyper.momentum * ub_delta[i]
        + (1.0 - ub_hyper.momentum) * ub_hyper.rate * ub_gradient[i];
    ub_bias[i] = ub_bias[i] + d;
    ub_delta[i] = d;
}
"#;

// ============================================================================
// CONVOLUTION KERNELS
// ============================================================================
// Compiled per layer with options: OUT_W, OUT_H, FILTERS, PREV_W, PREV_H,
// PREV_D, KW, KH, X_SHIFT, Y_SHIFT. Value buffers are channel-interleaved
// ((y*W + x)*D + d); weights are laid out [filter][ky][kx][prev_depth].
// Window cells outside the input extent read zero.

const CONV_WGSL: &str = r#"
struct Hyper {
    rate: f32,
    momentum: f32,
    decay: f32,
    _pad: f32,
}

// --- Forward ---
@group(0) @binding(0) var<storage, read> fw_prev_value: array<f32>;
@group(0) @binding(1) var<storage, read> fw_weight: array<f32>;
@group(0) @binding(2) var<storage, read_write> fw_value: array<f32>;
@group(0) @binding(3) var<storage, read_write> fw_derivative: array<f32>;

@compute @workgroup_size(64)
fn conv_forward(@builtin(global_invocation_id) gid: vec3<u32>) {
    let o = gid.x;
    if (o >= OUT_W * OUT_H * FILTERS) { return; }
    let f = o % FILTERS;
    let xy = o / FILTERS;
    let x = xy % OUT_W;
    let y = xy / OUT_W;

    var sum = 0.0;
    for (var ky = 0u; ky < KH; ky = ky + 1u) {
        let py = i32(y) + i32(ky) + Y_SHIFT;
        for (var kx = 0u; kx < KW; kx = kx + 1u) {
            let px = i32(x) + i32(kx) + X_SHIFT;
            let inside = px >= 0 && px < i32(PREV_W) && py >= 0 && py < i32(PREV_H);
            for (var d = 0u; d < PREV_D; d = d + 1u) {
                let w = fw_weight[((f * KH + ky) * KW + kx) * PREV_D + d];
                var v = 0.0;
                if (inside) {
                    v = fw_prev_value[(u32(py) * PREV_W + u32(px)) * PREV_D + d];
                }
                sum = sum + w * v;
            }
        }
    }
    let yv = activation(sum);
    fw_value[o] = yv;
    fw_derivative[o] = activation_prime(sum, yv);
}

// --- Error propagation (transpose of the forward map) ---
// One invocation per predecessor cell; sums every output position whose
// receptive window covers it.

@group(0) @binding(0) var<storage, read> bp_gradient: array<f32>;
@group(0) @binding(1) var<storage, read> bp_weight: array<f32>;
@group(0) @binding(2) var<storage, read_write> bp_prev_gradient: array<f32>;

@compute @workgroup_size(64)
fn conv_backprop(@builtin(global_invocation_id) gid: vec3<u32>) {
    let j = gid.x;
    if (j >= PREV_W * PREV_H * PREV_D) { return; }
    let d = j % PREV_D;
    let xy = j / PREV_D;
    let px = xy % PREV_W;
    let py = xy / PREV_W;

    var acc = 0.0;
    for (var ky = 0u; ky < KH; ky = ky + 1u) {
        let y = i32(py) - i32(ky) - Y_SHIFT;
        if (y < 0 || y >= i32(OUT_H)) { continue; }
        for (var kx = 0u; kx < KW; kx = kx + 1u) {
            let x = i32(px) - i32(kx) - X_SHIFT;
            if (x < 0 || x >= i32(OUT_W)) { continue; }
            for (var f = 0u; f < FILTERS; f = f + 1u) {
                let g = bp_gradient[(u32(y) * OUT_W + u32(x)) * FILTERS + f];
                let w = bp_weight[((f * KH + ky) * KW + kx) * PREV_D + d];
                acc = acc + g * w;
            }
        }
    }
    bp_prev_gradient[j] = bp_prev_gradient[j] + acc;
}

// --- Weight update ---
// One invocation per weight; accumulates the gradient over the whole output
// plane, then applies the momentum/decay rule.

@group(0) @binding(0) var<storage, read> uw_gradient: array<f32>;
@group(0) @binding(1) var<storage, read> uw_prev_value: array<f32>;
@group(0) @binding(2) var<storage, read_write> uw_weight: array<f32>;
@group(0) @binding(3) var<storage, read_write> uw_delta: array<f32>;
@group(0) @binding(4) var<uniform> uw_hyper: Hyper;

@compute @workgroup_size(64)
fn conv_update_weights(@builtin(global_invocation_id) gid: vec3<u32>) {
    let wi = gid.x;
    if (wi >= KW * KH * PREV_D * FILTERS) { return; }
    let d = wi % PREV_D;
    var r = wi / PREV_D;
    let kx = r % KW;
    r = r / KW;
    let ky = r % KH;
    let f = r / KH;

    var acc = 0.0;
    for (var y = 0u; y < OUT_H; y = y + 1u) {
        let py = i32(y) + i32(ky) + Y_SHIFT;
        if (py < 0 || py >= i32(PREV_H)) { continue; }
        for (var x = 0u; x < OUT_W; x = x + 1u) {
            let px = i32(x) + i32(kx) + X_SHIFT;
            if (px < 0 || px >= i32(PREV_W)) { continue; }
            let g = uw_gradient[(y * OUT_W + x) * FILTERS + f];
            let v = uw_prev_value[(u32(py) * PREV_W + u32(px)) * PREV_D + d];
            acc = acc + g * v;
        }
    }
    let dnew = uw_hyper.momentum * uw_delta[wi]
        + (1.0 - uw_hyper.momentum) * uw_hyper.rate * acc;
    uw_weight[wi] = uw_weight[wi] * uw_hyper.decay + dnew;
    uw_delta[wi] = dnew;
}
"#;

// ============================================================================
// OUTPUT (LOSS) KERNELS
// ============================================================================
// Compiled per layer with option: SIZE. The value binding is the predecessor's
// value buffer (the output layer computes no values of its own).

const OUTPUT_WGSL: &str = r#"
// --- Error seed ---
@group(0) @binding(0) var<storage, read> ob_truth: array<f32>;
@group(0) @binding(1) var<storage, read> ob_value: array<f32>;
@group(0) @binding(2) var<storage, read_write> ob_prev_gradient: array<f32>;

@compute @workgroup_size(64)
fn output_backward(@builtin(global_invocation_id) gid: vec3<u32>) {
    let i = gid.x;
    if (i >= SIZE) { return; }
    ob_prev_gradient[i] = ob_truth[i] - ob_value[i];
}

// --- Squared-error reduction ---
// Single workgroup: strided partial sums, then a shared-memory tree reduce
// into the one-element loss buffer.

@group(0) @binding(0) var<storage, read> ol_truth: array<f32>;
@group(0) @binding(1) var<storage, read> ol_value: array<f32>;
@group(0) @binding(2) var<storage, read_write> ol_loss: array<f32>;

var<workgroup> ol_scratch: array<f32, 64>;

@compute @workgroup_size(64)
fn output_loss(@builtin(local_invocation_id) lid: vec3<u32>) {
    var sum = 0.0;
    for (var i = lid.x; i < SIZE; i = i + 64u) {
        let e = ol_truth[i] - ol_value[i];
        sum = sum + e * e;
    }
    ol_scratch[lid.x] = sum;
    workgroupBarrier();
    for (var stride = 32u; stride > 0u; stride = stride / 2u) {
        if (lid.x < stride) {
            ol_scratch[lid.x] = ol_scratch[lid.x] + ol_scratch[lid.x + stride];
        }
        workgroupBarrier();
    }
    if (lid.x == 0u) {
        ol_loss[0] = ol_scratch[0];
    }
}
"#;

#[cfg(test)]
mod tests {
    use super::lookup;

    #[test]
    fn registry_resolves_all_kernel_files() {
        for name in ["common", "dense", "conv", "output"] {
            assert!(lookup(name).contains("@compute"), "{} has no entry point", name);
        }
    }

    #[test]
    fn activation_fragments_define_both_functions() {
        for name in ["act_linear", "act_relu", "act_leaky_relu", "act_sigmoid", "act_tanh"] {
            let src = lookup(name);
            assert!(src.contains("fn activation("));
            assert!(src.contains("fn activation_prime("));
        }
    }

    #[test]
    #[should_panic(expected = "no kernel source")]
    fn unknown_source_is_fatal() {
        lookup("does_not_exist");
    }
}
