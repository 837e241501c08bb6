//! Metal shader source for the fused optimizer kernels.
//!
//! Every kernel takes the argument table at buffer 0, the packing metadata at
//! buffer 1 and the scalar hyperparameters at buffers 2 to 7. Argument ids
//! follow `role * 32 + slot`, with the step counters as the last role.

/// Fused Adam and AdamW kernels, with and without AMSGrad, over `float` and
/// `half` parameters with `float` step counters.
pub const FUSED_ADAM_SOURCE: &str = r#"
#include <metal_stdlib>
using namespace metal;

constant uint CHUNK_SIZE = 65536;
constant uint MAX_SLOTS = 32;

struct MetadataArguments {
    uint numels[MAX_SLOTS];
    uint threadgroup_to_tensor[MAX_SLOTS];
    uint threadgroup_to_chunk[MAX_SLOTS];
};

template <typename T, typename step_t>
struct AdamArguments {
    metal::array<device T*, MAX_SLOTS> params [[id(0)]];
    metal::array<device T*, MAX_SLOTS> grads [[id(32)]];
    metal::array<device T*, MAX_SLOTS> exp_avgs [[id(64)]];
    metal::array<device T*, MAX_SLOTS> exp_avg_sqs [[id(96)]];
    metal::array<device step_t*, MAX_SLOTS> state_steps [[id(128)]];
};

template <typename T, typename step_t>
struct AdamAmsgradArguments {
    metal::array<device T*, MAX_SLOTS> params [[id(0)]];
    metal::array<device T*, MAX_SLOTS> grads [[id(32)]];
    metal::array<device T*, MAX_SLOTS> exp_avgs [[id(64)]];
    metal::array<device T*, MAX_SLOTS> exp_avg_sqs [[id(96)]];
    metal::array<device T*, MAX_SLOTS> max_exp_avg_sqs [[id(128)]];
    metal::array<device step_t*, MAX_SLOTS> state_steps [[id(160)]];
};

struct AdamScalars {
    float lr;
    float beta1;
    float beta2;
    float weight_decay;
    float eps;
    bool maximize;
};

// Applies weight decay and advances both moments in place.
inline void adam_moments(
    thread float& grad,
    thread float& param,
    thread float& exp_avg,
    thread float& exp_avg_sq,
    const AdamScalars s,
    const bool decoupled
) {
    if (s.maximize) {
        grad = -grad;
    }
    if (s.weight_decay != 0.0f) {
        if (decoupled) {
            param -= s.lr * s.weight_decay * param;
        } else {
            grad += param * s.weight_decay;
        }
    }
    exp_avg = s.beta1 * exp_avg + (1.0f - s.beta1) * grad;
    exp_avg_sq = s.beta2 * exp_avg_sq + (1.0f - s.beta2) * grad * grad;
}

inline float adam_update(
    const float param,
    const float exp_avg,
    const float second_moment,
    const float step,
    const AdamScalars s
) {
    const float bias_correction1 = 1.0f - precise::pow(s.beta1, step);
    const float bias_correction2 = 1.0f - precise::pow(s.beta2, step);
    const float step_size = s.lr / bias_correction1;
    const float denom = precise::sqrt(second_moment) / precise::sqrt(bias_correction2) + s.eps;
    return param - step_size * exp_avg / denom;
}

template <typename T, typename step_t>
inline void adam_chunk(
    device AdamArguments<T, step_t>& args,
    constant MetadataArguments& metadata,
    const AdamScalars s,
    const bool decoupled,
    uint tid,
    uint tgid,
    uint tptg
) {
    const uint tensor_loc = metadata.threadgroup_to_tensor[tgid];
    const uint chunk = metadata.threadgroup_to_chunk[tgid];
    const uint numel = metadata.numels[tensor_loc];
    const uint start = chunk * CHUNK_SIZE;
    const uint end = min(start + CHUNK_SIZE, numel);
    const float step = float(*args.state_steps[tensor_loc]);

    for (uint i = start + tid; i < end; i += tptg) {
        float param = float(args.params[tensor_loc][i]);
        float grad = float(args.grads[tensor_loc][i]);
        float exp_avg = float(args.exp_avgs[tensor_loc][i]);
        float exp_avg_sq = float(args.exp_avg_sqs[tensor_loc][i]);

        adam_moments(grad, param, exp_avg, exp_avg_sq, s, decoupled);
        param = adam_update(param, exp_avg, exp_avg_sq, step, s);

        args.params[tensor_loc][i] = T(param);
        args.exp_avgs[tensor_loc][i] = T(exp_avg);
        args.exp_avg_sqs[tensor_loc][i] = T(exp_avg_sq);
    }
}

template <typename T, typename step_t>
inline void adam_amsgrad_chunk(
    device AdamAmsgradArguments<T, step_t>& args,
    constant MetadataArguments& metadata,
    const AdamScalars s,
    const bool decoupled,
    uint tid,
    uint tgid,
    uint tptg
) {
    const uint tensor_loc = metadata.threadgroup_to_tensor[tgid];
    const uint chunk = metadata.threadgroup_to_chunk[tgid];
    const uint numel = metadata.numels[tensor_loc];
    const uint start = chunk * CHUNK_SIZE;
    const uint end = min(start + CHUNK_SIZE, numel);
    const float step = float(*args.state_steps[tensor_loc]);

    for (uint i = start + tid; i < end; i += tptg) {
        float param = float(args.params[tensor_loc][i]);
        float grad = float(args.grads[tensor_loc][i]);
        float exp_avg = float(args.exp_avgs[tensor_loc][i]);
        float exp_avg_sq = float(args.exp_avg_sqs[tensor_loc][i]);
        float max_exp_avg_sq = float(args.max_exp_avg_sqs[tensor_loc][i]);

        adam_moments(grad, param, exp_avg, exp_avg_sq, s, decoupled);
        max_exp_avg_sq = max(max_exp_avg_sq, exp_avg_sq);
        param = adam_update(param, exp_avg, max_exp_avg_sq, step, s);

        args.params[tensor_loc][i] = T(param);
        args.exp_avgs[tensor_loc][i] = T(exp_avg);
        args.exp_avg_sqs[tensor_loc][i] = T(exp_avg_sq);
        args.max_exp_avg_sqs[tensor_loc][i] = T(max_exp_avg_sq);
    }
}

#define ADAM_SCALARS                                  \
    constant float& lr [[buffer(2)]],                 \
    constant float& beta1 [[buffer(3)]],              \
    constant float& beta2 [[buffer(4)]],              \
    constant float& weight_decay [[buffer(5)]],       \
    constant float& eps [[buffer(6)]],                \
    constant uint8_t& maximize [[buffer(7)]],         \
    uint tid [[thread_position_in_threadgroup]],      \
    uint tgid [[threadgroup_position_in_grid]],       \
    uint tptg [[threads_per_threadgroup]]

#define COLLECT_SCALARS \
    const AdamScalars s = { lr, beta1, beta2, weight_decay, eps, maximize != 0 }

#define FUSED_ADAM(NAME, T, STEP_T, DECOUPLED)                               \
kernel void NAME(                                                            \
    device AdamArguments<T, STEP_T>& args [[buffer(0)]],                     \
    constant MetadataArguments& metadata [[buffer(1)]],                      \
    ADAM_SCALARS                                                             \
) {                                                                          \
    COLLECT_SCALARS;                                                         \
    adam_chunk<T, STEP_T>(args, metadata, s, DECOUPLED, tid, tgid, tptg);    \
}

#define FUSED_ADAM_AMSGRAD(NAME, T, STEP_T, DECOUPLED)                               \
kernel void NAME(                                                                    \
    device AdamAmsgradArguments<T, STEP_T>& args [[buffer(0)]],                      \
    constant MetadataArguments& metadata [[buffer(1)]],                              \
    ADAM_SCALARS                                                                     \
) {                                                                                  \
    COLLECT_SCALARS;                                                                 \
    adam_amsgrad_chunk<T, STEP_T>(args, metadata, s, DECOUPLED, tid, tgid, tptg);    \
}

FUSED_ADAM(fused_adam_float_float, float, float, false)
FUSED_ADAM(fused_adam_half_float, half, float, false)
FUSED_ADAM(fused_adamw_float_float, float, float, true)
FUSED_ADAM(fused_adamw_half_float, half, float, true)

FUSED_ADAM_AMSGRAD(fused_adam_amsgrad_float_float, float, float, false)
FUSED_ADAM_AMSGRAD(fused_adam_amsgrad_half_float, half, float, false)
FUSED_ADAM_AMSGRAD(fused_adamw_amsgrad_float_float, float, float, true)
FUSED_ADAM_AMSGRAD(fused_adamw_amsgrad_half_float, half, float, true)
"#;

/// Names of every kernel compiled from [`FUSED_ADAM_SOURCE`].
pub const FUSED_ADAM_KERNELS: [&str; 8] = [
    "fused_adam_float_float",
    "fused_adam_half_float",
    "fused_adamw_float_float",
    "fused_adamw_half_float",
    "fused_adam_amsgrad_float_float",
    "fused_adam_amsgrad_half_float",
    "fused_adamw_amsgrad_float_float",
    "fused_adamw_amsgrad_half_float",
];
