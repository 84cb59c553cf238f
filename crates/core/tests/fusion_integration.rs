//! End-to-end tests for scale-group discovery and layer fusion on a tiny
//! Mixtral built from synthetic weights. CPU only.

mod common;

use candle_core::{DType, Tensor};
use common::{input_ids, max_abs_diff, tiny_config, tiny_model, EXPERTS, LAYERS};
use mixfuse_core::moe::Expert;
use mixfuse_core::quantization::{apply_scale, GroupKind, Operator};
use mixfuse_core::{AwqModel, FuseError, MoeDecoderLayer};

// ─── Discovery ───────────────────────────────────────────────────────────────

#[test]
fn mha_layers_yield_two_groups_per_expert_plus_two() {
    let model = tiny_model(&tiny_config(2, EXPERTS));
    let groups = model.calibration_groups(&input_ids()).unwrap();
    assert_eq!(groups.len(), LAYERS);

    for layer_groups in &groups {
        assert_eq!(layer_groups.len(), 2 * EXPERTS + 2);
        let kinds: Vec<GroupKind> = layer_groups.iter().map(|g| g.kind).collect();
        assert_eq!(kinds[0], GroupKind::AttentionInput);
        assert_eq!(kinds[1], GroupKind::AttentionOutput);
        for i in 0..EXPERTS {
            assert_eq!(kinds[2 + 2 * i], GroupKind::ExpertGateUp { expert: i });
            assert_eq!(kinds[3 + 2 * i], GroupKind::ExpertDown { expert: i });
        }
    }
}

#[test]
fn gqa_layers_omit_attention_output_group() {
    let model = tiny_model(&tiny_config(1, EXPERTS));
    let groups = model.calibration_groups(&input_ids()).unwrap();

    for layer_groups in &groups {
        assert_eq!(layer_groups.len(), 2 * EXPERTS + 1);
        assert_eq!(layer_groups[1].kind, GroupKind::ExpertGateUp { expert: 0 });
    }
}

#[test]
fn groups_reference_layer_weights() {
    let model = tiny_model(&tiny_config(2, EXPERTS));
    let groups = model.calibration_groups(&input_ids()).unwrap();
    let layer = &model.decoder_layers().unwrap()[1];
    let groups = &groups[1];

    assert_eq!(groups[0].prev_op.op, Operator::Norm(*layer.input_layernorm()));
    assert_eq!(groups[0].layers[2].op, Operator::Linear(*layer.v_proj()));
    assert_eq!(groups[1].layers[0].op, Operator::Linear(*layer.o_proj()));

    let last = groups.last().unwrap();
    let expert = &layer.moe().experts()[EXPERTS - 1];
    assert_eq!(last.prev_op.op, Operator::Linear(*expert.up_proj()));
    assert_eq!(last.layers[0].op, Operator::Linear(*expert.down_proj()));
}

#[test]
fn scaling_every_lossless_group_keeps_logits() {
    let mut model = tiny_model(&tiny_config(2, EXPERTS));
    let before = model.forward(&input_ids()).unwrap();
    let groups = model.calibration_groups(&input_ids()).unwrap();

    for layer_groups in &groups {
        for group in layer_groups {
            // the post-attention norm also feeds the router
            if matches!(group.kind, GroupKind::ExpertGateUp { .. }) {
                continue;
            }
            let channels = group.input.dim(candle_core::D::Minus1).unwrap();
            let scales = Tensor::arange(0u32, channels as u32, &candle_core::Device::Cpu)
                .unwrap()
                .to_dtype(DType::F32)
                .unwrap()
                .affine(0.05, 0.8)
                .unwrap();
            apply_scale(model.arena_mut(), group, &scales).unwrap();
        }
    }

    let after = model.forward(&input_ids()).unwrap();
    assert!(max_abs_diff(&before, &after) < 1e-3);
}

// ─── Fusion ──────────────────────────────────────────────────────────────────

#[test]
fn fused_model_matches_unfused_top2() {
    let mut model = tiny_model(&tiny_config(2, 2));
    let expected = model.forward(&input_ids()).unwrap();

    model.fuse_layers().unwrap();
    assert!(model.body().is_fused());
    let got = model.forward(&input_ids()).unwrap();
    assert_eq!(got.dims(), expected.dims());
    assert!(max_abs_diff(&expected, &got) < 1e-4);
}

#[test]
fn fused_gqa_model_matches_unfused() {
    let mut model = tiny_model(&tiny_config(1, 2));
    let expected = model.forward(&input_ids()).unwrap();

    model.fuse_layers().unwrap();
    let got = model.forward(&input_ids()).unwrap();
    assert!(max_abs_diff(&expected, &got) < 1e-4);
}

#[test]
fn experts_are_replaced_in_place_and_share_weights() {
    let mut model = tiny_model(&tiny_config(2, 2));
    let before: Vec<Vec<_>> = model
        .decoder_layers()
        .unwrap()
        .iter()
        .map(|layer| {
            layer
                .moe()
                .experts()
                .iter()
                .map(|e| (*e.gate_proj(), *e.down_proj(), *e.up_proj()))
                .collect()
        })
        .collect();
    let live_bytes = model.arena().live_bytes();

    model.fuse_layers().unwrap();
    let fused = model.fused_model().unwrap();
    assert_eq!(fused.blocks().len(), LAYERS);
    assert_eq!(fused.vocab_size(), common::VOCAB);

    for (block, handles) in fused.blocks().iter().zip(&before) {
        let experts = block.moe().experts();
        assert_eq!(experts.len(), EXPERTS);
        for (expert, (gate, down, up)) in experts.iter().zip(handles) {
            let Expert::Fused(fused_expert) = expert else {
                panic!("expert was not fused");
            };
            let mlp = fused_expert.fused_mlp();
            assert_eq!(mlp.gate_proj(), gate);
            assert_eq!(mlp.down_proj(), down);
            assert_eq!(mlp.up_proj(), up);
        }
    }
    // the fused QKV replaces q/k/v, nothing else is copied
    assert_eq!(model.arena().live_bytes(), live_bytes);
}

#[test]
fn weight_updates_after_fusion_are_observed() {
    // every expert sees every token
    let cfg = tiny_config(2, EXPERTS);
    let mut fused = tiny_model(&cfg);
    let mut reference = tiny_model(&cfg);
    let w1 = *fused.decoder_layers().unwrap()[0].moe().experts()[1].gate_proj();

    fused.fuse_layers().unwrap();
    let original = fused.forward(&input_ids()).unwrap();
    fused.reset_cache();

    let zeros = fused.arena().get(w1.weight()).unwrap().zeros_like().unwrap();
    fused.arena_mut().replace(w1.weight(), zeros.clone()).unwrap();
    reference.arena_mut().replace(w1.weight(), zeros).unwrap();

    let updated = fused.forward(&input_ids()).unwrap();
    let expected = reference.forward(&input_ids()).unwrap();
    assert!(max_abs_diff(&updated, &expected) < 1e-4);
    assert!(max_abs_diff(&original, &updated) > 1e-6);
}

#[test]
fn fusing_twice_is_rejected() {
    let mut model = tiny_model(&tiny_config(2, 2));
    model.fuse_layers().unwrap();
    assert!(matches!(
        model.fuse_layers().unwrap_err(),
        FuseError::StructuralMismatch(_)
    ));
    assert!(matches!(
        model.calibration_groups(&input_ids()).unwrap_err(),
        FuseError::StructuralMismatch(_)
    ));
}

#[test]
fn fused_decode_matches_prefill() {
    let mut model = tiny_model(&tiny_config(2, 2));
    let ids = input_ids();
    let full = model.forward(&ids).unwrap();

    model.fuse_layers().unwrap();
    let seq = ids.dim(1).unwrap();
    let mut steps = Vec::with_capacity(seq);
    for t in 0..seq {
        steps.push(model.forward(&ids.narrow(1, t, 1).unwrap()).unwrap());
    }
    let decoded = Tensor::cat(&steps, 1).unwrap();
    assert!(max_abs_diff(&full, &decoded) < 1e-4);
}
