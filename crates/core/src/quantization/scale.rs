use candle_core::Tensor;

use super::groups::{Operator, ScaleGroup};
use crate::error::{FuseError, Result};
use crate::weights::WeightArena;

/// Fold per-channel `scales` into a group's weights.
///
/// The producer's output channels are divided by `scales` and every member's
/// input channels are multiplied by them, so the composition computed by the
/// group is unchanged up to rounding. A linear producer with more output
/// rows than `scales` has only its trailing rows scaled.
///
/// Producers shared with operators outside the group (the post-attention
/// norm also feeds the router and the other experts) change those
/// operators' inputs as well.
pub fn apply_scale(arena: &mut WeightArena, group: &ScaleGroup, scales: &Tensor) -> Result<()> {
    let channels = scales.dims1()?;
    check_channels(arena, group, channels)?;

    match &group.prev_op.op {
        Operator::Norm(norm) => {
            let weight = arena.get(norm.weight())?;
            let scaled = weight.broadcast_div(&scales.to_dtype(weight.dtype())?)?;
            arena.replace(norm.weight(), scaled)?;
        }
        Operator::Linear(linear) => {
            let weight = arena.get(linear.weight())?;
            let column = scales.to_dtype(weight.dtype())?.unsqueeze(1)?;
            let scaled = scale_trailing_rows(weight, &column, channels)?;
            arena.replace(linear.weight(), scaled)?;

            if let Some(bias) = linear.bias() {
                let b = arena.get(bias)?.unsqueeze(1)?;
                let scaled = scale_trailing_rows(&b, &column, channels)?.squeeze(1)?;
                arena.replace(bias, scaled)?;
            }
        }
    }

    for member in &group.layers {
        if let Operator::Linear(linear) = &member.op {
            let weight = arena.get(linear.weight())?;
            let row = scales.to_dtype(weight.dtype())?.unsqueeze(0)?;
            let scaled = weight.broadcast_mul(&row)?;
            arena.replace(linear.weight(), scaled)?;
        }
    }

    Ok(())
}

/// Validate every operator of the group against `channels` before anything
/// is written.
fn check_channels(arena: &WeightArena, group: &ScaleGroup, channels: usize) -> Result<()> {
    let mismatch = |name: &str, expected: usize| FuseError::ShapeMismatch {
        name: name.to_string(),
        expected: vec![expected],
        got: vec![channels],
    };

    let producer_channels = match &group.prev_op.op {
        Operator::Norm(norm) => arena.get(norm.weight())?.dims1()?,
        Operator::Linear(linear) => linear.dims(arena)?.0,
    };
    let producer_ok = match group.prev_op.op {
        Operator::Norm(_) => producer_channels == channels,
        Operator::Linear(_) => producer_channels >= channels,
    };
    if !producer_ok {
        return Err(mismatch(&group.prev_op.name, producer_channels));
    }

    for member in &group.layers {
        let Operator::Linear(linear) = &member.op else {
            return Err(FuseError::StructuralMismatch(format!(
                "group member `{}` is not a linear operator",
                member.name
            )));
        };
        let (_, in_dim) = linear.dims(arena)?;
        if in_dim != channels {
            return Err(mismatch(&member.name, in_dim));
        }
    }
    Ok(())
}

/// Divide the last `channels` rows of `t` (`[rows, cols]`) by `column` (`[channels, 1]`).
fn scale_trailing_rows(t: &Tensor, column: &Tensor, channels: usize) -> Result<Tensor> {
    let rows = t.dim(0)?;
    let head = rows - channels;
    let tail = t.narrow(0, head, channels)?.broadcast_div(column)?;
    if head == 0 {
        return Ok(tail);
    }
    Ok(Tensor::cat(&[&t.narrow(0, 0, head)?, &tail], 0)?)
}
