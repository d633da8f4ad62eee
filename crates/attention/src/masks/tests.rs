use super::*;
use candle_core::{Device, Result, Tensor};

fn idx(
    b: usize,
    h: usize,
    q: usize,
    k: usize,
    num_heads: usize,
    q_len: usize,
    k_len: usize,
) -> usize {
    ((((b * num_heads) + h) * q_len) + q) * k_len + k
}

#[test]
fn causal_mask_respects_offsets() -> Result<()> {
    let device = Device::Cpu;
    let batch = 1;
    let num_heads = 2;
    let q_len = 3;
    let k_len = 5;

    let mask = build_causal_mask(&device, batch, num_heads, q_len, k_len)?;
    assert_eq!(mask.dims(), &[batch, num_heads, q_len, k_len]);

    let values = mask.flatten_all()?.to_vec1::<f32>()?;

    // Earliest query can only see the prefix (offset = k_len - q_len).
    assert_eq!(values[idx(0, 0, 0, 2, num_heads, q_len, k_len)], 0.0);
    assert_eq!(
        values[idx(0, 0, 0, 3, num_heads, q_len, k_len)],
        f32::NEG_INFINITY
    );

    // Later queries gain access to more keys.
    assert_eq!(values[idx(0, 1, 2, 4, num_heads, q_len, k_len)], 0.0);

    Ok(())
}

#[test]
fn memory_prefix_is_visible_to_every_query() -> Result<()> {
    let device = Device::Cpu;
    let mask = build_prefixed_causal_mask(&device, 2, 4, 1)?;
    assert_eq!(mask.dims(), &[2, 1, 4, 5]);
    let values = mask.flatten_all()?.to_vec1::<f32>()?;

    for b in 0..2 {
        for q in 0..4 {
            // Slot 0 is the latent memory.
            assert_eq!(values[idx(b, 0, q, 0, 1, 4, 5)], 0.0);
            // Token q sits at key index q + 1 and is visible to itself.
            assert_eq!(values[idx(b, 0, q, q + 1, 1, 4, 5)], 0.0);
            for k in (q + 2)..5 {
                assert_eq!(values[idx(b, 0, q, k, 1, 4, 5)], f32::NEG_INFINITY);
            }
        }
    }
    Ok(())
}

#[test]
fn causal_mask_handles_single_token_cases() -> Result<()> {
    let device = Device::Cpu;

    let mask = build_causal_mask(&device, 1, 1, 1, 1)?;
    assert_eq!(mask.flatten_all()?.to_vec1::<f32>()?, vec![0.0]);

    let mask = build_causal_mask(&device, 1, 1, 1, 4)?;
    assert_eq!(
        mask.flatten_all()?.to_vec1::<f32>()?,
        vec![0.0, 0.0, 0.0, 0.0]
    );
    Ok(())
}

#[test]
fn padding_mask_skips_prefix_and_keeps_self() -> Result<()> {
    let device = Device::Cpu;
    let padding = vec![vec![false, false, true], vec![true, false, false]];
    let mask = padding_mask_from_booleans(&device, &padding, 1)?;
    assert_eq!(mask.dims(), &[2, 1, 3, 4]);
    let values = mask.flatten_all()?.to_vec1::<f32>()?;

    // Memory slot is never padded.
    for b in 0..2 {
        for q in 0..3 {
            assert_eq!(values[idx(b, 0, q, 0, 1, 3, 4)], 0.0);
        }
    }
    // Padded token 2 of the first row is hidden from query 0 but not itself.
    assert_eq!(values[idx(0, 0, 0, 3, 1, 3, 4)], f32::NEG_INFINITY);
    assert_eq!(values[idx(0, 0, 2, 3, 1, 3, 4)], 0.0);
    // Left padding in the second row.
    assert_eq!(values[idx(1, 0, 2, 1, 1, 3, 4)], f32::NEG_INFINITY);
    assert_eq!(values[idx(1, 0, 0, 1, 1, 3, 4)], 0.0);
    Ok(())
}

#[test]
fn padding_mask_from_attention_matches_booleans() -> Result<()> {
    let device = Device::Cpu;
    let attention = Tensor::from_vec(vec![1u32, 1, 0, 1, 1, 1], (2, 3), &device)?;
    let from_tensor = padding_mask_from_attention(&attention, 0)?;
    let from_bools = padding_mask_from_booleans(
        &device,
        &[vec![false, false, true], vec![false, false, false]],
        0,
    )?;
    assert_eq!(
        from_tensor.flatten_all()?.to_vec1::<f32>()?,
        from_bools.flatten_all()?.to_vec1::<f32>()?
    );
    Ok(())
}

#[test]
fn ragged_padding_is_rejected() {
    let device = Device::Cpu;
    let padding = vec![vec![false, true], vec![false]];
    assert!(padding_mask_from_booleans(&device, &padding, 0).is_err());
}
