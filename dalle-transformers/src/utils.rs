use candle::{Device, Result, Tensor};

/// Replaces the entries of `on_false` where `mask` is set with `on_true`.
pub fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor> {
    let shape = mask.shape();
    let on_true = Tensor::new(on_true, on_false.device())?
        .to_dtype(on_false.dtype())?
        .broadcast_as(shape.dims())?;
    mask.where_cond(&on_true, on_false)
}

/// Causal mask for `seq_len` queries attending to `offset + seq_len` keys, set where
/// attention is forbidden.
pub fn causal_mask(seq_len: usize, offset: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<u8> = (0..seq_len)
        .flat_map(|i| (0..offset + seq_len).map(move |j| u8::from(j > i + offset)))
        .collect();
    Tensor::from_slice(&mask, (seq_len, offset + seq_len), device)
}
