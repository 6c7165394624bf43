use anyhow::Result;
use candle::{DType, Device, Tensor};
use candle_tiled_attn::{forward, DropoutConfig, FlashAttn, TileConfig};

fn zeros(shape: &[usize]) -> Result<Tensor> {
    Ok(Tensor::zeros(shape, DType::F32, &Device::Cpu)?)
}

fn err_msg<T: std::fmt::Debug>(res: candle::Result<T>) -> String {
    res.expect_err("expected an error").to_string()
}

#[test]
fn rejects_bad_fixed_inputs() -> Result<()> {
    let q = zeros(&[1, 4, 8, 16])?;
    let k = zeros(&[1, 2, 8, 16])?;

    let msg = err_msg(candle_tiled_attn::flash_attn(&zeros(&[4, 8, 16])?, &k, &k, 1.0, false));
    assert!(msg.contains("rank"), "{msg}");

    let msg = err_msg(candle_tiled_attn::flash_attn(&q, &k.to_dtype(DType::F16)?, &k, 1.0, false));
    assert!(msg.contains("dtype"), "{msg}");

    let msg = err_msg(candle_tiled_attn::flash_attn(&q, &k, &zeros(&[1, 2, 9, 16])?, 1.0, false));
    assert!(msg.contains("shape mismatch"), "{msg}");

    let k3 = zeros(&[1, 3, 8, 16])?;
    let msg = err_msg(candle_tiled_attn::flash_attn(&q, &k3, &k3, 1.0, false));
    assert!(msg.contains("must divide"), "{msg}");

    let big = zeros(&[1, 1, 2, 300])?;
    let msg = err_msg(candle_tiled_attn::flash_attn(&big, &big, &big, 1.0, false));
    assert!(msg.contains("head dimension"), "{msg}");

    let kd = zeros(&[1, 2, 8, 8])?;
    let msg = err_msg(candle_tiled_attn::flash_attn(&q, &kd, &kd, 1.0, false));
    assert!(msg.contains("head size mismatch"), "{msg}");

    let ints = Tensor::zeros((1, 1, 2, 4), DType::U32, &Device::Cpu)?;
    let msg = err_msg(candle_tiled_attn::flash_attn(&ints, &ints, &ints, 1.0, false));
    assert!(msg.contains("does not support dtype"), "{msg}");
    Ok(())
}

#[test]
fn rejects_bad_output_and_bias() -> Result<()> {
    let q = zeros(&[2, 2, 5, 8])?;
    let run = |o: Option<&Tensor>, bias: Option<&Tensor>| {
        forward(&q, &q, &q, o, None, None, 0, 0, false, 1.0, bias)
    };
    let msg = err_msg(run(Some(&zeros(&[2, 2, 5, 4])?), None));
    assert!(msg.contains("shape mismatch q"), "{msg}");
    let msg = err_msg(run(Some(&q.to_dtype(DType::F64)?), None));
    assert!(msg.contains("dtype mismatch"), "{msg}");
    let strided_o = zeros(&[2, 5, 2, 8])?.transpose(1, 2)?;
    let msg = err_msg(run(Some(&strided_o), None));
    assert!(msg.contains("contiguous"), "{msg}");

    let msg = err_msg(run(None, Some(&zeros(&[3, 2, 5, 5])?)));
    assert!(msg.contains("bias"), "{msg}");
    let msg = err_msg(run(None, Some(&zeros(&[1, 1, 4, 5])?)));
    assert!(msg.contains("bias"), "{msg}");
    let msg = err_msg(run(None, Some(&zeros(&[1, 1, 5, 5])?.to_dtype(DType::F16)?)));
    assert!(msg.contains("dtype mismatch"), "{msg}");
    assert!(run(None, Some(&zeros(&[1, 2, 5, 5])?)).is_ok());
    Ok(())
}

#[test]
fn rejects_bad_parameters() -> Result<()> {
    let q = zeros(&[1, 1, 4, 8])?;
    for p in [1.0, -0.1, 1.5, f32::NAN] {
        let attn = FlashAttn::new(1.0, false).with_dropout(DropoutConfig::new(p));
        let msg = err_msg(attn.fwd(&q, &q, &q, None));
        assert!(msg.contains("dropout probability"), "{msg}");
    }
    let attn = FlashAttn::new(1.0, false).with_tiles(TileConfig::new(0, 16));
    let msg = err_msg(attn.fwd(&q, &q, &q, None));
    assert!(msg.contains("non-zero"), "{msg}");
    Ok(())
}

#[test]
fn rejects_bad_cumulative_tables() -> Result<()> {
    let q = zeros(&[10, 2, 8])?;
    let k = zeros(&[12, 2, 8])?;
    let table = |v: &[u32]| Tensor::new(v, &Device::Cpu);
    let attn = FlashAttn::new(1.0, false);
    let run = |cu_q: &Tensor, cu_k: &Tensor, max_q: usize, max_k: usize| {
        attn.fwd_varlen(&q, &k, &k, cu_q, cu_k, max_q, max_k, None)
    };

    let ok_q = table(&[0, 4, 10])?;
    let ok_k = table(&[0, 6, 12])?;
    assert!(run(&ok_q, &ok_k, 6, 6).is_ok());

    let msg = err_msg(run(&table(&[0, 4, 10])?, &table(&[0, 12])?, 6, 12));
    assert!(msg.contains("differ in length"), "{msg}");
    let msg = err_msg(run(&table(&[0, 6, 4])?, &ok_k, 6, 6));
    assert!(msg.contains("non-decreasing"), "{msg}");
    let msg = err_msg(run(&ok_q, &ok_k, 5, 6));
    assert!(msg.contains("above the maximum"), "{msg}");
    let msg = err_msg(run(&table(&[0, 4, 11])?, &ok_k, 7, 6));
    assert!(msg.contains("packed tokens"), "{msg}");
    let msg = err_msg(run(&table(&[])?, &table(&[])?, 6, 6));
    assert!(msg.contains("at least one entry"), "{msg}");

    let msg = err_msg(forward(
        &q,
        &k,
        &k,
        None,
        Some(&ok_q),
        None,
        6,
        6,
        false,
        1.0,
        None,
    ));
    assert!(msg.contains("given together"), "{msg}");
    Ok(())
}

#[test]
fn empty_batch_and_empty_sequences() -> Result<()> {
    let q = zeros(&[3, 1, 8])?;
    let k = zeros(&[0, 1, 8])?;
    let cu_q = Tensor::new(&[0u32, 3], &Device::Cpu)?;
    let cu_k = Tensor::new(&[0u32, 0], &Device::Cpu)?;
    let mut attn = FlashAttn::new(1.0, false);
    attn.return_softmax_lse = true;
    let res = attn.fwd_varlen(&q, &k, &k, &cu_q, &cu_k, 3, 0, None)?;
    assert_eq!(res.out.flatten_all()?.to_vec1::<f32>()?, vec![0f32; 24]);
    let lse = res.softmax_lse.expect("lse requested");
    assert!(lse
        .flatten_all()?
        .to_vec1::<f32>()?
        .iter()
        .all(|x| *x == f32::NEG_INFINITY));
    Ok(())
}
