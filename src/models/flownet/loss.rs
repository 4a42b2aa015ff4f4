use candle_core::{Result, Tensor};

/// Ground truth is divided by this before it is compared with predictions.
pub const FLOW_SCALE: f64 = 20.0;

/// Per-scale loss weights, finest (flow2, 1/4) first. The coarsest
/// prediction (flow6, 1/64) carries the largest weight.
pub const LOSS_WEIGHTS: [f64; 5] = [0.005, 0.01, 0.02, 0.08, 0.32];

const EPE_EPS: f64 = 1e-8;

/// Mean endpoint error between two `[B, 2, H, W]` flows.
pub fn epe(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let sq = (pred - target)?.sqr()?.sum_keepdim(1)?;
    (sq + EPE_EPS)?.sqrt()?.mean_all()
}

/// Weighted EPE over every prediction scale. `flows` is full-resolution
/// ground truth in pixels, `preds` come from `FlowNetS::forward_t`.
pub fn multiscale_epe(preds: &[Tensor], flows: &Tensor) -> Result<Tensor> {
    let (_b, _c, h, w) = flows.dims4()?;
    let target = (flows / FLOW_SCALE)?;
    let mut total: Option<Tensor> = None;
    for (pred, weight) in preds.iter().zip(LOSS_WEIGHTS) {
        let (_, _, ph, pw) = pred.dims4()?;
        if h % ph != 0 || w % pw != 0 || h / ph != w / pw {
            candle_core::bail!("prediction {ph}x{pw} does not evenly divide ground truth {h}x{w}")
        }
        let factor = h / ph;
        let scaled = if factor > 1 {
            target.avg_pool2d(factor)?
        } else {
            target.clone()
        };
        let term = (epe(pred, &scaled)? * weight)?;
        total = Some(match total {
            Some(t) => (t + term)?,
            None => term,
        });
    }
    match total {
        Some(t) => Ok(t),
        None => candle_core::bail!("no flow predictions"),
    }
}

/// Finest prediction brought back to input resolution, in pixels.
pub fn full_resolution(preds: &[Tensor], height: usize, width: usize) -> Result<Tensor> {
    match preds.first() {
        Some(p) => p.upsample_nearest2d(height, width)? * FLOW_SCALE,
        None => candle_core::bail!("no flow predictions"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn scales(flows: &Tensor) -> Result<Vec<Tensor>> {
        let target = (flows / FLOW_SCALE)?;
        [4usize, 8, 16, 32, 64]
            .iter()
            .map(|f| target.avg_pool2d(*f))
            .collect()
    }

    #[test]
    fn epe_of_known_offset() -> Result<()> {
        let dev = Device::Cpu;
        let a = Tensor::zeros((1, 2, 2, 2), DType::F32, &dev)?;
        let b = Tensor::cat(
            &[
                Tensor::full(3f32, (1, 1, 2, 2), &dev)?,
                Tensor::full(4f32, (1, 1, 2, 2), &dev)?,
            ],
            1,
        )?;
        let e = epe(&a, &b)?.to_scalar::<f32>()?;
        assert!((e - 5.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn perfect_prediction_has_near_zero_loss() -> Result<()> {
        let dev = Device::Cpu;
        let flows = Tensor::rand(-10f32, 10f32, (2, 2, 64, 64), &dev)?;
        let preds = scales(&flows)?;
        let loss = multiscale_epe(&preds, &flows)?.to_scalar::<f32>()?;
        assert!(loss.abs() < 1e-3);
        Ok(())
    }

    #[test]
    fn zero_prediction_is_penalized() -> Result<()> {
        let dev = Device::Cpu;
        let flows = Tensor::full(20f32, (1, 2, 64, 64), &dev)?;
        let preds: Vec<Tensor> = scales(&flows)?
            .iter()
            .map(|p| p.zeros_like())
            .collect::<Result<_>>()?;
        let loss = multiscale_epe(&preds, &flows)?.to_scalar::<f32>()?;
        let expected = 2f64.sqrt() * LOSS_WEIGHTS.iter().sum::<f64>();
        assert!((loss as f64 - expected).abs() < 1e-3);
        Ok(())
    }

    fn loss_with_unit_error_at(scale: usize) -> Result<f32> {
        let dev = Device::Cpu;
        let flows = Tensor::rand(-10f32, 10f32, (1, 2, 64, 64), &dev)?;
        let unit_u = Tensor::new(&[1f32, 0.0], &dev)?.reshape((1, 2, 1, 1))?;
        let mut preds = scales(&flows)?;
        preds[scale] = preds[scale].broadcast_add(&unit_u)?;
        multiscale_epe(&preds, &flows)?.to_scalar::<f32>()
    }

    #[test]
    fn coarsest_scale_carries_the_largest_weight() -> Result<()> {
        let coarse = loss_with_unit_error_at(4)?;
        let fine = loss_with_unit_error_at(0)?;
        assert!((coarse - 0.32).abs() < 1e-3, "flow6 error gave {coarse}");
        assert!((fine - 0.005).abs() < 1e-3, "flow2 error gave {fine}");
        Ok(())
    }

    #[test]
    fn full_resolution_restores_pixels() -> Result<()> {
        let dev = Device::Cpu;
        let p = Tensor::full(0.5f32, (1, 2, 4, 4), &dev)?;
        let up = full_resolution(&[p], 16, 16)?;
        assert_eq!(up.dims(), &[1, 2, 16, 16]);
        let v = up.flatten_all()?.to_vec1::<f32>()?;
        assert!(v.iter().all(|x| (x - 10.0).abs() < 1e-5));
        Ok(())
    }
}
