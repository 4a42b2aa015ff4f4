use candle_core::{Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, Dropout, Module, VarBuilder};

const LEAKY_SLOPE: f64 = 0.1;

fn conv(vb: VarBuilder, in_c: usize, out_c: usize, kernel: usize, stride: usize) -> Result<Conv2d> {
    candle_nn::conv2d(
        in_c,
        out_c,
        kernel,
        Conv2dConfig {
            padding: (kernel - 1) / 2,
            stride,
            ..Default::default()
        },
        vb,
    )
}

// doubles height and width
fn deconv(vb: VarBuilder, in_c: usize, out_c: usize) -> Result<ConvTranspose2d> {
    candle_nn::conv_transpose2d(
        in_c,
        out_c,
        4,
        ConvTranspose2dConfig {
            padding: 1,
            stride: 2,
            ..Default::default()
        },
        vb,
    )
}

fn leaky_relu(xs: &Tensor) -> Result<Tensor> {
    xs.maximum(&(xs * LEAKY_SLOPE)?)
}

/// FlowNetSimple: both images stacked on the channel axis, a strided
/// encoder down to 1/64 and a refinement decoder predicting flow at
/// 1/64, 1/32, 1/16, 1/8 and 1/4 of the input resolution.
#[derive(Debug)]
pub struct FlowNetS {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    conv3_1: Conv2d,
    conv4: Conv2d,
    conv4_1: Conv2d,
    conv5: Conv2d,
    conv5_1: Conv2d,
    conv6: Conv2d,
    conv6_1: Conv2d,
    dropout: Option<Dropout>,

    predict_flow6: Conv2d,
    predict_flow5: Conv2d,
    predict_flow4: Conv2d,
    predict_flow3: Conv2d,
    predict_flow2: Conv2d,

    deconv5: ConvTranspose2d,
    deconv4: ConvTranspose2d,
    deconv3: ConvTranspose2d,
    deconv2: ConvTranspose2d,

    upsample_flow6_to_5: ConvTranspose2d,
    upsample_flow5_to_4: ConvTranspose2d,
    upsample_flow4_to_3: ConvTranspose2d,
    upsample_flow3_to_2: ConvTranspose2d,
}

impl FlowNetS {
    /// `drop_rate` enables dropout after conv5_1 and conv6_1 while training.
    pub fn new(vb: VarBuilder, drop_rate: Option<f32>) -> Result<Self> {
        Ok(Self {
            conv1: conv(vb.pp("conv1"), 6, 64, 7, 2)?,
            conv2: conv(vb.pp("conv2"), 64, 128, 5, 2)?,
            conv3: conv(vb.pp("conv3"), 128, 256, 5, 2)?,
            conv3_1: conv(vb.pp("conv3_1"), 256, 256, 3, 1)?,
            conv4: conv(vb.pp("conv4"), 256, 512, 3, 2)?,
            conv4_1: conv(vb.pp("conv4_1"), 512, 512, 3, 1)?,
            conv5: conv(vb.pp("conv5"), 512, 512, 3, 2)?,
            conv5_1: conv(vb.pp("conv5_1"), 512, 512, 3, 1)?,
            conv6: conv(vb.pp("conv6"), 512, 1024, 3, 2)?,
            conv6_1: conv(vb.pp("conv6_1"), 1024, 1024, 3, 1)?,
            dropout: drop_rate.filter(|p| *p > 0.0).map(Dropout::new),

            predict_flow6: conv(vb.pp("predict_flow6"), 1024, 2, 3, 1)?,
            predict_flow5: conv(vb.pp("predict_flow5"), 512 + 512 + 2, 2, 3, 1)?,
            predict_flow4: conv(vb.pp("predict_flow4"), 512 + 256 + 2, 2, 3, 1)?,
            predict_flow3: conv(vb.pp("predict_flow3"), 256 + 128 + 2, 2, 3, 1)?,
            predict_flow2: conv(vb.pp("predict_flow2"), 128 + 64 + 2, 2, 3, 1)?,

            deconv5: deconv(vb.pp("deconv5"), 1024, 512)?,
            deconv4: deconv(vb.pp("deconv4"), 512 + 512 + 2, 256)?,
            deconv3: deconv(vb.pp("deconv3"), 512 + 256 + 2, 128)?,
            deconv2: deconv(vb.pp("deconv2"), 256 + 128 + 2, 64)?,

            upsample_flow6_to_5: deconv(vb.pp("upsample_flow6_to_5"), 2, 2)?,
            upsample_flow5_to_4: deconv(vb.pp("upsample_flow5_to_4"), 2, 2)?,
            upsample_flow4_to_3: deconv(vb.pp("upsample_flow4_to_3"), 2, 2)?,
            upsample_flow3_to_2: deconv(vb.pp("upsample_flow3_to_2"), 2, 2)?,
        })
    }

    fn drop(&self, xs: Tensor, train: bool) -> Result<Tensor> {
        match &self.dropout {
            Some(d) => d.forward(&xs, train),
            None => Ok(xs),
        }
    }

    /// Flow predictions, finest (1/4) first. Values are in units of
    /// `FLOW_SCALE` pixels.
    pub fn forward_t(&self, imgs_0: &Tensor, imgs_1: &Tensor, train: bool) -> Result<Vec<Tensor>> {
        let xs = Tensor::cat(&[imgs_0, imgs_1], 1)?;
        let (_b, _c, h, w) = xs.dims4()?;
        if h % 64 != 0 || w % 64 != 0 {
            candle_core::bail!("input {h}x{w} is not a multiple of 64")
        }

        let conv1 = leaky_relu(&self.conv1.forward(&xs)?)?;
        let conv2 = leaky_relu(&self.conv2.forward(&conv1)?)?;
        let conv3 = leaky_relu(&self.conv3.forward(&conv2)?)?;
        let conv3_1 = leaky_relu(&self.conv3_1.forward(&conv3)?)?;
        let conv4 = leaky_relu(&self.conv4.forward(&conv3_1)?)?;
        let conv4_1 = leaky_relu(&self.conv4_1.forward(&conv4)?)?;
        let conv5 = leaky_relu(&self.conv5.forward(&conv4_1)?)?;
        let conv5_1 = self.drop(leaky_relu(&self.conv5_1.forward(&conv5)?)?, train)?;
        let conv6 = leaky_relu(&self.conv6.forward(&conv5_1)?)?;
        let conv6_1 = self.drop(leaky_relu(&self.conv6_1.forward(&conv6)?)?, train)?;

        let flow6 = self.predict_flow6.forward(&conv6_1)?;
        let flow6_up = self.upsample_flow6_to_5.forward(&flow6)?;
        let deconv5 = leaky_relu(&self.deconv5.forward(&conv6_1)?)?;
        let concat5 = Tensor::cat(&[&conv5_1, &deconv5, &flow6_up], 1)?;

        let flow5 = self.predict_flow5.forward(&concat5)?;
        let flow5_up = self.upsample_flow5_to_4.forward(&flow5)?;
        let deconv4 = leaky_relu(&self.deconv4.forward(&concat5)?)?;
        let concat4 = Tensor::cat(&[&conv4_1, &deconv4, &flow5_up], 1)?;

        let flow4 = self.predict_flow4.forward(&concat4)?;
        let flow4_up = self.upsample_flow4_to_3.forward(&flow4)?;
        let deconv3 = leaky_relu(&self.deconv3.forward(&concat4)?)?;
        let concat3 = Tensor::cat(&[&conv3_1, &deconv3, &flow4_up], 1)?;

        let flow3 = self.predict_flow3.forward(&concat3)?;
        let flow3_up = self.upsample_flow3_to_2.forward(&flow3)?;
        let deconv2 = leaky_relu(&self.deconv2.forward(&concat3)?)?;
        let concat2 = Tensor::cat(&[&conv2, &deconv2, &flow3_up], 1)?;

        let flow2 = self.predict_flow2.forward(&concat2)?;

        Ok(vec![flow2, flow3, flow4, flow5, flow6])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn predicts_five_scales() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = FlowNetS::new(vb, Some(0.5))?;
        let imgs = Tensor::zeros((1, 3, 64, 128), DType::F32, &dev)?;
        let flows = model.forward_t(&imgs, &imgs, true)?;
        let dims: Vec<Vec<usize>> = flows.iter().map(|f| f.dims().to_vec()).collect();
        assert_eq!(
            dims,
            vec![
                vec![1, 2, 16, 32],
                vec![1, 2, 8, 16],
                vec![1, 2, 4, 8],
                vec![1, 2, 2, 4],
                vec![1, 2, 1, 2],
            ]
        );
        Ok(())
    }

    #[test]
    fn rejects_unaligned_input() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = FlowNetS::new(vb, None)?;
        let imgs = Tensor::zeros((1, 3, 48, 64), DType::F32, &dev)?;
        assert!(model.forward_t(&imgs, &imgs, false).is_err());
        Ok(())
    }

    #[test]
    fn eval_mode_is_deterministic() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model = FlowNetS::new(vb, Some(0.5))?;
        let imgs = Tensor::rand(0f32, 1f32, (1, 3, 64, 64), &dev)?;
        let a = model.forward_t(&imgs, &imgs, false)?[0].flatten_all()?.to_vec1::<f32>()?;
        let b = model.forward_t(&imgs, &imgs, false)?[0].flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }
}
