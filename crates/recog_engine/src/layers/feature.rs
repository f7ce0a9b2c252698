//! SimpleConv - Convolutional feature extractor

use candle_core::{Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, LayerNorm, Module, VarBuilder};

/// Epsilon for the column LayerNorm
const LAYER_NORM_EPS: f64 = 1e-5;

/// Three 3x3 conv stages (two of them pooled) followed by height averaging.
/// Output is one feature vector per image column: `[batch, width / 4, output_channel]`.
pub struct SimpleConv {
    pub conv1: Conv2d,
    pub conv2: Conv2d,
    pub conv3: Conv2d,
    pub norm: LayerNorm,
}

impl SimpleConv {
    pub fn load(input_channel: usize, output_channel: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let c1 = (output_channel / 4).max(8);
        let c2 = (output_channel / 2).max(8);

        let conv1 = candle_nn::conv2d(input_channel, c1, 3, cfg, vb.pp("conv1"))?;
        let conv2 = candle_nn::conv2d(c1, c2, 3, cfg, vb.pp("conv2"))?;
        let conv3 = candle_nn::conv2d(c2, output_channel, 3, cfg, vb.pp("conv3"))?;
        let norm = candle_nn::layer_norm(output_channel, LAYER_NORM_EPS, vb.pp("norm"))?;

        Ok(Self {
            conv1,
            conv2,
            conv3,
            norm,
        })
    }

    /// `images`: `[batch, channels, height, width]`
    pub fn forward(&self, images: &Tensor) -> Result<Tensor> {
        let x = self.conv1.forward(images)?.relu()?.max_pool2d(2)?;
        let x = self.conv2.forward(&x)?.relu()?.max_pool2d(2)?;
        let x = self.conv3.forward(&x)?.relu()?;

        // [B, C, H, W] -> [B, C, W] -> [B, W, C]
        let columns = x.mean(2)?.transpose(1, 2)?.contiguous()?;
        self.norm.forward(&columns)
    }
}
