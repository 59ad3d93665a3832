pub mod dalle;

use candle::{DType, Device, Result, Tensor};
use std::path::PathBuf;

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else {
        let device = Device::cuda_if_available(0)?;
        if !device.is_cuda() {
            tracing::info!("running on CPU, to run on GPU build this example with `--features cuda`");
        }
        Ok(device)
    }
}

/// `local` when given, otherwise `filename` fetched from the `repo` model on the hub.
pub fn hub_file(repo: &str, filename: &str, local: Option<PathBuf>) -> Result<PathBuf> {
    match local {
        Some(local) => Ok(local),
        None => {
            let api = hf_hub::api::sync::Api::new().map_err(candle::Error::wrap)?;
            api.model(repo.to_string())
                .get(filename)
                .map_err(candle::Error::wrap)
        }
    }
}

/// Half precision on GPUs, single precision elsewhere.
pub fn dtype(device: &Device) -> DType {
    if device.is_cuda() {
        DType::F16
    } else {
        DType::F32
    }
}

/// Rescales a `(c, height, width)` image so that its values span `0..=255`, the
/// minimum mapping to 0 and the maximum to 255.
pub fn normalize_image(img: &Tensor) -> Result<Tensor> {
    let (c, h, w) = img.dims3()?;
    let values = img.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    let range = f32::max(max - min, 1e-5);
    let pixels = values
        .iter()
        .map(|&v| ((v - min) / range * 255. + 0.5).clamp(0., 255.) as u8)
        .collect::<Vec<_>>();
    Tensor::from_vec(pixels, (c, h, w), &Device::Cpu)
}

/// Saves an image to disk using the image crate, this expects an input with shape
/// (c, height, width).
pub fn save_image<P: AsRef<std::path::Path>>(img: &Tensor, p: P) -> Result<()> {
    let p = p.as_ref();
    let (channel, height, width) = img.dims3()?;
    if channel != 3 {
        candle::bail!("save_image expects an input of shape (3, height, width)")
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let image: image::ImageBuffer<image::Rgb<u8>, Vec<u8>> =
        match image::ImageBuffer::from_raw(width as u32, height as u32, pixels) {
            Some(image) => image,
            None => candle::bail!("error saving image {p:?}"),
        };
    image.save(p).map_err(candle::Error::wrap)?;
    Ok(())
}
