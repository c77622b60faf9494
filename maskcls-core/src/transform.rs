use burn::config::Config;
use image::{
    imageops::{self, colorops::brighten_in_place, FilterType},
    Rgb, RgbImage,
};
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{f32::consts::PI, sync::Mutex};

/// A decoded image laid out as `[channels, height, width]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub data: Vec<f32>,
    pub height: usize,
    pub width: usize,
}

impl ImageTensor {
    pub const CHANNELS: usize = 3;

    pub fn shape(&self) -> [usize; 3] {
        [Self::CHANNELS, self.height, self.width]
    }
}

/// Image to tensor conversion applied by the dataset on every access.
pub trait Transform: Send + Sync {
    fn apply(&self, image: RgbImage) -> ImageTensor;
}

impl<F> Transform for F
where
    F: Fn(RgbImage) -> ImageTensor + Send + Sync,
{
    fn apply(&self, image: RgbImage) -> ImageTensor {
        self(image)
    }
}

/// Converts an RGB image to a CHW tensor scaled to `[0, 1]`.
pub fn to_tensor(image: &RgbImage) -> ImageTensor {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let plane = width * height;
    let mut data = vec![0.; ImageTensor::CHANNELS * plane];
    for (i, pixel) in image.pixels().enumerate() {
        for (c, value) in pixel.0.iter().enumerate() {
            data[c * plane + i] = *value as f32 / 255.0;
        }
    }
    ImageTensor {
        data,
        height,
        width,
    }
}

#[derive(Config, Debug)]
pub struct TransformConfig {
    /// `[height, width]` the image is resized to
    #[config(default = "[512, 384]")]
    pub image_size: [u32; 2],
    /// `[height, width]` of the center crop taken after resizing
    #[config(default = "[298, 224]")]
    pub crop_size: [u32; 2],
    #[config(default = "[0.548, 0.504, 0.479]")]
    pub mean: [f32; 3],
    #[config(default = "[0.237, 0.247, 0.246]")]
    pub std: [f32; 3],
}

impl TransformConfig {
    pub fn init(&self) -> StandardTransform {
        StandardTransform {
            config: self.clone(),
        }
    }

    pub fn init_augmented(&self, seed: u64) -> AugmentTransform {
        AugmentTransform {
            base: self.init(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

/// Resize, center crop and normalize.
#[derive(Debug, Clone)]
pub struct StandardTransform {
    config: TransformConfig,
}

impl StandardTransform {
    fn resize_crop(&self, image: &RgbImage) -> RgbImage {
        let [height, width] = self.config.image_size;
        let resized = imageops::resize(image, width, height, FilterType::Triangle);
        let crop_height = self.config.crop_size[0].min(height);
        let crop_width = self.config.crop_size[1].min(width);
        let top = (height - crop_height) / 2;
        let left = (width - crop_width) / 2;
        imageops::crop_imm(&resized, left, top, crop_width, crop_height).to_image()
    }

    fn normalize(&self, mut tensor: ImageTensor) -> ImageTensor {
        let plane = tensor.height * tensor.width;
        for (c, channel) in tensor.data.chunks_mut(plane.max(1)).enumerate() {
            let (mean, std) = (self.config.mean[c], self.config.std[c]);
            channel.iter_mut().for_each(|v| *v = (*v - mean) / std);
        }
        tensor
    }
}

impl Transform for StandardTransform {
    fn apply(&self, image: RgbImage) -> ImageTensor {
        self.normalize(to_tensor(&self.resize_crop(&image)))
    }
}

/// [`StandardTransform`] with random horizontal flip, rotation and brightness, driven by its own seeded rng.
///
/// Every call draws from the one rng in call order. A seed reproduces an epoch
/// with a single loader worker; with several workers the draws follow thread scheduling.
#[derive(Debug)]
pub struct AugmentTransform {
    base: StandardTransform,
    rng: Mutex<StdRng>,
}

impl Transform for AugmentTransform {
    fn apply(&self, image: RgbImage) -> ImageTensor {
        let (flip, theta, brightness) = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            (
                rng.gen_bool(0.5),
                rng.gen_range(-1. / 12. ..1. / 12.),
                rng.gen_range(-32..32),
            )
        };
        let mut image = self.base.resize_crop(&image);
        if flip {
            imageops::flip_horizontal_in_place(&mut image);
        }
        let mut image = rotate_about_center(&image, theta * PI, Interpolation::Nearest, Rgb([0, 0, 0]));
        brighten_in_place(&mut image, brightness);
        self.base.normalize(to_tensor(&image))
    }
}
