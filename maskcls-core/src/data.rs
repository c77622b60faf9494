use crate::{
    error::{Error, Result},
    label::{label_records, ImageSample, Labels},
    manifest::{read_image_ids, read_records, ManifestLayout},
    transform::{to_tensor, ImageTensor, Transform},
};
use burn::{
    data::dataloader::{batcher::Batcher, Dataset},
    prelude::*,
    tensor::TensorData,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Split {
    Train,
    Validation,
    Test,
}

#[derive(Config, Debug)]
pub struct DatasetConfig {
    image_root: PathBuf,
    manifest: PathBuf,
    split: Split,
    /// Fraction of the shuffled subjects that belong to the train split
    #[config(default = 0.8)]
    split_rate: f64,
    #[config(default = false)]
    inference: bool,
    #[config(default = false)]
    soft_label: bool,
    #[config(default = 41)]
    seed: u64,
    #[config(default = "ManifestLayout::default()")]
    layout: ManifestLayout,
}

impl DatasetConfig {
    pub fn init(&self, transform: Option<Arc<dyn Transform>>) -> Result<MaskDataset> {
        MaskDataset::new(self, transform)
    }
}

#[derive(Debug, Clone)]
pub struct MaskItem {
    pub image: ImageTensor,
    /// `None` in inference mode
    pub labels: Option<Labels>,
    /// Position of the sample in its dataset
    pub index: usize,
    pub path: PathBuf,
}

pub struct MaskDataset {
    samples: Vec<ImageSample>,
    inference: bool,
    soft_label: bool,
    transform: Option<Arc<dyn Transform>>,
}

impl MaskDataset {
    pub fn new(config: &DatasetConfig, transform: Option<Arc<dyn Transform>>) -> Result<Self> {
        let samples = if config.inference {
            inference_samples(&config.image_root, &config.manifest)?
        } else {
            labeled_samples(config)?
        };
        info!(
            "loaded {} samples from {} ({:?}{})",
            samples.len(),
            config.manifest.display(),
            config.split,
            if config.inference { ", inference" } else { "" }
        );
        Ok(Self {
            samples,
            inference: config.inference,
            soft_label: config.soft_label,
            transform,
        })
    }

    /// Inference dataset over the `ImageID` column of `manifest`.
    pub fn predict(
        image_root: impl Into<PathBuf>,
        manifest: impl Into<PathBuf>,
        transform: Option<Arc<dyn Transform>>,
    ) -> Result<Self> {
        DatasetConfig::new(image_root.into(), manifest.into(), Split::Test)
            .with_inference(true)
            .init(transform)
    }

    pub fn samples(&self) -> &[ImageSample] {
        &self.samples
    }

    pub fn is_inference(&self) -> bool {
        self.inference
    }

    pub fn is_soft_label(&self) -> bool {
        self.soft_label
    }

    /// Decodes and transforms the sample at `index`.
    pub fn load(&self, index: usize) -> Result<MaskItem> {
        let sample = self.samples.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.samples.len(),
        })?;
        Ok(self.decode(index, sample)?)
    }

    fn decode(&self, index: usize, sample: &ImageSample) -> LoadedItem {
        let image = image::open(&sample.path)
            .map_err(|source| LoadFailure {
                index,
                path: sample.path.clone(),
                source: Arc::new(source),
            })?
            .to_rgb8();
        let image = match &self.transform {
            Some(transform) => transform.apply(image),
            None => to_tensor(&image),
        };
        Ok(MaskItem {
            image,
            labels: if self.inference { None } else { sample.labels },
            index,
            path: sample.path.clone(),
        })
    }
}

/// An image that could not be decoded, handed to the batcher in place of its item.
#[derive(Debug, Clone)]
pub struct LoadFailure {
    pub index: usize,
    pub path: PathBuf,
    pub source: Arc<image::ImageError>,
}

impl From<LoadFailure> for Error {
    fn from(failure: LoadFailure) -> Self {
        Error::Image {
            path: failure.path,
            source: failure.source,
        }
    }
}

/// What the data loader produces for one index.
pub type LoadedItem = std::result::Result<MaskItem, LoadFailure>;

impl Dataset<LoadedItem> for MaskDataset {
    fn get(&self, index: usize) -> Option<LoadedItem> {
        self.samples
            .get(index)
            .map(|sample| self.decode(index, sample))
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Identifiers are always taken relative to `image_root`, leading separators included.
fn inference_samples(image_root: &Path, manifest: &Path) -> Result<Vec<ImageSample>> {
    Ok(read_image_ids(manifest)?
        .into_iter()
        .map(|id| ImageSample {
            path: image_root.join(id.trim_start_matches(|c: char| c == '/' || c == '\\')),
            labels: None,
        })
        .collect())
}

fn labeled_samples(config: &DatasetConfig) -> Result<Vec<ImageSample>> {
    if !(0.0..=1.0).contains(&config.split_rate) {
        return Err(Error::Config(format!(
            "split rate {} is outside [0, 1]",
            config.split_rate
        )));
    }
    let mut records = read_records(&config.manifest, config.layout)?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    records.shuffle(&mut rng);
    let split_idx = (records.len() as f64 * config.split_rate).floor() as usize;
    let subset = match config.split {
        Split::Train => &records[..split_idx],
        Split::Validation => &records[split_idx..],
        Split::Test => {
            return Err(Error::Config(
                "the test split is only available in inference mode".into(),
            ))
        }
    };
    debug!(
        "{:?} split holds {} of {} subjects",
        config.split,
        subset.len(),
        records.len()
    );
    let mut samples = label_records(&config.image_root, subset)?;
    samples.shuffle(&mut rng);
    Ok(samples)
}

fn image_tensor<B: Backend>(image: &ImageTensor, device: &B::Device) -> Tensor<B, 4> {
    let [channels, height, width] = image.shape();
    Tensor::<B, 1>::from_data(TensorData::new(image.data.clone(), [image.data.len()]), device)
        .reshape([1, channels, height, width])
}

#[derive(Clone)]
pub struct MaskBatcher<B: Backend> {
    device: B::Device,
}

/// Labeled images with their combined class as target.
#[derive(Debug, Clone)]
pub struct MaskBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> MaskBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

/// # Panics
///
/// On an image that failed to load or on an item without labels. Only labeled
/// datasets feed training batches.
impl<B: Backend> Batcher<LoadedItem, MaskBatch<B>> for MaskBatcher<B> {
    fn batch(&self, items: Vec<LoadedItem>) -> MaskBatch<B> {
        let (images, targets): (Vec<_>, Vec<_>) = items
            .into_iter()
            .map(|item| {
                let item = item.unwrap_or_else(|failure| panic!("{}", Error::from(failure)));
                let labels = item.labels.unwrap_or_else(|| {
                    panic!("unlabeled sample {} in a training batch", item.path.display())
                });
                (
                    image_tensor::<B>(&item.image, &self.device),
                    labels.class_index() as i64,
                )
            })
            .unzip();
        let len = targets.len();

        MaskBatch {
            images: Tensor::cat(images, 0),
            targets: Tensor::from_data(TensorData::new(targets, [len]), &self.device),
        }
    }
}

#[derive(Clone)]
pub struct InferenceBatcher<B: Backend> {
    device: B::Device,
}

/// Images together with their dataset indices, so that predictions can be put back in manifest order.
#[derive(Debug, Clone)]
pub struct InferenceBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    pub indices: Vec<usize>,
}

impl<B: Backend> InferenceBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

/// A batch holding a failed load becomes that failure.
impl<B: Backend> Batcher<LoadedItem, std::result::Result<InferenceBatch<B>, LoadFailure>>
    for InferenceBatcher<B>
{
    fn batch(&self, items: Vec<LoadedItem>) -> std::result::Result<InferenceBatch<B>, LoadFailure> {
        let items = items.into_iter().collect::<std::result::Result<Vec<_>, _>>()?;
        let images = items
            .iter()
            .map(|item| image_tensor::<B>(&item.image, &self.device))
            .collect();
        let indices = items.iter().map(|item| item.index).collect();

        Ok(InferenceBatch {
            images: Tensor::cat(images, 0),
            indices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fixtures::{write_image, write_inference_set, write_training_set, IMAGE_SIDE},
        label::{AgeBucket, Gender, MaskStatus},
    };
    use burn::backend::NdArray;
    use std::{collections::HashSet, fs};

    type TestBackend = NdArray<f32>;

    const SUBJECTS: [(&str, i64); 7] = [
        ("male", 20),
        ("female", 45),
        ("female", 61),
        ("male", 30),
        ("male", 59),
        ("female", 29),
        ("female", 60),
    ];

    fn split(root: &Path, manifest: &Path, split: Split, rate: f64, seed: u64) -> MaskDataset {
        DatasetConfig::new(root.to_path_buf(), manifest.to_path_buf(), split)
            .with_split_rate(rate)
            .with_seed(seed)
            .init(None)
            .unwrap()
    }

    fn folders(dataset: &MaskDataset) -> HashSet<PathBuf> {
        dataset
            .samples()
            .iter()
            .map(|s| s.path.parent().unwrap().to_path_buf())
            .collect()
    }

    #[test]
    fn train_and_validation_partition_the_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_training_set(dir.path(), &SUBJECTS);

        for rate in [0.0, 0.3, 0.5, 0.8, 1.0] {
            let train = split(dir.path(), &manifest, Split::Train, rate, 3);
            let valid = split(dir.path(), &manifest, Split::Validation, rate, 3);
            assert_eq!(train.len() + valid.len(), SUBJECTS.len() * 3);
            assert_eq!(
                folders(&train).len(),
                (SUBJECTS.len() as f64 * rate).floor() as usize
            );
            assert!(folders(&train).is_disjoint(&folders(&valid)));
        }
    }

    #[test]
    fn seed_makes_construction_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_training_set(dir.path(), &SUBJECTS);

        let a = split(dir.path(), &manifest, Split::Train, 0.5, 11);
        let b = split(dir.path(), &manifest, Split::Train, 0.5, 11);
        assert_eq!(a.samples(), b.samples());
    }

    #[test]
    fn labeled_items() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_training_set(dir.path(), &[("female", 45)]);
        let dataset = split(dir.path(), &manifest, Split::Train, 1.0, 0);
        assert_eq!(dataset.len(), 3);
        assert!(!dataset.is_inference());

        let mut seen = HashSet::new();
        for index in 0..dataset.len() {
            let item = dataset.load(index).unwrap();
            let labels = item.labels.unwrap();
            assert_eq!(labels.gender, Gender::Female);
            assert_eq!(labels.age, AgeBucket::Middle);
            assert_eq!(item.index, index);
            assert_eq!(item.image.shape(), [3, IMAGE_SIDE as usize, IMAGE_SIDE as usize]);
            seen.insert(labels.mask);
        }
        assert_eq!(
            seen,
            HashSet::from([MaskStatus::Worn, MaskStatus::Incorrect, MaskStatus::NotWorn])
        );
    }

    #[test]
    fn inference_dataset_follows_manifest_rows() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_inference_set(dir.path(), &[10, 20, 30, 40]);
        let root = dir.path().join("images");
        let dataset = MaskDataset::predict(&root, &manifest, None).unwrap();

        assert!(dataset.is_inference());
        assert_eq!(dataset.len(), 4);
        let paths = dataset.samples().iter().map(|s| s.path.clone()).collect::<Vec<_>>();
        assert_eq!(
            paths,
            (0..4).map(|i| root.join(format!("{i:03}.jpg"))).collect::<Vec<_>>()
        );
        let item = dataset.load(2).unwrap();
        assert!(item.labels.is_none());
        assert_eq!(item.path, root.join("002.jpg"));
    }

    #[test]
    fn out_of_range_index() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_inference_set(dir.path(), &[0, 0]);
        let dataset = MaskDataset::predict(dir.path().join("images"), &manifest, None).unwrap();

        assert!(matches!(
            dataset.load(2).unwrap_err(),
            Error::IndexOutOfRange { index: 2, len: 2 }
        ));
        assert!(dataset.get(2).is_none());
    }

    #[test]
    fn undecodable_image_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_inference_set(dir.path(), &[0]);
        fs::write(dir.path().join("images").join("000.jpg"), b"not a jpeg").unwrap();
        let dataset = MaskDataset::predict(dir.path().join("images"), &manifest, None).unwrap();

        assert!(matches!(dataset.load(0).unwrap_err(), Error::Image { .. }));
        assert!(matches!(dataset.get(0), Some(Err(LoadFailure { index: 0, .. }))));
    }

    #[test]
    fn invalid_configurations() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_training_set(dir.path(), &SUBJECTS[..2]);

        let config = DatasetConfig::new(dir.path().to_path_buf(), manifest.clone(), Split::Train)
            .with_split_rate(1.5);
        assert!(matches!(config.init(None).err(), Some(Error::Config(_))));

        let config = DatasetConfig::new(dir.path().to_path_buf(), manifest, Split::Test);
        assert!(matches!(config.init(None).err(), Some(Error::Config(_))));
    }

    #[test]
    fn unknown_gender_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_training_set(dir.path(), &[("other", 33)]);
        let config = DatasetConfig::new(dir.path().to_path_buf(), manifest, Split::Train)
            .with_split_rate(1.0);
        assert!(matches!(config.init(None).err(), Some(Error::InvalidLabel(_))));
    }

    #[test]
    fn transform_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_inference_set(dir.path(), &[0]);
        let transform: Arc<dyn Transform> = Arc::new(|_image: image::RgbImage| ImageTensor {
            data: vec![0.5; 3],
            height: 1,
            width: 1,
        });
        let dataset =
            MaskDataset::predict(dir.path().join("images"), &manifest, Some(transform)).unwrap();
        assert_eq!(dataset.load(0).unwrap().image.data, vec![0.5; 3]);
    }

    #[test]
    fn batchers_stack_items() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_training_set(dir.path(), &[("male", 70)]);
        let dataset = split(dir.path(), &manifest, Split::Train, 1.0, 0);
        let items = (0..3).map(|i| dataset.get(i).unwrap()).collect::<Vec<_>>();
        let expected = items
            .iter()
            .map(|item| item.as_ref().unwrap().labels.unwrap().class_index() as i64)
            .collect::<Vec<_>>();

        let device = Default::default();
        let batch = MaskBatcher::<TestBackend>::new(device).batch(items.clone());
        let side = IMAGE_SIDE as usize;
        assert_eq!(batch.images.dims(), [3, 3, side, side]);
        assert_eq!(
            batch.targets.into_data().convert::<i64>().to_vec::<i64>().unwrap(),
            expected
        );

        let batch = InferenceBatcher::<TestBackend>::new(device)
            .batch(items[1..].to_vec())
            .unwrap();
        assert_eq!(batch.images.dims(), [2, 3, side, side]);
        assert_eq!(batch.indices, vec![1, 2]);
    }

    #[test]
    fn inference_batch_carries_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_inference_set(dir.path(), &[0, 0, 0]);
        fs::write(dir.path().join("images").join("001.jpg"), b"truncated").unwrap();
        let dataset = MaskDataset::predict(dir.path().join("images"), &manifest, None).unwrap();
        let items = (0..3).map(|i| dataset.get(i).unwrap()).collect::<Vec<_>>();

        let failure = InferenceBatcher::<TestBackend>::new(Default::default())
            .batch(items)
            .unwrap_err();
        assert_eq!(failure.index, 1);
        assert!(matches!(Error::from(failure), Error::Image { path, .. } if path.ends_with("001.jpg")));
    }

    #[test]
    #[should_panic(expected = "unlabeled sample")]
    fn training_batcher_rejects_unlabeled_items() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = write_inference_set(dir.path(), &[0]);
        let dataset = MaskDataset::predict(dir.path().join("images"), &manifest, None).unwrap();

        MaskBatcher::<TestBackend>::new(Default::default()).batch(vec![dataset.get(0).unwrap()]);
    }

    #[test]
    fn image_ids_stay_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("info.csv");
        fs::write(&manifest, "ImageID,ans\n/abs.jpg,0\nsub/rel.jpg,0\n").unwrap();
        let root = dir.path().join("images");
        let dataset = MaskDataset::predict(&root, &manifest, None).unwrap();

        let paths = dataset.samples().iter().map(|s| s.path.clone()).collect::<Vec<_>>();
        assert_eq!(paths, vec![root.join("abs.jpg"), root.join("sub/rel.jpg")]);
    }

    #[test]
    fn fixture_images_decode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.jpg");
        write_image(&path, 200);
        assert_eq!(image::open(path).unwrap().width(), IMAGE_SIDE);
    }
}
