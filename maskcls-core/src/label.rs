//! Derivation of mask, gender and age labels from manifest rows and image file names.

use crate::{
    error::{Error, Result},
    manifest::ManifestRecord,
};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::warn;

/// Number of combined classes, `3 mask states * 2 genders * 3 age buckets`.
pub const NUM_CLASSES: usize = 18;

const IMAGE_EXTENSION: &str = "jpg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskStatus {
    Worn = 0,
    Incorrect = 1,
    NotWorn = 2,
}

impl MaskStatus {
    /// Reads the status token of a file name such as `mask1.jpg` or `incorrect_mask.jpg`.
    ///
    /// Everything from the first `.` on is dropped, then every digit is removed.
    /// Unknown tokens (`normal`, ...) map to [`MaskStatus::NotWorn`].
    pub fn from_file_name(file_name: &str) -> Self {
        let stem = file_name.split('.').next().unwrap_or_default();
        let status: String = stem.chars().filter(|c| !c.is_ascii_digit()).collect();
        match status.as_str() {
            "mask" => MaskStatus::Worn,
            "incorrect_mask" => MaskStatus::Incorrect,
            _ => MaskStatus::NotWorn,
        }
    }

    fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(MaskStatus::Worn),
            1 => Some(MaskStatus::Incorrect),
            2 => Some(MaskStatus::NotWorn),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gender {
    Male = 0,
    Female = 1,
}

impl Gender {
    pub fn one_hot(self) -> [f32; 2] {
        match self {
            Gender::Male => [1., 0.],
            Gender::Female => [0., 1.],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }
}

impl FromStr for Gender {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "male" => Ok(Gender::Male),
            "female" => Ok(Gender::Female),
            other => Err(Error::InvalidLabel(format!("unknown gender {other:?}"))),
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgeBucket {
    /// Younger than 30
    Young = 0,
    /// 30 to 59
    Middle = 1,
    /// 60 and older
    Old = 2,
}

impl AgeBucket {
    pub fn from_age(age: i64) -> Self {
        match age {
            ..30 => AgeBucket::Young,
            30..60 => AgeBucket::Middle,
            _ => AgeBucket::Old,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Labels {
    pub mask: MaskStatus,
    pub gender: Gender,
    pub age: AgeBucket,
}

impl Labels {
    /// The combined class used as training target and submission answer.
    pub fn class_index(&self) -> usize {
        self.mask as usize * 6 + self.gender as usize * 3 + self.age as usize
    }

    pub fn from_class_index(index: usize) -> Option<Self> {
        if index >= NUM_CLASSES {
            return None;
        }
        let gender = if (index % 6) / 3 == 0 {
            Gender::Male
        } else {
            Gender::Female
        };
        let age = match index % 3 {
            0 => AgeBucket::Young,
            1 => AgeBucket::Middle,
            _ => AgeBucket::Old,
        };
        Some(Self {
            mask: MaskStatus::from_index(index / 6)?,
            gender,
            age,
        })
    }
}

/// One classifiable image. `labels` is `None` for inference samples.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSample {
    pub path: PathBuf,
    pub labels: Option<Labels>,
}

/// Lists the `*.jpg` files directly inside `folder`, sorted by file name.
///
/// A missing folder yields no images.
pub fn discover_images(folder: &Path) -> Result<Vec<PathBuf>> {
    if !folder.is_dir() {
        warn!("image folder {} does not exist", folder.display());
        return Ok(vec![]);
    }
    let mut paths = vec![];
    for entry in walkdir::WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        let is_jpg = entry.path().extension().is_some_and(|ext| ext == IMAGE_EXTENSION);
        if entry.file_type().is_file() && !hidden && is_jpg {
            paths.push(entry.into_path());
        }
    }
    Ok(paths)
}

/// Builds one labeled sample per image of a single manifest record.
pub fn derive_samples(
    record: &ManifestRecord,
    image_paths: impl IntoIterator<Item = PathBuf>,
) -> Result<Vec<ImageSample>> {
    let gender: Gender = record.gender.parse()?;
    let age = AgeBucket::from_age(record.age);
    Ok(image_paths
        .into_iter()
        .map(|path| {
            let mask = path
                .file_name()
                .map(|name| MaskStatus::from_file_name(&name.to_string_lossy()))
                .unwrap_or(MaskStatus::NotWorn);
            ImageSample {
                path,
                labels: Some(Labels { mask, gender, age }),
            }
        })
        .collect())
}

/// Runs [`derive_samples`] over every record, discovering images under `image_root/<folder>`.
pub fn label_records(image_root: &Path, records: &[ManifestRecord]) -> Result<Vec<ImageSample>> {
    let mut samples = vec![];
    for record in records {
        let images = discover_images(&image_root.join(&record.folder))?;
        samples.extend(derive_samples(record, images)?);
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn record(gender: &str, age: i64, folder: &str) -> ManifestRecord {
        ManifestRecord {
            id: "000001".into(),
            gender: gender.into(),
            age,
            folder: folder.into(),
        }
    }

    #[test]
    fn age_bucket_boundaries() {
        assert_eq!(AgeBucket::from_age(0), AgeBucket::Young);
        assert_eq!(AgeBucket::from_age(29), AgeBucket::Young);
        assert_eq!(AgeBucket::from_age(30), AgeBucket::Middle);
        assert_eq!(AgeBucket::from_age(59), AgeBucket::Middle);
        assert_eq!(AgeBucket::from_age(60), AgeBucket::Old);
        assert_eq!(AgeBucket::from_age(90), AgeBucket::Old);
    }

    #[test]
    fn mask_status_from_file_name() {
        assert_eq!(MaskStatus::from_file_name("mask.jpg"), MaskStatus::Worn);
        assert_eq!(MaskStatus::from_file_name("mask3.jpg"), MaskStatus::Worn);
        assert_eq!(MaskStatus::from_file_name("mask12.png"), MaskStatus::Worn);
        assert_eq!(
            MaskStatus::from_file_name("incorrect_mask.jpg"),
            MaskStatus::Incorrect
        );
        assert_eq!(
            MaskStatus::from_file_name("incorrect_mask2.jpg"),
            MaskStatus::Incorrect
        );
        assert_eq!(MaskStatus::from_file_name("normal.jpg"), MaskStatus::NotWorn);
        assert_eq!(MaskStatus::from_file_name("normal3.jpg"), MaskStatus::NotWorn);
        assert_eq!(MaskStatus::from_file_name("masked.jpg"), MaskStatus::NotWorn);
    }

    #[test]
    fn gender_parsing() {
        assert_eq!("male".parse::<Gender>().unwrap(), Gender::Male);
        assert_eq!("female".parse::<Gender>().unwrap(), Gender::Female);
        assert_eq!(Gender::Female.one_hot(), [0., 1.]);
        let err = "Female".parse::<Gender>().unwrap_err();
        assert!(matches!(err, Error::InvalidLabel(_)));
        assert!(err.is_configuration());
    }

    #[test]
    fn class_index_decomposes() {
        for index in 0..NUM_CLASSES {
            let labels = Labels::from_class_index(index).unwrap();
            assert_eq!(labels.class_index(), index);
        }
        assert!(Labels::from_class_index(NUM_CLASSES).is_none());
        let labels = Labels {
            mask: MaskStatus::Incorrect,
            gender: Gender::Female,
            age: AgeBucket::Old,
        };
        assert_eq!(labels.class_index(), 11);
    }

    #[test]
    fn derives_one_sample_per_image() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("000001");
        fs::create_dir(&folder).unwrap();
        for name in ["mask1.jpg", "normal2.jpg", "._mask3.jpg", "notes.txt"] {
            fs::write(folder.join(name), b"").unwrap();
        }
        fs::create_dir(folder.join("nested")).unwrap();
        fs::write(folder.join("nested").join("mask4.jpg"), b"").unwrap();

        let samples = label_records(dir.path(), &[record("female", 45, "000001")]).unwrap();
        assert_eq!(
            samples,
            vec![
                ImageSample {
                    path: folder.join("mask1.jpg"),
                    labels: Some(Labels {
                        mask: MaskStatus::Worn,
                        gender: Gender::Female,
                        age: AgeBucket::Middle,
                    }),
                },
                ImageSample {
                    path: folder.join("normal2.jpg"),
                    labels: Some(Labels {
                        mask: MaskStatus::NotWorn,
                        gender: Gender::Female,
                        age: AgeBucket::Middle,
                    }),
                },
            ]
        );
    }

    #[test]
    fn unknown_gender_is_rejected() {
        let err = derive_samples(&record("unknown", 20, "x"), vec![PathBuf::from("mask.jpg")])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidLabel(_)));
    }

    #[test]
    fn missing_folder_has_no_images() {
        let dir = tempfile::tempdir().unwrap();
        assert!(discover_images(&dir.path().join("absent")).unwrap().is_empty());
    }
}
