use crate::{
    data::MaskBatch,
    error::{Error, Result},
    label::NUM_CLASSES,
};
use burn::{
    module::Param,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::{CrossEntropyLoss, CrossEntropyLossConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        Dropout, DropoutConfig, Initializer, Linear, LinearConfig,
    },
    prelude::*,
    tensor::{activation::relu, backend::AutodiffBackend},
    train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep},
};
use clap::{builder::OsStr, ValueEnum};
use resnet_burn::{weights, ResNet};
use serde::{Deserialize, Serialize};

/// Width of the ImageNet logits produced by the ResNet backbones.
const RESNET_FEATURES: usize = 1000;
const BASE_FEATURES: usize = 128;
const LABEL_SMOOTHING: f32 = 0.1;

/// Anything that maps a batch of images to per-class scores.
pub trait Classifier<B: Backend> {
    /// # Shapes
    ///   - Images [batch_size, 3, height, width]
    ///   - Output [batch_size, num_classes]
    fn infer(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>>;
}

/// Small convolutional network trained from scratch.
#[derive(Module, Debug)]
pub struct BaseCnn<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    pool: MaxPool2d,
    dropout: Dropout,
    avgpool: AdaptiveAvgPool2d,
}

impl<B: Backend> BaseCnn<B> {
    fn new(device: &B::Device) -> Self {
        Self {
            conv1: Conv2dConfig::new([3, 32], [7, 7]).init(device),
            conv2: Conv2dConfig::new([32, 64], [3, 3]).init(device),
            conv3: Conv2dConfig::new([64, BASE_FEATURES], [3, 3]).init(device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            dropout: DropoutConfig::new(0.25).init(),
            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = relu(self.conv1.forward(x));
        let x = relu(self.conv2.forward(x));
        let x = self.dropout.forward(self.pool.forward(x));
        let x = relu(self.conv3.forward(x));
        let x = self.dropout.forward(self.pool.forward(x));
        self.avgpool.forward(x).flatten(1, 3)
    }
}

#[derive(Module, Debug)]
pub struct MaskModel<B: Backend> {
    resnet: Option<ResNet<B>>,
    base: Option<BaseCnn<B>>,
    head: Linear<B>,
    dropout: Dropout,
    dropout_samples: usize,
    loss: CrossEntropyLoss<B>,
}

impl<B: Backend> MaskModel<B> {
    /// # Shapes
    ///   - Images [batch_size, 3, height, width]
    ///   - Output [batch_size, NUM_CLASSES]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = match (&self.resnet, &self.base) {
            (Some(resnet), _) => resnet.forward(images),
            (None, Some(base)) => base.forward(images),
            (None, None) => unreachable!("a model always holds one backbone"),
        };
        // multi-sample dropout: one shared head, logits averaged over the samples
        let mut logits = self.head.forward(self.dropout.forward(features.clone()));
        for _ in 1..self.dropout_samples {
            logits = logits + self.head.forward(self.dropout.forward(features.clone()));
        }
        logits / self.dropout_samples as f32
    }

    /// Trains against targets smoothed by [`LABEL_SMOOTHING`] when `soft_label` is set.
    pub fn with_soft_label(mut self, soft_label: bool, device: &B::Device) -> Self {
        self.loss = cross_entropy(soft_label, device);
        self
    }

    fn forward_classification(&self, batch: MaskBatch<B>) -> ClassificationOutput<B> {
        let output = self.forward(batch.images);
        let loss = self.loss.forward(output.clone(), batch.targets.clone());
        ClassificationOutput::new(loss, output, batch.targets)
    }
}

impl<B: Backend> Classifier<B> for MaskModel<B> {
    fn infer(&self, images: Tensor<B, 4>) -> Result<Tensor<B, 2>> {
        Ok(self.forward(images))
    }
}

impl<B: AutodiffBackend> TrainStep<MaskBatch<B>, ClassificationOutput<B>> for MaskModel<B> {
    fn step(&self, batch: MaskBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let classify = self.forward_classification(batch);
        TrainOutput::new(self, classify.loss.backward(), classify)
    }
}

impl<B: Backend> ValidStep<MaskBatch<B>, ClassificationOutput<B>> for MaskModel<B> {
    fn step(&self, batch: MaskBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch)
    }
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    backbone: Backbone,
    /// Start the ResNet backbones from ImageNet weights
    #[config(default = false)]
    pretrained: bool,
    #[config(default = 0.0)]
    dropout: f64,
    /// Number of dropout samples averaged by the head, 1 for a plain linear head
    #[config(default = 1)]
    dropout_samples: usize,
}

impl ModelConfig {
    /// Randomly initialized model, the shape expected when loading a checkpoint.
    pub fn init<B: Backend>(&self, device: &B::Device) -> MaskModel<B> {
        let (resnet, base) = match self.backbone {
            Backbone::Base => (None, Some(BaseCnn::new(device))),
            Backbone::ResNet18 => (Some(ResNet::resnet18(RESNET_FEATURES, device)), None),
            Backbone::ResNet34 => (Some(ResNet::resnet34(RESNET_FEATURES, device)), None),
            Backbone::ResNet50 => (Some(ResNet::resnet50(RESNET_FEATURES, device)), None),
            Backbone::ResNet101 => (Some(ResNet::resnet101(RESNET_FEATURES, device)), None),
            Backbone::ResNet152 => (Some(ResNet::resnet152(RESNET_FEATURES, device)), None),
        };
        self.assemble(resnet, base, device)
    }

    /// Like [`ModelConfig::init`], downloading ImageNet weights for the ResNet backbones when `pretrained` is set.
    pub fn init_pretrained<B: Backend>(&self, device: &B::Device) -> Result<MaskModel<B>> {
        if !self.pretrained || self.backbone == Backbone::Base {
            return Ok(self.init(device));
        }
        let resnet = match self.backbone {
            Backbone::ResNet18 => ResNet::resnet18_pretrained(weights::ResNet18::ImageNet1kV1, device),
            Backbone::ResNet34 => ResNet::resnet34_pretrained(weights::ResNet34::ImageNet1kV1, device),
            Backbone::ResNet50 => ResNet::resnet50_pretrained(weights::ResNet50::ImageNet1kV1, device),
            Backbone::ResNet101 => {
                ResNet::resnet101_pretrained(weights::ResNet101::ImageNet1kV1, device)
            }
            Backbone::ResNet152 => {
                ResNet::resnet152_pretrained(weights::ResNet152::ImageNet1kV1, device)
            }
            Backbone::Base => unreachable!(),
        }
        .map_err(|err| Error::Checkpoint {
            path: self.backbone.name().into(),
            reason: err.to_string(),
        })?;
        Ok(self.assemble(Some(resnet), None, device))
    }

    pub fn backbone(&self) -> Backbone {
        self.backbone
    }

    fn assemble<B: Backend>(
        &self,
        resnet: Option<ResNet<B>>,
        base: Option<BaseCnn<B>>,
        device: &B::Device,
    ) -> MaskModel<B> {
        let features = if resnet.is_some() {
            RESNET_FEATURES
        } else {
            BASE_FEATURES
        };
        let mut head = LinearConfig::new(features, NUM_CLASSES)
            .with_initializer(Initializer::KaimingUniform {
                gain: 1.0,
                fan_out_only: false,
            })
            .init(device);
        head.bias = Some(Param::from_tensor(Tensor::zeros([NUM_CLASSES], device)));
        MaskModel {
            resnet,
            base,
            head,
            dropout: DropoutConfig::new(self.dropout).init(),
            dropout_samples: self.dropout_samples.max(1),
            loss: cross_entropy(false, device),
        }
    }
}

fn cross_entropy<B: Backend>(soft_label: bool, device: &B::Device) -> CrossEntropyLoss<B> {
    CrossEntropyLossConfig::new()
        .with_smoothing(soft_label.then_some(LABEL_SMOOTHING))
        .init(device)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Backbone {
    #[default]
    #[value(name = "base")]
    Base,
    #[value(name = "resnet18")]
    ResNet18,
    #[value(name = "resnet34")]
    ResNet34,
    #[value(name = "resnet50")]
    ResNet50,
    #[value(name = "resnet101")]
    ResNet101,
    #[value(name = "resnet152")]
    ResNet152,
}

impl Backbone {
    pub fn name(&self) -> &'static str {
        match self {
            Backbone::Base => "base",
            Backbone::ResNet18 => "resnet18",
            Backbone::ResNet34 => "resnet34",
            Backbone::ResNet50 => "resnet50",
            Backbone::ResNet101 => "resnet101",
            Backbone::ResNet152 => "resnet152",
        }
    }
}

impl From<Backbone> for OsStr {
    fn from(value: Backbone) -> Self {
        value.name().into()
    }
}
