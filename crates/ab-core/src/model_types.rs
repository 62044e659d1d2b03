use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Compute backend a job asks for.
///
/// Tags the worker does not recognise are kept verbatim in [`Model::Other`]
/// so a new backend on the server never breaks job parsing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Model {
    VqganImagenet,
    Glid3Xl,
    StableDiffusion,
    StableDiffusionInpainting,
    SwinIr,
    DalleMega,
    Other(String),
}

impl Model {
    /// Model name for display in logs
    pub fn name(&self) -> &str {
        match self {
            Self::VqganImagenet => "VQGAN ImageNet f16",
            Self::Glid3Xl => "GLID-3 XL",
            Self::StableDiffusion => "Stable Diffusion",
            Self::StableDiffusionInpainting => "Stable Diffusion Inpainting",
            Self::SwinIr => "SwinIR",
            Self::DalleMega => "DALL-E Mega",
            Self::Other(id) => id,
        }
    }

    /// Model ID for API communication
    pub fn id(&self) -> &str {
        match self {
            Self::VqganImagenet => "vqgan_imagenet_f16_16384",
            Self::Glid3Xl => "glid_3_xl",
            Self::StableDiffusion => "stable_diffusion",
            Self::StableDiffusionInpainting => "stable_diffusion_inpainting",
            Self::SwinIr => "swinir",
            Self::DalleMega => "dalle_mega",
            Self::Other(id) => id,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }

    /// All models this build knows about
    pub fn all() -> [Model; 6] {
        [
            Self::VqganImagenet,
            Self::Glid3Xl,
            Self::StableDiffusion,
            Self::StableDiffusionInpainting,
            Self::SwinIr,
            Self::DalleMega,
        ]
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::Glid3Xl
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl From<String> for Model {
    fn from(id: String) -> Self {
        Self::all()
            .into_iter()
            .find(|m| m.id() == id)
            .unwrap_or(Self::Other(id))
    }
}

impl From<Model> for String {
    fn from(model: Model) -> Self {
        match model {
            Model::Other(id) => id,
            known => known.id().to_string(),
        }
    }
}

impl FromStr for Model {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.trim().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_ids() {
        assert_eq!(Model::StableDiffusion.id(), "stable_diffusion");
        assert_eq!(Model::VqganImagenet.id(), "vqgan_imagenet_f16_16384");
    }

    #[test]
    fn test_all_models() {
        assert_eq!(Model::all().len(), 6);
        assert!(Model::all().iter().all(Model::is_known));
    }

    #[test]
    fn test_parse_known_and_unknown() {
        assert_eq!("swinir".parse::<Model>().unwrap(), Model::SwinIr);
        assert_eq!(
            "brand_new_model".parse::<Model>().unwrap(),
            Model::Other("brand_new_model".into())
        );
    }

    #[test]
    fn test_serde_uses_wire_tag() {
        let json = serde_json::to_string(&Model::Glid3Xl).unwrap();
        assert_eq!(json, "\"glid_3_xl\"");

        let other: Model = serde_json::from_str("\"mystery\"").unwrap();
        assert_eq!(other.id(), "mystery");
        assert_eq!(serde_json::to_string(&other).unwrap(), "\"mystery\"");
    }
}
