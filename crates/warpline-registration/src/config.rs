use crate::error::RegistrationError;

/// Immutable configuration of a registration run.
///
/// Deformation scales are exponents: at scale `s` the control grid has
/// `2^s` intervals per axis. `min_scale_image` is the image-pyramid
/// depth below which the engine stops advancing image detail while
/// still refining the deformation.
///
/// Validation happens once at engine construction; invalid values are
/// rejected there, never clamped silently.
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// Coarsest deformation scale (starting control grid).
    pub min_scale_deformation: usize,
    /// Finest deformation scale.
    pub max_scale_deformation: usize,
    /// Image-pyramid floor used while the deformation still refines.
    pub min_scale_image: usize,
    /// Weight of the divergence penalty.
    pub div_weight: f64,
    /// Weight of the curl penalty.
    pub curl_weight: f64,
    /// Weight of the landmark energy term.
    pub landmark_weight: f64,
    /// Weight of the image similarity term.
    pub image_weight: f64,
    /// Relative plateau threshold that stops the optimizer.
    pub stop_threshold: f64,
    /// Tighten the stop threshold tenfold on the final scale/depth
    /// combination.
    pub accurate_mode: bool,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            min_scale_deformation: 0,
            max_scale_deformation: 2,
            min_scale_image: 0,
            div_weight: 0.0,
            curl_weight: 0.0,
            landmark_weight: 0.0,
            image_weight: 1.0,
            stop_threshold: 1e-2,
            accurate_mode: true,
        }
    }
}

impl RegistrationConfig {
    /// Check every entry constraint.
    pub fn validate(&self) -> Result<(), RegistrationError> {
        if self.min_scale_deformation > self.max_scale_deformation {
            return Err(RegistrationError::InvalidScaleBounds(
                self.min_scale_deformation,
                self.max_scale_deformation,
            ));
        }
        for (name, w) in [
            ("divergence", self.div_weight),
            ("curl", self.curl_weight),
            ("landmark", self.landmark_weight),
            ("image", self.image_weight),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(RegistrationError::InvalidWeight(name, w));
            }
        }
        if !self.stop_threshold.is_finite() || self.stop_threshold <= 0.0 {
            return Err(RegistrationError::InvalidStopThreshold(self.stop_threshold));
        }
        Ok(())
    }

    /// Image pyramid depth the models should be built with: one level
    /// per deformation refinement plus the image-detail floor.
    pub fn pyramid_depth(&self) -> usize {
        self.max_scale_deformation - self.min_scale_deformation + 1 + self.min_scale_image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RegistrationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pyramid_depth(), 3);
    }

    #[test]
    fn test_rejects_inverted_scales() {
        let config = RegistrationConfig {
            min_scale_deformation: 3,
            max_scale_deformation: 1,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RegistrationError::InvalidScaleBounds(3, 1))
        ));
    }

    #[test]
    fn test_rejects_negative_weight() {
        let config = RegistrationConfig {
            curl_weight: -0.5,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RegistrationError::InvalidWeight("curl", _))
        ));
    }

    #[test]
    fn test_rejects_bad_threshold() {
        for bad in [0.0, -1.0, f64::NAN] {
            let config = RegistrationConfig {
                stop_threshold: bad,
                ..Default::default()
            };
            assert!(config.validate().is_err());
        }
    }
}
