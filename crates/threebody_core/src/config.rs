//! Aggregate solver configuration.
//!
//! A front end deserializes one `SolverConfig` and hands its parts to the
//! individual stages; nothing here is read from process-wide state.

use serde::{Deserialize, Serialize};

use crate::continuation::ContinuationSettings;
use crate::correction::CorrectorSettings;
use crate::dynamics::{Cr3bpField, MassParameter};
use crate::error::Result;
use crate::manifold::ManifoldSettings;
use crate::propagation::PropagationSettings;
use crate::stability::StabilitySettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    pub mu: MassParameter,
    #[serde(default)]
    pub propagation: PropagationSettings,
    #[serde(default)]
    pub corrector: CorrectorSettings,
    #[serde(default)]
    pub continuation: ContinuationSettings,
    #[serde(default)]
    pub stability: StabilitySettings,
    /// Absent unless the front end asks for manifolds; the perturbation has
    /// no default.
    #[serde(default)]
    pub manifold: Option<ManifoldSettings>,
}

impl SolverConfig {
    /// Default settings for every stage at the given mass ratio.
    pub fn new(mu: MassParameter) -> Self {
        Self {
            mu,
            propagation: PropagationSettings::default(),
            corrector: CorrectorSettings::default(),
            continuation: ContinuationSettings::default(),
            stability: StabilitySettings::default(),
            manifold: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.propagation.validate()?;
        self.corrector.validate()?;
        self.continuation.validate()?;
        self.stability.validate()?;
        match &self.manifold {
            Some(manifold) => manifold.validate(),
            None => Ok(()),
        }
    }

    pub fn field(&self) -> Cr3bpField {
        Cr3bpField::new(self.mu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::VectorField;
    use crate::error::Cr3bpError;
    use crate::manifold::{ManifoldSide, ManifoldStability};

    #[test]
    fn partial_json_fills_defaults() {
        let json = r#"{
            "mu": 0.01215,
            "corrector": { "tolerance": 1e-10, "max_iterations": 40 },
            "continuation": { "step_size": -2e-3, "parameter_range": [2.5, 3.5] }
        }"#;
        let config: SolverConfig = serde_json::from_str(json).expect("config");
        assert_eq!(config.mu.value(), 0.01215);
        assert_eq!(config.corrector.max_iterations, 40);
        assert_eq!(config.corrector.max_line_search, 8);
        assert_eq!(config.continuation.step_size, -2e-3);
        assert_eq!(config.continuation.parameter_range, Some((2.5, 3.5)));
        assert_eq!(config.propagation, PropagationSettings::default());
        assert!(config.manifold.is_none());
        config.validate().expect("valid");
        assert_eq!(config.field().mu(), 0.01215);
    }

    #[test]
    fn out_of_range_mass_ratio_is_rejected_while_parsing() {
        let err = serde_json::from_str::<SolverConfig>(r#"{ "mu": 0.7 }"#).expect_err("mu");
        assert!(err.to_string().contains("0.7"), "{err}");
    }

    #[test]
    fn validate_reports_the_bad_stage() {
        let mut config = SolverConfig::new(MassParameter::new(3.0e-6).expect("mu"));
        config.stability.unit_tolerance = -1.0;
        let err = config.validate().expect_err("tolerance");
        assert!(matches!(err, Cr3bpError::InvalidInput(_)));
        assert!(err.to_string().contains("unit_tolerance"));
    }

    #[test]
    fn manifold_section_is_parsed_and_validated() {
        let json = r#"{
            "mu": 0.01215,
            "manifold": { "stability": "Unstable", "side": "Negative", "perturbation": 1e-6, "seeds": 12 }
        }"#;
        let config: SolverConfig = serde_json::from_str(json).expect("config");
        let manifold = config.manifold.as_ref().expect("manifold settings");
        assert_eq!(manifold.stability, ManifoldStability::Unstable);
        assert_eq!(manifold.side, ManifoldSide::Negative);
        assert_eq!(manifold.seeds, 12);
        config.validate().expect("valid");

        let mut bad = config;
        if let Some(manifold) = bad.manifold.as_mut() {
            manifold.perturbation = 0.0;
        }
        assert!(bad.validate().is_err());
    }

    #[test]
    fn config_round_trips() {
        let config = SolverConfig::new(MassParameter::new(0.5).expect("mu"));
        let text = serde_json::to_string(&config).expect("serialize");
        let back: SolverConfig = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, config);
    }
}
