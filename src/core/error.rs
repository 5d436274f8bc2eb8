use serde::{Deserialize, Serialize};

/// Rejected `SimulationConfig`. Raised synchronously, before any work is
/// handed to a computation unit.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("initialWealth must be a finite value > 0, got {0}")]
    InitialWealth(f64),
    #[error("timeHorizonYears must be between {min} and {max}, got {got}")]
    TimeHorizon { got: u32, min: u32, max: u32 },
    #[error("withdrawalAmount must be a finite value >= 0, got {0}")]
    WithdrawalAmount(f64),
    #[error("riskScore must be between {min} and {max}, got {got}")]
    RiskScore { got: u32, min: u32, max: u32 },
    #[error("inflationRate must be a finite percentage >= 0, got {0}")]
    InflationRate(f64),
    #[error("simulationCount must be between {min} and {max}, got {got}")]
    SimulationCount { got: u32, min: u32, max: u32 },
    #[error("asset assumption {field} is invalid: {value}")]
    AssetAssumption { field: &'static str, value: f64 },
    #[error("batchSize must be > 0")]
    BatchSize,
}

/// Fault that ends a run without a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", content = "message", rename_all = "camelCase")]
pub enum SimulationError {
    #[error("simulation failed: {0}")]
    Runtime(String),
    /// Host-side detection of a unit that stopped answering or went away.
    /// The unit is disposed; a fresh one is created by the next start.
    #[error("computation unit unresponsive: {0}")]
    UnresponsiveUnit(String),
}

impl SimulationError {
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn is_unresponsive(&self) -> bool {
        matches!(self, Self::UnresponsiveUnit(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_error_messages_name_the_field() {
        let err = ConfigurationError::TimeHorizon {
            got: 60,
            min: 1,
            max: 50,
        };
        assert_eq!(
            err.to_string(),
            "timeHorizonYears must be between 1 and 50, got 60"
        );
        assert!(
            ConfigurationError::InitialWealth(0.0)
                .to_string()
                .contains("initialWealth")
        );
    }

    #[test]
    fn simulation_error_serializes_with_kind_tag() {
        let err = SimulationError::UnresponsiveUnit("timed out".to_string());
        let json = serde_json::to_string(&err).expect("serialize");
        assert_eq!(json, r#"{"kind":"unresponsiveUnit","message":"timed out"}"#);
        assert!(err.is_unresponsive());
        assert!(!SimulationError::runtime("nan").is_unresponsive());
    }
}
