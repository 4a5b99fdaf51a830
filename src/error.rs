use thiserror::Error;

pub type Result<T> = std::result::Result<T, SurvivalError>;

#[derive(Error, Debug)]
pub enum SurvivalError {
    #[error("dimensions don't match: {message}")]
    InvalidDimensions { message: String },

    #[error("{model} fit on [{covariates}] failed: {message}")]
    OptimizationFailed {
        model: String,
        covariates: String,
        message: String,
    },

    #[error("bad parameter: {parameter} = {value}")]
    InvalidParameter { parameter: String, value: String },

    #[error("numerical issues: {message}")]
    NumericalError { message: String },

    #[error("survival data is broken: {message}")]
    InvalidSurvivalData { message: String },

    #[error("input schema mismatch: {message}")]
    Schema { message: String },

    #[error("test across '{grouping}' is undefined: {reason}")]
    DegenerateStrata { grouping: String, reason: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

impl SurvivalError {
    pub fn invalid_dimensions(message: impl Into<String>) -> Self {
        Self::InvalidDimensions { message: message.into() }
    }

    /// fit failure naming the model and the covariate set it was attempted on
    pub fn optimization_failed(
        model: impl Into<String>,
        covariates: &[String],
        message: impl Into<String>,
    ) -> Self {
        Self::OptimizationFailed {
            model: model.into(),
            covariates: covariates.join(", "),
            message: message.into(),
        }
    }

    pub fn invalid_parameter(parameter: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            value: value.into(),
        }
    }

    pub fn numerical_error(message: impl Into<String>) -> Self {
        Self::NumericalError { message: message.into() }
    }

    pub fn invalid_survival_data(message: impl Into<String>) -> Self {
        Self::InvalidSurvivalData { message: message.into() }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema { message: message.into() }
    }

    pub fn degenerate_strata(grouping: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DegenerateStrata {
            grouping: grouping.into(),
            reason: reason.into(),
        }
    }

    /// true for errors that mean "a fit did not work out", as opposed to bad input
    pub fn is_fit_failure(&self) -> bool {
        matches!(self, Self::OptimizationFailed { .. } | Self::NumericalError { .. })
    }
}
