//! Ordered classes for continuous covariates.
//!
//! Intervals are left-closed and right-open, the last one unbounded above,
//! so a value sitting on a cut point belongs to the class that starts there.
//! Values that cannot be binned (NaN, infinite, negative) come back as `None`.

use std::fmt;

/// cut points for half-open intervals `[cuts[i], cuts[i+1])`, last one open-ended
#[derive(Debug, Clone, PartialEq)]
pub struct Breaks {
    cuts: Vec<f64>,
}

impl Breaks {
    /// `cuts` must be finite and strictly increasing
    pub fn new(cuts: Vec<f64>) -> Option<Self> {
        let finite = cuts.iter().all(|c| c.is_finite());
        let increasing = cuts.windows(2).all(|w| w[0] < w[1]);
        if cuts.is_empty() || !finite || !increasing {
            return None;
        }
        Some(Self { cuts })
    }

    pub fn n_classes(&self) -> usize {
        self.cuts.len()
    }

    pub fn cuts(&self) -> &[f64] {
        &self.cuts
    }

    /// index of the interval holding `value`
    pub fn classify(&self, value: f64) -> Option<usize> {
        if !value.is_finite() || value < 0.0 || value < self.cuts[0] {
            return None;
        }
        // number of cut points <= value, minus one
        let idx = self.cuts.partition_point(|&c| c <= value);
        Some(idx - 1)
    }
}

/// five age classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AgeClass {
    Under30,
    From30To45,
    From45To60,
    From60To75,
    Over75,
}

const AGE_CUTS: [f64; 5] = [0.0, 30.0, 45.0, 60.0, 75.0];

impl AgeClass {
    pub const ALL: [AgeClass; 5] = [
        AgeClass::Under30,
        AgeClass::From30To45,
        AgeClass::From45To60,
        AgeClass::From60To75,
        AgeClass::Over75,
    ];

    pub fn breaks() -> Breaks {
        Breaks { cuts: AGE_CUTS.to_vec() }
    }

    pub fn from_value(age: f64) -> Option<Self> {
        Self::breaks().classify(age).map(|i| Self::ALL[i])
    }

    pub fn label(&self) -> &'static str {
        match self {
            AgeClass::Under30 => "[0,30)",
            AgeClass::From30To45 => "[30,45)",
            AgeClass::From45To60 => "[45,60)",
            AgeClass::From60To75 => "[60,75)",
            AgeClass::Over75 => "[75,Inf)",
        }
    }
}

impl fmt::Display for AgeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// WHO body-mass-index classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BmiClass {
    Underweight,
    Normal,
    Overweight,
    Class1,
    Class2,
    Class3,
}

const BMI_CUTS: [f64; 6] = [0.0, 18.5, 25.0, 30.0, 35.0, 40.0];

impl BmiClass {
    pub const ALL: [BmiClass; 6] = [
        BmiClass::Underweight,
        BmiClass::Normal,
        BmiClass::Overweight,
        BmiClass::Class1,
        BmiClass::Class2,
        BmiClass::Class3,
    ];

    pub fn breaks() -> Breaks {
        Breaks { cuts: BMI_CUTS.to_vec() }
    }

    pub fn from_value(bmi: f64) -> Option<Self> {
        Self::breaks().classify(bmi).map(|i| Self::ALL[i])
    }

    pub fn label(&self) -> &'static str {
        match self {
            BmiClass::Underweight => "Underweight",
            BmiClass::Normal => "Normal",
            BmiClass::Overweight => "Overweight",
            BmiClass::Class1 => "Class1",
            BmiClass::Class2 => "Class2",
            BmiClass::Class3 => "Class3",
        }
    }
}

impl fmt::Display for BmiClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
